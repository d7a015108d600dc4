use rust_decimal::Decimal;
use sea_orm::{ActiveValue::Set, DatabaseConnection, EntityTrait};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::models::strategy;
use crate::strategies::StrategyParams;
use crate::utils::errors::AppError;

use super::{LifecycleState, StrategyRecord, Tier};

/// Write-behind persistence for registry records.
///
/// Mutations enqueue a snapshot; a single writer task upserts rows in order,
/// so the database converges on the in-memory state without registry callers
/// ever blocking on I/O.
pub struct Persister {
    sender: mpsc::UnboundedSender<StrategyRecord>,
}

impl Persister {
    pub fn spawn(db: Arc<DatabaseConnection>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<StrategyRecord>();
        tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                if let Err(e) = upsert(db.as_ref(), &record).await {
                    warn!("Failed to persist strategy {}: {}", record.id, e);
                }
            }
        });
        Self { sender }
    }

    pub fn enqueue(&self, record: StrategyRecord) {
        let _ = self.sender.send(record);
    }
}

async fn upsert(db: &DatabaseConnection, record: &StrategyRecord) -> Result<(), AppError> {
    let model = to_model(record)?;
    strategy::Entity::insert(model)
        .on_conflict(
            sea_orm::sea_query::OnConflict::column(strategy::Column::Id)
                .update_columns([
                    strategy::Column::Parameters,
                    strategy::Column::Generation,
                    strategy::Column::Cycle,
                    strategy::Column::Enabled,
                    strategy::Column::Tier,
                    strategy::Column::State,
                    strategy::Column::QualifiesForReal,
                    strategy::Column::TotalTrades,
                    strategy::Column::WinRate,
                    strategy::Column::TotalReturn,
                    strategy::Column::MaxDrawdown,
                    strategy::Column::Sharpe,
                    strategy::Column::DailyReturn,
                    strategy::Column::FinalScore,
                    strategy::Column::ProtectedUntil,
                    strategy::Column::LastEvaluatedAt,
                    strategy::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec(db)
        .await?;
    Ok(())
}

fn to_model(record: &StrategyRecord) -> Result<strategy::ActiveModel, AppError> {
    Ok(strategy::ActiveModel {
        id: Set(record.id),
        strategy_type: Set(record.strategy_type.as_str().to_string()),
        symbol: Set(record.symbol.clone()),
        parameters: Set(serde_json::to_value(&record.params)?),
        generation: Set(record.generation as i32),
        cycle: Set(record.cycle as i64),
        parent_id: Set(record.parent_id),
        enabled: Set(record.enabled),
        tier: Set(record.tier.map(|t| t.as_i16())),
        state: Set(record.state.as_str().to_string()),
        qualifies_for_real: Set(record.qualifies_for_real),
        total_trades: Set(record.metrics.total_trades as i32),
        win_rate: Set(record.metrics.win_rate),
        total_return: Set(record.metrics.total_return),
        max_drawdown: Set(record.metrics.max_drawdown),
        sharpe: Set(record.metrics.sharpe),
        daily_return: Set(record.metrics.daily_return),
        final_score: Set(record.metrics.final_score),
        protected_until: Set(record.protected_until),
        last_evaluated_at: Set(record.metrics.last_evaluated_at),
        created_at: Set(record.created_at),
        updated_at: Set(record.updated_at),
    })
}

/// Load the full population, validating every parameter document against its
/// family schema before it re-enters the engine.
pub async fn load_all(db: &DatabaseConnection) -> Result<Vec<StrategyRecord>, AppError> {
    let rows = strategy::Entity::find().all(db).await?;
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        match from_model(&row) {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping unreadable strategy row {}: {}", row.id, e),
        }
    }
    Ok(records)
}

fn from_model(model: &strategy::Model) -> Result<StrategyRecord, AppError> {
    let params: StrategyParams = serde_json::from_value(model.parameters.clone())?;
    params.validate()?;

    let strategy_type = model.strategy_type.parse()?;
    if params.family() != strategy_type {
        return Err(AppError::Constraint(format!(
            "stored family {} does not match parameters",
            model.strategy_type
        )));
    }

    Ok(StrategyRecord {
        id: model.id,
        strategy_type,
        symbol: model.symbol.clone(),
        params,
        generation: model.generation.max(0) as u32,
        cycle: model.cycle.max(0) as u64,
        parent_id: model.parent_id,
        metrics: super::StrategyMetrics {
            total_trades: model.total_trades.max(0) as u32,
            win_rate: model.win_rate,
            total_return: model.total_return,
            max_drawdown: model.max_drawdown,
            sharpe: model.sharpe,
            daily_return: model.daily_return,
            final_score: model.final_score.max(Decimal::ZERO),
            last_evaluated_at: model.last_evaluated_at,
        },
        enabled: model.enabled,
        tier: model.tier.and_then(Tier::from_i16),
        state: if model.state == "retired" {
            LifecycleState::Retired
        } else {
            LifecycleState::Live
        },
        qualifies_for_real: model.qualifies_for_real,
        protected_until: model.protected_until,
        created_at: model.created_at,
        updated_at: model.updated_at,
    })
}
