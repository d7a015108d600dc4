use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable row for one strategy in the population.
///
/// `parameters` holds the family-tagged parameter document; every load goes
/// back through the schema validator before the strategy is evaluated.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "strategies")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub strategy_type: String,
    pub symbol: String,
    pub parameters: Json,
    pub generation: i32,
    pub cycle: i64,
    pub parent_id: Option<Uuid>,
    pub enabled: bool,
    /// 1..=4 when scheduled, NULL while unassigned.
    pub tier: Option<i16>,
    pub state: String, // live, retired
    pub qualifies_for_real: bool,
    pub total_trades: i32,
    pub win_rate: Decimal,
    pub total_return: Decimal,
    pub max_drawdown: Decimal,
    pub sharpe: Option<Decimal>,
    pub daily_return: Decimal,
    pub final_score: Decimal,
    pub protected_until: Option<DateTime<Utc>>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
