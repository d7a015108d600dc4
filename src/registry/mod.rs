pub mod persistence;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::scoring::ScoreBreakdown;
use crate::strategies::{StrategyParams, StrategyType};
use crate::utils::errors::AppError;

use persistence::Persister;

/// Scheduling tier. T4 is the only tier permitted to trade real money.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    T1 = 1,
    T2 = 2,
    T3 = 3,
    T4 = 4,
}

impl Tier {
    pub fn from_i16(value: i16) -> Option<Tier> {
        match value {
            1 => Some(Tier::T1),
            2 => Some(Tier::T2),
            3 => Some(Tier::T3),
            4 => Some(Tier::T4),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> i16 {
        *self as i16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Live,
    Retired,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Live => "live",
            LifecycleState::Retired => "retired",
        }
    }
}

/// Rolling metrics maintained by the scoring subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyMetrics {
    pub total_trades: u32,
    pub win_rate: Decimal,
    pub total_return: Decimal,
    pub max_drawdown: Decimal,
    pub sharpe: Option<Decimal>,
    pub daily_return: Decimal,
    pub final_score: Decimal,
    pub last_evaluated_at: Option<DateTime<Utc>>,
}

impl StrategyMetrics {
    pub fn from_breakdown(breakdown: &ScoreBreakdown, now: DateTime<Utc>) -> Self {
        Self {
            total_trades: breakdown.total_trades,
            win_rate: Decimal::from_f64(breakdown.win_rate.unwrap_or(0.0))
                .unwrap_or(Decimal::ZERO)
                .round_dp(4),
            total_return: breakdown.total_pnl,
            max_drawdown: Decimal::from_f64(breakdown.drawdown.unwrap_or(0.0))
                .unwrap_or(Decimal::ZERO)
                .round_dp(4),
            sharpe: breakdown
                .sharpe
                .and_then(Decimal::from_f64)
                .map(|s| s.round_dp(4)),
            daily_return: breakdown.daily_return,
            final_score: breakdown.final_score,
            last_evaluated_at: Some(now),
        }
    }
}

/// One strategy in the population.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: Uuid,
    pub strategy_type: StrategyType,
    pub symbol: String,
    pub params: StrategyParams,
    /// Lineage depth: parent generation + 1 at creation, fixed afterwards.
    pub generation: u32,
    /// Count of committed parameter changes; the optimistic concurrency
    /// token for `commit_parameters`.
    pub cycle: u64,
    pub parent_id: Option<Uuid>,
    pub metrics: StrategyMetrics,
    pub enabled: bool,
    pub tier: Option<Tier>,
    pub state: LifecycleState,
    pub qualifies_for_real: bool,
    pub protected_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StrategyRecord {
    pub fn new(
        strategy_type: StrategyType,
        symbol: String,
        params: StrategyParams,
        parent: Option<&StrategyRecord>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            strategy_type,
            symbol,
            params,
            generation: parent.map(|p| p.generation + 1).unwrap_or(0),
            cycle: 0,
            parent_id: parent.map(|p| p.id),
            metrics: StrategyMetrics::default(),
            enabled: true,
            tier: None,
            state: LifecycleState::Live,
            qualifies_for_real: false,
            protected_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state == LifecycleState::Live
    }

    pub fn is_protected(&self, now: DateTime<Utc>) -> bool {
        self.protected_until.map(|t| now < t).unwrap_or(false)
    }
}

/// Search filters for `list`.
#[derive(Debug, Clone, Default)]
pub struct StrategyFilter {
    pub tier: Option<Tier>,
    pub enabled: Option<bool>,
    pub strategy_type: Option<StrategyType>,
    pub include_retired: bool,
}

/// Durable population store.
///
/// Single-writer semantics come from the optimistic `cycle` token: concurrent
/// evolution commits race through `commit_parameters` and the loser receives
/// `CycleConflict` without side effects. Reads are lock-free clones. Every
/// mutation writes through to the database when one is configured.
pub struct StrategyRegistry {
    entries: DashMap<Uuid, StrategyRecord>,
    persister: Option<Persister>,
}

impl StrategyRegistry {
    pub fn new(db: Option<Arc<DatabaseConnection>>) -> Self {
        Self {
            entries: DashMap::new(),
            persister: db.map(Persister::spawn),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Restore the population from the database at startup.
    pub async fn load(&self, db: &DatabaseConnection) -> Result<usize, AppError> {
        let records = persistence::load_all(db).await?;
        let count = records.len();
        for record in records {
            self.entries.insert(record.id, record);
        }
        info!("Loaded {} strategies from database", count);
        Ok(count)
    }

    pub fn get(&self, id: Uuid) -> Option<StrategyRecord> {
        self.entries.get(&id).map(|r| r.clone())
    }

    /// List matching strategies ordered by `final_score` descending.
    pub fn list(&self, filter: &StrategyFilter) -> Vec<StrategyRecord> {
        let mut records: Vec<StrategyRecord> = self
            .entries
            .iter()
            .filter(|r| {
                (filter.include_retired || r.is_live())
                    && filter.tier.map_or(true, |t| r.tier == Some(t))
                    && filter.enabled.map_or(true, |e| r.enabled == e)
                    && filter
                        .strategy_type
                        .map_or(true, |t| r.strategy_type == t)
            })
            .map(|r| r.clone())
            .collect();

        records.sort_by(|a, b| {
            b.metrics
                .final_score
                .cmp(&a.metrics.final_score)
                .then_with(|| a.id.cmp(&b.id))
        });
        records
    }

    /// Insert or replace a strategy.
    pub fn upsert(&self, record: StrategyRecord) -> StrategyRecord {
        self.entries.insert(record.id, record.clone());
        self.persist(&record);
        record
    }

    /// Atomically commit a new parameter set.
    ///
    /// Fails `Constraint` when the proposal violates its family schema,
    /// `CycleConflict` when `expected_cycle` no longer matches, `Rejected`
    /// when the strategy is retired. On success the cycle increments in the
    /// same write as the parameters.
    pub fn commit_parameters(
        &self,
        id: Uuid,
        new_params: StrategyParams,
        expected_cycle: u64,
    ) -> Result<StrategyRecord, AppError> {
        new_params.validate()?;

        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("strategy {}", id)))?;

        if !entry.is_live() {
            return Err(AppError::Rejected(format!("strategy {} is retired", id)));
        }
        if entry.strategy_type != new_params.family() {
            return Err(AppError::Constraint(format!(
                "family mismatch: {} vs {}",
                entry.strategy_type,
                new_params.family()
            )));
        }
        if entry.cycle != expected_cycle {
            return Err(AppError::CycleConflict {
                strategy_id: id,
                expected: expected_cycle,
                actual: entry.cycle,
            });
        }

        entry.params = new_params;
        entry.cycle += 1;
        entry.updated_at = Utc::now();
        let record = entry.clone();
        drop(entry);

        self.persist(&record);
        Ok(record)
    }

    /// Apply a score update computed at `at_cycle`.
    ///
    /// Updates racing a parameter commit are dropped: metrics measured
    /// against cycle k never overwrite state at cycle k+1.
    pub fn update_metrics(
        &self,
        id: Uuid,
        at_cycle: u64,
        breakdown: &ScoreBreakdown,
        qualifies_for_real: bool,
    ) -> Option<StrategyRecord> {
        let mut entry = self.entries.get_mut(&id)?;
        if entry.cycle != at_cycle || !entry.is_live() {
            return None;
        }
        entry.metrics = StrategyMetrics::from_breakdown(breakdown, Utc::now());
        entry.qualifies_for_real = qualifies_for_real;
        entry.updated_at = Utc::now();
        let record = entry.clone();
        drop(entry);

        self.persist(&record);
        Some(record)
    }

    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<StrategyRecord, AppError> {
        self.mutate(id, |r| {
            r.enabled = enabled;
            Ok(())
        })
    }

    pub fn set_tier(&self, id: Uuid, tier: Option<Tier>) -> Result<StrategyRecord, AppError> {
        self.mutate(id, |r| {
            r.tier = tier;
            Ok(())
        })
    }

    pub fn set_protected_until(
        &self,
        id: Uuid,
        until: Option<DateTime<Utc>>,
    ) -> Result<StrategyRecord, AppError> {
        self.mutate(id, |r| {
            r.protected_until = until;
            Ok(())
        })
    }

    /// Terminal transition: a retired strategy never re-enters scheduling.
    pub fn retire(&self, id: Uuid, _reason: &str) -> Result<StrategyRecord, AppError> {
        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("strategy {}", id)))?;
        if entry.is_live() {
            entry.state = LifecycleState::Retired;
            entry.enabled = false;
            entry.tier = None;
            entry.qualifies_for_real = false;
            entry.updated_at = Utc::now();
        }
        let record = entry.clone();
        drop(entry);

        self.persist(&record);
        Ok(record)
    }

    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|r| r.is_live()).count()
    }

    pub fn count_by_type(&self) -> std::collections::HashMap<StrategyType, usize> {
        let mut counts = std::collections::HashMap::new();
        for record in self.entries.iter() {
            if record.is_live() {
                *counts.entry(record.strategy_type).or_insert(0) += 1;
            }
        }
        counts
    }

    fn mutate(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut StrategyRecord) -> Result<(), AppError>,
    ) -> Result<StrategyRecord, AppError> {
        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("strategy {}", id)))?;
        if !entry.is_live() {
            return Err(AppError::Rejected(format!("strategy {} is retired", id)));
        }
        f(&mut entry)?;
        entry.updated_at = Utc::now();
        let record = entry.clone();
        drop(entry);

        self.persist(&record);
        Ok(record)
    }

    fn persist(&self, record: &StrategyRecord) {
        if let Some(persister) = &self.persister {
            persister.enqueue(record.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::StrategyType;

    fn record(symbol: &str, score: i64) -> StrategyRecord {
        let mut r = StrategyRecord::new(
            StrategyType::Momentum,
            symbol.to_string(),
            StrategyParams::defaults(StrategyType::Momentum),
            None,
        );
        r.metrics.final_score = Decimal::from(score);
        r
    }

    #[test]
    fn list_orders_by_score_descending() {
        let registry = StrategyRegistry::in_memory();
        registry.upsert(record("A/USDT", 40));
        registry.upsert(record("B/USDT", 80));
        registry.upsert(record("C/USDT", 60));

        let listed = registry.list(&StrategyFilter::default());
        let scores: Vec<Decimal> = listed.iter().map(|r| r.metrics.final_score).collect();
        assert_eq!(
            scores,
            vec![Decimal::from(80), Decimal::from(60), Decimal::from(40)]
        );
    }

    #[test]
    fn commit_increments_cycle_atomically() {
        let registry = StrategyRegistry::in_memory();
        let r = registry.upsert(record("BTC/USDT", 50));

        let committed = registry
            .commit_parameters(r.id, StrategyParams::defaults(StrategyType::Momentum), 0)
            .unwrap();
        assert_eq!(committed.cycle, 1);
    }

    #[test]
    fn stale_cycle_commit_conflicts_without_side_effects() {
        let registry = StrategyRegistry::in_memory();
        let r = registry.upsert(record("BTC/USDT", 50));

        registry
            .commit_parameters(r.id, StrategyParams::defaults(StrategyType::Momentum), 0)
            .unwrap();

        // Second committer still believes cycle is 0.
        let err = registry
            .commit_parameters(r.id, StrategyParams::defaults(StrategyType::Momentum), 0)
            .unwrap_err();
        assert!(matches!(err, AppError::CycleConflict { actual: 1, .. }));
        assert_eq!(registry.get(r.id).unwrap().cycle, 1);
    }

    #[test]
    fn family_mismatch_is_a_constraint_error() {
        let registry = StrategyRegistry::in_memory();
        let r = registry.upsert(record("BTC/USDT", 50));
        let err = registry
            .commit_parameters(r.id, StrategyParams::defaults(StrategyType::Breakout), 0)
            .unwrap_err();
        assert!(matches!(err, AppError::Constraint(_)));
    }

    #[test]
    fn retire_is_terminal_for_commits() {
        let registry = StrategyRegistry::in_memory();
        let r = registry.upsert(record("BTC/USDT", 50));
        registry.retire(r.id, "test").unwrap();

        let retired = registry.get(r.id).unwrap();
        assert_eq!(retired.state, LifecycleState::Retired);
        assert!(!retired.enabled);
        assert_eq!(retired.tier, None);

        let err = registry
            .commit_parameters(r.id, StrategyParams::defaults(StrategyType::Momentum), 0)
            .unwrap_err();
        assert!(matches!(err, AppError::Rejected(_)));

        // Retired strategies are excluded from default listings.
        assert!(registry.list(&StrategyFilter::default()).is_empty());
    }

    #[test]
    fn stale_metric_update_is_dropped_after_commit() {
        let registry = StrategyRegistry::in_memory();
        let r = registry.upsert(record("BTC/USDT", 50));

        registry
            .commit_parameters(r.id, StrategyParams::defaults(StrategyType::Momentum), 0)
            .unwrap();

        // Breakdown computed against cycle 0 arrives late.
        let breakdown = crate::scoring::ScoreCard::default()
            .compute(&crate::config::EngineSettings::default());
        assert!(registry.update_metrics(r.id, 0, &breakdown, false).is_none());
        assert!(registry.update_metrics(r.id, 1, &breakdown, false).is_some());
    }
}
