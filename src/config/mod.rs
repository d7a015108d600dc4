use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveValue::Set, DatabaseConnection, EntityTrait};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::models::engine_setting;
use crate::utils::errors::AppError;

/// Process-level configuration read from the environment at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    /// Comma-separated trading pairs, e.g. "BTC/USDT,ETH/USDT".
    #[serde(default = "default_symbols")]
    pub symbols: String,
}

fn default_symbols() -> String {
    "BTC/USDT,ETH/USDT".to_string()
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        settings.try_deserialize()
    }

    pub fn symbol_list(&self) -> Vec<String> {
        self.symbols
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Runtime engine settings, one field per persisted key.
///
/// Monetary values are `Decimal`; rates, probabilities, and score weights are
/// plain floats. The SCS weights and hysteresis band are deliberately
/// settings rather than constants: they are operator decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    // Population
    pub max_total_strategies: usize,
    pub optimal_strategy_count: usize,
    pub max_active_strategies: usize,

    // Tier sizes and cadences
    pub t2_size: usize,
    pub t3_size: usize,
    pub t4_size: usize,
    pub t1_interval_hours: u64,
    pub t2_interval_minutes: u64,
    pub t3_interval_minutes: u64,

    // Real-trading gate
    pub real_trading_enabled: bool,
    pub s_real: f64,
    pub min_trades_for_real: u32,
    pub min_win_rate: f64,
    pub min_sim_days: u32,
    pub min_sim_win_rate: f64,
    pub min_sim_pnl: Decimal,

    // Evolution
    pub mutation_rate: f64,
    pub crossover_rate: f64,
    pub min_score_improvement: f64,
    pub param_validation_trades: u32,
    pub validation_time_cap_minutes: u64,
    pub top_protect: usize,
    pub protect_window_minutes: u64,
    pub elimination_days: i64,
    pub s_elim: f64,
    pub min_trades_for_evaluation: u32,
    pub evolution_score_ceiling: f64,

    // Risk
    pub validation_amount: Decimal,
    pub real_trading_amount: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub max_position_pct: Decimal,
    pub max_holding_minutes: u64,
    pub slippage_bps: Decimal,
    pub fee_rate: Decimal,
    pub max_retries: u32,

    // Feeds and quotas
    pub max_age_ms: u64,
    pub quota_capacity: u32,
    pub quota_refill_per_sec: f64,

    // Scheduler
    pub hysteresis_band: f64,
    pub max_eval_retries: u32,
    pub queue_capacity: usize,
    pub emergency_loss_streak: u32,
    pub max_drawdown_cap: f64,

    // Scoring
    pub score_window_trades: usize,
    pub score_window_days: i64,
    pub score_prior: f64,
    pub score_weight_win_rate: f64,
    pub score_weight_sharpe: f64,
    pub score_weight_profit_factor: f64,
    pub score_weight_drawdown: f64,
    pub score_weight_volatility: f64,
    pub profit_factor_cap: f64,
    pub volatility_penalty_k: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_total_strategies: 150,
            optimal_strategy_count: 100,
            max_active_strategies: 120,

            t2_size: 2000,
            t3_size: 21,
            t4_size: 3,
            t1_interval_hours: 6,
            t2_interval_minutes: 30,
            t3_interval_minutes: 3,

            real_trading_enabled: false,
            s_real: 65.0,
            min_trades_for_real: 10,
            min_win_rate: 0.6,
            min_sim_days: 3,
            min_sim_win_rate: 0.55,
            min_sim_pnl: Decimal::ZERO,

            mutation_rate: 0.3,
            crossover_rate: 0.2,
            min_score_improvement: 2.0,
            param_validation_trades: 20,
            validation_time_cap_minutes: 720,
            top_protect: 3,
            protect_window_minutes: 360,
            elimination_days: 7,
            s_elim: 30.0,
            min_trades_for_evaluation: 10,
            evolution_score_ceiling: 90.0,

            validation_amount: Decimal::from(100),
            real_trading_amount: Decimal::from(50),
            stop_loss_pct: Decimal::from_str("0.05").unwrap(),
            take_profit_pct: Decimal::from_str("0.10").unwrap(),
            max_position_pct: Decimal::from_str("0.20").unwrap(),
            max_holding_minutes: 240,
            slippage_bps: Decimal::from(5),
            fee_rate: Decimal::from_str("0.001").unwrap(),
            max_retries: 3,

            max_age_ms: 30_000,
            quota_capacity: 10,
            quota_refill_per_sec: 5.0,

            hysteresis_band: 0.05,
            max_eval_retries: 3,
            queue_capacity: 1024,
            emergency_loss_streak: 3,
            max_drawdown_cap: 0.20,

            score_window_trades: 50,
            score_window_days: 30,
            score_prior: 0.4,
            score_weight_win_rate: 0.30,
            score_weight_sharpe: 0.25,
            score_weight_profit_factor: 0.20,
            score_weight_drawdown: 0.15,
            score_weight_volatility: 0.10,
            profit_factor_cap: 10.0,
            volatility_penalty_k: 4.0,
        }
    }
}

/// Shared, hot-reloadable settings with single-row-per-key persistence.
pub struct SettingsStore {
    inner: RwLock<EngineSettings>,
    db: Option<Arc<DatabaseConnection>>,
}

impl SettingsStore {
    pub fn new(db: Option<Arc<DatabaseConnection>>) -> Self {
        Self {
            inner: RwLock::new(EngineSettings::default()),
            db,
        }
    }

    /// Load persisted overrides on top of the defaults.
    pub async fn load(&self) -> Result<(), AppError> {
        let Some(db) = &self.db else {
            return Ok(());
        };

        let rows = engine_setting::Entity::find().all(db.as_ref()).await?;
        for row in rows {
            if let Err(e) = self.apply(&row.key, row.value.clone()) {
                warn!("Ignoring persisted setting {}: {}", row.key, e);
            }
        }
        info!("Loaded engine settings from database");
        Ok(())
    }

    /// Current settings snapshot. Cheap clone; callers hold no lock.
    pub fn snapshot(&self) -> EngineSettings {
        self.inner.read().expect("settings lock poisoned").clone()
    }

    /// Update one key, persisting the change.
    pub async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), AppError> {
        self.apply(key, value.clone())?;

        if let Some(db) = &self.db {
            let model = engine_setting::ActiveModel {
                key: Set(key.to_string()),
                value: Set(value),
                updated_at: Set(Utc::now()),
            };
            engine_setting::Entity::insert(model)
                .on_conflict(
                    sea_orm::sea_query::OnConflict::column(engine_setting::Column::Key)
                        .update_columns([
                            engine_setting::Column::Value,
                            engine_setting::Column::UpdatedAt,
                        ])
                        .to_owned(),
                )
                .exec(db.as_ref())
                .await?;
        }
        Ok(())
    }

    /// All settings as a JSON document, for the control surface.
    pub fn to_document(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_default()
    }

    fn apply(&self, key: &str, value: serde_json::Value) -> Result<(), AppError> {
        let mut guard = self.inner.write().expect("settings lock poisoned");
        let mut doc = serde_json::to_value(&*guard)?;
        let obj = doc
            .as_object_mut()
            .ok_or_else(|| AppError::Internal("settings document is not an object".into()))?;

        if !obj.contains_key(key) {
            return Err(AppError::NotFound(format!("unknown setting: {}", key)));
        }
        obj.insert(key.to_string(), value);

        *guard = serde_json::from_value(doc)
            .map_err(|e| AppError::Validation(format!("invalid value for {}: {}", key, e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_weights_sum_to_one() {
        let s = EngineSettings::default();
        let total = s.score_weight_win_rate
            + s.score_weight_sharpe
            + s.score_weight_profit_factor
            + s.score_weight_drawdown
            + s.score_weight_volatility;
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn set_known_key_updates_snapshot() {
        let store = SettingsStore::new(None);
        store
            .set("real_trading_enabled", serde_json::json!(true))
            .await
            .unwrap();
        assert!(store.snapshot().real_trading_enabled);
    }

    #[tokio::test]
    async fn set_unknown_key_fails() {
        let store = SettingsStore::new(None);
        let err = store
            .set("no_such_key", serde_json::json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn invalid_value_is_rejected_and_state_unchanged() {
        let store = SettingsStore::new(None);
        let err = store
            .set("t4_size", serde_json::json!("not a number"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(store.snapshot().t4_size, 3);
    }
}
