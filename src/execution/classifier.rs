use chrono::{DateTime, Duration, Utc};

use crate::config::EngineSettings;
use crate::registry::{StrategyRecord, Tier};
use crate::scoring::TradeKind;

/// Split a signal into the real or validation trade path.
///
/// Everything defaults to validation; real execution requires the global
/// toggle, T4 membership, the score gate, a minimum simulated track record
/// (`min_sim_days`), and an elapsed protection window since the strategy
/// first became real-eligible. The caller still archives every real signal
/// as a validation observation for scoring continuity.
pub fn classify(
    strategy: &StrategyRecord,
    settings: &EngineSettings,
    now: DateTime<Utc>,
) -> TradeKind {
    if !settings.real_trading_enabled {
        return TradeKind::Validation;
    }
    if strategy.tier != Some(Tier::T4) {
        return TradeKind::Validation;
    }
    if !strategy.qualifies_for_real {
        return TradeKind::Validation;
    }
    if now.signed_duration_since(strategy.created_at) < Duration::days(settings.min_sim_days as i64)
    {
        return TradeKind::Validation;
    }
    if strategy.is_protected(now) {
        return TradeKind::Validation;
    }
    TradeKind::Real
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal::Decimal;

    use crate::strategies::{StrategyParams, StrategyType};

    fn eligible_t4() -> StrategyRecord {
        let mut record = StrategyRecord::new(
            StrategyType::Momentum,
            "BTC/USDT".to_string(),
            StrategyParams::defaults(StrategyType::Momentum),
            None,
        );
        record.tier = Some(Tier::T4);
        record.qualifies_for_real = true;
        record.metrics.final_score = Decimal::from(80);
        // Old enough to clear the minimum simulated track record.
        record.created_at = Utc::now() - Duration::days(30);
        record
    }

    fn enabled_settings() -> EngineSettings {
        EngineSettings {
            real_trading_enabled: true,
            ..EngineSettings::default()
        }
    }

    #[test]
    fn gate_off_forces_validation() {
        let record = eligible_t4();
        let settings = EngineSettings::default();
        assert_eq!(
            classify(&record, &settings, Utc::now()),
            TradeKind::Validation
        );
    }

    #[test]
    fn eligible_t4_trades_real_when_gate_on() {
        assert_eq!(
            classify(&eligible_t4(), &enabled_settings(), Utc::now()),
            TradeKind::Real
        );
    }

    #[test]
    fn below_t4_stays_validation() {
        let mut record = eligible_t4();
        record.tier = Some(Tier::T3);
        assert_eq!(
            classify(&record, &enabled_settings(), Utc::now()),
            TradeKind::Validation
        );
    }

    #[test]
    fn young_strategies_stay_in_validation() {
        let mut record = eligible_t4();
        record.created_at = Utc::now() - Duration::hours(12);
        assert_eq!(
            classify(&record, &enabled_settings(), Utc::now()),
            TradeKind::Validation
        );
    }

    #[test]
    fn protection_window_defers_real_trading() {
        let mut record = eligible_t4();
        record.protected_until = Some(Utc::now() + Duration::minutes(30));
        assert_eq!(
            classify(&record, &enabled_settings(), Utc::now()),
            TradeKind::Validation
        );

        // Window elapsed.
        record.protected_until = Some(Utc::now() - Duration::minutes(1));
        assert_eq!(
            classify(&record, &enabled_settings(), Utc::now()),
            TradeKind::Real
        );
    }
}
