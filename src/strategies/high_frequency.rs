use chrono::Duration;
use once_cell::sync::Lazy;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::schema::{FamilySchema, ParamSpec};
use super::{simple_returns, std_dev_f64, Side, Decision, EvalContext, EvalState};
use crate::utils::errors::AppError;

/// Round-trip fee haircut applied to the expected move, as a fraction of
/// price.
const FEE_BUFFER: f64 = 0.002;

/// Scalps short bursts of realized volatility: trades in the direction of the
/// last bar when volatility exceeds `volatility_threshold` and the expected
/// edge after fees clears `min_profit`, with a `signal_interval` cooldown
/// between signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighFrequencyParams {
    pub lookback_period: u32,
    pub volatility_threshold: Decimal,
    /// Minimum expected profit per unit, in quote currency.
    pub min_profit: Decimal,
    /// Cooldown between signals, seconds.
    pub signal_interval: u32,
}

pub static SCHEMA: Lazy<FamilySchema> = Lazy::new(|| FamilySchema {
    specs: vec![
        ParamSpec::int("lookback_period", 5, 60, 20),
        ParamSpec::num("volatility_threshold", "0.0005", "0.05", "0.004"),
        ParamSpec::num("min_profit", "0.01", "100", "1"),
        ParamSpec::int("signal_interval", 1, 3600, 60),
    ],
    rules: vec![],
});

impl Default for HighFrequencyParams {
    fn default() -> Self {
        Self {
            lookback_period: 20,
            volatility_threshold: Decimal::from_str_exact("0.004").unwrap(),
            min_profit: Decimal::ONE,
            signal_interval: 60,
        }
    }
}

impl HighFrequencyParams {
    pub fn min_candles(&self) -> usize {
        self.lookback_period as usize + 1
    }

    pub fn to_map(&self) -> BTreeMap<String, Decimal> {
        BTreeMap::from([
            (
                "lookback_period".to_string(),
                Decimal::from(self.lookback_period),
            ),
            (
                "volatility_threshold".to_string(),
                self.volatility_threshold,
            ),
            ("min_profit".to_string(), self.min_profit),
            (
                "signal_interval".to_string(),
                Decimal::from(self.signal_interval),
            ),
        ])
    }

    pub fn from_map(values: &BTreeMap<String, Decimal>) -> Result<Self, AppError> {
        SCHEMA.validate(values)?;
        Ok(Self {
            lookback_period: values["lookback_period"].to_u32().unwrap_or(20),
            volatility_threshold: values["volatility_threshold"],
            min_profit: values["min_profit"],
            signal_interval: values["signal_interval"].to_u32().unwrap_or(60),
        })
    }

    pub fn evaluate(&self, ctx: &EvalContext, state: &mut EvalState) -> Decision {
        if ctx.candles.len() < self.min_candles() {
            return Decision::hold("insufficient_data");
        }

        if let Some(last_at) = state.last_signal_at {
            let elapsed = ctx.now.signed_duration_since(last_at);
            if elapsed < Duration::seconds(self.signal_interval as i64) {
                return Decision::hold("cooldown");
            }
        }

        let window = &ctx.candles[ctx.candles.len() - self.min_candles()..];
        let returns = simple_returns(window);
        let vol = match std_dev_f64(&returns) {
            Some(v) => v,
            None => return Decision::hold("insufficient_data"),
        };

        let vol_threshold = self.volatility_threshold.to_f64().unwrap_or(0.004);
        if vol < vol_threshold {
            return Decision::hold("volatility below threshold");
        }

        let last = match ctx.last.to_f64() {
            Some(v) => v,
            None => return Decision::hold("insufficient_data"),
        };
        let expected_edge = (vol - FEE_BUFFER) * last;
        let min_profit = self.min_profit.to_f64().unwrap_or(1.0);
        if expected_edge < min_profit {
            return Decision::hold("edge below fee-adjusted minimum");
        }

        let last_return = *returns.last().unwrap_or(&0.0);
        if last_return == 0.0 {
            return Decision::hold("no direction");
        }

        state.last_signal_at = Some(ctx.now);
        let confidence = Decimal::from_f64((vol / vol_threshold / 2.0).min(1.0))
            .unwrap_or(Decimal::ONE);
        Decision {
            side: if last_return > 0.0 {
                Side::Buy
            } else {
                Side::Sell
            },
            confidence,
            reason: format!("realized vol {:.4} over {} bars", vol, self.lookback_period),
        }
    }
}
