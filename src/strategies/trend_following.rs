use once_cell::sync::Lazy;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::schema::{FamilySchema, ParamSpec};
use super::{Side, Decision, EvalContext, EvalState};
use crate::utils::errors::AppError;

/// Enters when trend strength (distance of the close from its lookback mean)
/// exceeds `trend_threshold`, then rides the move with a trailing stop of
/// `trailing_stop_pct` off the high-water mark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendFollowingParams {
    pub lookback_period: u32,
    pub trend_threshold: Decimal,
    pub trailing_stop_pct: Decimal,
}

pub static SCHEMA: Lazy<FamilySchema> = Lazy::new(|| FamilySchema {
    specs: vec![
        ParamSpec::int("lookback_period", 10, 200, 50),
        ParamSpec::num("trend_threshold", "0.001", "0.2", "0.02"),
        ParamSpec::num("trailing_stop_pct", "0.005", "0.2", "0.03"),
    ],
    rules: vec![],
});

impl Default for TrendFollowingParams {
    fn default() -> Self {
        Self {
            lookback_period: 50,
            trend_threshold: Decimal::from_str_exact("0.02").unwrap(),
            trailing_stop_pct: Decimal::from_str_exact("0.03").unwrap(),
        }
    }
}

impl TrendFollowingParams {
    pub fn min_candles(&self) -> usize {
        self.lookback_period as usize
    }

    pub fn to_map(&self) -> BTreeMap<String, Decimal> {
        BTreeMap::from([
            (
                "lookback_period".to_string(),
                Decimal::from(self.lookback_period),
            ),
            ("trend_threshold".to_string(), self.trend_threshold),
            ("trailing_stop_pct".to_string(), self.trailing_stop_pct),
        ])
    }

    pub fn from_map(values: &BTreeMap<String, Decimal>) -> Result<Self, AppError> {
        SCHEMA.validate(values)?;
        Ok(Self {
            lookback_period: values["lookback_period"].to_u32().unwrap_or(50),
            trend_threshold: values["trend_threshold"],
            trailing_stop_pct: values["trailing_stop_pct"],
        })
    }

    pub fn evaluate(&self, ctx: &EvalContext, state: &mut EvalState) -> Decision {
        if ctx.candles.len() < self.min_candles() {
            return Decision::hold("insufficient_data");
        }

        let window = &ctx.candles[ctx.candles.len() - self.lookback_period as usize..];
        let total: Decimal = window.iter().map(|k| k.close).sum();
        let sma = total / Decimal::from(window.len() as u64);
        if sma <= Decimal::ZERO {
            return Decision::hold("insufficient_data");
        }
        let strength = (ctx.last - sma) / sma;

        if state.in_position {
            let high_water = state.high_water.unwrap_or(ctx.last).max(ctx.last);
            state.high_water = Some(high_water);

            let stop = high_water * (Decimal::ONE - self.trailing_stop_pct);
            if ctx.last <= stop {
                state.in_position = false;
                state.high_water = None;
                return Decision {
                    side: Side::Sell,
                    confidence: Decimal::from_str_exact("0.8").unwrap(),
                    reason: format!("trailing stop hit at {} (peak {})", stop, high_water),
                };
            }
            return Decision::hold("riding trend");
        }

        if strength >= self.trend_threshold {
            state.in_position = true;
            state.high_water = Some(ctx.last);
            let confidence = (strength / (self.trend_threshold * Decimal::from(2)))
                .min(Decimal::ONE);
            return Decision {
                side: Side::Buy,
                confidence,
                reason: format!(
                    "trend strength {:.4} over {} bars",
                    strength, self.lookback_period
                ),
            };
        }

        Decision::hold("trend below threshold")
    }
}
