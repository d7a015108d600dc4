use once_cell::sync::Lazy;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::schema::{FamilySchema, PairRule, ParamSpec};
use super::{Side, Decision, EvalContext, EvalState};
use crate::utils::errors::AppError;

/// Short-horizon return vs threshold, confirmed by a volume surge against
/// the longer-window mean volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentumParams {
    pub short_period: u32,
    pub long_period: u32,
    pub threshold: Decimal,
    pub volume_threshold: Decimal,
}

pub static SCHEMA: Lazy<FamilySchema> = Lazy::new(|| FamilySchema {
    specs: vec![
        ParamSpec::int("short_period", 2, 50, 5),
        ParamSpec::int("long_period", 10, 200, 40),
        ParamSpec::num("threshold", "0.001", "0.2", "0.01"),
        ParamSpec::num("volume_threshold", "1.0", "5.0", "1.5"),
    ],
    rules: vec![PairRule::LessThan("short_period", "long_period")],
});

impl Default for MomentumParams {
    fn default() -> Self {
        Self {
            short_period: 5,
            long_period: 40,
            threshold: Decimal::from_str_exact("0.01").unwrap(),
            volume_threshold: Decimal::from_str_exact("1.5").unwrap(),
        }
    }
}

impl MomentumParams {
    pub fn min_candles(&self) -> usize {
        (self.long_period as usize).max(self.short_period as usize + 1)
    }

    pub fn to_map(&self) -> BTreeMap<String, Decimal> {
        BTreeMap::from([
            ("short_period".to_string(), Decimal::from(self.short_period)),
            ("long_period".to_string(), Decimal::from(self.long_period)),
            ("threshold".to_string(), self.threshold),
            ("volume_threshold".to_string(), self.volume_threshold),
        ])
    }

    pub fn from_map(values: &BTreeMap<String, Decimal>) -> Result<Self, AppError> {
        SCHEMA.validate(values)?;
        Ok(Self {
            short_period: values["short_period"].to_u32().unwrap_or(5),
            long_period: values["long_period"].to_u32().unwrap_or(40),
            threshold: values["threshold"],
            volume_threshold: values["volume_threshold"],
        })
    }

    pub fn evaluate(&self, ctx: &EvalContext, _state: &mut EvalState) -> Decision {
        if ctx.candles.len() < self.min_candles() {
            return Decision::hold("insufficient_data");
        }

        let len = ctx.candles.len();
        let base = ctx.candles[len - 1 - self.short_period as usize].close;
        if base <= Decimal::ZERO {
            return Decision::hold("insufficient_data");
        }
        let ret = (ctx.last - base) / base;

        let window = &ctx.candles[len - self.long_period as usize..];
        let total_volume: Decimal = window.iter().map(|k| k.volume).sum();
        let mean_volume = total_volume / Decimal::from(window.len() as u64);
        let last_volume = ctx.candles[len - 1].volume;

        if mean_volume <= Decimal::ZERO || last_volume < self.volume_threshold * mean_volume {
            return Decision::hold("volume below surge threshold");
        }

        if ret.abs() < self.threshold {
            return Decision::hold("return below threshold");
        }

        let confidence = (ret.abs() / (self.threshold * Decimal::from(2)))
            .min(Decimal::ONE);
        let side = if ret > Decimal::ZERO {
            Side::Buy
        } else {
            Side::Sell
        };
        Decision {
            side,
            confidence,
            reason: format!("momentum {:.4}% over {} bars", ret * Decimal::from(100), self.short_period),
        }
    }
}
