use once_cell::sync::Lazy;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::schema::{FamilySchema, ParamSpec};
use super::{mean_f64, std_dev_f64, Side, Decision, EvalContext, EvalState};
use crate::utils::errors::AppError;

/// Counter-trades when the close's z-score over the lookback window exceeds
/// `std_multiplier`, provided the absolute deviation clears `min_deviation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanReversionParams {
    pub lookback_period: u32,
    pub std_multiplier: Decimal,
    pub min_deviation: Decimal,
}

pub static SCHEMA: Lazy<FamilySchema> = Lazy::new(|| FamilySchema {
    specs: vec![
        ParamSpec::int("lookback_period", 10, 200, 30),
        ParamSpec::num("std_multiplier", "1.0", "4.0", "2.0"),
        ParamSpec::num("min_deviation", "0.001", "0.1", "0.005"),
    ],
    rules: vec![],
});

impl Default for MeanReversionParams {
    fn default() -> Self {
        Self {
            lookback_period: 30,
            std_multiplier: Decimal::from(2),
            min_deviation: Decimal::from_str_exact("0.005").unwrap(),
        }
    }
}

impl MeanReversionParams {
    pub fn min_candles(&self) -> usize {
        self.lookback_period as usize
    }

    pub fn to_map(&self) -> BTreeMap<String, Decimal> {
        BTreeMap::from([
            (
                "lookback_period".to_string(),
                Decimal::from(self.lookback_period),
            ),
            ("std_multiplier".to_string(), self.std_multiplier),
            ("min_deviation".to_string(), self.min_deviation),
        ])
    }

    pub fn from_map(values: &BTreeMap<String, Decimal>) -> Result<Self, AppError> {
        SCHEMA.validate(values)?;
        Ok(Self {
            lookback_period: values["lookback_period"].to_u32().unwrap_or(30),
            std_multiplier: values["std_multiplier"],
            min_deviation: values["min_deviation"],
        })
    }

    pub fn evaluate(&self, ctx: &EvalContext, _state: &mut EvalState) -> Decision {
        if ctx.candles.len() < self.min_candles() {
            return Decision::hold("insufficient_data");
        }

        let window = &ctx.candles[ctx.candles.len() - self.lookback_period as usize..];
        let closes: Vec<f64> = window.iter().filter_map(|k| k.close.to_f64()).collect();
        if closes.len() < window.len() {
            return Decision::hold("insufficient_data");
        }

        let mean = match mean_f64(closes.iter().copied()) {
            Some(m) if m > 0.0 => m,
            _ => return Decision::hold("insufficient_data"),
        };
        let std = match std_dev_f64(&closes) {
            Some(s) if s > 0.0 => s,
            _ => return Decision::hold("no price dispersion"),
        };

        let last = match ctx.last.to_f64() {
            Some(v) => v,
            None => return Decision::hold("insufficient_data"),
        };
        let z = (last - mean) / std;
        let deviation = (last - mean).abs() / mean;

        let multiplier = self.std_multiplier.to_f64().unwrap_or(2.0);
        let min_dev = self.min_deviation.to_f64().unwrap_or(0.005);
        if z.abs() < multiplier || deviation < min_dev {
            return Decision::hold("within band");
        }

        let confidence = Decimal::from_f64((z.abs() / (multiplier * 2.0)).min(1.0))
            .unwrap_or(Decimal::ONE);
        // Price stretched above the mean reverts down, and vice versa.
        let side = if z > 0.0 { Side::Sell } else { Side::Buy };
        Decision {
            side,
            confidence,
            reason: format!("z-score {:.2} over {} bars", z, self.lookback_period),
        }
    }
}
