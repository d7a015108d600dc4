pub mod breakout;
pub mod grid;
pub mod high_frequency;
pub mod mean_reversion;
pub mod momentum;
pub mod params;
pub mod schema;
pub mod trend_following;

pub use params::{StrategyParams, StrategyType};
pub use schema::{FamilySchema, PairRule, ParamSpec};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;

use crate::exchange::Kline;

/// Market snapshot handed to a family evaluator.
///
/// Candles are oldest-first and already bounded to the engine's history
/// window; `last` is the most recent trade price.
pub struct EvalContext<'a> {
    pub symbol: &'a str,
    pub candles: &'a [Kline],
    pub last: Decimal,
    pub now: DateTime<Utc>,
}

/// Mutable per-strategy evaluation state.
///
/// Keyed by (strategy, cycle) in the signal engine and reset whenever a new
/// parameter set is committed, so state never leaks across parameter
/// generations.
#[derive(Debug, Default, Clone)]
pub struct EvalState {
    /// Grid ladder anchor price.
    pub grid_reference: Option<Decimal>,
    /// Grid levels with an outstanding order.
    pub engaged_levels: HashSet<i32>,
    /// Price seen on the previous evaluation, for crossing detection.
    pub last_price: Option<Decimal>,
    /// Cooldown tracking for high-frequency signals.
    pub last_signal_at: Option<DateTime<Utc>>,
    /// Trailing-stop high-water mark while trend-following is long.
    pub high_water: Option<Decimal>,
    pub in_position: bool,
}

/// Trade direction carried from evaluator decision through signal to trade
/// record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
    Hold,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
            Side::Hold => "hold",
        }
    }

    pub fn is_actionable(&self) -> bool {
        !matches!(self, Side::Hold)
    }
}

/// Evaluator output before the signal engine sizes and fingerprints it.
#[derive(Debug, Clone)]
pub struct Decision {
    pub side: Side,
    /// Confidence in [0, 1].
    pub confidence: Decimal,
    pub reason: String,
}

impl Decision {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            side: Side::Hold,
            confidence: Decimal::ZERO,
            reason: reason.into(),
        }
    }
}

/// Mean of a candle statistic in f64, for z-scores and volatility.
pub(crate) fn mean_f64(values: impl Iterator<Item = f64>) -> Option<f64> {
    let collected: Vec<f64> = values.collect();
    if collected.is_empty() {
        return None;
    }
    Some(collected.iter().sum::<f64>() / collected.len() as f64)
}

/// Population standard deviation in f64.
pub(crate) fn std_dev_f64(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// One-bar log-free returns over a close series.
pub(crate) fn simple_returns(candles: &[Kline]) -> Vec<f64> {
    use rust_decimal::prelude::ToPrimitive;
    candles
        .windows(2)
        .filter_map(|w| {
            let prev = w[0].close.to_f64()?;
            let cur = w[1].close.to_f64()?;
            if prev == 0.0 {
                None
            } else {
                Some(cur / prev - 1.0)
            }
        })
        .collect()
}
