use once_cell::sync::Lazy;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::schema::{FamilySchema, PairRule, ParamSpec};
use super::{Side, Decision, EvalContext, EvalState};
use crate::utils::errors::AppError;

/// Trades closes that clear the rolling extreme of the lookback window by
/// `breakout_threshold`, sustained for `confirmation_periods` consecutive
/// bars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakoutParams {
    pub lookback_period: u32,
    pub breakout_threshold: Decimal,
    pub confirmation_periods: u32,
}

pub static SCHEMA: Lazy<FamilySchema> = Lazy::new(|| FamilySchema {
    specs: vec![
        ParamSpec::int("lookback_period", 10, 200, 50),
        ParamSpec::num("breakout_threshold", "0.001", "0.1", "0.01"),
        ParamSpec::int("confirmation_periods", 1, 10, 2),
    ],
    rules: vec![PairRule::LessThan("confirmation_periods", "lookback_period")],
});

impl Default for BreakoutParams {
    fn default() -> Self {
        Self {
            lookback_period: 50,
            breakout_threshold: Decimal::from_str_exact("0.01").unwrap(),
            confirmation_periods: 2,
        }
    }
}

impl BreakoutParams {
    pub fn min_candles(&self) -> usize {
        self.lookback_period as usize + self.confirmation_periods as usize
    }

    pub fn to_map(&self) -> BTreeMap<String, Decimal> {
        BTreeMap::from([
            (
                "lookback_period".to_string(),
                Decimal::from(self.lookback_period),
            ),
            ("breakout_threshold".to_string(), self.breakout_threshold),
            (
                "confirmation_periods".to_string(),
                Decimal::from(self.confirmation_periods),
            ),
        ])
    }

    pub fn from_map(values: &BTreeMap<String, Decimal>) -> Result<Self, AppError> {
        SCHEMA.validate(values)?;
        Ok(Self {
            lookback_period: values["lookback_period"].to_u32().unwrap_or(50),
            breakout_threshold: values["breakout_threshold"],
            confirmation_periods: values["confirmation_periods"].to_u32().unwrap_or(2),
        })
    }

    pub fn evaluate(&self, ctx: &EvalContext, _state: &mut EvalState) -> Decision {
        if ctx.candles.len() < self.min_candles() {
            return Decision::hold("insufficient_data");
        }

        let len = ctx.candles.len();
        let confirm = self.confirmation_periods as usize;
        // Reference window excludes the bars being confirmed.
        let window = &ctx.candles[len - confirm - self.lookback_period as usize..len - confirm];
        let rolling_max = window
            .iter()
            .map(|k| k.close)
            .max()
            .unwrap_or(Decimal::ZERO);
        let rolling_min = window
            .iter()
            .map(|k| k.close)
            .min()
            .unwrap_or(Decimal::ZERO);
        if rolling_max <= Decimal::ZERO {
            return Decision::hold("insufficient_data");
        }

        let upper = rolling_max * (Decimal::ONE + self.breakout_threshold);
        let lower = rolling_min * (Decimal::ONE - self.breakout_threshold);
        let confirming = &ctx.candles[len - confirm..];

        if confirming.iter().all(|k| k.close > upper) {
            let stretch = (ctx.last - upper) / upper;
            return Decision {
                side: Side::Buy,
                confidence: (Decimal::from_str_exact("0.5").unwrap()
                    + stretch / self.breakout_threshold / Decimal::from(4))
                .min(Decimal::ONE),
                reason: format!(
                    "close above {}-bar high for {} bars",
                    self.lookback_period, self.confirmation_periods
                ),
            };
        }

        if confirming.iter().all(|k| k.close < lower) {
            let stretch = (lower - ctx.last) / lower;
            return Decision {
                side: Side::Sell,
                confidence: (Decimal::from_str_exact("0.5").unwrap()
                    + stretch / self.breakout_threshold / Decimal::from(4))
                .min(Decimal::ONE),
                reason: format!(
                    "close below {}-bar low for {} bars",
                    self.lookback_period, self.confirmation_periods
                ),
            };
        }

        Decision::hold("no confirmed breakout")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    use crate::exchange::Kline;

    fn klines(prices: &[i64]) -> Vec<Kline> {
        let base = Utc::now() - Duration::hours(prices.len() as i64);
        prices
            .iter()
            .enumerate()
            .map(|(i, p)| Kline {
                open_time: base + Duration::hours(i as i64),
                close_time: base + Duration::hours(i as i64 + 1),
                open: Decimal::from(*p),
                high: Decimal::from(*p),
                low: Decimal::from(*p),
                close: Decimal::from(*p),
                volume: Decimal::from(1000),
                quote_volume: Decimal::from(1000 * *p),
                trades_count: 10,
            })
            .collect()
    }

    fn eval(params: &BreakoutParams, candles: &[Kline]) -> Decision {
        let ctx = EvalContext {
            symbol: "BTC/USDT",
            candles,
            last: candles.last().unwrap().close,
            now: Utc::now(),
        };
        params.evaluate(&ctx, &mut EvalState::default())
    }

    fn params() -> BreakoutParams {
        BreakoutParams {
            lookback_period: 10,
            breakout_threshold: Decimal::from_str_exact("0.01").unwrap(),
            confirmation_periods: 2,
        }
    }

    #[test]
    fn confirmed_upside_breakout_buys() {
        // Range-bound at 100, then two consecutive closes >1% above the high.
        let candles = klines(&[100, 100, 100, 100, 100, 100, 100, 100, 100, 100, 103, 104]);
        assert_eq!(eval(&params(), &candles).side, Side::Buy);
    }

    #[test]
    fn single_bar_poke_is_not_confirmed() {
        let candles = klines(&[100, 100, 100, 100, 100, 100, 100, 100, 100, 100, 100, 104]);
        assert_eq!(eval(&params(), &candles).side, Side::Hold);
    }

    #[test]
    fn confirmed_downside_breakout_sells() {
        let candles = klines(&[100, 100, 100, 100, 100, 100, 100, 100, 100, 100, 97, 96]);
        assert_eq!(eval(&params(), &candles).side, Side::Sell);
    }
}
