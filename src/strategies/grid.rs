use once_cell::sync::Lazy;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::schema::{FamilySchema, ParamSpec};
use super::{Side, Decision, EvalContext, EvalState};
use crate::utils::errors::AppError;

/// Static ladder of `grid_count` levels spaced `grid_spacing` around the
/// reference price captured on first evaluation. An order is emitted when
/// price crosses a rung with no outstanding order; the rung re-arms when
/// price crosses back through it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridParams {
    pub grid_count: u32,
    pub grid_spacing: Decimal,
}

pub static SCHEMA: Lazy<FamilySchema> = Lazy::new(|| FamilySchema {
    specs: vec![
        ParamSpec::int("grid_count", 2, 40, 10),
        ParamSpec::num("grid_spacing", "0.001", "0.05", "0.01"),
    ],
    rules: vec![],
});

impl Default for GridParams {
    fn default() -> Self {
        Self {
            grid_count: 10,
            grid_spacing: Decimal::from_str_exact("0.01").unwrap(),
        }
    }
}

impl GridParams {
    pub fn min_candles(&self) -> usize {
        1
    }

    pub fn to_map(&self) -> BTreeMap<String, Decimal> {
        BTreeMap::from([
            ("grid_count".to_string(), Decimal::from(self.grid_count)),
            ("grid_spacing".to_string(), self.grid_spacing),
        ])
    }

    pub fn from_map(values: &BTreeMap<String, Decimal>) -> Result<Self, AppError> {
        SCHEMA.validate(values)?;
        Ok(Self {
            grid_count: values["grid_count"].to_u32().unwrap_or(10),
            grid_spacing: values["grid_spacing"],
        })
    }

    fn level_price(&self, reference: Decimal, index: i32) -> Decimal {
        reference * (Decimal::ONE + self.grid_spacing * Decimal::from(index))
    }

    pub fn evaluate(&self, ctx: &EvalContext, state: &mut EvalState) -> Decision {
        if ctx.candles.is_empty() {
            return Decision::hold("insufficient_data");
        }

        let reference = match state.grid_reference {
            Some(r) => r,
            None => {
                state.grid_reference = Some(ctx.last);
                state.last_price = Some(ctx.last);
                return Decision::hold("grid anchored");
            }
        };
        let prev = match state.last_price {
            Some(p) => p,
            None => {
                state.last_price = Some(ctx.last);
                return Decision::hold("grid anchored");
            }
        };
        state.last_price = Some(ctx.last);

        if ctx.last == prev {
            return Decision::hold("no level crossed");
        }

        let half = (self.grid_count / 2).max(1) as i32;
        let moving_up = ctx.last > prev;
        let lo = prev.min(ctx.last);
        let hi = prev.max(ctx.last);

        // Walk rungs in crossing order so the nearest one fires first.
        let indices: Vec<i32> = if moving_up {
            (-half..=half).filter(|i| *i != 0).collect()
        } else {
            (-half..=half).rev().filter(|i| *i != 0).collect()
        };

        for index in indices {
            let rung = self.level_price(reference, index);
            if rung <= lo || rung > hi {
                continue;
            }

            let engaged = state.engaged_levels.contains(&index);
            if moving_up {
                if index > 0 && !engaged {
                    state.engaged_levels.insert(index);
                    return Decision {
                        side: Side::Sell,
                        confidence: Decimal::from_str_exact("0.6").unwrap(),
                        reason: format!("price crossed sell rung {} at {}", index, rung),
                    };
                }
                if index < 0 && engaged {
                    // Buy rung filled on the way down; price recovered past it.
                    state.engaged_levels.remove(&index);
                }
            } else {
                if index < 0 && !engaged {
                    state.engaged_levels.insert(index);
                    return Decision {
                        side: Side::Buy,
                        confidence: Decimal::from_str_exact("0.6").unwrap(),
                        reason: format!("price crossed buy rung {} at {}", index, rung),
                    };
                }
                if index > 0 && engaged {
                    state.engaged_levels.remove(&index);
                }
            }
        }

        Decision::hold("no level crossed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::exchange::Kline;

    fn kline(price: Decimal) -> Kline {
        let now = Utc::now();
        Kline {
            open_time: now,
            close_time: now,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Decimal::from(1000),
            quote_volume: price * Decimal::from(1000),
            trades_count: 10,
        }
    }

    fn eval(params: &GridParams, state: &mut EvalState, price: i64) -> Decision {
        let candles = vec![kline(Decimal::from(price))];
        let ctx = EvalContext {
            symbol: "BTC/USDT",
            candles: &candles,
            last: Decimal::from(price),
            now: Utc::now(),
        };
        params.evaluate(&ctx, state)
    }

    fn params() -> GridParams {
        GridParams {
            grid_count: 10,
            grid_spacing: Decimal::from_str_exact("0.01").unwrap(),
        }
    }

    #[test]
    fn first_evaluation_anchors_the_grid() {
        let mut state = EvalState::default();
        let decision = eval(&params(), &mut state, 100);
        assert_eq!(decision.side, Side::Hold);
        assert_eq!(state.grid_reference, Some(Decimal::from(100)));
    }

    #[test]
    fn crossing_a_buy_rung_buys_once() {
        let params = params();
        let mut state = EvalState::default();
        eval(&params, &mut state, 100);

        // Drop through the -1 rung at 99.
        let decision = eval(&params, &mut state, 98);
        assert_eq!(decision.side, Side::Buy);

        // Hovering below the same rung does not re-fire.
        let decision = eval(&params, &mut state, 98);
        assert_eq!(decision.side, Side::Hold);
    }

    #[test]
    fn rung_rearms_after_price_recovers() {
        let params = params();
        let mut state = EvalState::default();
        eval(&params, &mut state, 100);

        assert_eq!(eval(&params, &mut state, 98).side, Side::Buy);
        // Recovery back above the rung re-arms it...
        assert_eq!(eval(&params, &mut state, 100).side, Side::Hold);
        // ...so the next drop fires again.
        assert_eq!(eval(&params, &mut state, 98).side, Side::Buy);
    }

    #[test]
    fn rally_through_a_sell_rung_sells() {
        let params = params();
        let mut state = EvalState::default();
        eval(&params, &mut state, 100);
        assert_eq!(eval(&params, &mut state, 102).side, Side::Sell);
    }
}
