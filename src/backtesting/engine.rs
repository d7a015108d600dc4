use chrono::Utc;
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::EngineSettings;
use crate::exchange::Kline;
use crate::scoring::{ScoreCard, TradeKind, TradeOutcome};
use crate::strategies::{EvalContext, EvalState, Side, StrategyParams};

use super::types::{BacktestOutcome, Portfolio, ReplayTrade};

/// Replays a parameter set over historical candles and scores the result
/// with the live SCS formula.
///
/// This is the shadow-backtest gate of the evolution loop: a proposal has to
/// beat its parent here before it earns live validation.
pub struct ShadowBacktester;

impl ShadowBacktester {
    /// Run one replay. Candles are oldest-first; the stake per entry and the
    /// fee rate come from the engine settings so shadow results are
    /// comparable with validation trading.
    pub fn run(
        params: &StrategyParams,
        candles: &[Kline],
        settings: &EngineSettings,
    ) -> BacktestOutcome {
        let stake = settings.validation_amount;
        let mut portfolio = Portfolio::new(stake * Decimal::from(10));
        let mut state = EvalState::default();
        let mut card = ScoreCard::default();
        let mut trades: Vec<ReplayTrade> = Vec::new();

        let mut entry_price: Option<Decimal> = None;
        let mut entry_qty = Decimal::ZERO;

        let warmup = params.min_candles();
        for index in warmup..candles.len() {
            let kline = &candles[index];
            portfolio.update_total_value(kline.close);

            // Stop-loss / take-profit guard the open position before the
            // strategy itself is consulted.
            if let Some(entry) = entry_price {
                if entry > Decimal::ZERO {
                    let change = (kline.close - entry) / entry;
                    let stop = change <= -settings.stop_loss_pct;
                    let take = change >= settings.take_profit_pct;
                    if stop || take {
                        let reason = if stop { "stop loss" } else { "take profit" };
                        Self::close(
                            &mut portfolio,
                            &mut card,
                            &mut trades,
                            kline,
                            entry,
                            entry_qty,
                            settings,
                            reason,
                        );
                        entry_price = None;
                        entry_qty = Decimal::ZERO;
                    }
                }
            }

            let ctx = EvalContext {
                symbol: "replay",
                candles: &candles[..=index],
                last: kline.close,
                now: kline.close_time,
            };
            let decision = params.evaluate(&ctx, &mut state);

            match decision.side {
                Side::Buy if entry_price.is_none() => {
                    let quantity = if kline.close > Decimal::ZERO {
                        stake / kline.close
                    } else {
                        continue;
                    };
                    if portfolio.execute_buy(kline.close, quantity) {
                        let fee = stake * settings.fee_rate;
                        portfolio.cash_balance -= fee;
                        entry_price = Some(kline.close);
                        entry_qty = quantity;
                        trades.push(ReplayTrade {
                            ts: kline.close_time,
                            side: Side::Buy,
                            price: kline.close,
                            quantity,
                            pnl: None,
                            reason: decision.reason.clone(),
                        });
                        card.insert(TradeOutcome {
                            fingerprint: format!("replay-{}", index),
                            kind: TradeKind::Validation,
                            side: Side::Buy,
                            pnl: Decimal::ZERO,
                            fees: fee,
                            realized: false,
                            success: true,
                            ts: kline.close_time,
                        });
                    }
                }
                Side::Sell => {
                    if let Some(entry) = entry_price {
                        Self::close(
                            &mut portfolio,
                            &mut card,
                            &mut trades,
                            kline,
                            entry,
                            entry_qty,
                            settings,
                            &decision.reason,
                        );
                        entry_price = None;
                        entry_qty = Decimal::ZERO;
                    }
                }
                _ => {}
            }
        }

        // Close any remaining position at the final bar.
        if let (Some(entry), Some(last)) = (entry_price, candles.last()) {
            Self::close(
                &mut portfolio,
                &mut card,
                &mut trades,
                last,
                entry,
                entry_qty,
                settings,
                "end of replay",
            );
        }
        if let Some(last) = candles.last() {
            portfolio.update_total_value(last.close);
        }

        let breakdown = card.compute(settings);
        debug!(
            "Shadow backtest: {} trades, score {}",
            trades.len(),
            breakdown.final_score
        );

        BacktestOutcome {
            breakdown,
            trades,
            final_balance: portfolio.total_value,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn close(
        portfolio: &mut Portfolio,
        card: &mut ScoreCard,
        trades: &mut Vec<ReplayTrade>,
        kline: &Kline,
        entry: Decimal,
        quantity: Decimal,
        settings: &EngineSettings,
        reason: &str,
    ) {
        if quantity <= Decimal::ZERO || !portfolio.execute_sell(kline.close, quantity) {
            return;
        }
        let fee = kline.close * quantity * settings.fee_rate;
        portfolio.cash_balance -= fee;
        let pnl = (kline.close - entry) * quantity - fee;

        trades.push(ReplayTrade {
            ts: kline.close_time,
            side: Side::Sell,
            price: kline.close,
            quantity,
            pnl: Some(pnl),
            reason: reason.to_string(),
        });
        card.insert(TradeOutcome {
            fingerprint: format!("replay-close-{}", trades.len()),
            kind: TradeKind::Validation,
            side: Side::Sell,
            pnl,
            fees: fee,
            realized: true,
            success: true,
            ts: kline.close_time,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal::prelude::*;

    use crate::strategies::momentum::MomentumParams;

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
                volume: Decimal::from(3000),
                quote_volume: Decimal::from(3000 * *p),
                trades_count: 10,
            })
            .collect()
    }

    fn momentum() -> StrategyParams {
        StrategyParams::Momentum(MomentumParams {
            short_period: 2,
            long_period: 10,
            threshold: Decimal::from_str_exact("0.01").unwrap(),
            volume_threshold: Decimal::from_str_exact("0.5").unwrap(),
        })
    }

    #[test]
    fn uptrend_replay_produces_profitable_trades() {
        // Steady riser: momentum enters and the final close banks profit.
        let prices: Vec<i64> = (0..40).map(|i| 100 + i * 2).collect();
        let outcome =
            ShadowBacktester::run(&momentum(), &klines(&prices), &EngineSettings::default());

        assert!(!outcome.trades.is_empty());
        assert!(outcome.breakdown.total_pnl > Decimal::ZERO);
        assert!(outcome.final_balance > Decimal::from(1000));
    }

    #[test]
    fn flat_replay_emits_no_trades_and_prior_score() {
        let prices = vec![100i64; 40];
        let outcome =
            ShadowBacktester::run(&momentum(), &klines(&prices), &EngineSettings::default());
        assert!(outcome.trades.is_empty());
        assert!(outcome.breakdown.provisional);
    }

    #[test]
    fn replay_is_deterministic() {
        let prices: Vec<i64> = (0..60).map(|i| 100 + ((i * 7) % 13) - 6).collect();
        let settings = EngineSettings::default();
        let a = ShadowBacktester::run(&momentum(), &klines(&prices), &settings);
        let b = ShadowBacktester::run(&momentum(), &klines(&prices), &settings);
        assert_eq!(a.breakdown.final_score, b.breakdown.final_score);
        assert_eq!(a.trades.len(), b.trades.len());
    }
}
