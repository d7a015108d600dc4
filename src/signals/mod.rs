use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::exchange::{ExchangeError, KlineInterval, MarketDataGateway, OrderSide};
use crate::strategies::{EvalContext, EvalState, Side, StrategyParams};

/// Discrete trade signal produced by one strategy evaluation.
#[derive(Debug, Clone)]
pub struct Signal {
    pub strategy_id: Uuid,
    pub cycle: u64,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Confidence in [0, 1].
    pub confidence: Decimal,
    pub ts: DateTime<Utc>,
    /// Content hash used for trade deduplication and idempotent execution.
    pub fingerprint: String,
    pub reason: String,
}

impl Signal {
    pub fn is_actionable(&self) -> bool {
        self.side.is_actionable() && self.quantity > Decimal::ZERO
    }
}

/// Content hash of (strategy, parameter cycle, symbol, bar, side).
///
/// Two workers evaluating the same strategy at the same bar produce the same
/// fingerprint, which is what makes downstream dedup possible.
pub fn fingerprint(
    strategy_id: Uuid,
    cycle: u64,
    symbol: &str,
    bar_ts: DateTime<Utc>,
    side: Side,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(strategy_id.as_bytes());
    hasher.update(cycle.to_be_bytes());
    hasher.update(symbol.as_bytes());
    hasher.update(bar_ts.timestamp_millis().to_be_bytes());
    hasher.update(side.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Evaluates strategies against market data and emits signals.
///
/// Per-strategy evaluation state (grid rungs, cooldowns, trailing stops) is
/// keyed by (strategy, cycle) so a committed parameter change starts from a
/// clean slate. The engine never fails an evaluation: missing or stale data
/// produces a `hold` signal carrying the reason.
pub struct SignalEngine {
    gateway: Arc<dyn MarketDataGateway>,
    states: DashMap<(Uuid, u64), EvalState>,
    interval: KlineInterval,
    history: usize,
}

impl SignalEngine {
    pub fn new(gateway: Arc<dyn MarketDataGateway>, interval: KlineInterval, history: usize) -> Self {
        Self {
            gateway,
            states: DashMap::new(),
            interval,
            history,
        }
    }

    /// Evaluate one strategy. `quote_amount` sizes the emitted order in quote
    /// currency; `max_age` bounds acceptable tick staleness.
    pub async fn evaluate(
        &self,
        strategy_id: Uuid,
        cycle: u64,
        symbol: &str,
        params: &StrategyParams,
        quote_amount: Decimal,
        max_age: Duration,
    ) -> Signal {
        let now = Utc::now();

        let ticker = match self.gateway.price(symbol, Some(max_age)).await {
            Ok(t) => t,
            Err(e) => {
                return self.hold_signal(strategy_id, cycle, symbol, now, hold_reason(&e));
            }
        };

        let want = params.min_candles().min(self.history);
        let candles = match self.gateway.candles(symbol, self.interval, self.history).await {
            Ok(c) if c.len() >= want => c,
            Ok(_) => {
                return self.hold_signal(strategy_id, cycle, symbol, now, "insufficient_data");
            }
            Err(e) => {
                return self.hold_signal(strategy_id, cycle, symbol, now, hold_reason(&e));
            }
        };

        // Drop state from earlier parameter cycles of this strategy.
        self.states
            .retain(|(id, c), _| *id != strategy_id || *c == cycle);

        let decision = {
            let mut state = self
                .states
                .entry((strategy_id, cycle))
                .or_default();
            let ctx = EvalContext {
                symbol,
                candles: &candles,
                last: ticker.last,
                now,
            };
            params.evaluate(&ctx, &mut state)
        };

        let bar_ts = candles.last().map(|k| k.close_time).unwrap_or(now);
        let (price, quantity) = if decision.side.is_actionable() {
            self.priced_quantity(symbol, decision.side, quote_amount, ticker.last)
                .await
        } else {
            (ticker.last, Decimal::ZERO)
        };

        debug!(
            "Evaluated {} cycle {} on {}: {} ({})",
            strategy_id,
            cycle,
            symbol,
            decision.side.as_str(),
            decision.reason
        );

        Signal {
            strategy_id,
            cycle,
            symbol: symbol.to_string(),
            side: decision.side,
            price,
            quantity,
            confidence: decision.confidence,
            ts: now,
            fingerprint: fingerprint(strategy_id, cycle, symbol, bar_ts, decision.side),
            reason: decision.reason,
        }
    }

    /// Clear evaluation state for a strategy, e.g. after retirement.
    pub fn forget(&self, strategy_id: Uuid) {
        self.states.retain(|(id, _), _| *id != strategy_id);
    }

    /// Close time of the newest candle for a symbol, for bar-driven
    /// scheduling.
    pub async fn latest_bar(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.gateway
            .candles(symbol, self.interval, 1)
            .await
            .ok()?
            .last()
            .map(|k| k.close_time)
    }

    /// Round the signal price to the tick toward the adverse side and size
    /// the quantity down to the lot.
    async fn priced_quantity(
        &self,
        symbol: &str,
        side: Side,
        quote_amount: Decimal,
        last: Decimal,
    ) -> (Decimal, Decimal) {
        let info = match self.gateway.symbol_info(symbol).await {
            Ok(info) => info,
            Err(_) => {
                let quantity = if last > Decimal::ZERO {
                    quote_amount / last
                } else {
                    Decimal::ZERO
                };
                return (last, quantity);
            }
        };

        let order_side = match side {
            Side::Sell => OrderSide::Sell,
            _ => OrderSide::Buy,
        };
        let price = info.round_price(last, order_side);
        let quantity = if price > Decimal::ZERO {
            info.round_quantity(quote_amount / price)
        } else {
            Decimal::ZERO
        };
        (price, quantity)
    }

    fn hold_signal(
        &self,
        strategy_id: Uuid,
        cycle: u64,
        symbol: &str,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Signal {
        Signal {
            strategy_id,
            cycle,
            symbol: symbol.to_string(),
            side: Side::Hold,
            price: Decimal::ZERO,
            quantity: Decimal::ZERO,
            confidence: Decimal::ZERO,
            ts: now,
            fingerprint: fingerprint(strategy_id, cycle, symbol, now, Side::Hold),
            reason: reason.to_string(),
        }
    }
}

fn hold_reason(err: &ExchangeError) -> &'static str {
    match err {
        ExchangeError::StaleData { .. } => "stale_data",
        ExchangeError::Unavailable(_) => "feed_unavailable",
        _ => "insufficient_data",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    use crate::exchange::{Kline, SimExchange};
    use crate::strategies::momentum::MomentumParams;
    use crate::strategies::StrategyType;

    fn rising_klines(n: usize) -> Vec<Kline> {
        let base = Utc::now() - ChronoDuration::hours(n as i64);
        (0..n)
            .map(|i| {
                let price = Decimal::from(100 + (i as i64) * 2);
                let volume = if i == n - 1 {
                    Decimal::from(5000)
                } else {
                    Decimal::from(1000)
                };
                Kline {
                    open_time: base + ChronoDuration::hours(i as i64),
                    close_time: base + ChronoDuration::hours(i as i64 + 1),
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume,
                    quote_volume: volume * price,
                    trades_count: 10,
                }
            })
            .collect()
    }

    fn engine_with_data(klines: Vec<Kline>) -> SignalEngine {
        let sim = Arc::new(SimExchange::new());
        sim.set_series("BTC/USDT", KlineInterval::OneHour, klines);
        SignalEngine::new(sim, KlineInterval::OneHour, 200)
    }

    fn momentum_params() -> StrategyParams {
        StrategyParams::Momentum(MomentumParams {
            short_period: 3,
            long_period: 10,
            threshold: Decimal::from_str_exact("0.01").unwrap(),
            volume_threshold: Decimal::from_str_exact("1.5").unwrap(),
        })
    }

    #[tokio::test]
    async fn emits_sized_actionable_signal() {
        let engine = engine_with_data(rising_klines(20));
        let id = Uuid::new_v4();
        let signal = engine
            .evaluate(
                id,
                1,
                "BTC/USDT",
                &momentum_params(),
                Decimal::from(100),
                Duration::from_secs(3600),
            )
            .await;

        assert_eq!(signal.side, Side::Buy);
        assert!(signal.quantity > Decimal::ZERO);
        assert!(!signal.fingerprint.is_empty());
    }

    #[tokio::test]
    async fn signal_price_rounds_to_tick_toward_adverse() {
        let mut klines = rising_klines(20);
        // Sub-tick close; a buy must round up to the 0.01 tick.
        klines.last_mut().unwrap().close = Decimal::from_str_exact("138.004").unwrap();
        let engine = engine_with_data(klines);

        let signal = engine
            .evaluate(
                Uuid::new_v4(),
                1,
                "BTC/USDT",
                &momentum_params(),
                Decimal::from(100),
                Duration::from_secs(3600),
            )
            .await;

        assert_eq!(signal.side, Side::Buy);
        assert_eq!(signal.price, Decimal::from_str_exact("138.01").unwrap());
        // Quantity sized against the rounded price and floored to the lot.
        assert_eq!(
            signal.quantity,
            (Decimal::from(100) / signal.price * Decimal::from(100_000)).floor()
                / Decimal::from(100_000)
        );
    }

    #[tokio::test]
    async fn identical_evaluations_share_a_fingerprint() {
        let engine = engine_with_data(rising_klines(20));
        let id = Uuid::new_v4();
        let params = momentum_params();

        let a = engine
            .evaluate(id, 1, "BTC/USDT", &params, Decimal::from(100), Duration::from_secs(3600))
            .await;
        let b = engine
            .evaluate(id, 1, "BTC/USDT", &params, Decimal::from(100), Duration::from_secs(3600))
            .await;
        assert_eq!(a.fingerprint, b.fingerprint);

        // A new parameter cycle changes the fingerprint.
        let c = engine
            .evaluate(id, 2, "BTC/USDT", &params, Decimal::from(100), Duration::from_secs(3600))
            .await;
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[tokio::test]
    async fn outage_yields_hold_with_reason() {
        let sim = Arc::new(SimExchange::new());
        sim.set_series("BTC/USDT", KlineInterval::OneHour, rising_klines(20));
        sim.set_outage(true);
        let engine = SignalEngine::new(sim, KlineInterval::OneHour, 200);

        let signal = engine
            .evaluate(
                Uuid::new_v4(),
                1,
                "BTC/USDT",
                &momentum_params(),
                Decimal::from(100),
                Duration::from_secs(3600),
            )
            .await;
        assert_eq!(signal.side, Side::Hold);
        assert_eq!(signal.reason, "feed_unavailable");
    }

    #[tokio::test]
    async fn short_history_yields_hold() {
        let engine = engine_with_data(rising_klines(3));
        let signal = engine
            .evaluate(
                Uuid::new_v4(),
                1,
                "BTC/USDT",
                &momentum_params(),
                Decimal::from(100),
                Duration::from_secs(3600),
            )
            .await;
        assert_eq!(signal.side, Side::Hold);
        assert_eq!(signal.reason, "insufficient_data");
    }

    #[tokio::test]
    async fn grid_state_persists_across_evaluations() {
        let sim = Arc::new(SimExchange::new());
        let mut klines = rising_klines(1);
        klines[0].close = Decimal::from(100);
        sim.set_series("BTC/USDT", KlineInterval::OneHour, klines.clone());
        let engine = SignalEngine::new(Arc::clone(&sim) as Arc<dyn MarketDataGateway>, KlineInterval::OneHour, 200);

        let id = Uuid::new_v4();
        let params = StrategyParams::defaults(StrategyType::GridTrading);

        // First evaluation anchors the ladder.
        let first = engine
            .evaluate(id, 1, "BTC/USDT", &params, Decimal::from(100), Duration::from_secs(3600))
            .await;
        assert_eq!(first.side, Side::Hold);

        // Price falls through a buy rung.
        let mut lower = klines[0].clone();
        lower.close = Decimal::from(98);
        lower.open_time = lower.open_time + ChronoDuration::hours(1);
        lower.close_time = lower.close_time + ChronoDuration::hours(1);
        sim.push_kline("BTC/USDT", KlineInterval::OneHour, lower);

        let second = engine
            .evaluate(id, 1, "BTC/USDT", &params, Decimal::from(100), Duration::from_secs(3600))
            .await;
        assert_eq!(second.side, Side::Buy);
    }
}
