use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::EngineSettings;
use crate::exchange::{KlineInterval, MarketDataGateway};
use crate::strategies::{EvalContext, EvalState, Side, StrategyParams};

/// Result of live-validating one proposal.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    /// Actionable signals observed.
    pub signals: u32,
    pub realized_trades: u32,
    pub wins: u32,
    pub observed_pnl: Decimal,
    /// True when the time cap expired before the signal target.
    pub timed_out: bool,
}

impl ValidationReport {
    pub fn win_rate(&self) -> Option<f64> {
        if self.realized_trades == 0 {
            None
        } else {
            Some(self.wins as f64 / self.realized_trades as f64)
        }
    }

    /// The commit gate: observed win rate and pnl both clear their minimums.
    pub fn passes(&self, settings: &EngineSettings) -> bool {
        self.win_rate().unwrap_or(0.0) >= settings.min_sim_win_rate
            && self.observed_pnl >= settings.min_sim_pnl
    }
}

/// Runs a proposal against live market data through the simulated fill path,
/// with no registry or exchange side effects.
///
/// Fills use the mid price with the configured slippage and fee model, the
/// same way the validation trade path fills real strategies' signals.
pub struct ValidationHarness {
    gateway: Arc<dyn MarketDataGateway>,
    interval: KlineInterval,
    history: usize,
}

impl ValidationHarness {
    pub fn new(gateway: Arc<dyn MarketDataGateway>, interval: KlineInterval, history: usize) -> Self {
        Self {
            gateway,
            interval,
            history,
        }
    }

    /// Observe up to `signal_target` signals or run until `time_cap`,
    /// whichever comes first, evaluating once per new bar.
    pub async fn validate(
        &self,
        params: &StrategyParams,
        symbol: &str,
        settings: &EngineSettings,
        signal_target: u32,
        time_cap: Duration,
        poll_every: Duration,
    ) -> ValidationReport {
        let deadline = Instant::now() + time_cap;
        let mut state = EvalState::default();
        let mut last_bar = None;
        let mut position: Option<(Decimal, Decimal)> = None;

        let mut report = ValidationReport {
            signals: 0,
            realized_trades: 0,
            wins: 0,
            observed_pnl: Decimal::ZERO,
            timed_out: false,
        };

        while report.signals < signal_target {
            if Instant::now() >= deadline {
                report.timed_out = true;
                break;
            }
            sleep(poll_every).await;

            let candles = match self.gateway.candles(symbol, self.interval, self.history).await {
                Ok(c) if c.len() >= params.min_candles() => c,
                _ => continue,
            };
            let bar = candles.last().map(|k| k.close_time);
            if bar == last_bar {
                continue;
            }
            last_bar = bar;

            let ticker = match self.gateway.price(symbol, None).await {
                Ok(t) => t,
                Err(_) => continue,
            };

            let decision = {
                let ctx = EvalContext {
                    symbol,
                    candles: &candles,
                    last: ticker.last,
                    now: bar.unwrap_or_else(chrono::Utc::now),
                };
                params.evaluate(&ctx, &mut state)
            };

            let mid = ticker.mid();
            let slip = mid * settings.slippage_bps / Decimal::from(10_000);
            match decision.side {
                Side::Buy if position.is_none() => {
                    report.signals += 1;
                    let price = mid + slip;
                    if price > Decimal::ZERO {
                        let quantity = settings.validation_amount / price;
                        position = Some((price, quantity));
                    }
                }
                Side::Sell => {
                    report.signals += 1;
                    if let Some((entry, quantity)) = position.take() {
                        let price = mid - slip;
                        let fees = (entry + price) * quantity * settings.fee_rate;
                        let pnl = (price - entry) * quantity - fees;
                        report.realized_trades += 1;
                        if pnl > Decimal::ZERO {
                            report.wins += 1;
                        }
                        report.observed_pnl += pnl;
                    }
                }
                _ => {}
            }
        }

        debug!(
            "Live validation: {} signals, {} realized, pnl {}",
            report.signals, report.realized_trades, report.observed_pnl
        );
        report
    }
}
