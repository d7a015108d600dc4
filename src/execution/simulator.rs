use rust_decimal::Decimal;

use crate::config::EngineSettings;
use crate::exchange::Ticker;
use crate::scoring::TradeKind;
use crate::signals::Signal;
use crate::strategies::Side;

use super::types::TradeRecord;

/// Fills validation trades against the mid price with modeled slippage and
/// fees. No exchange side effects.
pub struct ValidationSimulator;

impl ValidationSimulator {
    /// Price the fill: slippage moves the mid adversely by `slippage_bps`.
    pub fn fill_price(ticker: &Ticker, side: Side, settings: &EngineSettings) -> Decimal {
        let mid = ticker.mid();
        let slip = mid * settings.slippage_bps / Decimal::from(10_000);
        match side {
            Side::Buy => mid + slip,
            Side::Sell => mid - slip,
            Side::Hold => mid,
        }
    }

    /// Build the validation trade record for a signal. `realized_pnl` is the
    /// round-trip result when this fill closes a position.
    pub fn fill(
        signal: &Signal,
        ticker: &Ticker,
        settings: &EngineSettings,
        realized_pnl: Option<Decimal>,
    ) -> TradeRecord {
        let price = Self::fill_price(ticker, signal.side, settings);
        let fees = price * signal.quantity * settings.fee_rate;

        TradeRecord {
            fingerprint: signal.fingerprint.clone(),
            kind: TradeKind::Validation,
            strategy_id: signal.strategy_id,
            symbol: signal.symbol.clone(),
            side: signal.side,
            price,
            quantity: signal.quantity,
            pnl: realized_pnl.map(|p| p - fees).unwrap_or(Decimal::ZERO),
            fees,
            success: true,
            realized: realized_pnl.is_some(),
            exchange_order_id: None,
            ts: signal.ts,
        }
    }
}
