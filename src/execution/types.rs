use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scoring::TradeKind;
use crate::strategies::Side;

/// Executed (or failed) trade as the engine records it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub fingerprint: String,
    pub kind: TradeKind,
    pub strategy_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub fees: Decimal,
    pub success: bool,
    /// True when `pnl` is a realized round-trip result (position-closing).
    pub realized: bool,
    pub exchange_order_id: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Open lot tracked per (strategy, trade kind) for pnl realization.
#[derive(Debug, Clone, Copy)]
pub struct OpenPosition {
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub opened_at: DateTime<Utc>,
}
