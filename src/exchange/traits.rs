use async_trait::async_trait;
use std::time::Duration;

use super::errors::ExchangeError;
use super::types::*;

/// Read-only market data feed.
///
/// Implementations must be safe for concurrent readers. A caller may bound
/// acceptable staleness with `max_age`; when no fresh enough tick exists the
/// gateway fails with `StaleData` and the caller skips its evaluation cycle.
#[async_trait]
pub trait MarketDataGateway: Send + Sync {
    /// Latest quote for a symbol.
    async fn price(&self, symbol: &str, max_age: Option<Duration>) -> Result<Ticker, ExchangeError>;

    /// Top `levels` of order book depth, best price first.
    async fn depth(&self, symbol: &str, levels: usize) -> Result<Vec<DepthLevel>, ExchangeError>;

    /// Most recent `n` closed candles, oldest first.
    async fn candles(
        &self,
        symbol: &str,
        interval: KlineInterval,
        n: usize,
    ) -> Result<Vec<Kline>, ExchangeError>;

    /// Lot/tick metadata for order rounding.
    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError>;
}

/// Trade side-effect boundary.
///
/// `submit` must be idempotent on `OrderRequest::client_ref`: re-submitting
/// the same reference returns the original acknowledgement instead of placing
/// a second order.
#[async_trait]
pub trait ExchangeExecutor: Send + Sync {
    async fn submit(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError>;

    async fn poll(&self, order_id: &str) -> Result<OrderStatus, ExchangeError>;

    async fn balance(&self, asset: &str) -> Result<AssetBalance, ExchangeError>;
}
