use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, warn};

use async_trait::async_trait;

use super::errors::ExchangeError;
use super::traits::MarketDataGateway;
use super::types::*;

/// Read-through cache in front of a market data gateway.
///
/// A single feed task refreshes tickers and candles; evaluation workers only
/// ever read the cached copies, so a feed outage degrades to `StaleData` for
/// readers instead of fanning out upstream calls. Candle history is kept per
/// (symbol, interval) and bounded to `max_candles`.
pub struct MarketCache {
    upstream: Arc<dyn MarketDataGateway>,
    tickers: DashMap<String, Ticker>,
    candles: DashMap<(String, KlineInterval), Vec<Kline>>,
    symbols: DashMap<String, SymbolInfo>,
    max_candles: usize,
}

impl MarketCache {
    pub fn new(upstream: Arc<dyn MarketDataGateway>, max_candles: usize) -> Self {
        Self {
            upstream,
            tickers: DashMap::new(),
            candles: DashMap::new(),
            symbols: DashMap::new(),
            max_candles,
        }
    }

    /// Refresh the ticker and candle window for one symbol.
    pub async fn refresh(&self, symbol: &str, candle_interval: KlineInterval) {
        match self.upstream.price(symbol, None).await {
            Ok(ticker) => {
                self.tickers.insert(symbol.to_string(), ticker);
            }
            Err(e) => warn!("Feed refresh failed for {}: {}", symbol, e),
        }

        match self
            .upstream
            .candles(symbol, candle_interval, self.max_candles)
            .await
        {
            Ok(klines) => {
                self.candles
                    .insert((symbol.to_string(), candle_interval), klines);
            }
            Err(e) => debug!("Candle refresh failed for {}: {}", symbol, e),
        }
    }

    /// Spawn the single-writer feed task for a fixed symbol set.
    pub fn spawn_feed(
        self: &Arc<Self>,
        symbols: Vec<String>,
        candle_interval: KlineInterval,
        poll_every: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(poll_every);
            loop {
                tick.tick().await;
                for symbol in &symbols {
                    cache.refresh(symbol, candle_interval).await;
                }
            }
        })
    }

    fn cached_ticker(
        &self,
        symbol: &str,
        max_age: Option<Duration>,
    ) -> Result<Ticker, ExchangeError> {
        let ticker = self
            .tickers
            .get(symbol)
            .map(|t| t.clone())
            .ok_or_else(|| ExchangeError::Unavailable(format!("no tick for {}", symbol)))?;

        if let Some(max_age) = max_age {
            let age = Utc::now().signed_duration_since(ticker.ts);
            let age_ms = age.num_milliseconds().max(0) as u64;
            if age_ms > max_age.as_millis() as u64 {
                return Err(ExchangeError::StaleData {
                    symbol: symbol.to_string(),
                    age_ms,
                });
            }
        }
        Ok(ticker)
    }
}

#[async_trait]
impl MarketDataGateway for MarketCache {
    async fn price(&self, symbol: &str, max_age: Option<Duration>) -> Result<Ticker, ExchangeError> {
        self.cached_ticker(symbol, max_age)
    }

    async fn depth(&self, symbol: &str, levels: usize) -> Result<Vec<DepthLevel>, ExchangeError> {
        // Depth is not cached; it is only consulted by the execution path,
        // which already holds a quota token.
        self.upstream.depth(symbol, levels).await
    }

    async fn candles(
        &self,
        symbol: &str,
        interval: KlineInterval,
        n: usize,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let klines = self
            .candles
            .get(&(symbol.to_string(), interval))
            .map(|k| k.clone())
            .ok_or_else(|| ExchangeError::Unavailable(format!("no candles for {}", symbol)))?;

        let start = klines.len().saturating_sub(n);
        Ok(klines[start..].to_vec())
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError> {
        if let Some(info) = self.symbols.get(symbol) {
            return Ok(info.clone());
        }
        let info = self.upstream.symbol_info(symbol).await?;
        self.symbols.insert(symbol.to_string(), info.clone());
        Ok(info)
    }
}
