use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

use super::errors::ExchangeError;
use super::traits::{ExchangeExecutor, MarketDataGateway};
use super::types::*;

/// Deterministic in-process exchange.
///
/// Serves scripted candle series as market data and fills market orders at
/// the last price, with idempotency on `client_ref`. Used by the validation
/// trade path, evolution live-validation, and tests; failure injection covers
/// the connector error modes the executor must recover from.
pub struct SimExchange {
    series: DashMap<(String, KlineInterval), Vec<Kline>>,
    balances: DashMap<String, AssetBalance>,
    orders: DashMap<String, OrderStatus>,
    by_client_ref: DashMap<String, OrderAck>,
    fee_rate: Decimal,
    spread: Decimal,
    order_seq: AtomicU64,
    outage: AtomicBool,
    reject_next: AtomicBool,
    network_failures: AtomicU64,
}

impl SimExchange {
    pub fn new() -> Self {
        Self {
            series: DashMap::new(),
            balances: DashMap::new(),
            orders: DashMap::new(),
            by_client_ref: DashMap::new(),
            fee_rate: Decimal::from_str("0.001").unwrap(),
            spread: Decimal::from_str("0.0002").unwrap(),
            order_seq: AtomicU64::new(1),
            outage: AtomicBool::new(false),
            reject_next: AtomicBool::new(false),
            network_failures: AtomicU64::new(0),
        }
    }

    pub fn set_series(&self, symbol: &str, interval: KlineInterval, klines: Vec<Kline>) {
        self.series.insert((symbol.to_string(), interval), klines);
    }

    pub fn push_kline(&self, symbol: &str, interval: KlineInterval, kline: Kline) {
        self.series
            .entry((symbol.to_string(), interval))
            .or_default()
            .push(kline);
    }

    pub fn set_balance(&self, asset: &str, available: Decimal) {
        self.balances.insert(
            asset.to_string(),
            AssetBalance {
                asset: asset.to_string(),
                total: available,
                available,
                locked: Decimal::ZERO,
            },
        );
    }

    /// Simulate a feed outage; all market data calls fail `Unavailable`.
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// Reject the next submitted order.
    pub fn reject_next_order(&self) {
        self.reject_next.store(true, Ordering::SeqCst);
    }

    /// Fail the next `n` submissions with a network error.
    pub fn fail_submissions(&self, n: u64) {
        self.network_failures.store(n, Ordering::SeqCst);
    }

    fn last_kline(&self, symbol: &str) -> Result<Kline, ExchangeError> {
        for entry in self.series.iter() {
            let (sym, _) = entry.key();
            if sym == symbol {
                if let Some(k) = entry.value().last() {
                    return Ok(k.clone());
                }
            }
        }
        Err(ExchangeError::Unavailable(format!(
            "no data for {}",
            symbol
        )))
    }

    fn check_outage(&self) -> Result<(), ExchangeError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(ExchangeError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

impl Default for SimExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataGateway for SimExchange {
    async fn price(&self, symbol: &str, _max_age: Option<Duration>) -> Result<Ticker, ExchangeError> {
        self.check_outage()?;
        let kline = self.last_kline(symbol)?;
        let half_spread = kline.close * self.spread / Decimal::from(2);
        Ok(Ticker {
            symbol: symbol.to_string(),
            bid: kline.close - half_spread,
            ask: kline.close + half_spread,
            last: kline.close,
            ts: kline.close_time,
        })
    }

    async fn depth(&self, symbol: &str, levels: usize) -> Result<Vec<DepthLevel>, ExchangeError> {
        self.check_outage()?;
        let kline = self.last_kline(symbol)?;
        let step = kline.close * self.spread;
        Ok((1..=levels)
            .map(|i| DepthLevel {
                price: kline.close - step * Decimal::from(i as u64),
                quantity: kline.volume / Decimal::from(levels.max(1) as u64),
            })
            .collect())
    }

    async fn candles(
        &self,
        symbol: &str,
        interval: KlineInterval,
        n: usize,
    ) -> Result<Vec<Kline>, ExchangeError> {
        self.check_outage()?;
        let klines = self
            .series
            .get(&(symbol.to_string(), interval))
            .map(|k| k.clone())
            .ok_or_else(|| ExchangeError::Unavailable(format!("no candles for {}", symbol)))?;
        let start = klines.len().saturating_sub(n);
        Ok(klines[start..].to_vec())
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError> {
        let (base, quote) = symbol
            .split_once('/')
            .ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))?;
        Ok(SymbolInfo {
            symbol: symbol.to_string(),
            base_asset: base.to_string(),
            quote_asset: quote.to_string(),
            tick_size: Decimal::from_str("0.01").unwrap(),
            lot_size: Decimal::from_str("0.00001").unwrap(),
            min_notional: Decimal::from(5),
        })
    }
}

#[async_trait]
impl ExchangeExecutor for SimExchange {
    async fn submit(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        // Idempotency: a repeated client_ref returns the original ack.
        if let Some(ack) = self.by_client_ref.get(&order.client_ref) {
            return Ok(ack.clone());
        }

        let remaining = self.network_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.network_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ExchangeError::NetworkError(
                "simulated connection reset".to_string(),
            ));
        }

        if self.reject_next.swap(false, Ordering::SeqCst) {
            return Err(ExchangeError::Rejected(
                "simulated exchange rejection".to_string(),
            ));
        }

        let info = self.symbol_info(&order.symbol).await?;
        let quote_asset = info.quote_asset.clone();
        let kline = self.last_kline(&order.symbol)?;
        // Fills round to the tick toward the adverse side, like a real book.
        let fill_price = info.round_price(order.price.unwrap_or(kline.close), order.side);
        let notional = fill_price * order.quantity;

        if order.side == OrderSide::Buy {
            let available = self
                .balances
                .get(&quote_asset)
                .map(|b| b.available)
                .unwrap_or(Decimal::ZERO);
            if notional > available {
                return Err(ExchangeError::InsufficientBalance(format!(
                    "need {} {}, have {}",
                    notional, quote_asset, available
                )));
            }
            if let Some(mut bal) = self.balances.get_mut(&quote_asset) {
                bal.available -= notional;
                bal.total -= notional;
            }
        }

        let order_id = format!("sim-{}-{}", self.order_seq.fetch_add(1, Ordering::SeqCst), Uuid::new_v4().simple());
        let fill = Fill {
            order_id: order_id.clone(),
            price: fill_price,
            quantity: order.quantity,
            fee: notional * self.fee_rate,
            ts: Utc::now(),
        };

        self.orders.insert(order_id.clone(), OrderStatus::Filled(fill));
        let ack = OrderAck {
            order_id,
            client_ref: order.client_ref.clone(),
        };
        self.by_client_ref.insert(order.client_ref.clone(), ack.clone());
        Ok(ack)
    }

    async fn poll(&self, order_id: &str) -> Result<OrderStatus, ExchangeError> {
        self.orders
            .get(order_id)
            .map(|s| s.clone())
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))
    }

    async fn balance(&self, asset: &str) -> Result<AssetBalance, ExchangeError> {
        Ok(self
            .balances
            .get(asset)
            .map(|b| b.clone())
            .unwrap_or(AssetBalance {
                asset: asset.to_string(),
                total: Decimal::ZERO,
                available: Decimal::ZERO,
                locked: Decimal::ZERO,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kline_at(price: i64) -> Kline {
        let now = Utc::now();
        Kline {
            open_time: now,
            close_time: now,
            open: Decimal::from(price),
            high: Decimal::from(price),
            low: Decimal::from(price),
            close: Decimal::from(price),
            volume: Decimal::from(1000),
            quote_volume: Decimal::from(1000 * price),
            trades_count: 100,
        }
    }

    #[tokio::test]
    async fn submit_is_idempotent_on_client_ref() {
        let sim = SimExchange::new();
        sim.set_series("BTC/USDT", KlineInterval::OneMinute, vec![kline_at(50000)]);
        sim.set_balance("USDT", Decimal::from(100_000));

        let order = OrderRequest {
            client_ref: "fp-1".to_string(),
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: Decimal::from_str("0.1").unwrap(),
            price: None,
        };

        let first = sim.submit(&order).await.unwrap();
        let second = sim.submit(&order).await.unwrap();
        assert_eq!(first.order_id, second.order_id);

        // Only one fill debited the balance.
        let bal = sim.balance("USDT").await.unwrap();
        assert_eq!(bal.available, Decimal::from(95_000));
    }

    #[tokio::test]
    async fn market_fills_round_to_tick_toward_adverse() {
        let sim = SimExchange::new();
        let mut kline = kline_at(50_000);
        kline.close = Decimal::from_str("50000.004").unwrap();
        sim.set_series("BTC/USDT", KlineInterval::OneMinute, vec![kline]);
        sim.set_balance("USDT", Decimal::from(100_000));

        let buy = OrderRequest {
            client_ref: "fp-buy".to_string(),
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: Decimal::from_str("0.1").unwrap(),
            price: None,
        };
        let ack = sim.submit(&buy).await.unwrap();
        let OrderStatus::Filled(fill) = sim.poll(&ack.order_id).await.unwrap() else {
            panic!("expected fill");
        };
        // Tick is 0.01; buys round up.
        assert_eq!(fill.price, Decimal::from_str("50000.01").unwrap());

        let sell = OrderRequest {
            client_ref: "fp-sell".to_string(),
            side: OrderSide::Sell,
            ..buy
        };
        let ack = sim.submit(&sell).await.unwrap();
        let OrderStatus::Filled(fill) = sim.poll(&ack.order_id).await.unwrap() else {
            panic!("expected fill");
        };
        // Sells round down.
        assert_eq!(fill.price, Decimal::from_str("50000.00").unwrap());
    }

    #[tokio::test]
    async fn outage_fails_market_data_as_unavailable() {
        let sim = SimExchange::new();
        sim.set_series("BTC/USDT", KlineInterval::OneMinute, vec![kline_at(50000)]);
        sim.set_outage(true);
        let err = sim.price("BTC/USDT", None).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Unavailable(_)));
    }
}
