use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use sea_orm::{ActiveValue::Set, DatabaseConnection, EntityTrait};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EngineSettings, SettingsStore};
use crate::events::{EventKind, EvolutionLog};
use crate::exchange::{
    ExchangeExecutor, Fill, MarketDataGateway, OrderRequest, OrderSide, OrderStatus, OrderType,
    TokenBucket,
};
use crate::models::{signal as signal_model, trade as trade_model};
use crate::registry::StrategyRegistry;
use crate::scoring::{ScoringService, TradeKind, TradeOutcome};
use crate::signals::Signal;
use crate::strategies::Side;
use crate::utils::backoff::Backoff;
use crate::utils::errors::AppError;

use super::classifier::classify;
use super::simulator::ValidationSimulator;
use super::types::{OpenPosition, TradeRecord};

const SUBMIT_DEADLINE: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(200);
const POLL_ATTEMPTS: u32 = 50;
const SUPERVISION_INTERVAL: Duration = Duration::from_secs(5);

/// Routes classified signals into real or simulated fills.
///
/// Idempotency and dedup both hang off the signal fingerprint: the first
/// worker to reach the executor wins, later submissions of the same
/// fingerprint get the first outcome back. Real orders are serialized per
/// symbol and carry `client_ref = fingerprint` so connector retries cannot
/// double-fill.
pub struct TradeExecutor {
    exchange: Arc<dyn ExchangeExecutor>,
    gateway: Arc<dyn MarketDataGateway>,
    registry: Arc<StrategyRegistry>,
    scoring: Arc<ScoringService>,
    settings: Arc<SettingsStore>,
    log: Arc<EvolutionLog>,
    quota: TokenBucket,
    outcomes: DashMap<(String, TradeKind), TradeRecord>,
    symbol_locks: DashMap<String, Arc<Mutex<()>>>,
    positions: DashMap<(Uuid, TradeKind), OpenPosition>,
    db: Option<Arc<DatabaseConnection>>,
    pressure_tx: Option<mpsc::UnboundedSender<Uuid>>,
}

impl TradeExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn ExchangeExecutor>,
        gateway: Arc<dyn MarketDataGateway>,
        registry: Arc<StrategyRegistry>,
        scoring: Arc<ScoringService>,
        settings: Arc<SettingsStore>,
        log: Arc<EvolutionLog>,
        db: Option<Arc<DatabaseConnection>>,
        pressure_tx: Option<mpsc::UnboundedSender<Uuid>>,
    ) -> Arc<Self> {
        let snapshot = settings.snapshot();
        Arc::new(Self {
            exchange,
            gateway,
            registry,
            scoring,
            settings,
            log,
            quota: TokenBucket::new(snapshot.quota_capacity, snapshot.quota_refill_per_sec),
            outcomes: DashMap::new(),
            symbol_locks: DashMap::new(),
            positions: DashMap::new(),
            db,
            pressure_tx,
        })
    }

    /// Process one signal end to end. Returns the trade record, the prior
    /// record when the fingerprint was already executed, or `None` for holds.
    pub async fn process(self: &Arc<Self>, signal: Signal) -> Result<Option<TradeRecord>, AppError> {
        if !signal.is_actionable() {
            return Ok(None);
        }

        // Orphan guard: the trade must belong to a live strategy.
        let Some(strategy) = self.registry.get(signal.strategy_id) else {
            return Ok(None);
        };
        if !strategy.is_live() || !strategy.enabled {
            return Ok(None);
        }

        let settings = self.settings.snapshot();
        match classify(&strategy, &settings, Utc::now()) {
            TradeKind::Validation => self.execute_validation(&signal, &settings).await,
            TradeKind::Real => self.execute_real(&signal, &settings).await,
        }
    }

    /// Outcome previously recorded for a fingerprint, if any.
    pub fn outcome(&self, fingerprint: &str, kind: TradeKind) -> Option<TradeRecord> {
        self.outcomes
            .get(&(fingerprint.to_string(), kind))
            .map(|r| r.clone())
    }

    async fn execute_validation(
        &self,
        signal: &Signal,
        settings: &EngineSettings,
    ) -> Result<Option<TradeRecord>, AppError> {
        let key = (signal.fingerprint.clone(), TradeKind::Validation);
        if let Some(existing) = self.outcomes.get(&key) {
            return Ok(Some(existing.clone()));
        }

        let ticker = match self.gateway.price(&signal.symbol, None).await {
            Ok(t) => t,
            Err(e) => {
                // Feed trouble skips the cycle; it is never a fill.
                let err = AppError::from(e);
                self.log.note_error(&err);
                return Ok(None);
            }
        };

        // First fingerprint to reach this entry wins; the loser's position
        // state is never touched.
        let record = match self.outcomes.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(e) => return Ok(Some(e.get().clone())),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let price = ValidationSimulator::fill_price(&ticker, signal.side, settings);
                let realized = self.apply_position(
                    signal.strategy_id,
                    TradeKind::Validation,
                    signal.side,
                    price,
                    signal.quantity,
                    signal.ts,
                );
                v.insert(ValidationSimulator::fill(signal, &ticker, settings, realized))
                    .clone()
            }
        };

        self.persist(signal, &record).await;
        self.score(signal, &record, settings);
        Ok(Some(record))
    }

    async fn execute_real(
        self: &Arc<Self>,
        signal: &Signal,
        settings: &EngineSettings,
    ) -> Result<Option<TradeRecord>, AppError> {
        let key = (signal.fingerprint.clone(), TradeKind::Real);
        if let Some(existing) = self.outcomes.get(&key) {
            return Ok(Some(existing.clone()));
        }

        // No concurrent real orders per symbol.
        let lock = self
            .symbol_locks
            .entry(signal.symbol.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(existing) = self.outcomes.get(&key) {
            return Ok(Some(existing.clone()));
        }

        let info = self
            .gateway
            .symbol_info(&signal.symbol)
            .await
            .map_err(AppError::from)?;

        let quantity = match signal.side {
            Side::Buy => {
                let balance = self
                    .exchange
                    .balance(&info.quote_asset)
                    .await
                    .map_err(AppError::from)?;
                let notional = settings
                    .real_trading_amount
                    .min(balance.available * settings.max_position_pct);
                if signal.price <= Decimal::ZERO || notional < info.min_notional {
                    return self
                        .record_real_failure(
                            signal,
                            settings,
                            "sized notional below exchange minimum",
                        )
                        .await;
                }
                info.round_quantity(notional / signal.price)
            }
            Side::Sell => {
                // Close what we hold; a sell with no inventory is a no-op.
                match self
                    .positions
                    .get(&(signal.strategy_id, TradeKind::Real))
                {
                    Some(pos) => pos.quantity,
                    None => return Ok(None),
                }
            }
            Side::Hold => return Ok(None),
        };

        if quantity <= Decimal::ZERO {
            return Ok(None);
        }

        let order = OrderRequest {
            client_ref: signal.fingerprint.clone(),
            symbol: signal.symbol.clone(),
            side: match signal.side {
                Side::Buy => OrderSide::Buy,
                _ => OrderSide::Sell,
            },
            order_type: OrderType::Market,
            quantity,
            price: None,
        };

        match self.submit_with_retries(&order, settings).await {
            Ok(fill) => {
                let record = self.record_real_fill(signal, settings, &fill).await;
                if signal.side == Side::Buy {
                    self.supervise_position(signal.clone(), fill);
                }
                Ok(Some(record))
            }
            Err(e @ (AppError::InsufficientFunds(_) | AppError::Rejected(_))) => {
                self.log.note_error(&e);
                self.record_real_failure(signal, settings, &e.to_string())
                    .await
            }
            Err(e) => {
                // Network-class failure after retries: caller may re-enqueue.
                self.log.note_error(&e);
                Err(e)
            }
        }
    }

    async fn submit_with_retries(
        &self,
        order: &OrderRequest,
        settings: &EngineSettings,
    ) -> Result<Fill, AppError> {
        let backoff = Backoff::default();
        let mut attempt = 0u32;
        loop {
            self.quota.acquire().await;
            let result = match timeout(SUBMIT_DEADLINE, self.exchange.submit(order)).await {
                Err(_) => Err(AppError::Network("order submission timed out".to_string())),
                Ok(r) => r.map_err(AppError::from),
            };

            match result {
                Ok(ack) => return self.poll_fill(&ack.order_id).await,
                Err(e)
                    if matches!(e, AppError::Network(_) | AppError::RateLimited(_))
                        && attempt < settings.max_retries =>
                {
                    self.log.note_error(&e);
                    debug!(
                        "Retrying order {} after {} (attempt {})",
                        order.client_ref, e, attempt
                    );
                    sleep(backoff.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn poll_fill(&self, order_id: &str) -> Result<Fill, AppError> {
        for _ in 0..POLL_ATTEMPTS {
            match self.exchange.poll(order_id).await.map_err(AppError::from)? {
                OrderStatus::Filled(fill) => return Ok(fill),
                OrderStatus::Rejected(reason) => return Err(AppError::Rejected(reason)),
                OrderStatus::Pending => sleep(POLL_INTERVAL).await,
            }
        }
        Err(AppError::Network(format!(
            "order {} still pending after poll budget",
            order_id
        )))
    }

    async fn record_real_fill(
        &self,
        signal: &Signal,
        settings: &EngineSettings,
        fill: &Fill,
    ) -> TradeRecord {
        // Scoring continuity: archive the simulated observation first; the
        // real fill's pnl then replaces it in the score card.
        if let Ok(ticker) = self.gateway.price(&signal.symbol, None).await {
            let sim_price = ValidationSimulator::fill_price(&ticker, signal.side, settings);
            let sim_realized = self.apply_position(
                signal.strategy_id,
                TradeKind::Validation,
                signal.side,
                sim_price,
                fill.quantity,
                signal.ts,
            );
            let archive = ValidationSimulator::fill(signal, &ticker, settings, sim_realized);
            let archive_key = (signal.fingerprint.clone(), TradeKind::Validation);
            if !self.outcomes.contains_key(&archive_key) {
                self.outcomes.insert(archive_key, archive.clone());
                self.persist(signal, &archive).await;
            }
        }

        let realized = self.apply_position(
            signal.strategy_id,
            TradeKind::Real,
            signal.side,
            fill.price,
            fill.quantity,
            signal.ts,
        );
        let record = TradeRecord {
            fingerprint: signal.fingerprint.clone(),
            kind: TradeKind::Real,
            strategy_id: signal.strategy_id,
            symbol: signal.symbol.clone(),
            side: signal.side,
            price: fill.price,
            quantity: fill.quantity,
            pnl: realized.map(|p| p - fill.fee).unwrap_or(Decimal::ZERO),
            fees: fill.fee,
            success: true,
            realized: realized.is_some(),
            exchange_order_id: Some(fill.order_id.clone()),
            ts: fill.ts,
        };

        self.outcomes.insert(
            (signal.fingerprint.clone(), TradeKind::Real),
            record.clone(),
        );
        self.persist(signal, &record).await;
        self.score(signal, &record, settings);

        self.log.record(
            "executor",
            EventKind::TradeExecuted,
            Some(signal.strategy_id),
            None,
            serde_json::to_value(&record).ok(),
            "real fill",
        );
        info!(
            "Real {} {} {} @ {} (fp {})",
            signal.side.as_str(),
            record.quantity,
            record.symbol,
            record.price,
            &record.fingerprint[..12.min(record.fingerprint.len())]
        );

        if record.realized && record.pnl < Decimal::ZERO {
            self.push_pressure(signal.strategy_id);
        }
        record
    }

    async fn record_real_failure(
        &self,
        signal: &Signal,
        settings: &EngineSettings,
        reason: &str,
    ) -> Result<Option<TradeRecord>, AppError> {
        let record = TradeRecord {
            fingerprint: signal.fingerprint.clone(),
            kind: TradeKind::Real,
            strategy_id: signal.strategy_id,
            symbol: signal.symbol.clone(),
            side: signal.side,
            price: signal.price,
            quantity: Decimal::ZERO,
            pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            success: false,
            realized: false,
            exchange_order_id: None,
            ts: Utc::now(),
        };

        self.outcomes.insert(
            (signal.fingerprint.clone(), TradeKind::Real),
            record.clone(),
        );
        self.persist(signal, &record).await;
        self.score(signal, &record, settings);

        self.log.record(
            "executor",
            EventKind::TradeFailed,
            Some(signal.strategy_id),
            None,
            None,
            reason.to_string(),
        );
        warn!("Real trade failed for {}: {}", signal.strategy_id, reason);
        self.push_pressure(signal.strategy_id);
        Ok(Some(record))
    }

    /// Watch an open real position for stop-loss, take-profit, or the
    /// holding cap, then force the close through the normal real path.
    fn supervise_position(self: &Arc<Self>, signal: Signal, entry: Fill) {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let settings = executor.settings.snapshot();
            let deadline =
                entry.ts + chrono::Duration::minutes(settings.max_holding_minutes as i64);

            loop {
                sleep(SUPERVISION_INTERVAL).await;

                if executor
                    .positions
                    .get(&(signal.strategy_id, TradeKind::Real))
                    .is_none()
                {
                    // Closed elsewhere.
                    return;
                }

                let ticker = match executor.gateway.price(&signal.symbol, None).await {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if entry.price <= Decimal::ZERO {
                    return;
                }
                let change = (ticker.last - entry.price) / entry.price;

                let stop = change <= -settings.stop_loss_pct;
                let take = change >= settings.take_profit_pct;
                let expired = Utc::now() >= deadline;
                if !(stop || take || expired) {
                    continue;
                }

                let reason = if stop {
                    "stop loss"
                } else if take {
                    "take profit"
                } else {
                    "max holding time"
                };

                let close_signal = Signal {
                    side: Side::Sell,
                    price: ticker.last,
                    fingerprint: format!("{}-close", signal.fingerprint),
                    ts: Utc::now(),
                    reason: reason.to_string(),
                    ..signal.clone()
                };

                let settings = executor.settings.snapshot();
                if let Err(e) = executor.execute_real(&close_signal, &settings).await {
                    warn!("Failed to close supervised position: {}", e);
                    continue;
                }
                info!(
                    "Closed supervised position for {} ({})",
                    signal.strategy_id, reason
                );
                return;
            }
        });
    }

    /// Track the open lot and return realized gross pnl for closing fills.
    fn apply_position(
        &self,
        strategy_id: Uuid,
        kind: TradeKind,
        side: Side,
        price: Decimal,
        quantity: Decimal,
        ts: chrono::DateTime<Utc>,
    ) -> Option<Decimal> {
        let key = (strategy_id, kind);
        match side {
            Side::Buy => {
                let mut entry = self.positions.entry(key).or_insert(OpenPosition {
                    entry_price: price,
                    quantity: Decimal::ZERO,
                    opened_at: ts,
                });
                let total = entry.quantity + quantity;
                if total > Decimal::ZERO {
                    entry.entry_price = (entry.entry_price * entry.quantity + price * quantity)
                        / total;
                }
                entry.quantity = total;
                None
            }
            Side::Sell => {
                let Some(mut entry) = self.positions.get_mut(&key) else {
                    return None;
                };
                let matched = entry.quantity.min(quantity);
                if matched <= Decimal::ZERO {
                    return None;
                }
                let pnl = (price - entry.entry_price) * matched;
                entry.quantity -= matched;
                let empty = entry.quantity <= Decimal::ZERO;
                drop(entry);
                if empty {
                    self.positions.remove(&key);
                }
                Some(pnl)
            }
            Side::Hold => None,
        }
    }

    fn score(&self, signal: &Signal, record: &TradeRecord, settings: &EngineSettings) {
        let outcome = TradeOutcome {
            fingerprint: record.fingerprint.clone(),
            kind: record.kind,
            side: record.side,
            pnl: record.pnl,
            fees: record.fees,
            realized: record.realized,
            success: record.success,
            ts: record.ts,
        };
        let breakdown = self.scoring.record_trade(signal.strategy_id, outcome);
        let eligible = breakdown.real_eligible(settings);
        self.registry
            .update_metrics(signal.strategy_id, signal.cycle, &breakdown, eligible);

        self.log.record(
            "scoring",
            EventKind::Scored,
            Some(signal.strategy_id),
            None,
            serde_json::json!({
                "final_score": breakdown.final_score,
                "provisional": breakdown.provisional,
                "total_trades": breakdown.total_trades,
            })
            .into(),
            if breakdown.provisional {
                "provisional"
            } else {
                "recomputed"
            },
        );
    }

    async fn persist(&self, signal: &Signal, record: &TradeRecord) {
        let Some(db) = &self.db else {
            return;
        };

        // Signal insertion precedes the trade row; both are idempotent.
        let signal_row = signal_model::ActiveModel {
            fingerprint: Set(signal.fingerprint.clone()),
            strategy_id: Set(signal.strategy_id),
            symbol: Set(signal.symbol.clone()),
            side: Set(signal.side.as_str().to_string()),
            price: Set(signal.price),
            quantity: Set(signal.quantity),
            confidence: Set(signal.confidence),
            kind: Set(record.kind.as_str().to_string()),
            ts: Set(signal.ts),
        };
        if let Err(e) = signal_model::Entity::insert(signal_row)
            .on_conflict(
                sea_orm::sea_query::OnConflict::column(signal_model::Column::Fingerprint)
                    .do_nothing()
                    .to_owned(),
            )
            .exec(db.as_ref())
            .await
        {
            if !matches!(e, sea_orm::DbErr::RecordNotInserted) {
                warn!("Failed to persist signal: {}", e);
            }
        }

        let trade_row = trade_model::ActiveModel {
            fingerprint: Set(record.fingerprint.clone()),
            kind: Set(record.kind.as_str().to_string()),
            strategy_id: Set(record.strategy_id),
            symbol: Set(record.symbol.clone()),
            side: Set(record.side.as_str().to_string()),
            price: Set(record.price),
            quantity: Set(record.quantity),
            pnl: Set(record.pnl),
            fees: Set(record.fees),
            success: Set(record.success),
            exchange_order_id: Set(record.exchange_order_id.clone()),
            ts: Set(record.ts),
        };
        if let Err(e) = trade_model::Entity::insert(trade_row)
            .on_conflict(
                sea_orm::sea_query::OnConflict::columns([
                    trade_model::Column::Fingerprint,
                    trade_model::Column::Kind,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec(db.as_ref())
            .await
        {
            if !matches!(e, sea_orm::DbErr::RecordNotInserted) {
                warn!("Failed to persist trade: {}", e);
            }
        }
    }

    fn push_pressure(&self, strategy_id: Uuid) {
        if let Some(tx) = &self.pressure_tx {
            let _ = tx.send(strategy_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::str::FromStr;

    use crate::exchange::{Kline, KlineInterval, SimExchange};
    use crate::registry::{StrategyRecord, Tier};
    use crate::signals::fingerprint;
    use crate::strategies::{StrategyParams, StrategyType};

    fn kline_at(price: i64) -> Kline {
        let now = Utc::now();
        Kline {
            open_time: now - ChronoDuration::minutes(1),
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

    struct Harness {
        sim: Arc<SimExchange>,
        registry: Arc<StrategyRegistry>,
        executor: Arc<TradeExecutor>,
        settings: Arc<SettingsStore>,
        pressure_rx: mpsc::UnboundedReceiver<Uuid>,
    }

    fn harness() -> Harness {
        let sim = Arc::new(SimExchange::new());
        sim.set_series("BTC/USDT", KlineInterval::OneMinute, vec![kline_at(50_000)]);
        sim.set_balance("USDT", Decimal::from(10_000));

        let settings = Arc::new(SettingsStore::new(None));
        let registry = Arc::new(StrategyRegistry::in_memory());
        let scoring = Arc::new(ScoringService::new(Arc::clone(&settings)));
        let log = EvolutionLog::new(64, None);
        let (tx, rx) = mpsc::unbounded_channel();

        let executor = TradeExecutor::new(
            Arc::clone(&sim) as Arc<dyn ExchangeExecutor>,
            Arc::clone(&sim) as Arc<dyn MarketDataGateway>,
            Arc::clone(&registry),
            scoring,
            Arc::clone(&settings),
            log,
            None,
            Some(tx),
        );

        Harness {
            sim,
            registry,
            executor,
            settings,
            pressure_rx: rx,
        }
    }

    fn strategy(registry: &StrategyRegistry, tier: Option<Tier>, qualifies: bool) -> StrategyRecord {
        let mut record = StrategyRecord::new(
            StrategyType::Momentum,
            "BTC/USDT".to_string(),
            StrategyParams::defaults(StrategyType::Momentum),
            None,
        );
        record.tier = tier;
        record.qualifies_for_real = qualifies;
        record.metrics.final_score = Decimal::from(80);
        // Past the minimum simulated track record.
        record.created_at = Utc::now() - ChronoDuration::days(30);
        registry.upsert(record)
    }

    fn buy_signal(record: &StrategyRecord) -> Signal {
        let ts = Utc::now();
        Signal {
            strategy_id: record.id,
            cycle: record.cycle,
            symbol: record.symbol.clone(),
            side: Side::Buy,
            price: Decimal::from(50_000),
            quantity: Decimal::from_str("0.002").unwrap(),
            confidence: Decimal::from_str("0.8").unwrap(),
            ts,
            fingerprint: fingerprint(record.id, record.cycle, &record.symbol, ts, Side::Buy),
            reason: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn gate_off_records_validation_without_exchange_call() {
        let h = harness();
        let record = strategy(&h.registry, Some(Tier::T4), true);
        let signal = buy_signal(&record);

        let trade = h.executor.process(signal).await.unwrap().unwrap();
        assert_eq!(trade.kind, TradeKind::Validation);
        assert!(trade.success);

        // No exchange side effects.
        let balance = h.sim.balance("USDT").await.unwrap();
        assert_eq!(balance.available, Decimal::from(10_000));

        // Score was recomputed from the simulated fill.
        let updated = h.registry.get(record.id).unwrap();
        assert!(updated.metrics.last_evaluated_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_fingerprint_returns_first_outcome() {
        let h = harness();
        let record = strategy(&h.registry, None, false);
        let signal = buy_signal(&record);

        let first = h.executor.process(signal.clone()).await.unwrap().unwrap();
        let second = h.executor.process(signal).await.unwrap().unwrap();
        assert_eq!(first.price, second.price);
        assert_eq!(first.ts, second.ts);
        assert!(h
            .executor
            .outcome(&first.fingerprint, TradeKind::Validation)
            .is_some());
    }

    #[tokio::test]
    async fn gate_on_t4_executes_real_and_archives_validation() {
        let h = harness();
        h.settings
            .set("real_trading_enabled", serde_json::json!(true))
            .await
            .unwrap();
        let record = strategy(&h.registry, Some(Tier::T4), true);
        let signal = buy_signal(&record);

        let trade = h.executor.process(signal.clone()).await.unwrap().unwrap();
        assert_eq!(trade.kind, TradeKind::Real);
        assert!(trade.exchange_order_id.is_some());

        // Balance debited exactly once.
        let balance = h.sim.balance("USDT").await.unwrap();
        assert!(balance.available < Decimal::from(10_000));

        // Dual dispatch: the validation observation exists too.
        assert!(h
            .executor
            .outcome(&signal.fingerprint, TradeKind::Validation)
            .is_some());

        // Idempotent resubmission.
        let again = h.executor.process(signal).await.unwrap().unwrap();
        assert_eq!(again.exchange_order_id, trade.exchange_order_id);
        let balance_again = h.sim.balance("USDT").await.unwrap();
        assert_eq!(balance.available, balance_again.available);
    }

    #[tokio::test]
    async fn rejection_records_failure_and_demotion_pressure() {
        let mut h = harness();
        h.settings
            .set("real_trading_enabled", serde_json::json!(true))
            .await
            .unwrap();
        let record = strategy(&h.registry, Some(Tier::T4), true);
        h.sim.reject_next_order();

        let trade = h
            .executor
            .process(buy_signal(&record))
            .await
            .unwrap()
            .unwrap();
        assert!(!trade.success);
        assert_eq!(trade.kind, TradeKind::Real);
        assert_eq!(h.pressure_rx.try_recv().unwrap(), record.id);
    }

    #[tokio::test]
    async fn transient_network_errors_are_retried() {
        let h = harness();
        h.settings
            .set("real_trading_enabled", serde_json::json!(true))
            .await
            .unwrap();
        let record = strategy(&h.registry, Some(Tier::T4), true);
        h.sim.fail_submissions(2);

        let trade = h
            .executor
            .process(buy_signal(&record))
            .await
            .unwrap()
            .unwrap();
        assert!(trade.success);
    }

    #[tokio::test]
    async fn validation_sell_realizes_pnl_against_open_lot() {
        let h = harness();
        let record = strategy(&h.registry, None, false);

        let buy = buy_signal(&record);
        h.executor.process(buy.clone()).await.unwrap().unwrap();

        // Price moves up, then the strategy exits.
        h.sim
            .set_series("BTC/USDT", KlineInterval::OneMinute, vec![kline_at(52_000)]);
        let ts = Utc::now();
        let sell = Signal {
            side: Side::Sell,
            price: Decimal::from(52_000),
            fingerprint: fingerprint(record.id, record.cycle, &record.symbol, ts, Side::Sell),
            ts,
            ..buy
        };
        let trade = h.executor.process(sell).await.unwrap().unwrap();
        assert!(trade.realized);
        assert!(trade.pnl > Decimal::ZERO);
    }
}
