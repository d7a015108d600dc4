use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EngineSettings, SettingsStore};
use crate::events::{EventKind, EvolutionLog};
use crate::execution::TradeExecutor;
use crate::registry::{StrategyFilter, StrategyRecord, StrategyRegistry, Tier};
use crate::scoring::ScoringService;
use crate::signals::SignalEngine;
use crate::utils::errors::AppError;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const WORKER_IDLE: Duration = Duration::from_millis(100);

/// One unit of evaluation work.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub strategy_id: Uuid,
    pub tier: Tier,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SchedState {
    next_due: Option<DateTime<Utc>>,
    last_bar: Option<DateTime<Utc>>,
    eval_retries: u32,
    /// Set by emergency demotion; cleared after fresh validation trades.
    emergency: Option<EmergencyState>,
}

#[derive(Debug, Clone, Copy)]
struct EmergencyState {
    trades_at_demotion: u32,
}

struct TierQueue {
    sender: mpsc::Sender<WorkItem>,
    receiver: Mutex<mpsc::Receiver<WorkItem>>,
}

/// Four-tier cooperative dispatcher.
///
/// Each tick re-ranks the population, recomputes hysteretic tier membership,
/// and enqueues due work into bounded per-tier queues. A pool of evaluation
/// workers drains the queues highest tier first; one worker owns one
/// strategy evaluation at a time. Under queue pressure the lowest tiers drop
/// first and T4 work is never dropped.
pub struct TierScheduler {
    registry: Arc<StrategyRegistry>,
    scoring: Arc<ScoringService>,
    settings: Arc<SettingsStore>,
    engine: Arc<SignalEngine>,
    executor: Arc<TradeExecutor>,
    log: Arc<EvolutionLog>,
    queues: [TierQueue; 4],
    state: DashMap<Uuid, SchedState>,
    in_flight: DashMap<Uuid, ()>,
    pressure_rx: Mutex<mpsc::UnboundedReceiver<Uuid>>,
    running: AtomicBool,
}

impl TierScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<StrategyRegistry>,
        scoring: Arc<ScoringService>,
        settings: Arc<SettingsStore>,
        engine: Arc<SignalEngine>,
        executor: Arc<TradeExecutor>,
        log: Arc<EvolutionLog>,
        pressure_rx: mpsc::UnboundedReceiver<Uuid>,
    ) -> Arc<Self> {
        let capacity = settings.snapshot().queue_capacity.max(1);
        let queues = std::array::from_fn(|_| {
            let (sender, receiver) = mpsc::channel(capacity);
            TierQueue {
                sender,
                receiver: Mutex::new(receiver),
            }
        });

        Arc::new(Self {
            registry,
            scoring,
            settings,
            engine,
            executor,
            log,
            queues,
            state: DashMap::new(),
            in_flight: DashMap::new(),
            pressure_rx: Mutex::new(pressure_rx),
            running: AtomicBool::new(false),
        })
    }

    /// Start the tick loop and the evaluation worker pool.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Starting tier scheduler");
        self.log
            .record("scheduler", EventKind::EngineStarted, None, None, None, "");

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        for worker_id in 0..workers {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.worker_loop(worker_id).await;
            });
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            while scheduler.running.load(Ordering::SeqCst) {
                scheduler.tick().await;
                sleep(TICK_INTERVAL).await;
            }
        });
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Stopping tier scheduler");
            self.log
                .record("scheduler", EventKind::EngineStopped, None, None, None, "");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One scheduling pass: pressure, membership, due work.
    pub async fn tick(&self) {
        let settings = self.settings.snapshot();
        self.drain_pressure(&settings).await;
        self.rebalance_tiers(&settings);
        self.enqueue_due(&settings, Utc::now()).await;
    }

    /// Recompute tier membership from the score ranking.
    ///
    /// Hysteresis: a strategy enters a tier only when its score clears the
    /// tier boundary by `hysteresis_band`, and leaves only when it falls the
    /// same margin below, so boundary noise does not flap membership.
    pub fn rebalance_tiers(&self, settings: &EngineSettings) {
        let ranked = self.registry.list(&StrategyFilter {
            enabled: Some(true),
            ..StrategyFilter::default()
        });
        if ranked.is_empty() {
            return;
        }

        let band = settings.hysteresis_band;
        let t2_boundary = boundary_score(&ranked, settings.t2_size);
        let t3_boundary = boundary_score(&ranked, settings.t3_size);

        for record in &ranked {
            let score = record.metrics.final_score.to_f64().unwrap_or(0.0);
            let current = record.tier;

            let target = if self.passes_t4_gate(record, score, settings) {
                Tier::T4
            } else if hysteretic_pass(score, t3_boundary, band, current >= Some(Tier::T3)) {
                Tier::T3
            } else if hysteretic_pass(score, t2_boundary, band, current >= Some(Tier::T2)) {
                Tier::T2
            } else {
                Tier::T1
            };

            if current != Some(target) {
                self.apply_tier_change(record, current, target, settings);
            }
        }

        self.enforce_tier_caps(settings);
    }

    /// T4 entry wraps the real-eligibility gate in the hysteresis band and
    /// blocks re-entry until post-emergency revalidation completes.
    fn passes_t4_gate(&self, record: &StrategyRecord, score: f64, settings: &EngineSettings) -> bool {
        if !record.qualifies_for_real {
            return false;
        }

        if let Some(state) = self.state.get(&record.id) {
            if let Some(emergency) = state.emergency {
                let breakdown = self.scoring.breakdown(record.id);
                let fresh_trades = breakdown
                    .map(|b| b.total_trades > emergency.trades_at_demotion)
                    .unwrap_or(false);
                if !fresh_trades {
                    return false;
                }
                // Fresh validation exists; still demand the upper band.
                if score < settings.s_real * (1.0 + settings.hysteresis_band) {
                    return false;
                }
                drop(state);
                if let Some(mut state) = self.state.get_mut(&record.id) {
                    state.emergency = None;
                }
                return true;
            }
        }

        hysteretic_pass(
            score,
            settings.s_real,
            settings.hysteresis_band,
            record.tier == Some(Tier::T4),
        )
    }

    /// Trim tiers to their population caps, pushing the weakest down.
    fn enforce_tier_caps(&self, settings: &EngineSettings) {
        for (tier, cap, fallback) in [
            (Tier::T4, settings.t4_size, Tier::T3),
            (Tier::T3, settings.t3_size, Tier::T2),
            (Tier::T2, settings.t2_size, Tier::T1),
        ] {
            let members = self.registry.list(&StrategyFilter {
                tier: Some(tier),
                ..StrategyFilter::default()
            });
            if members.len() <= cap {
                continue;
            }
            for record in members.into_iter().skip(cap) {
                self.apply_tier_change(&record, Some(tier), fallback, settings);
            }
        }
    }

    fn apply_tier_change(
        &self,
        record: &StrategyRecord,
        from: Option<Tier>,
        to: Tier,
        settings: &EngineSettings,
    ) {
        if self.registry.set_tier(record.id, Some(to)).is_err() {
            return;
        }

        let promoted = from.map(|f| to > f).unwrap_or(true);
        let kind = if promoted {
            EventKind::Promoted
        } else {
            EventKind::Demoted
        };
        self.log.record(
            "scheduler",
            kind,
            Some(record.id),
            from.map(|f| serde_json::json!(f.as_i16())),
            Some(serde_json::json!(to.as_i16())),
            format!("score {}", record.metrics.final_score),
        );

        // First promotion into T4 opens the protection window: the strategy
        // keeps validating before its first real order.
        if to == Tier::T4 && from != Some(Tier::T4) {
            let until = Utc::now() + ChronoDuration::minutes(settings.protect_window_minutes as i64);
            if self
                .registry
                .set_protected_until(record.id, Some(until))
                .is_ok()
            {
                self.log.record(
                    "scheduler",
                    EventKind::Protected,
                    Some(record.id),
                    None,
                    Some(serde_json::json!(until.to_rfc3339())),
                    "entered real-trading set",
                );
            }
        }

        debug!(
            "Tier change {}: {:?} -> {:?}",
            record.id, from, to
        );
    }

    /// Apply demotion pressure reported by the trade executor.
    async fn drain_pressure(&self, settings: &EngineSettings) {
        let mut rx = self.pressure_rx.lock().await;
        while let Ok(strategy_id) = rx.try_recv() {
            self.check_emergency(strategy_id, settings);
        }
    }

    /// Emergency demotion: consecutive real losses or a breached drawdown
    /// cap drop the strategy out of T4 immediately.
    pub fn check_emergency(&self, strategy_id: Uuid, settings: &EngineSettings) {
        let Some(record) = self.registry.get(strategy_id) else {
            return;
        };
        if record.tier != Some(Tier::T4) {
            return;
        }
        let Some(breakdown) = self.scoring.breakdown(strategy_id) else {
            return;
        };

        let loss_streak = breakdown.consecutive_real_losses >= settings.emergency_loss_streak;
        let drawdown_breach = breakdown
            .drawdown
            .map(|dd| dd > settings.max_drawdown_cap)
            .unwrap_or(false);
        if !(loss_streak || drawdown_breach) {
            return;
        }

        let reason = if loss_streak {
            format!(
                "{} consecutive losing real trades",
                breakdown.consecutive_real_losses
            )
        } else {
            "drawdown cap breached".to_string()
        };

        self.state.entry(strategy_id).or_default().emergency = Some(EmergencyState {
            trades_at_demotion: breakdown.total_trades,
        });
        self.apply_tier_change(&record, Some(Tier::T4), Tier::T3, settings);
        warn!("Emergency demotion of {}: {}", strategy_id, reason);
        self.log.record(
            "scheduler",
            EventKind::Demoted,
            Some(strategy_id),
            Some(serde_json::json!(Tier::T4.as_i16())),
            Some(serde_json::json!(Tier::T3.as_i16())),
            format!("emergency: {}", reason),
        );
    }

    /// Enqueue strategies whose cadence is due. A strategy sits in exactly
    /// one tier, so its highest obligation subsumes the lower ones.
    pub async fn enqueue_due(&self, settings: &EngineSettings, now: DateTime<Utc>) {
        let ranked = self.registry.list(&StrategyFilter {
            enabled: Some(true),
            ..StrategyFilter::default()
        });

        for record in ranked {
            // Retired strategies never reach here; the filter excludes them.
            let tier = record.tier.unwrap_or(Tier::T1);

            if self.in_flight.len() >= settings.max_active_strategies {
                break;
            }

            let due = match tier {
                Tier::T4 => {
                    // T4 runs on every new bar of its symbol.
                    let latest = self.engine.latest_bar(&record.symbol).await;
                    let mut state = self.state.entry(record.id).or_default();
                    match (latest, state.last_bar) {
                        (Some(bar), Some(seen)) if bar <= seen => false,
                        (Some(bar), _) => {
                            state.last_bar = Some(bar);
                            true
                        }
                        (None, _) => false,
                    }
                }
                _ => {
                    let interval = cadence(tier, settings);
                    let mut state = self.state.entry(record.id).or_default();
                    match state.next_due {
                        Some(due) if now < due => false,
                        _ => {
                            state.next_due = Some(now + interval);
                            true
                        }
                    }
                }
            };

            if due {
                self.dispatch(WorkItem {
                    strategy_id: record.id,
                    tier,
                    enqueued_at: now,
                })
                .await;
            }
        }
    }

    /// Bounded enqueue with tier-aware backpressure.
    async fn dispatch(&self, item: WorkItem) {
        let index = (item.tier.as_i16() - 1) as usize;
        if item.tier == Tier::T4 {
            // T4 work is never dropped; wait for capacity instead.
            if self.queues[index].sender.send(item).await.is_err() {
                warn!("T4 queue closed");
            }
            return;
        }

        if let Err(e) = self.queues[index].sender.try_send(item) {
            let err = AppError::Budget(format!("tier queue full: {}", e));
            self.log.note_error(&err);
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!("Evaluation worker {} started", worker_id);
        while self.running.load(Ordering::SeqCst) {
            match self.next_item().await {
                Some(item) => self.run_item(item).await,
                None => sleep(WORKER_IDLE).await,
            }
        }
        debug!("Evaluation worker {} stopped", worker_id);
    }

    /// Pop the highest-tier pending item.
    async fn next_item(&self) -> Option<WorkItem> {
        for index in (0..4).rev() {
            let mut receiver = self.queues[index].receiver.lock().await;
            if let Ok(item) = receiver.try_recv() {
                return Some(item);
            }
        }
        None
    }

    /// Evaluate one strategy and route its signal.
    pub async fn run_item(&self, item: WorkItem) {
        // One worker owns one strategy evaluation at a time.
        if self.in_flight.insert(item.strategy_id, ()).is_some() {
            return;
        }

        let result = self.evaluate(&item).await;
        self.in_flight.remove(&item.strategy_id);

        if let Err(e) = result {
            self.log.note_error(&e);
            self.handle_eval_failure(item, e).await;
        }
    }

    async fn evaluate(&self, item: &WorkItem) -> Result<(), AppError> {
        let Some(record) = self.registry.get(item.strategy_id) else {
            return Ok(());
        };
        if !record.is_live() || !record.enabled {
            return Ok(());
        }

        let settings = self.settings.snapshot();
        let signal = self
            .engine
            .evaluate(
                record.id,
                record.cycle,
                &record.symbol,
                &record.params,
                settings.validation_amount,
                Duration::from_millis(settings.max_age_ms),
            )
            .await;

        if !signal.is_actionable() {
            // Data trouble re-enqueues; a genuine hold just resets retries.
            if matches!(signal.reason.as_str(), "stale_data" | "feed_unavailable") {
                return Err(AppError::StaleData(signal.reason));
            }
            if let Some(mut state) = self.state.get_mut(&record.id) {
                state.eval_retries = 0;
            }
            return Ok(());
        }

        self.executor.process(signal).await?;
        if let Some(mut state) = self.state.get_mut(&record.id) {
            state.eval_retries = 0;
        }
        Ok(())
    }

    /// Re-enqueue a failed evaluation up to `max_eval_retries`, then mark it
    /// eval_failed. Failure is demotion pressure, not elimination.
    async fn handle_eval_failure(&self, item: WorkItem, error: AppError) {
        let settings = self.settings.snapshot();
        let retries = {
            let mut state = self.state.entry(item.strategy_id).or_default();
            state.eval_retries += 1;
            state.eval_retries
        };

        if error.is_retryable() && retries <= settings.max_eval_retries {
            debug!(
                "Re-enqueueing {} after {} (retry {})",
                item.strategy_id, error, retries
            );
            self.dispatch(item).await;
            return;
        }

        if let Some(mut state) = self.state.get_mut(&item.strategy_id) {
            state.eval_retries = 0;
        }
        self.log.record(
            "scheduler",
            EventKind::EvalFailed,
            Some(item.strategy_id),
            None,
            None,
            error.to_string(),
        );
    }
}

fn cadence(tier: Tier, settings: &EngineSettings) -> ChronoDuration {
    match tier {
        Tier::T1 => ChronoDuration::hours(settings.t1_interval_hours as i64),
        Tier::T2 => ChronoDuration::minutes(settings.t2_interval_minutes as i64),
        Tier::T3 => ChronoDuration::minutes(settings.t3_interval_minutes as i64),
        Tier::T4 => ChronoDuration::zero(),
    }
}

/// Score of the rank-`cap` strategy: the entry bar for a tier of that size.
fn boundary_score(ranked: &[StrategyRecord], cap: usize) -> f64 {
    if ranked.len() <= cap {
        return ranked
            .last()
            .and_then(|r| r.metrics.final_score.to_f64())
            .unwrap_or(0.0);
    }
    ranked[cap.saturating_sub(1)]
        .metrics
        .final_score
        .to_f64()
        .unwrap_or(0.0)
}

/// Hysteretic threshold test: members hold on until the lower band, joiners
/// must clear the upper band.
fn hysteretic_pass(score: f64, boundary: f64, band: f64, is_member: bool) -> bool {
    if is_member {
        score >= boundary * (1.0 - band)
    } else {
        score >= boundary * (1.0 + band)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    use crate::exchange::{ExchangeExecutor, MarketDataGateway, SimExchange};
    use crate::scoring::{TradeKind, TradeOutcome};
    use crate::strategies::{Side, StrategyParams, StrategyType};

    struct Harness {
        scheduler: Arc<TierScheduler>,
        registry: Arc<StrategyRegistry>,
        scoring: Arc<ScoringService>,
        settings: Arc<SettingsStore>,
        log: Arc<EvolutionLog>,
    }

    fn harness() -> Harness {
        let sim = Arc::new(SimExchange::new());
        let settings = Arc::new(SettingsStore::new(None));
        let registry = Arc::new(StrategyRegistry::in_memory());
        let scoring = Arc::new(ScoringService::new(Arc::clone(&settings)));
        let log = EvolutionLog::new(256, None);
        let engine = Arc::new(SignalEngine::new(
            Arc::clone(&sim) as Arc<dyn MarketDataGateway>,
            crate::exchange::KlineInterval::OneMinute,
            200,
        ));
        let (_tx, rx) = mpsc::unbounded_channel();
        let executor = TradeExecutor::new(
            Arc::clone(&sim) as Arc<dyn ExchangeExecutor>,
            Arc::clone(&sim) as Arc<dyn MarketDataGateway>,
            Arc::clone(&registry),
            Arc::clone(&scoring),
            Arc::clone(&settings),
            Arc::clone(&log),
            None,
            None,
        );
        let scheduler = TierScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&scoring),
            Arc::clone(&settings),
            engine,
            executor,
            Arc::clone(&log),
            rx,
        );
        Harness {
            scheduler,
            registry,
            scoring,
            settings,
            log,
        }
    }

    fn seed(registry: &StrategyRegistry, score: i64, qualifies: bool) -> StrategyRecord {
        let mut record = StrategyRecord::new(
            StrategyType::Momentum,
            "BTC/USDT".to_string(),
            StrategyParams::defaults(StrategyType::Momentum),
            None,
        );
        record.metrics.final_score = Decimal::from(score);
        record.metrics.win_rate = Decimal::from_str_exact("0.7").unwrap();
        record.metrics.total_trades = 20;
        record.qualifies_for_real = qualifies;
        registry.upsert(record)
    }

    fn set_score(registry: &StrategyRegistry, id: Uuid, score: &str) {
        let mut record = registry.get(id).unwrap();
        record.metrics.final_score = Decimal::from_str_exact(score).unwrap();
        registry.upsert(record);
    }

    #[tokio::test]
    async fn promotion_requires_clearing_the_upper_band() {
        let h = harness();
        let settings = h.settings.snapshot();
        let record = seed(&h.registry, 0, true);

        // 65.5 is above S_real = 65 but below 65 * 1.05.
        set_score(&h.registry, record.id, "65.5");
        h.scheduler.rebalance_tiers(&settings);
        assert_ne!(h.registry.get(record.id).unwrap().tier, Some(Tier::T4));

        // 68.5 clears the band.
        set_score(&h.registry, record.id, "68.5");
        h.scheduler.rebalance_tiers(&settings);
        assert_eq!(h.registry.get(record.id).unwrap().tier, Some(Tier::T4));
    }

    #[tokio::test]
    async fn demotion_waits_for_the_lower_band() {
        let h = harness();
        let settings = h.settings.snapshot();
        let record = seed(&h.registry, 0, true);

        set_score(&h.registry, record.id, "68.5");
        h.scheduler.rebalance_tiers(&settings);
        assert_eq!(h.registry.get(record.id).unwrap().tier, Some(Tier::T4));

        // Oscillation between 64.5 and 65.5 never crosses either band.
        for score in ["64.5", "65.5", "64.5", "65.5"] {
            set_score(&h.registry, record.id, score);
            h.scheduler.rebalance_tiers(&settings);
            assert_eq!(
                h.registry.get(record.id).unwrap().tier,
                Some(Tier::T4),
                "flapped at {}",
                score
            );
        }

        // Below 65 * 0.95 finally demotes.
        set_score(&h.registry, record.id, "61.0");
        h.scheduler.rebalance_tiers(&settings);
        assert_ne!(h.registry.get(record.id).unwrap().tier, Some(Tier::T4));
    }

    #[tokio::test]
    async fn t4_cap_keeps_only_the_strongest() {
        let h = harness();
        let settings = h.settings.snapshot();
        // Five eligible strategies with distinct scores; cap is 3.
        for score in [70, 72, 74, 76, 78] {
            seed(&h.registry, score, true);
        }
        h.scheduler.rebalance_tiers(&settings);

        let t4 = h.registry.list(&StrategyFilter {
            tier: Some(Tier::T4),
            ..StrategyFilter::default()
        });
        assert_eq!(t4.len(), settings.t4_size);
        assert!(t4
            .iter()
            .all(|r| r.metrics.final_score >= Decimal::from(74)));
    }

    #[tokio::test]
    async fn each_strategy_sits_in_exactly_one_tier() {
        let h = harness();
        let settings = h.settings.snapshot();
        for score in [10, 20, 30, 40, 50, 60, 70, 80] {
            seed(&h.registry, score, false);
        }
        h.scheduler.rebalance_tiers(&settings);

        let all = h.registry.list(&StrategyFilter::default());
        let assigned: usize = [Tier::T1, Tier::T2, Tier::T3, Tier::T4]
            .iter()
            .map(|t| {
                h.registry
                    .list(&StrategyFilter {
                        tier: Some(*t),
                        ..StrategyFilter::default()
                    })
                    .len()
            })
            .sum();
        assert_eq!(assigned, all.len());
    }

    #[tokio::test]
    async fn emergency_demotion_after_three_real_losses() {
        let h = harness();
        let settings = h.settings.snapshot();
        let record = seed(&h.registry, 80, true);
        h.registry.set_tier(record.id, Some(Tier::T4)).unwrap();

        for i in 0..3 {
            h.scoring.record_trade(
                record.id,
                TradeOutcome {
                    fingerprint: format!("loss{}", i),
                    kind: TradeKind::Real,
                    side: Side::Sell,
                    pnl: Decimal::from(-5),
                    fees: Decimal::ONE,
                    realized: true,
                    success: true,
                    ts: Utc::now(),
                },
            );
        }

        h.scheduler.check_emergency(record.id, &settings);
        assert_eq!(h.registry.get(record.id).unwrap().tier, Some(Tier::T3));

        // High score alone does not restore T4: fresh validation is needed.
        set_score(&h.registry, record.id, "90");
        h.scheduler.rebalance_tiers(&settings);
        assert_ne!(h.registry.get(record.id).unwrap().tier, Some(Tier::T4));

        // A fresh validation trade plus the score clears re-entry.
        h.scoring.record_trade(
            record.id,
            TradeOutcome {
                fingerprint: "fresh".to_string(),
                kind: TradeKind::Validation,
                side: Side::Sell,
                pnl: Decimal::from(4),
                fees: Decimal::ONE,
                realized: true,
                success: true,
                ts: Utc::now(),
            },
        );
        set_score(&h.registry, record.id, "90");
        h.scheduler.rebalance_tiers(&settings);
        assert_eq!(h.registry.get(record.id).unwrap().tier, Some(Tier::T4));
    }

    #[tokio::test]
    async fn first_t4_entry_opens_protection_window() {
        let h = harness();
        let settings = h.settings.snapshot();
        let record = seed(&h.registry, 80, true);

        h.scheduler.rebalance_tiers(&settings);
        let updated = h.registry.get(record.id).unwrap();
        assert_eq!(updated.tier, Some(Tier::T4));
        assert!(updated.protected_until.unwrap() > Utc::now());

        let protected_events: Vec<_> = h
            .log
            .recent(50)
            .into_iter()
            .filter(|e| e.kind == EventKind::Protected)
            .collect();
        assert_eq!(protected_events.len(), 1);
    }

    #[tokio::test]
    async fn retired_strategies_are_never_enqueued() {
        let h = harness();
        let settings = h.settings.snapshot();
        let record = seed(&h.registry, 50, false);
        h.registry.retire(record.id, "test").unwrap();

        h.scheduler.enqueue_due(&settings, Utc::now()).await;
        assert!(h.scheduler.next_item().await.is_none());
    }

    #[tokio::test]
    async fn due_work_is_enqueued_once_per_interval() {
        let h = harness();
        let settings = h.settings.snapshot();
        let record = seed(&h.registry, 50, false);
        h.registry.set_tier(record.id, Some(Tier::T3)).unwrap();

        let now = Utc::now();
        h.scheduler.enqueue_due(&settings, now).await;
        assert!(h.scheduler.next_item().await.is_some());

        // Immediately after, nothing is due.
        h.scheduler.enqueue_due(&settings, now).await;
        assert!(h.scheduler.next_item().await.is_none());
    }
}
