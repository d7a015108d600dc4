pub mod mutation;
pub mod validation;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rand::Rng;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backtesting::ShadowBacktester;
use crate::config::{EngineSettings, SettingsStore};
use crate::events::{EventKind, EvolutionLog};
use crate::exchange::{KlineInterval, MarketDataGateway};
use crate::registry::{StrategyFilter, StrategyRecord, StrategyRegistry, Tier};
use crate::scoring::ScoringService;
use crate::strategies::{StrategyParams, StrategyType};
use crate::utils::errors::AppError;

pub use validation::{ValidationHarness, ValidationReport};

/// Tracks the best score seen per strategy for the no-improvement
/// elimination criterion.
#[derive(Debug, Clone, Copy)]
struct ImprovementState {
    best_score: Decimal,
    best_at: DateTime<Utc>,
}

/// The genetic optimization loop.
///
/// Out-of-band of evaluation: proposes parameter changes on mid-tier
/// strategies, gates them through a shadow backtest and live validation, and
/// commits winners through the registry's optimistic cycle token. Also owns
/// population homeostasis and retirement.
pub struct EvolutionEngine {
    registry: Arc<StrategyRegistry>,
    scoring: Arc<ScoringService>,
    settings: Arc<SettingsStore>,
    gateway: Arc<dyn MarketDataGateway>,
    log: Arc<EvolutionLog>,
    symbols: Vec<String>,
    interval: KlineInterval,
    history: usize,
    improvement: DashMap<Uuid, ImprovementState>,
    /// Poll cadence for live validation; coarse in production, tight in tests.
    validation_poll: Duration,
    tick_every: Duration,
    running: AtomicBool,
}

impl EvolutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<StrategyRegistry>,
        scoring: Arc<ScoringService>,
        settings: Arc<SettingsStore>,
        gateway: Arc<dyn MarketDataGateway>,
        log: Arc<EvolutionLog>,
        symbols: Vec<String>,
        interval: KlineInterval,
        history: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            scoring,
            settings,
            gateway,
            log,
            symbols,
            interval,
            history,
            improvement: DashMap::new(),
            validation_poll: Duration::from_millis(500),
            tick_every: Duration::from_secs(30),
            running: AtomicBool::new(false),
        })
    }

    /// Start the background optimization loop.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Starting evolution engine");
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while engine.running.load(Ordering::SeqCst) {
                if let Err(e) = engine.evolve_once().await {
                    engine.log.note_error(&e);
                    warn!("Evolution pass failed: {}", e);
                }
                engine.retirement_sweep();
                engine.homeostasis();
                sleep(engine.tick_every).await;
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One propose → shadow-backtest → live-validate → commit pass.
    pub async fn evolve_once(&self) -> Result<(), AppError> {
        let settings = self.settings.snapshot();
        let Some((parent, proposal, expected_cycle)) = self.propose(&settings) else {
            return Ok(());
        };

        // Shadow backtest both parent and proposal on the same history so
        // the improvement estimate is apples to apples.
        let candles = match self
            .gateway
            .candles(&parent.symbol, self.interval, self.history)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                let err = AppError::from(e);
                self.log.note_error(&err);
                return Ok(());
            }
        };
        if candles.len() <= proposal.min_candles() {
            return Ok(());
        }

        let (base, candidate) = rayon::join(
            || ShadowBacktester::run(&parent.params, &candles, &settings),
            || ShadowBacktester::run(&proposal, &candles, &settings),
        );
        let predicted = candidate.breakdown.final_score.to_f64().unwrap_or(0.0)
            - base.breakdown.final_score.to_f64().unwrap_or(0.0);

        if predicted < settings.min_score_improvement {
            debug!(
                "Proposal for {} rejected in shadow: predicted {:+.2}",
                parent.id, predicted
            );
            self.log.record(
                "evolution",
                EventKind::Validated,
                Some(parent.id),
                None,
                None,
                format!(
                    "rejected: predicted improvement {:+.2} below {}",
                    predicted, settings.min_score_improvement
                ),
            );
            return Ok(());
        }

        // Live validation through the simulated trade path.
        let harness = ValidationHarness::new(
            Arc::clone(&self.gateway),
            self.interval,
            self.history,
        );
        let time_cap = Duration::from_secs(settings.validation_time_cap_minutes * 60);
        let report = harness
            .validate(
                &proposal,
                &parent.symbol,
                &settings,
                settings.param_validation_trades,
                time_cap,
                self.validation_poll,
            )
            .await;

        if !report.passes(&settings) {
            self.log.record(
                "evolution",
                EventKind::Validated,
                Some(parent.id),
                None,
                None,
                format!(
                    "rejected: observed win rate {:?}, pnl {} over {} trades",
                    report.win_rate(),
                    report.observed_pnl,
                    report.realized_trades
                ),
            );
            return Ok(());
        }

        match self
            .registry
            .commit_parameters(parent.id, proposal.clone(), expected_cycle)
        {
            Ok(committed) => {
                info!(
                    "Committed parameters for {} at cycle {}",
                    committed.id, committed.cycle
                );
                self.log.record(
                    "evolution",
                    EventKind::Mutated,
                    Some(parent.id),
                    serde_json::to_value(&parent.params).ok(),
                    serde_json::to_value(&proposal).ok(),
                    format!(
                        "predicted {:+.2}, observed pnl {} over {} validation trades",
                        predicted, report.observed_pnl, report.realized_trades
                    ),
                );
            }
            Err(AppError::CycleConflict { actual, .. }) => {
                // Another worker won the race; the proposal dies quietly.
                debug!(
                    "Cycle conflict on {}: expected {}, now {}",
                    parent.id, expected_cycle, actual
                );
                self.log.record(
                    "evolution",
                    EventKind::Validated,
                    Some(parent.id),
                    None,
                    None,
                    "discarded: cycle conflict",
                );
            }
            Err(AppError::Constraint(reason)) => {
                self.log.record(
                    "evolution",
                    EventKind::Validated,
                    Some(parent.id),
                    None,
                    None,
                    format!("discarded: {}", reason),
                );
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Pick a candidate and build a proposal. Weighted random over T2/T3
    /// strategies under the score ceiling, skipping protected ones.
    fn propose(
        &self,
        settings: &EngineSettings,
    ) -> Option<(StrategyRecord, StrategyParams, u64)> {
        let now = Utc::now();
        let ranked = self.registry.list(&StrategyFilter {
            enabled: Some(true),
            ..StrategyFilter::default()
        });

        // The top performers are shielded from mutation.
        let shielded: HashSet<Uuid> = ranked
            .iter()
            .take(settings.top_protect)
            .map(|r| r.id)
            .collect();

        let pool: Vec<&StrategyRecord> = ranked
            .iter()
            .filter(|r| matches!(r.tier, Some(Tier::T2) | Some(Tier::T3)))
            .filter(|r| {
                r.metrics.final_score.to_f64().unwrap_or(0.0) < settings.evolution_score_ceiling
            })
            .filter(|r| !shielded.contains(&r.id) && !r.is_protected(now))
            .collect();
        if pool.is_empty() {
            return None;
        }

        let mut rng = rand::thread_rng();
        let parent = weighted_pick(&pool, &mut rng)?;

        let proposal = if rng.gen::<f64>() < settings.crossover_rate {
            let mates: Vec<&&StrategyRecord> = pool
                .iter()
                .filter(|r| r.strategy_type == parent.strategy_type && r.id != parent.id)
                .collect();
            match mates.as_slice() {
                [] => mutation::mutate(&parent.params, settings.mutation_rate, &mut rng),
                mates => {
                    let mate = mates[rng.gen_range(0..mates.len())];
                    mutation::crossover(&parent.params, &mate.params, &mut rng)
                }
            }
        } else {
            mutation::mutate(&parent.params, settings.mutation_rate, &mut rng)
        };

        match proposal {
            Ok(proposal) => Some((parent.clone(), proposal, parent.cycle)),
            Err(e) => {
                self.log.note_error(&e);
                None
            }
        }
    }

    /// Refill the population toward `optimal_strategy_count`, sampling
    /// under-represented families more often. Never exceeds
    /// `max_total_strategies`.
    pub fn homeostasis(&self) -> usize {
        let settings = self.settings.snapshot();
        let live = self.registry.live_count();
        if live >= settings.optimal_strategy_count {
            return 0;
        }
        let deficit = (settings.optimal_strategy_count - live)
            .min(settings.max_total_strategies.saturating_sub(live));

        let mut counts = self.registry.count_by_type();
        let mut rng = rand::thread_rng();
        let mut created = 0;

        for _ in 0..deficit {
            // Diversity bias: weight each family by 1 / (count + 1).
            let weights: Vec<f64> = StrategyType::ALL
                .iter()
                .map(|t| 1.0 / (*counts.get(t).unwrap_or(&0) as f64 + 1.0))
                .collect();
            let family = StrategyType::ALL[pick_index(&weights, &mut rng)];
            let params = StrategyParams::sample(family, &mut rng);
            let symbol = self.symbols[rng.gen_range(0..self.symbols.len())].clone();

            let record = StrategyRecord::new(family, symbol, params, None);
            let record = self.registry.upsert(record);
            *counts.entry(family).or_insert(0) += 1;
            created += 1;

            self.log.record(
                "evolution",
                EventKind::Created,
                Some(record.id),
                None,
                serde_json::to_value(&record.params).ok(),
                format!("homeostasis: population {} -> {}", live, live + created),
            );
        }

        if created > 0 {
            info!("Homeostasis created {} strategies", created);
        }
        created
    }

    /// Retire strategies meeting the elimination criteria. Protected and
    /// top-ranked strategies are exempt.
    pub fn retirement_sweep(&self) -> usize {
        let settings = self.settings.snapshot();
        let now = Utc::now();
        let ranked = self.registry.list(&StrategyFilter::default());
        let mut retired = 0;

        for (rank, record) in ranked.iter().enumerate() {
            if rank < settings.top_protect || record.is_protected(now) {
                continue;
            }

            let score = record.metrics.final_score;
            let trades = record.metrics.total_trades;

            // Track best-ever score for the stagnation criterion.
            let stagnant = {
                let mut entry = self.improvement.entry(record.id).or_insert(ImprovementState {
                    best_score: score,
                    best_at: now,
                });
                if score > entry.best_score {
                    entry.best_score = score;
                    entry.best_at = now;
                }
                now.signed_duration_since(entry.best_at)
                    > ChronoDuration::days(settings.elimination_days)
            };

            let enough_evidence = trades >= settings.min_trades_for_evaluation;
            let low_score = enough_evidence
                && score.to_f64().unwrap_or(0.0) < settings.s_elim;
            let bleeding = enough_evidence
                && record.metrics.total_return < Decimal::ZERO
                && score.to_f64().unwrap_or(0.0) < settings.s_real;

            let reason = if low_score {
                Some(format!("score {} below elimination floor", score))
            } else if stagnant {
                Some(format!(
                    "no improvement for {} days",
                    settings.elimination_days
                ))
            } else if bleeding {
                Some(format!(
                    "negative return {} over {} trades",
                    record.metrics.total_return, trades
                ))
            } else {
                None
            };

            if let Some(reason) = reason {
                if self.registry.retire(record.id, &reason).is_ok() {
                    self.scoring.forget(record.id);
                    self.improvement.remove(&record.id);
                    retired += 1;
                    self.log.record(
                        "evolution",
                        EventKind::Eliminated,
                        Some(record.id),
                        serde_json::to_value(&record.params).ok(),
                        None,
                        reason,
                    );
                }
            }
        }

        if retired > 0 {
            info!("Retired {} strategies", retired);
        }
        retired
    }
}

fn weighted_pick<'a>(
    pool: &[&'a StrategyRecord],
    rng: &mut impl Rng,
) -> Option<&'a StrategyRecord> {
    let weights: Vec<f64> = pool
        .iter()
        .map(|r| r.metrics.final_score.to_f64().unwrap_or(0.0) + 1.0)
        .collect();
    Some(pool[pick_index(&weights, rng)])
}

fn pick_index(weights: &[f64], rng: &mut impl Rng) -> usize {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return rng.gen_range(0..weights.len());
    }
    let mut target = rng.gen_range(0.0..total);
    for (index, weight) in weights.iter().enumerate() {
        if target < *weight {
            return index;
        }
        target -= weight;
    }
    weights.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    use crate::exchange::{Kline, SimExchange};

    fn harness_engine(
        symbols: Vec<String>,
    ) -> (
        Arc<EvolutionEngine>,
        Arc<StrategyRegistry>,
        Arc<SettingsStore>,
        Arc<EvolutionLog>,
        Arc<SimExchange>,
    ) {
        let sim = Arc::new(SimExchange::new());
        let settings = Arc::new(SettingsStore::new(None));
        let registry = Arc::new(StrategyRegistry::in_memory());
        let scoring = Arc::new(ScoringService::new(Arc::clone(&settings)));
        let log = EvolutionLog::new(1024, None);
        let engine = EvolutionEngine::new(
            Arc::clone(&registry),
            scoring,
            Arc::clone(&settings),
            Arc::clone(&sim) as Arc<dyn MarketDataGateway>,
            Arc::clone(&log),
            symbols,
            KlineInterval::OneHour,
            200,
        );
        (engine, registry, settings, log, sim)
    }

    fn seed(
        registry: &StrategyRegistry,
        family: StrategyType,
        score: i64,
        tier: Option<Tier>,
        trades: u32,
    ) -> StrategyRecord {
        let mut record = StrategyRecord::new(
            family,
            "BTC/USDT".to_string(),
            StrategyParams::defaults(family),
            None,
        );
        record.metrics.final_score = Decimal::from(score);
        record.metrics.total_trades = trades;
        record.tier = tier;
        registry.upsert(record)
    }

    fn flat_series(n: usize) -> Vec<Kline> {
        let base = Utc::now() - ChronoDuration::hours(n as i64);
        (0..n)
            .map(|i| Kline {
                open_time: base + ChronoDuration::hours(i as i64),
                close_time: base + ChronoDuration::hours(i as i64 + 1),
                open: Decimal::from(100),
                high: Decimal::from(100),
                low: Decimal::from(100),
                close: Decimal::from(100),
                volume: Decimal::from(1000),
                quote_volume: Decimal::from(100_000),
                trades_count: 10,
            })
            .collect()
    }

    #[tokio::test]
    async fn homeostasis_refills_to_optimal_with_diversity() {
        let (engine, registry, settings, _log, _sim) =
            harness_engine(vec!["BTC/USDT".to_string()]);
        settings
            .set("optimal_strategy_count", serde_json::json!(30))
            .await
            .unwrap();
        settings
            .set("max_total_strategies", serde_json::json!(40))
            .await
            .unwrap();

        // Heavily skewed population: 10 momentum only.
        for _ in 0..10 {
            seed(&registry, StrategyType::Momentum, 50, None, 0);
        }

        let created = engine.homeostasis();
        assert_eq!(created, 20);
        assert_eq!(registry.live_count(), 30);

        // Under-represented families got the bulk of the new slots.
        let counts = registry.count_by_type();
        let non_momentum: usize = StrategyType::ALL
            .iter()
            .filter(|t| **t != StrategyType::Momentum)
            .map(|t| *counts.get(t).unwrap_or(&0))
            .sum();
        assert!(
            non_momentum >= 15,
            "diversity bias too weak: {} non-momentum of 20 created",
            non_momentum
        );
    }

    #[tokio::test]
    async fn homeostasis_never_exceeds_max_total() {
        let (engine, registry, settings, _log, _sim) =
            harness_engine(vec!["BTC/USDT".to_string()]);
        settings
            .set("optimal_strategy_count", serde_json::json!(100))
            .await
            .unwrap();
        settings
            .set("max_total_strategies", serde_json::json!(15))
            .await
            .unwrap();

        for _ in 0..10 {
            seed(&registry, StrategyType::Momentum, 50, None, 0);
        }
        engine.homeostasis();
        assert!(registry.live_count() <= 15);
    }

    #[tokio::test]
    async fn low_score_strategies_are_retired() {
        let (engine, registry, settings, log, _sim) =
            harness_engine(vec!["BTC/USDT".to_string()]);
        settings
            .set("top_protect", serde_json::json!(1))
            .await
            .unwrap();

        // Protected top performer and a failing one with enough evidence.
        let strong = seed(&registry, StrategyType::Momentum, 80, Some(Tier::T2), 30);
        let weak = seed(&registry, StrategyType::Breakout, 10, Some(Tier::T2), 30);
        let unproven = seed(&registry, StrategyType::GridTrading, 10, None, 2);

        let retired = engine.retirement_sweep();
        assert_eq!(retired, 1);
        assert!(!registry.get(weak.id).unwrap().is_live());
        assert!(registry.get(strong.id).unwrap().is_live());
        // Too few trades: not enough evidence to eliminate.
        assert!(registry.get(unproven.id).unwrap().is_live());

        let eliminated: Vec<_> = log
            .recent(50)
            .into_iter()
            .filter(|e| e.kind == EventKind::Eliminated)
            .collect();
        assert_eq!(eliminated.len(), 1);
        assert_eq!(eliminated[0].strategy_id, Some(weak.id));
    }

    #[tokio::test]
    async fn shadow_rejection_skips_live_validation_and_commit() {
        let (engine, registry, settings, log, sim) =
            harness_engine(vec!["BTC/USDT".to_string()]);
        settings
            .set("top_protect", serde_json::json!(0))
            .await
            .unwrap();
        // Flat market: no proposal can look better in replay.
        sim.set_series("BTC/USDT", KlineInterval::OneHour, flat_series(120));

        let parent = seed(&registry, StrategyType::Momentum, 40, Some(Tier::T2), 10);
        engine.evolve_once().await.unwrap();

        // Cycle untouched, rejection recorded.
        assert_eq!(registry.get(parent.id).unwrap().cycle, 0);
        let rejections: Vec<_> = log
            .recent(50)
            .into_iter()
            .filter(|e| e.kind == EventKind::Validated)
            .collect();
        assert_eq!(rejections.len(), 1);
        assert!(rejections[0].reason.starts_with("rejected"));
    }

    #[tokio::test]
    async fn propose_skips_protected_and_out_of_tier_strategies() {
        let (engine, registry, settings, _log, _sim) =
            harness_engine(vec!["BTC/USDT".to_string()]);
        let snapshot = settings.snapshot();

        // T4 and unassigned strategies are not evolution candidates.
        seed(&registry, StrategyType::Momentum, 80, Some(Tier::T4), 30);
        seed(&registry, StrategyType::Momentum, 20, None, 5);
        assert!(engine.propose(&snapshot).is_none());

        // A T2 candidate below the ceiling is pickable.
        let candidate = seed(&registry, StrategyType::Momentum, 1, Some(Tier::T2), 5);
        // But the top_protect shield covers the best performers; with only
        // three strategies and top_protect = 3 nothing is pickable.
        assert!(engine.propose(&snapshot).is_none());

        for _ in 0..3 {
            seed(&registry, StrategyType::Breakout, 90, Some(Tier::T3), 30);
        }
        let (parent, proposal, cycle) = engine.propose(&snapshot).unwrap();
        assert_eq!(cycle, 0);
        assert_eq!(proposal.family(), parent.strategy_type);
        assert!(parent.id == candidate.id || parent.metrics.final_score <= Decimal::from(90));
    }
}
