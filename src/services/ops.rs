use rust_decimal::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::SettingsStore;
use crate::events::{EventKind, EventRecord, EvolutionLog};
use crate::evolution::EvolutionEngine;
use crate::registry::{StrategyFilter, StrategyRecord, StrategyRegistry, Tier};
use crate::scheduler::TierScheduler;
use crate::utils::errors::AppError;

/// Strategy detail with its recent log slice, for the strategy page.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyDetail {
    pub strategy: StrategyRecord,
    pub recent_events: Vec<EventRecord>,
}

/// Derived population overview.
#[derive(Debug, Clone, Serialize)]
pub struct PopulationSnapshot {
    pub total_live: usize,
    pub enabled: usize,
    pub per_tier: HashMap<i16, usize>,
    /// Score histogram over ten 10-point buckets.
    pub score_histogram: [usize; 10],
    pub leading: Option<LeadingStrategy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeadingStrategy {
    pub id: Uuid,
    pub generation: u32,
    pub cycle: u64,
    pub final_score: rust_decimal::Decimal,
}

/// Operation set consumed by the HTTP/JSON boundary.
///
/// The boundary itself lives outside the core; everything here is plain
/// methods over the engine's services, so the transport stays thin.
pub struct OpsService {
    registry: Arc<StrategyRegistry>,
    settings: Arc<SettingsStore>,
    scheduler: Arc<TierScheduler>,
    evolution: Arc<EvolutionEngine>,
    log: Arc<EvolutionLog>,
}

impl OpsService {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        settings: Arc<SettingsStore>,
        scheduler: Arc<TierScheduler>,
        evolution: Arc<EvolutionEngine>,
        log: Arc<EvolutionLog>,
    ) -> Self {
        Self {
            registry,
            settings,
            scheduler,
            evolution,
            log,
        }
    }

    pub fn list_strategies(&self, filter: &StrategyFilter) -> Vec<StrategyRecord> {
        self.registry.list(filter)
    }

    pub fn strategy_detail(&self, id: Uuid, event_count: usize) -> Option<StrategyDetail> {
        let strategy = self.registry.get(id)?;
        Some(StrategyDetail {
            recent_events: self.log.recent_for(id, event_count),
            strategy,
        })
    }

    pub fn population_snapshot(&self) -> PopulationSnapshot {
        let live = self.registry.list(&StrategyFilter::default());

        let mut per_tier = HashMap::new();
        let mut histogram = [0usize; 10];
        let mut enabled = 0;
        for record in &live {
            if record.enabled {
                enabled += 1;
            }
            if let Some(tier) = record.tier {
                *per_tier.entry(tier.as_i16()).or_insert(0) += 1;
            }
            let score = record.metrics.final_score.to_f64().unwrap_or(0.0);
            let bucket = ((score / 10.0) as usize).min(9);
            histogram[bucket] += 1;
        }

        PopulationSnapshot {
            total_live: live.len(),
            enabled,
            per_tier,
            score_histogram: histogram,
            leading: live.first().map(|r| LeadingStrategy {
                id: r.id,
                generation: r.generation,
                cycle: r.cycle,
                final_score: r.metrics.final_score,
            }),
        }
    }

    pub fn settings_document(&self) -> serde_json::Value {
        self.settings.to_document()
    }

    pub async fn update_setting(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), AppError> {
        let before = self
            .settings
            .to_document()
            .get(key)
            .cloned();
        self.settings.set(key, value.clone()).await?;
        self.log.record(
            "ops",
            EventKind::SettingChanged,
            None,
            before,
            Some(value),
            key.to_string(),
        );
        Ok(())
    }

    /// The operator's master switch for real-money trading.
    pub async fn set_real_trading(&self, enabled: bool) -> Result<(), AppError> {
        self.update_setting("real_trading_enabled", serde_json::json!(enabled))
            .await
    }

    pub fn start(&self) {
        let scheduler = Arc::clone(&self.scheduler);
        scheduler.start();
        self.evolution.start();
    }

    pub fn stop(&self) {
        self.scheduler.stop();
        self.evolution.stop();
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn recent_events(&self, n: usize) -> Vec<EventRecord> {
        self.log.recent(n)
    }

    pub fn error_counters(&self) -> HashMap<String, u64> {
        self.log.error_counters()
    }

    /// Tier populations, for the dashboard header.
    pub fn tier_counts(&self) -> HashMap<i16, usize> {
        [Tier::T1, Tier::T2, Tier::T3, Tier::T4]
            .iter()
            .map(|tier| {
                (
                    tier.as_i16(),
                    self.registry
                        .list(&StrategyFilter {
                            tier: Some(*tier),
                            ..StrategyFilter::default()
                        })
                        .len(),
                )
            })
            .collect()
    }
}
