use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sea_orm::{ActiveValue::Set, DatabaseConnection, EntityTrait};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::evolution_event;
use crate::utils::errors::AppError;

/// Everything the engine narrates about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Mutated,
    Validated,
    Promoted,
    Demoted,
    Protected,
    Eliminated,
    Scored,
    TradeExecuted,
    TradeFailed,
    EvalFailed,
    SettingChanged,
    EngineStarted,
    EngineStopped,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Mutated => "mutated",
            EventKind::Validated => "validated",
            EventKind::Promoted => "promoted",
            EventKind::Demoted => "demoted",
            EventKind::Protected => "protected",
            EventKind::Eliminated => "eliminated",
            EventKind::Scored => "scored",
            EventKind::TradeExecuted => "trade_executed",
            EventKind::TradeFailed => "trade_failed",
            EventKind::EvalFailed => "eval_failed",
            EventKind::SettingChanged => "setting_changed",
            EventKind::EngineStarted => "engine_started",
            EventKind::EngineStopped => "engine_stopped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub ts: DateTime<Utc>,
    pub strategy_id: Option<Uuid>,
    pub actor: String,
    pub kind: EventKind,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub reason: String,
}

/// Append-only, bounded event log.
///
/// The in-memory ring serves the control surface; rows are mirrored to the
/// `evolution_log` table through a writer task so emitters never block on the
/// database. The log is observability, never a source of truth.
pub struct EvolutionLog {
    ring: RwLock<VecDeque<EventRecord>>,
    capacity: usize,
    sender: Option<mpsc::UnboundedSender<EventRecord>>,
    error_counters: DashMap<String, u64>,
}

impl EvolutionLog {
    pub fn new(capacity: usize, db: Option<Arc<DatabaseConnection>>) -> Arc<Self> {
        let sender = db.map(|db| {
            let (tx, mut rx) = mpsc::unbounded_channel::<EventRecord>();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let row = evolution_event::ActiveModel {
                        ts: Set(event.ts),
                        strategy_id: Set(event.strategy_id),
                        actor: Set(event.actor.clone()),
                        kind: Set(event.kind.as_str().to_string()),
                        before: Set(event.before.clone()),
                        after: Set(event.after.clone()),
                        reason: Set(event.reason.clone()),
                        ..Default::default()
                    };
                    if let Err(e) = evolution_event::Entity::insert(row).exec(db.as_ref()).await {
                        warn!("Failed to persist evolution event: {}", e);
                    }
                }
            });
            tx
        });

        Arc::new(Self {
            ring: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            sender,
            error_counters: DashMap::new(),
        })
    }

    pub fn record(
        &self,
        actor: &str,
        kind: EventKind,
        strategy_id: Option<Uuid>,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
        reason: impl Into<String>,
    ) {
        let event = EventRecord {
            ts: Utc::now(),
            strategy_id,
            actor: actor.to_string(),
            kind,
            before,
            after,
            reason: reason.into(),
        };

        debug!(
            "[{}] {} {} {}",
            event.actor,
            event.kind.as_str(),
            event
                .strategy_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            event.reason
        );

        {
            let mut ring = self.ring.write().expect("event ring poisoned");
            if ring.len() == self.capacity {
                // Oldest events compact away.
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }

    /// Count a recovered or surfaced error by kind.
    pub fn note_error(&self, err: &AppError) {
        *self
            .error_counters
            .entry(err.kind().to_string())
            .or_insert(0) += 1;
    }

    /// Most recent `n` events, newest last.
    pub fn recent(&self, n: usize) -> Vec<EventRecord> {
        let ring = self.ring.read().expect("event ring poisoned");
        let start = ring.len().saturating_sub(n);
        ring.iter().skip(start).cloned().collect()
    }

    /// Events for one strategy, newest last.
    pub fn recent_for(&self, strategy_id: Uuid, n: usize) -> Vec<EventRecord> {
        let ring = self.ring.read().expect("event ring poisoned");
        let mut events: Vec<EventRecord> = ring
            .iter()
            .filter(|e| e.strategy_id == Some(strategy_id))
            .cloned()
            .collect();
        let start = events.len().saturating_sub(n);
        events.drain(..start);
        events
    }

    pub fn error_counters(&self) -> std::collections::HashMap<String, u64> {
        self.error_counters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}
