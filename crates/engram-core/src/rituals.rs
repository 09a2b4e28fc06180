//! Ritual orchestrator
//!
//! A single-threaded cooperative scheduler over stored ritual definitions.
//! Ticks are caller-driven: `run_pending(now)` selects ready rituals
//! (`next_run <= now`, not already running) in priority order and executes
//! each to completion before dispatching the next. Failures are logged,
//! recorded toward the meta-evolution health metric, and never stop the
//! remaining rituals in the tick. Deadlines are honored between rituals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::{EngramError, Result};
use crate::evolution::MetaEvolutionController;
use crate::storage::Storage;

// ============================================================================
// RITUAL DATA
// ============================================================================

/// What a ritual does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RitualKind {
    /// Compress old message ranges into epochs
    Compression,
    /// Prune stale low-confidence knowledge
    Pruning,
    /// Drive the evolutionary pilot
    Evolution,
    /// Analyze capture ring, refresh statistics, apply index advice
    Reindex,
    /// Run the logic probes
    Probe,
}

impl RitualKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RitualKind::Compression => "compression",
            RitualKind::Pruning => "pruning",
            RitualKind::Evolution => "evolution",
            RitualKind::Reindex => "reindex",
            RitualKind::Probe => "probe",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "pruning" => RitualKind::Pruning,
            "evolution" => RitualKind::Evolution,
            "reindex" => RitualKind::Reindex,
            "probe" => RitualKind::Probe,
            _ => RitualKind::Compression,
        }
    }
}

/// How often a ritual fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    /// Every hour
    Hourly,
    /// Every day
    Daily,
    /// Every week
    Weekly,
    /// Only on explicit request
    Manual,
}

impl Frequency {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Manual => "manual",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "hourly" => Frequency::Hourly,
            "weekly" => Frequency::Weekly,
            "manual" => Frequency::Manual,
            _ => Frequency::Daily,
        }
    }

    /// Interval between runs; `None` for manual rituals.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Frequency::Hourly => Some(Duration::hours(1)),
            Frequency::Daily => Some(Duration::days(1)),
            Frequency::Weekly => Some(Duration::weeks(1)),
            Frequency::Manual => None,
        }
    }
}

/// Ritual execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RitualStatus {
    /// Waiting for its next slot
    #[default]
    Pending,
    /// Currently executing
    Running,
    /// Last run finished cleanly
    Succeeded,
    /// Last run failed (recorded, not retried within the tick)
    Failed,
}

impl RitualStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RitualStatus::Pending => "pending",
            RitualStatus::Running => "running",
            RitualStatus::Succeeded => "succeeded",
            RitualStatus::Failed => "failed",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "running" => RitualStatus::Running,
            "succeeded" => RitualStatus::Succeeded,
            "failed" => RitualStatus::Failed,
            _ => RitualStatus::Pending,
        }
    }
}

/// One stored ritual
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ritual {
    /// Row id
    pub id: i64,
    /// Unique name
    pub name: String,
    /// What it does
    pub kind: RitualKind,
    /// JSON definition passed to the handler
    pub definition: serde_json::Value,
    /// Cadence
    pub frequency: Frequency,
    /// Dispatch order within a tick (lower runs first)
    pub priority: i64,
    /// Last execution time
    pub last_run: Option<DateTime<Utc>>,
    /// Next due time; `None` for manual rituals
    pub next_run: Option<DateTime<Utc>>,
    /// Execution status
    pub status: RitualStatus,
    /// JSON metadata
    pub metadata: serde_json::Value,
}

/// Outcome of one ritual execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RitualRunReport {
    /// Ritual id
    pub ritual_id: i64,
    /// Ritual name
    pub name: String,
    /// Ritual kind
    pub kind: RitualKind,
    /// Whether the handler returned cleanly
    pub succeeded: bool,
    /// Handler summary or error text
    pub detail: String,
    /// Wall-clock duration
    pub duration_ms: f64,
}

/// Work performed when a ritual of a given kind fires.
///
/// Handlers may perform storage I/O; cancellation is cooperative through the
/// deadline, honored at the handler's own suspension points.
pub trait RitualHandler: Send + Sync {
    /// Execute the ritual, returning a short human-readable summary.
    fn execute(&self, ritual: &Ritual, deadline: Option<Instant>) -> Result<String>;
}

/// Observer notified after each ritual run.
pub type RitualListener = dyn Fn(&RitualRunReport) + Send + Sync;

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Cooperative scheduler over stored rituals
pub struct RitualOrchestrator {
    storage: Arc<Storage>,
    handlers: Mutex<HashMap<RitualKind, Arc<dyn RitualHandler>>>,
    listeners: Mutex<Vec<Arc<RitualListener>>>,
    meta: Mutex<Option<Arc<MetaEvolutionController>>>,
}

impl RitualOrchestrator {
    /// Bind to an open storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            handlers: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            meta: Mutex::new(None),
        }
    }

    /// Install the handler for a ritual kind (replaces any previous one).
    pub fn register_handler(&self, kind: RitualKind, handler: Arc<dyn RitualHandler>) {
        self.handlers.lock().unwrap_or_else(|p| p.into_inner()).insert(kind, handler);
    }

    /// Register an observer for ritual outcomes.
    pub fn add_listener(&self, listener: Arc<RitualListener>) {
        self.listeners.lock().unwrap_or_else(|p| p.into_inner()).push(listener);
    }

    /// Feed ritual outcomes into the meta-evolution health window.
    pub fn attach_meta(&self, meta: Arc<MetaEvolutionController>) {
        *self.meta.lock().unwrap_or_else(|p| p.into_inner()) = Some(meta);
    }

    /// Define (or replace) a ritual by unique name. Scheduled rituals
    /// become due one interval after definition; manual rituals only run on
    /// request.
    pub fn define(
        &self,
        name: &str,
        kind: RitualKind,
        frequency: Frequency,
        definition: serde_json::Value,
        priority: i64,
    ) -> Result<Ritual> {
        let next_run = frequency.interval().map(|i| (Utc::now() + i).to_rfc3339());
        let def = definition.to_string();
        self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_rituals (name, ritual_type, definition, frequency, priority, next_run) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(name) DO UPDATE SET \
                     ritual_type = excluded.ritual_type, \
                     definition = excluded.definition, \
                     frequency = excluded.frequency, \
                     priority = excluded.priority, \
                     next_run = excluded.next_run, \
                     status = 'pending'",
                params![name, kind.as_str(), def, frequency.as_str(), priority, next_run],
            )?;
            Ok(())
        })?;
        self.get_by_name(name)?
            .ok_or(EngramError::NotFound { entity: "ritual", id: 0 })
    }

    /// Fetch a ritual by name.
    pub fn get_by_name(&self, name: &str) -> Result<Option<Ritual>> {
        let rows = self.query("name = ?1", params![name])?;
        Ok(rows.into_iter().next())
    }

    /// Every ritual, priority order.
    pub fn list(&self) -> Result<Vec<Ritual>> {
        self.query("1 = 1", params![])
    }

    /// Execute every ready ritual (due at `now`, not running) in priority
    /// order, each to completion. The deadline is checked between rituals;
    /// on expiry the remaining rituals stay pending for the next tick.
    pub fn run_pending(
        &self,
        now: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<Vec<RitualRunReport>> {
        let due = self.query(
            "status != 'running' AND frequency != 'manual' \
             AND next_run IS NOT NULL AND next_run <= ?1 \
             ORDER BY priority ASC, id ASC",
            params![now.to_rfc3339()],
        )?;

        let mut reports = Vec::with_capacity(due.len());
        for ritual in due {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    tracing::debug!("tick deadline reached, deferring remaining rituals");
                    break;
                }
            }
            reports.push(self.execute_one(&ritual, now, deadline)?);
        }
        Ok(reports)
    }

    /// Execute one ritual by name immediately, regardless of schedule.
    pub fn run_ritual(&self, name: &str, deadline: Option<Instant>) -> Result<RitualRunReport> {
        let ritual = self
            .get_by_name(name)?
            .ok_or(EngramError::NotFound { entity: "ritual", id: 0 })?;
        self.execute_one(&ritual, Utc::now(), deadline)
    }

    fn execute_one(
        &self,
        ritual: &Ritual,
        now: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<RitualRunReport> {
        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&ritual.kind)
            .cloned();

        self.mark(ritual.id, RitualStatus::Running, None, None)?;
        let start = Instant::now();
        let outcome = match handler {
            Some(handler) => handler.execute(ritual, deadline),
            None => Err(EngramError::Config(format!(
                "no handler registered for ritual kind {}",
                ritual.kind.as_str()
            ))),
        };
        let duration_ms = start.elapsed().as_secs_f64() * 1_000.0;

        let next_run = ritual.frequency.interval().map(|i| now + i);
        let (status, succeeded, detail) = match outcome {
            Ok(summary) => (RitualStatus::Succeeded, true, summary),
            Err(e) => {
                tracing::warn!(ritual = %ritual.name, "ritual failed: {e}");
                (RitualStatus::Failed, false, e.to_string())
            }
        };
        self.mark(ritual.id, status, Some(now), next_run)?;

        let report = RitualRunReport {
            ritual_id: ritual.id,
            name: ritual.name.clone(),
            kind: ritual.kind,
            succeeded,
            detail,
            duration_ms,
        };

        if let Some(meta) = self.meta.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            meta.record_outcome(succeeded, duration_ms);
        }
        let listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner()).clone();
        for listener in listeners {
            listener(&report);
        }
        Ok(report)
    }

    fn mark(
        &self,
        id: i64,
        status: RitualStatus,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.storage.with_writer(|conn| {
            conn.execute(
                "UPDATE agent_rituals SET \
                     status = ?1, \
                     last_run = COALESCE(?2, last_run), \
                     next_run = COALESCE(?3, next_run) \
                 WHERE id = ?4",
                params![
                    status.as_str(),
                    last_run.map(|t| t.to_rfc3339()),
                    next_run.map(|t| t.to_rfc3339()),
                    id
                ],
            )?;
            Ok(())
        })
    }

    fn query(&self, filter: &str, params: impl rusqlite::Params + Copy) -> Result<Vec<Ritual>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, name, ritual_type, definition, frequency, priority, last_run, next_run, \
                        status, metadata \
                 FROM agent_rituals WHERE {filter}"
            ))?;
            let rows = stmt
                .query_map(params, |row| {
                    let def: String = row.get(3)?;
                    let last_run: Option<String> = row.get(6)?;
                    let next_run: Option<String> = row.get(7)?;
                    let meta: String = row.get(9)?;
                    Ok(Ritual {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        kind: RitualKind::parse_name(&row.get::<_, String>(2)?),
                        definition: serde_json::from_str(&def).unwrap_or(serde_json::Value::Null),
                        frequency: Frequency::parse_name(&row.get::<_, String>(4)?),
                        priority: row.get(5)?,
                        last_run: last_run.and_then(|s| s.parse().ok()),
                        next_run: next_run.and_then(|s| s.parse().ok()),
                        status: RitualStatus::parse_name(&row.get::<_, String>(8)?),
                        metadata: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
