//! Capability registry
//!
//! Skills the agent can invoke, versioned and tracked by reliability.
//! `(name, version)` is unique; status moves experimental -> sandbox ->
//! promoted, with deprecated as the terminal shelf. Reliability is an
//! exponential moving average of reported outcomes, clamped to [0, 1].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::{EngramError, Result};
use crate::storage::Storage;

/// EMA weight of one new outcome
const RELIABILITY_ALPHA: f64 = 0.2;

// ============================================================================
// CAPABILITY DATA
// ============================================================================

/// Capability lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityStatus {
    /// Newly registered, unproven
    #[default]
    Experimental,
    /// Under sandbox evaluation
    Sandbox,
    /// Live
    Promoted,
    /// Shelved; terminal
    Deprecated,
}

impl CapabilityStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityStatus::Experimental => "experimental",
            CapabilityStatus::Sandbox => "sandbox",
            CapabilityStatus::Promoted => "promoted",
            CapabilityStatus::Deprecated => "deprecated",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "sandbox" => CapabilityStatus::Sandbox,
            "promoted" => CapabilityStatus::Promoted,
            "deprecated" => CapabilityStatus::Deprecated,
            _ => CapabilityStatus::Experimental,
        }
    }

    /// Forward-only transition check; deprecated is terminal.
    pub fn can_become(&self, next: CapabilityStatus) -> bool {
        use CapabilityStatus::*;
        matches!(
            (self, next),
            (Experimental, Sandbox)
                | (Experimental, Promoted)
                | (Experimental, Deprecated)
                | (Sandbox, Promoted)
                | (Sandbox, Deprecated)
                | (Promoted, Deprecated)
        )
    }
}

/// One registered capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    /// Row id
    pub id: i64,
    /// Capability name
    pub name: String,
    /// Version label (`(name, version)` unique)
    pub version: String,
    /// Human description
    pub description: Option<String>,
    /// Lifecycle status
    pub status: CapabilityStatus,
    /// Outcome EMA in [0, 1]
    pub reliability: f64,
    /// JSON metadata
    pub metadata: serde_json::Value,
    /// Insertion time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Capability CRUD and reliability feedback over an open storage
pub struct CapabilityRegistry {
    storage: Arc<Storage>,
}

impl CapabilityRegistry {
    /// Bind to an open storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Register a capability version. Duplicate `(name, version)` fails with
    /// an integrity violation.
    pub fn register(&self, name: &str, version: &str, description: Option<&str>) -> Result<Capability> {
        let now = Utc::now().to_rfc3339();
        let id = self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_capabilities (name, version, description, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![name, version, description, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get(id)?.ok_or(EngramError::NotFound { entity: "capability", id })
    }

    /// Fetch one capability by id.
    pub fn get(&self, id: i64) -> Result<Option<Capability>> {
        let rows = self.query("id = ?1", params![id])?;
        Ok(rows.into_iter().next())
    }

    /// Fetch one capability by `(name, version)`.
    pub fn get_version(&self, name: &str, version: &str) -> Result<Option<Capability>> {
        let rows = self.query("name = ?1 AND version = ?2", params![name, version])?;
        Ok(rows.into_iter().next())
    }

    /// Every version of a capability, newest first.
    pub fn versions(&self, name: &str) -> Result<Vec<Capability>> {
        self.query("name = ?1 ORDER BY id DESC", params![name])
    }

    /// Forward-only status transition.
    pub fn transition(&self, id: i64, next: CapabilityStatus) -> Result<Capability> {
        let current = self.get(id)?.ok_or(EngramError::NotFound { entity: "capability", id })?;
        if !current.status.can_become(next) {
            return Err(EngramError::IllegalTransition {
                entity: "capability",
                id,
                from: current.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        let now = Utc::now().to_rfc3339();
        self.storage.with_writer(|conn| {
            conn.execute(
                "UPDATE agent_capabilities SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![next.as_str(), now, id],
            )
        })?;
        self.get(id)?.ok_or(EngramError::NotFound { entity: "capability", id })
    }

    /// Promote to live.
    pub fn promote(&self, id: i64) -> Result<Capability> {
        self.transition(id, CapabilityStatus::Promoted)
    }

    /// Shelve permanently.
    pub fn deprecate(&self, id: i64) -> Result<Capability> {
        self.transition(id, CapabilityStatus::Deprecated)
    }

    /// Nudge reliability with one observed outcome (EMA, clamped [0, 1]).
    pub fn report_outcome(&self, id: i64, success: bool) -> Result<Capability> {
        let current = self.get(id)?.ok_or(EngramError::NotFound { entity: "capability", id })?;
        let observed = if success { 1.0 } else { 0.0 };
        let reliability = ((1.0 - RELIABILITY_ALPHA) * current.reliability
            + RELIABILITY_ALPHA * observed)
            .clamp(0.0, 1.0);
        let now = Utc::now().to_rfc3339();
        self.storage.with_writer(|conn| {
            conn.execute(
                "UPDATE agent_capabilities SET reliability = ?1, updated_at = ?2 WHERE id = ?3",
                params![reliability, now, id],
            )
        })?;
        self.get(id)?.ok_or(EngramError::NotFound { entity: "capability", id })
    }

    fn query(&self, filter: &str, params: impl rusqlite::Params + Copy) -> Result<Vec<Capability>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, name, version, description, status, reliability, metadata, \
                        created_at, updated_at \
                 FROM agent_capabilities WHERE {filter}"
            ))?;
            let rows = stmt
                .query_map(params, |row| {
                    let meta: String = row.get(6)?;
                    let created: String = row.get(7)?;
                    let updated: String = row.get(8)?;
                    Ok(Capability {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        version: row.get(2)?,
                        description: row.get(3)?,
                        status: CapabilityStatus::parse_name(&row.get::<_, String>(4)?),
                        reliability: row.get(5)?,
                        metadata: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
                        created_at: created.parse().unwrap_or_else(|_| Utc::now()),
                        updated_at: updated.parse().unwrap_or_else(|_| Utc::now()),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionSettings, OptimizationConfig};
    use crate::storage::bootstrap;

    fn registry() -> CapabilityRegistry {
        let storage = Arc::new(
            Storage::open(
                &ConnectionSettings::Embedded { path: None },
                &OptimizationConfig::default(),
            )
            .unwrap(),
        );
        bootstrap(&storage).unwrap();
        CapabilityRegistry::new(storage)
    }

    #[test]
    fn name_version_is_unique() {
        let registry = registry();
        registry.register("summarize", "1.0.0", None).unwrap();
        let err = registry.register("summarize", "1.0.0", None);
        assert!(matches!(err, Err(EngramError::IntegrityViolation(_))));
        // New version is fine
        registry.register("summarize", "1.1.0", None).unwrap();
        assert_eq!(registry.versions("summarize").unwrap().len(), 2);
    }

    #[test]
    fn lifecycle_is_forward_only() {
        let registry = registry();
        let cap = registry.register("fetch", "1.0.0", Some("http fetch")).unwrap();
        assert_eq!(cap.status, CapabilityStatus::Experimental);

        let promoted = registry.promote(cap.id).unwrap();
        assert_eq!(promoted.status, CapabilityStatus::Promoted);

        let deprecated = registry.deprecate(cap.id).unwrap();
        assert_eq!(deprecated.status, CapabilityStatus::Deprecated);

        // Terminal
        let err = registry.promote(cap.id);
        assert!(matches!(err, Err(EngramError::IllegalTransition { .. })));
    }

    #[test]
    fn reliability_moves_with_outcomes_and_stays_bounded() {
        let registry = registry();
        let cap = registry.register("calc", "1.0.0", None).unwrap();
        assert!((cap.reliability - 0.5).abs() < 1e-9);

        let up = registry.report_outcome(cap.id, true).unwrap();
        assert!(up.reliability > 0.5);

        let mut last = up.reliability;
        for _ in 0..50 {
            last = registry.report_outcome(cap.id, true).unwrap().reliability;
        }
        assert!(last <= 1.0 && last > 0.95);

        for _ in 0..50 {
            last = registry.report_outcome(cap.id, false).unwrap().reliability;
        }
        assert!((0.0..0.05).contains(&last));
    }
}
