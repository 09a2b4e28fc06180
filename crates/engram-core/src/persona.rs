//! Personas
//!
//! A persona binds sessions to a durable identity: a unique name, a role,
//! and the capability/policy names it operates under. Binding a session
//! stamps the persona into the session's metadata; listing filters on it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::{EngramError, Result};
use crate::journal::{Session, SessionJournal};
use crate::storage::Storage;

/// One stored persona
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    /// Row id
    pub id: i64,
    /// Unique name
    pub name: String,
    /// Role description
    pub role: Option<String>,
    /// Capability names this persona operates with
    pub capabilities: Vec<String>,
    /// Policy names binding this persona
    pub policies: Vec<String>,
    /// JSON metadata
    pub metadata: serde_json::Value,
    /// Insertion time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Persona CRUD and session binding over an open storage
pub struct PersonaRegistry {
    storage: Arc<Storage>,
}

impl PersonaRegistry {
    /// Bind to an open storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Create (or update) a persona by unique name.
    pub fn define(
        &self,
        name: &str,
        role: Option<&str>,
        capabilities: &[String],
        policies: &[String],
    ) -> Result<Persona> {
        let now = Utc::now().to_rfc3339();
        let caps = serde_json::to_string(capabilities)?;
        let pols = serde_json::to_string(policies)?;
        self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_personas (name, role, capabilities, policies, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
                 ON CONFLICT(name) DO UPDATE SET \
                     role = excluded.role, \
                     capabilities = excluded.capabilities, \
                     policies = excluded.policies, \
                     updated_at = excluded.updated_at",
                params![name, role, caps, pols, now],
            )?;
            Ok(())
        })?;
        self.get_by_name(name)?
            .ok_or(EngramError::NotFound { entity: "persona", id: 0 })
    }

    /// Fetch a persona by name.
    pub fn get_by_name(&self, name: &str) -> Result<Option<Persona>> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT id, name, role, capabilities, policies, metadata, created_at, updated_at \
                 FROM agent_personas WHERE name = ?1",
                [name],
                row_to_persona,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    /// Every persona in id order.
    pub fn list(&self) -> Result<Vec<Persona>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, role, capabilities, policies, metadata, created_at, updated_at \
                 FROM agent_personas ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([], row_to_persona)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Stamp a persona into a session's metadata.
    pub fn bind_session(&self, journal: &SessionJournal, persona_name: &str, session_id: i64) -> Result<()> {
        let persona = self
            .get_by_name(persona_name)?
            .ok_or(EngramError::NotFound { entity: "persona", id: 0 })?;
        let session = journal
            .get_session(session_id)?
            .ok_or(EngramError::NotFound { entity: "session", id: session_id })?;

        let mut metadata = match session.metadata {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        metadata.insert("persona".to_string(), serde_json::json!(persona.name));
        let meta = serde_json::Value::Object(metadata).to_string();
        let now = Utc::now().to_rfc3339();
        self.storage.with_writer(|conn| {
            conn.execute(
                "UPDATE agent_sessions SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
                params![meta, now, session_id],
            )
        })?;
        Ok(())
    }

    /// Sessions bound to a persona, newest first.
    pub fn sessions_for(&self, journal: &SessionJournal, persona_name: &str) -> Result<Vec<Session>> {
        Ok(journal
            .list_sessions(None)?
            .into_iter()
            .filter(|s| s.metadata["persona"] == persona_name)
            .collect())
    }
}

fn row_to_persona(row: &rusqlite::Row<'_>) -> rusqlite::Result<Persona> {
    let caps: String = row.get(3)?;
    let pols: String = row.get(4)?;
    let meta: String = row.get(5)?;
    let created: String = row.get(6)?;
    let updated: String = row.get(7)?;
    Ok(Persona {
        id: row.get(0)?,
        name: row.get(1)?,
        role: row.get(2)?,
        capabilities: serde_json::from_str(&caps).unwrap_or_default(),
        policies: serde_json::from_str(&pols).unwrap_or_default(),
        metadata: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
        created_at: created.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: updated.parse().unwrap_or_else(|_| Utc::now()),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionSettings, OptimizationConfig};
    use crate::storage::bootstrap;

    fn setup() -> (PersonaRegistry, SessionJournal) {
        let storage = Arc::new(
            Storage::open(
                &ConnectionSettings::Embedded { path: None },
                &OptimizationConfig::default(),
            )
            .unwrap(),
        );
        bootstrap(&storage).unwrap();
        (PersonaRegistry::new(storage.clone()), SessionJournal::new(storage))
    }

    #[test]
    fn define_is_upsert_by_name() {
        let (registry, _) = setup();
        let first = registry
            .define("scout", Some("explorer"), &["fetch".into()], &[])
            .unwrap();
        let second = registry
            .define("scout", Some("researcher"), &["fetch".into(), "summarize".into()], &[])
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.role.as_deref(), Some("researcher"));
        assert_eq!(second.capabilities.len(), 2);
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn binding_stamps_session_metadata() {
        let (registry, journal) = setup();
        registry.define("scout", None, &[], &[]).unwrap();
        let session = journal
            .open_session(Some("s"), Some(serde_json::json!({"purpose": "test"})))
            .unwrap();
        registry.bind_session(&journal, "scout", session.id).unwrap();

        let bound = journal.get_session(session.id).unwrap().unwrap();
        assert_eq!(bound.metadata["persona"], "scout");
        // Prior metadata survives
        assert_eq!(bound.metadata["purpose"], "test");

        let sessions = registry.sessions_for(&journal, "scout").unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(registry.sessions_for(&journal, "other").unwrap().is_empty());
    }

    #[test]
    fn binding_unknown_persona_fails() {
        let (registry, journal) = setup();
        let session = journal.open_session(Some("s"), None).unwrap();
        let err = registry.bind_session(&journal, "ghost", session.id);
        assert!(matches!(err, Err(EngramError::NotFound { entity: "persona", .. })));
    }
}
