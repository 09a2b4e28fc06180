//! Goals
//!
//! Durable objectives in the agent's world-model. Terminal statuses
//! (achieved, abandoned) are one-way, like closed episodes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::{EngramError, Result};
use crate::storage::Storage;

// ============================================================================
// GOAL DATA
// ============================================================================

/// Goal lifecycle; `Achieved` and `Abandoned` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    /// Being pursued
    #[default]
    Open,
    /// Completed
    Achieved,
    /// Given up
    Abandoned,
}

impl GoalStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalStatus::Open => "open",
            GoalStatus::Achieved => "achieved",
            GoalStatus::Abandoned => "abandoned",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "achieved" => GoalStatus::Achieved,
            "abandoned" => GoalStatus::Abandoned,
            _ => GoalStatus::Open,
        }
    }
}

/// One stored goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    /// Row id
    pub id: i64,
    /// Originating session, when any
    pub session_id: Option<i64>,
    /// Short imperative title
    pub title: String,
    /// Longer description
    pub description: Option<String>,
    /// Lifecycle status
    pub status: GoalStatus,
    /// Priority (lower is more urgent)
    pub priority: i64,
    /// Insertion time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// TRACKER
// ============================================================================

/// Goal CRUD over an open storage
pub struct GoalTracker {
    storage: Arc<Storage>,
}

impl GoalTracker {
    /// Bind to an open storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Create an open goal.
    pub fn create(
        &self,
        title: &str,
        description: Option<&str>,
        priority: i64,
        session_id: Option<i64>,
    ) -> Result<Goal> {
        let now = Utc::now().to_rfc3339();
        let id = self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_goals (session_id, title, description, priority, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![session_id, title, description, priority, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get(id)?.ok_or(EngramError::NotFound { entity: "goal", id })
    }

    /// Fetch one goal.
    pub fn get(&self, id: i64) -> Result<Option<Goal>> {
        let rows = self.query("id = ?1", params![id])?;
        Ok(rows.into_iter().next())
    }

    /// Goals by status, most urgent first.
    pub fn list(&self, status: Option<GoalStatus>) -> Result<Vec<Goal>> {
        match status {
            Some(s) => self.query(
                "status = ?1 ORDER BY priority ASC, id ASC",
                params![s.as_str()],
            ),
            None => self.query("1 = 1 ORDER BY priority ASC, id ASC", params![]),
        }
    }

    /// One-way status transition out of `Open`.
    pub fn transition(&self, id: i64, next: GoalStatus) -> Result<Goal> {
        let current = self.get(id)?.ok_or(EngramError::NotFound { entity: "goal", id })?;
        let legal = current.status == GoalStatus::Open && next != GoalStatus::Open;
        if !legal {
            return Err(EngramError::IllegalTransition {
                entity: "goal",
                id,
                from: current.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        let now = Utc::now().to_rfc3339();
        self.storage.with_writer(|conn| {
            conn.execute(
                "UPDATE agent_goals SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![next.as_str(), now, id],
            )
        })?;
        self.get(id)?.ok_or(EngramError::NotFound { entity: "goal", id })
    }

    fn query(&self, filter: &str, params: impl rusqlite::Params + Copy) -> Result<Vec<Goal>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, session_id, title, description, status, priority, created_at, updated_at \
                 FROM agent_goals WHERE {filter}"
            ))?;
            let rows = stmt
                .query_map(params, |row| {
                    let created: String = row.get(6)?;
                    let updated: String = row.get(7)?;
                    Ok(Goal {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        title: row.get(2)?,
                        description: row.get(3)?,
                        status: GoalStatus::parse_name(&row.get::<_, String>(4)?),
                        priority: row.get(5)?,
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
