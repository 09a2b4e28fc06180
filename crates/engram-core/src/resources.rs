//! Resource monitor
//!
//! Tallies token and cost usage per session and per model. Negative inputs
//! are clamped to zero with a warning; aggregates are computed in SQL.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::Storage;

// ============================================================================
// ROWS & AGGREGATES
// ============================================================================

/// One recorded usage event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// Row id
    pub id: i64,
    /// Owning session
    pub session_id: i64,
    /// Acting agent, when known
    pub agent_id: Option<String>,
    /// Model that consumed the tokens
    pub model_name: String,
    /// Prompt tokens
    pub input_tokens: i64,
    /// Completion tokens
    pub output_tokens: i64,
    /// Monetary cost
    pub cost: f64,
    /// Cost currency code
    pub currency: String,
    /// Insertion time
    pub created_at: DateTime<Utc>,
}

/// Per-model aggregate
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    /// Input + output tokens
    pub tokens: i64,
    /// Total cost
    pub cost: f64,
}

// ============================================================================
// MONITOR
// ============================================================================

/// Usage recorder over an open storage
pub struct ResourceMonitor {
    storage: Arc<Storage>,
}

impl ResourceMonitor {
    /// Bind to an open storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Record a usage event. Negative token counts and costs clamp to zero.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        session_id: i64,
        model_name: &str,
        input_tokens: i64,
        output_tokens: i64,
        cost: f64,
        currency: &str,
        agent_id: Option<&str>,
    ) -> Result<i64> {
        let (input_tokens, output_tokens, cost) = clamp_non_negative(input_tokens, output_tokens, cost);
        let now = Utc::now().to_rfc3339();
        self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_resource_usage \
                 (session_id, agent_id, model_name, input_tokens, output_tokens, cost, currency, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![session_id, agent_id, model_name, input_tokens, output_tokens, cost, currency, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Total cost of one session.
    pub fn session_total_cost(&self, session_id: i64) -> Result<f64> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(cost), 0) FROM agent_resource_usage WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
        })
    }

    /// Total cost across every session.
    pub fn global_total_cost(&self) -> Result<f64> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(cost), 0) FROM agent_resource_usage",
                [],
                |row| row.get(0),
            )
        })
    }

    /// Tokens and cost per model, sorted by model name.
    pub fn per_model(&self) -> Result<BTreeMap<String, ModelUsage>> {
        let rows: Vec<(String, i64, f64)> = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT model_name, SUM(input_tokens + output_tokens), SUM(cost) \
                 FROM agent_resource_usage GROUP BY model_name",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        Ok(rows
            .into_iter()
            .map(|(model, tokens, cost)| (model, ModelUsage { tokens, cost }))
            .collect())
    }

    /// Usage rows of one session in insertion order.
    pub fn list_for_session(&self, session_id: i64) -> Result<Vec<ResourceUsage>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, agent_id, model_name, input_tokens, output_tokens, \
                        cost, currency, created_at \
                 FROM agent_resource_usage WHERE session_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([session_id], |row| {
                    let created: String = row.get(8)?;
                    Ok(ResourceUsage {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        agent_id: row.get(2)?,
                        model_name: row.get(3)?,
                        input_tokens: row.get(4)?,
                        output_tokens: row.get(5)?,
                        cost: row.get(6)?,
                        currency: row.get(7)?,
                        created_at: created.parse().unwrap_or_else(|_| Utc::now()),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

fn clamp_non_negative(input_tokens: i64, output_tokens: i64, cost: f64) -> (i64, i64, f64) {
    if input_tokens < 0 || output_tokens < 0 || cost < 0.0 {
        tracing::warn!(
            input_tokens,
            output_tokens,
            cost,
            "negative resource usage clamped to zero"
        );
    }
    (input_tokens.max(0), output_tokens.max(0), cost.max(0.0))
}

// ============================================================================
// TESTS
// ============================================================================
