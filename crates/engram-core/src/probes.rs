//! Logic probes
//!
//! Self-verification checks: named read-only scripts with an optional
//! expected outcome. A probe run executes the script, compares the first
//! column of the first row against the expectation, and records
//! `last_run`/`last_status` on the probe row.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::{EngramError, Result};
use crate::storage::Storage;

// ============================================================================
// ROWS & RESULTS
// ============================================================================

/// One stored probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicProbe {
    /// Row id
    pub id: i64,
    /// Unique name
    pub name: String,
    /// Read-only script (single SELECT)
    pub script: String,
    /// Expected first-row/first-column value, when asserted
    pub expected_outcome: Option<String>,
    /// Last execution time
    pub last_run: Option<DateTime<Utc>>,
    /// `"passed"`, `"failed"`, `"observed"`, or `"error: ..."`
    pub last_status: Option<String>,
    /// JSON metadata
    pub metadata: serde_json::Value,
    /// Insertion time
    pub created_at: DateTime<Utc>,
}

/// Outcome of one probe run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    /// Probe id
    pub probe_id: i64,
    /// Probe name
    pub name: String,
    /// Pass/fail verdict; `None` when the probe has no expectation
    pub passed: Option<bool>,
    /// Observed value, when the script produced one
    pub observed: Option<String>,
    /// Recorded status line
    pub status: String,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Probe storage and execution
pub struct ProbeEngine {
    storage: Arc<Storage>,
}

impl ProbeEngine {
    /// Bind to an open storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Define (or replace) a probe by unique name.
    ///
    /// Scripts must be a single read-only SELECT; anything else is rejected
    /// at definition time.
    pub fn define(
        &self,
        name: &str,
        script: &str,
        expected_outcome: Option<&str>,
    ) -> Result<LogicProbe> {
        validate_script(script)?;
        let now = Utc::now().to_rfc3339();
        self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_logic_probes (name, script, expected_outcome, created_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(name) DO UPDATE SET \
                     script = excluded.script, \
                     expected_outcome = excluded.expected_outcome, \
                     last_run = NULL, \
                     last_status = NULL",
                params![name, script, expected_outcome, now],
            )?;
            Ok(())
        })?;
        self.get_by_name(name)?
            .ok_or(EngramError::NotFound { entity: "probe", id: 0 })
    }

    /// Fetch a probe by name.
    pub fn get_by_name(&self, name: &str) -> Result<Option<LogicProbe>> {
        let rows = self.query("name = ?1", params![name])?;
        Ok(rows.into_iter().next())
    }

    /// Every probe in id order.
    pub fn list(&self) -> Result<Vec<LogicProbe>> {
        self.query("1 = 1", params![])
    }

    /// Execute one probe, record its status, and return the result.
    ///
    /// Script failures are recorded as `error: ...` status, not surfaced as
    /// errors; ritual runs should keep going past a broken probe.
    pub fn run(&self, probe_id: i64) -> Result<ProbeResult> {
        let probe = self
            .query("id = ?1", params![probe_id])?
            .into_iter()
            .next()
            .ok_or(EngramError::NotFound { entity: "probe", id: probe_id })?;

        let observed: std::result::Result<Option<String>, EngramError> =
            self.storage.with_reader(|conn| {
                conn.query_row(&probe.script, [], |row| {
                    let value: rusqlite::types::Value = row.get(0)?;
                    Ok(match value {
                        rusqlite::types::Value::Null => None,
                        rusqlite::types::Value::Integer(i) => Some(i.to_string()),
                        rusqlite::types::Value::Real(r) => Some(r.to_string()),
                        rusqlite::types::Value::Text(s) => Some(s),
                        rusqlite::types::Value::Blob(_) => Some("<blob>".to_string()),
                    })
                })
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
            });

        let (passed, observed, status) = match observed {
            Ok(observed) => match &probe.expected_outcome {
                Some(expected) => {
                    let passed = observed.as_deref() == Some(expected.as_str());
                    (Some(passed), observed, if passed { "passed" } else { "failed" }.to_string())
                }
                None => (None, observed, "observed".to_string()),
            },
            Err(e) => (Some(false), None, format!("error: {e}")),
        };

        let now = Utc::now().to_rfc3339();
        self.storage.with_writer(|conn| {
            conn.execute(
                "UPDATE agent_logic_probes SET last_run = ?1, last_status = ?2 WHERE id = ?3",
                params![now, status, probe_id],
            )
        })?;

        Ok(ProbeResult { probe_id, name: probe.name, passed, observed, status })
    }

    /// Run every probe in id order.
    pub fn run_all(&self) -> Result<Vec<ProbeResult>> {
        let probes = self.list()?;
        let mut results = Vec::with_capacity(probes.len());
        for probe in probes {
            results.push(self.run(probe.id)?);
        }
        Ok(results)
    }

    fn query(&self, filter: &str, params: impl rusqlite::Params + Copy) -> Result<Vec<LogicProbe>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, name, script, expected_outcome, last_run, last_status, metadata, created_at \
                 FROM agent_logic_probes WHERE {filter} ORDER BY id ASC"
            ))?;
            let rows = stmt
                .query_map(params, |row| {
                    let last_run: Option<String> = row.get(4)?;
                    let meta: String = row.get(6)?;
                    let created: String = row.get(7)?;
                    Ok(LogicProbe {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        script: row.get(2)?,
                        expected_outcome: row.get(3)?,
                        last_run: last_run.and_then(|s| s.parse().ok()),
                        last_status: row.get(5)?,
                        metadata: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
                        created_at: created.parse().unwrap_or_else(|_| Utc::now()),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

fn validate_script(script: &str) -> Result<()> {
    let trimmed = script.trim().trim_end_matches(';');
    if !trimmed.to_ascii_lowercase().starts_with("select") {
        return Err(EngramError::Config("probe scripts must be a single SELECT".into()));
    }
    if trimmed.contains(';') {
        return Err(EngramError::Config("probe scripts must be a single statement".into()));
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
