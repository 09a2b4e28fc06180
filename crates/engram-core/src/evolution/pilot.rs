//! Evolutionary pilot
//!
//! Drives schema mutations through a persisted state machine:
//!
//! ```text
//! Proposed -> Sandboxed -> Verifying -> (Promoted | Reverted)
//!                     \-> Rejected
//! ```
//!
//! Candidates run first as shadow objects in a `sandbox_*` namespace with an
//! N-step smoke test, then shadow production traffic until the verification
//! window is satisfied. Promotion goes through the DNA inverter, so every
//! promoted mutation carries a stored inverse; revert executes it and
//! restores pre-mutation DNA to snapshot fidelity.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::dna::{classify_ddl, AllowedDdl, DnaInverter};
use crate::error::{EngramError, Result};
use crate::sql::{quote_identifier, DropIndex, DropTable, Identifier, Query, TableRef};
use crate::storage::Storage;

/// Smoke test iterations run against the sandbox object
const SMOKE_STEPS: u32 = 5;

// ============================================================================
// STATE & RECORDS
// ============================================================================

/// Mutation lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationState {
    /// Candidate DDL, not yet sandboxed
    Proposed,
    /// Shadow object exists; smoke test passed
    Sandboxed,
    /// Production traffic is being shadowed
    Verifying,
    /// Applied to the live schema with a stored inverse
    Promoted,
    /// Inverse executed; pre-mutation DNA restored
    Reverted,
    /// Pre-flight validation or smoke test failed; no schema change
    Rejected,
}

impl MutationState {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationState::Proposed => "proposed",
            MutationState::Sandboxed => "sandboxed",
            MutationState::Verifying => "verifying",
            MutationState::Promoted => "promoted",
            MutationState::Reverted => "reverted",
            MutationState::Rejected => "rejected",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "sandboxed" => MutationState::Sandboxed,
            "verifying" => MutationState::Verifying,
            "promoted" => MutationState::Promoted,
            "reverted" => MutationState::Reverted,
            "rejected" => MutationState::Rejected,
            _ => MutationState::Proposed,
        }
    }
}

/// One persisted mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    /// Row id
    pub id: i64,
    /// Candidate DDL
    pub ddl: String,
    /// Stored inverse; always present once promoted
    pub inverse: Option<String>,
    /// Lifecycle state
    pub state: MutationState,
    /// Snapshot captured at promotion
    pub snapshot_id: Option<i64>,
    /// Shadow namespace object, while sandboxed
    pub sandbox_name: Option<String>,
    /// Table the mutation targets, when named
    pub target_table: Option<String>,
    /// Successful shadowed operations
    pub success_count: i64,
    /// Failed shadowed operations
    pub failure_count: i64,
    /// Free-form note (proposal source, rejection reason)
    pub note: Option<String>,
    /// Proposal time
    pub proposed_at: DateTime<Utc>,
    /// Last state change
    pub updated_at: DateTime<Utc>,
}

/// Shared tuning the meta-evolution controller adjusts at runtime
#[derive(Debug, Clone, Copy)]
pub struct EvolutionTuning {
    /// Scalar in [0, 1] controlling proposal eagerness
    pub mutation_aggressiveness: f64,
    /// Successful shadowed operations required before promotion
    pub verification_window: u32,
    /// Concurrent sandboxed entities cap
    pub max_sandbox_skills: usize,
}

// ============================================================================
// PILOT
// ============================================================================

/// Mutation state machine over an open storage
pub struct EvolutionaryPilot {
    storage: Arc<Storage>,
    dna: Arc<DnaInverter>,
    tuning: Arc<Mutex<EvolutionTuning>>,
}

impl EvolutionaryPilot {
    /// Bind to storage, the DNA inverter, and shared tuning.
    pub fn new(
        storage: Arc<Storage>,
        dna: Arc<DnaInverter>,
        tuning: Arc<Mutex<EvolutionTuning>>,
    ) -> Self {
        Self { storage, dna, tuning }
    }

    /// Current tuning snapshot.
    pub fn tuning(&self) -> Result<EvolutionTuning> {
        Ok(*self.tuning.lock().map_err(|_| EngramError::LockPoisoned("evolution tuning"))?)
    }

    /// Propose a candidate DDL mutation.
    ///
    /// The candidate is parsed against the whitelist and stored in its
    /// canonical node-rendered form; the caller's text is never executed.
    /// Pre-flight validation failure persists a `Rejected` record (audit) and
    /// surfaces the error; nothing else changes.
    pub fn propose(&self, ddl: &str, note: Option<&str>) -> Result<MutationRecord> {
        match classify_ddl(ddl) {
            Ok(parsed) => {
                let target = parsed.target_table().map(str::to_string);
                let canonical = parsed.render().sql;
                self.insert_record(&canonical, MutationState::Proposed, target.as_deref(), note)
            }
            Err(err) => {
                let reason = format!("pre-flight: {err}");
                self.insert_record(ddl, MutationState::Rejected, None, Some(&reason))?;
                Err(err)
            }
        }
    }

    /// Move a proposed mutation into the sandbox: create the shadow object
    /// and run the smoke test. Smoke failure rejects the mutation and cleans
    /// the namespace.
    pub fn sandbox(&self, id: i64) -> Result<MutationRecord> {
        let record = self.require_state(id, MutationState::Proposed, "sandbox")?;
        let tuning = self.tuning()?;
        let active: i64 = self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM agent_mutations WHERE state IN ('sandboxed', 'verifying')",
                [],
                |row| row.get(0),
            )
        })?;
        if active as usize >= tuning.max_sandbox_skills {
            return Err(EngramError::Config(format!(
                "sandbox capacity reached ({} active, cap {})",
                active, tuning.max_sandbox_skills
            )));
        }

        let parsed = classify_ddl(&record.ddl)?;
        let sandbox_name = format!("sandbox_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);

        match self.build_sandbox(&parsed, &sandbox_name) {
            Ok(()) => {
                self.update_record(id, |r| {
                    r.state = MutationState::Sandboxed;
                    r.sandbox_name = Some(sandbox_name.clone());
                })?;
                self.get(id)?.ok_or(EngramError::NotFound { entity: "mutation", id })
            }
            Err(err) => {
                self.drop_sandbox_objects(&sandbox_name)?;
                self.update_record(id, |r| {
                    r.state = MutationState::Rejected;
                    r.note = Some(format!("smoke test failed: {err}"));
                })?;
                Err(err)
            }
        }
    }

    /// Begin shadowing production traffic.
    pub fn begin_verification(&self, id: i64) -> Result<MutationRecord> {
        self.require_state(id, MutationState::Sandboxed, "verify")?;
        self.update_record(id, |r| r.state = MutationState::Verifying)?;
        self.get(id)?.ok_or(EngramError::NotFound { entity: "mutation", id })
    }

    /// Record one shadowed operation outcome.
    pub fn record_verification(&self, id: i64, success: bool) -> Result<MutationRecord> {
        self.require_state(id, MutationState::Verifying, "record verification")?;
        self.update_record(id, |r| {
            if success {
                r.success_count += 1;
            } else {
                r.failure_count += 1;
            }
        })?;
        self.get(id)?.ok_or(EngramError::NotFound { entity: "mutation", id })
    }

    /// Promote a verified mutation to the live schema through the DNA
    /// inverter. Requires the verification window to be satisfied.
    pub fn promote(&self, id: i64) -> Result<MutationRecord> {
        let record = self.require_state(id, MutationState::Verifying, "promote")?;
        let window = self.tuning()?.verification_window as i64;
        if record.success_count < window {
            return Err(EngramError::Config(format!(
                "verification window not satisfied ({}/{window} successes)",
                record.success_count
            )));
        }

        // Shadow objects go first so the pre-mutation snapshot is clean
        if let Some(sandbox) = &record.sandbox_name {
            self.drop_sandbox_objects(sandbox)?;
        }
        let applied = self.dna.apply(&record.ddl, &format!("pre-mutation-{id}"))?;
        self.update_record(id, |r| {
            r.state = MutationState::Promoted;
            r.inverse = Some(applied.inverse.clone());
            r.snapshot_id = Some(applied.snapshot_id);
            r.sandbox_name = None;
        })?;
        tracing::info!(mutation = id, snapshot = applied.snapshot_id, "mutation promoted");
        self.get(id)?.ok_or(EngramError::NotFound { entity: "mutation", id })
    }

    /// Execute the stored inverse of a promoted mutation.
    pub fn revert(&self, id: i64) -> Result<MutationRecord> {
        let record = self.require_state(id, MutationState::Promoted, "revert")?;
        let inverse = record.inverse.clone().ok_or_else(|| {
            // Unreachable through promote(); guards hand-edited rows
            EngramError::MigrationFailed(format!("promoted mutation {id} has no stored inverse"))
        })?;
        let snapshot_id = record
            .snapshot_id
            .ok_or_else(|| EngramError::MigrationFailed(format!("mutation {id} has no snapshot")))?;

        let matched = self.dna.rollback(&inverse, snapshot_id)?;
        if !matched {
            tracing::warn!(mutation = id, "rollback left residual schema drift");
        }
        self.update_record(id, |r| r.state = MutationState::Reverted)?;
        self.get(id)?.ok_or(EngramError::NotFound { entity: "mutation", id })
    }

    /// Revert the most recently promoted mutation, when one exists.
    /// Used by the meta-evolution controller on regression.
    pub fn revert_latest_promoted(&self) -> Result<Option<MutationRecord>> {
        let latest: Option<i64> = self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT id FROM agent_mutations WHERE state = 'promoted' ORDER BY updated_at DESC, id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        match latest {
            Some(id) => Ok(Some(self.revert(id)?)),
            None => Ok(None),
        }
    }

    /// Reject a mutation that has not reached verification, cleaning any
    /// sandbox objects.
    pub fn reject(&self, id: i64, reason: &str) -> Result<MutationRecord> {
        let record = self.get(id)?.ok_or(EngramError::NotFound { entity: "mutation", id })?;
        if !matches!(record.state, MutationState::Proposed | MutationState::Sandboxed) {
            return Err(self.illegal(id, record.state, "reject"));
        }
        if let Some(sandbox) = &record.sandbox_name {
            self.drop_sandbox_objects(sandbox)?;
        }
        self.update_record(id, |r| {
            r.state = MutationState::Rejected;
            r.note = Some(reason.to_string());
            r.sandbox_name = None;
        })?;
        self.get(id)?.ok_or(EngramError::NotFound { entity: "mutation", id })
    }

    /// Fetch one mutation.
    pub fn get(&self, id: i64) -> Result<Option<MutationRecord>> {
        let rows = self.query("id = ?1", params![id])?;
        Ok(rows.into_iter().next())
    }

    /// Mutations in a given state, newest first.
    pub fn list(&self, state: Option<MutationState>) -> Result<Vec<MutationRecord>> {
        match state {
            Some(s) => self.query("state = ?1 ORDER BY id DESC", params![s.as_str()]),
            None => self.query("1 = 1 ORDER BY id DESC", params![]),
        }
    }

    /// Counts per state, for the stats surface.
    pub fn state_counts(&self) -> Result<Vec<(String, i64)>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT state, COUNT(*) FROM agent_mutations GROUP BY state ORDER BY state",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // ------------------------------------------------------------------
    // Sandbox plumbing
    // ------------------------------------------------------------------

    /// Create the shadow object for a candidate and smoke test it.
    ///
    /// Shadow DDL is the parsed node with its name swapped into the sandbox
    /// namespace, executed through the node pipeline — never re-derived from
    /// the caller's text.
    fn build_sandbox(&self, parsed: &AllowedDdl, sandbox_name: &str) -> Result<()> {
        let sandbox_ident = Identifier::new(sandbox_name)?;
        let quoted_sandbox = quote_identifier(&sandbox_ident);
        match parsed {
            AllowedDdl::CreateTable(node) => {
                // Shadow table under the sandbox name
                let mut shadow = node.clone();
                shadow.table = TableRef { name: sandbox_ident };
                self.storage.execute_node(&Query::CreateTable(shadow))?;
                self.smoke_query(&format!("SELECT COUNT(*) FROM {quoted_sandbox}"))
            }
            AllowedDdl::CreateIndex(node) => {
                // A shadow index on the live table is semantically inert
                let mut shadow = node.clone();
                shadow.name = sandbox_ident;
                self.storage.execute_node(&Query::CreateIndex(shadow))?;
                self.smoke_query(&format!(
                    "SELECT COUNT(*) FROM {} INDEXED BY {quoted_sandbox}",
                    quote_identifier(&node.table.name)
                ))
            }
            AllowedDdl::AddColumn(node) => {
                // Empty clone of the target, then the candidate column
                let quoted_table = quote_identifier(&node.table.name);
                self.storage.raw_batch(&format!(
                    "CREATE TABLE {quoted_sandbox} AS SELECT * FROM {quoted_table} WHERE 0"
                ))?;
                let mut shadow = node.clone();
                shadow.table = TableRef { name: sandbox_ident };
                self.storage.execute_node(&Query::AddColumn(shadow))?;
                self.smoke_query(&format!("SELECT COUNT(*) FROM {quoted_sandbox}"))
            }
            AllowedDdl::DropIndex(node) => {
                // Nothing to build; verify the index exists to drop
                let exists: i64 = self.storage.with_reader(|conn| {
                    conn.query_row(
                        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
                        [node.name.as_str()],
                        |row| row.get(0),
                    )
                })?;
                if exists == 0 {
                    return Err(EngramError::MigrationFailed(format!(
                        "index {} does not exist",
                        node.name.as_str()
                    )));
                }
                Ok(())
            }
        }
    }

    fn smoke_query(&self, sql: &str) -> Result<()> {
        for step in 0..SMOKE_STEPS {
            let result: std::result::Result<i64, _> =
                self.storage.with_reader(|conn| conn.query_row(sql, [], |row| row.get(0)));
            if let Err(e) = result {
                return Err(EngramError::MigrationFailed(format!(
                    "smoke step {step} failed: {e}"
                )));
            }
        }
        Ok(())
    }

    fn drop_sandbox_objects(&self, sandbox_name: &str) -> Result<()> {
        let ident = Identifier::new(sandbox_name)?;
        self.storage.execute_node(&Query::DropTable(DropTable {
            table: TableRef { name: ident.clone() },
            if_exists: true,
        }))?;
        self.storage.execute_node(&Query::DropIndex(DropIndex { name: ident, if_exists: true }))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Record plumbing
    // ------------------------------------------------------------------

    fn insert_record(
        &self,
        ddl: &str,
        state: MutationState,
        target: Option<&str>,
        note: Option<&str>,
    ) -> Result<MutationRecord> {
        let now = Utc::now().to_rfc3339();
        let id = self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_mutations (ddl, state, target_table, note, proposed_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![ddl, state.as_str(), target, note, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get(id)?.ok_or(EngramError::NotFound { entity: "mutation", id })
    }

    fn update_record(&self, id: i64, mutate: impl FnOnce(&mut MutationRecord)) -> Result<()> {
        let mut record = self.get(id)?.ok_or(EngramError::NotFound { entity: "mutation", id })?;
        mutate(&mut record);
        let now = Utc::now().to_rfc3339();
        self.storage.with_writer(|conn| {
            conn.execute(
                "UPDATE agent_mutations SET \
                     state = ?1, inverse = ?2, snapshot_id = ?3, sandbox_name = ?4, \
                     success_count = ?5, failure_count = ?6, note = ?7, updated_at = ?8 \
                 WHERE id = ?9",
                params![
                    record.state.as_str(),
                    record.inverse,
                    record.snapshot_id,
                    record.sandbox_name,
                    record.success_count,
                    record.failure_count,
                    record.note,
                    now,
                    id
                ],
            )
        })?;
        Ok(())
    }

    fn require_state(&self, id: i64, wanted: MutationState, verb: &'static str) -> Result<MutationRecord> {
        let record = self.get(id)?.ok_or(EngramError::NotFound { entity: "mutation", id })?;
        if record.state != wanted {
            return Err(self.illegal(id, record.state, verb));
        }
        Ok(record)
    }

    fn illegal(&self, id: i64, from: MutationState, to: &str) -> EngramError {
        EngramError::IllegalTransition {
            entity: "mutation",
            id,
            from: from.as_str().to_string(),
            to: to.to_string(),
        }
    }

    fn query(&self, filter: &str, params: impl rusqlite::Params + Copy) -> Result<Vec<MutationRecord>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, ddl, inverse, state, snapshot_id, sandbox_name, target_table, \
                        success_count, failure_count, note, proposed_at, updated_at \
                 FROM agent_mutations WHERE {filter}"
            ))?;
            let rows = stmt
                .query_map(params, |row| {
                    let proposed: String = row.get(10)?;
                    let updated: String = row.get(11)?;
                    Ok(MutationRecord {
                        id: row.get(0)?,
                        ddl: row.get(1)?,
                        inverse: row.get(2)?,
                        state: MutationState::parse_name(&row.get::<_, String>(3)?),
                        snapshot_id: row.get(4)?,
                        sandbox_name: row.get(5)?,
                        target_table: row.get(6)?,
                        success_count: row.get(7)?,
                        failure_count: row.get(8)?,
                        note: row.get(9)?,
                        proposed_at: proposed.parse().unwrap_or_else(|_| Utc::now()),
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
    use crate::storage::{bootstrap, Introspector};

    fn pilot(verification_window: u32) -> EvolutionaryPilot {
        let storage = Arc::new(
            Storage::open(
                &ConnectionSettings::Embedded { path: None },
                &OptimizationConfig::default(),
            )
            .unwrap(),
        );
        bootstrap(&storage).unwrap();
        let dna = Arc::new(DnaInverter::new(storage.clone()));
        let tuning = Arc::new(Mutex::new(EvolutionTuning {
            mutation_aggressiveness: 0.25,
            verification_window,
            max_sandbox_skills: 2,
        }));
        EvolutionaryPilot::new(storage, dna, tuning)
    }

    fn drive_to_verified(pilot: &EvolutionaryPilot, ddl: &str, successes: u32) -> i64 {
        let record = pilot.propose(ddl, Some("test")).unwrap();
        pilot.sandbox(record.id).unwrap();
        pilot.begin_verification(record.id).unwrap();
        for _ in 0..successes {
            pilot.record_verification(record.id, true).unwrap();
        }
        record.id
    }

    #[test]
    fn full_lifecycle_promote_then_revert() {
        let pilot = pilot(3);
        let id = drive_to_verified(
            &pilot,
            "CREATE INDEX idx_kb_entity2 ON agent_knowledge_base(fact)",
            3,
        );

        let promoted = pilot.promote(id).unwrap();
        assert_eq!(promoted.state, MutationState::Promoted);
        assert!(promoted.inverse.is_some());
        assert!(promoted.snapshot_id.is_some());
        let snapshot = Introspector::new(&pilot.storage).snapshot().unwrap();
        assert!(snapshot.has_index("idx_kb_entity2"));

        let reverted = pilot.revert(id).unwrap();
        assert_eq!(reverted.state, MutationState::Reverted);
        let snapshot = Introspector::new(&pilot.storage).snapshot().unwrap();
        assert!(!snapshot.has_index("idx_kb_entity2"));
    }

    #[test]
    fn promotion_requires_the_window() {
        let pilot = pilot(5);
        let id = drive_to_verified(
            &pilot,
            "CREATE INDEX idx_goal_pri ON agent_goals(priority)",
            4,
        );
        let err = pilot.promote(id);
        assert!(matches!(err, Err(EngramError::Config(_))));
        pilot.record_verification(id, true).unwrap();
        assert_eq!(pilot.promote(id).unwrap().state, MutationState::Promoted);
    }

    #[test]
    fn propose_stores_the_canonical_render() {
        let pilot = pilot(1);
        let record = pilot
            .propose("create index idx_c on agent_goals(title);", None)
            .unwrap();
        assert_eq!(record.ddl, "CREATE INDEX \"idx_c\" ON \"agent_goals\" (\"title\")");
    }

    #[test]
    fn multi_statement_proposals_are_rejected() {
        let pilot = pilot(1);
        let err = pilot.propose(
            "CREATE INDEX ok ON agent_goals(title); DROP TABLE agent_sessions;--",
            None,
        );
        assert!(matches!(err, Err(EngramError::DdlNotAllowed(_))));
        let snapshot = Introspector::new(&pilot.storage).snapshot().unwrap();
        assert!(snapshot.table("agent_sessions").is_some());
        assert!(!snapshot.has_index("ok"));
        // Rejection is audited
        assert_eq!(pilot.list(Some(MutationState::Rejected)).unwrap().len(), 1);
    }

    #[test]
    fn invalid_ddl_is_rejected_preflight() {
        let pilot = pilot(1);
        let err = pilot.propose("DROP TABLE agent_sessions", None);
        assert!(matches!(err, Err(EngramError::DdlNotAllowed(_))));
        // Audit record persisted, schema untouched
        let rejected = pilot.list(Some(MutationState::Rejected)).unwrap();
        assert_eq!(rejected.len(), 1);
        let snapshot = Introspector::new(&pilot.storage).snapshot().unwrap();
        assert!(snapshot.table("agent_sessions").is_some());
    }

    #[test]
    fn sandbox_creates_and_cleans_shadow_objects() {
        let pilot = pilot(1);
        let record = pilot
            .propose("CREATE TABLE scratch_notes (id INTEGER PRIMARY KEY, body TEXT)", None)
            .unwrap();
        let sandboxed = pilot.sandbox(record.id).unwrap();
        let shadow = sandboxed.sandbox_name.clone().unwrap();
        assert!(shadow.starts_with("sandbox_"));
        let snapshot = Introspector::new(&pilot.storage).snapshot().unwrap();
        assert!(snapshot.table(&shadow).is_some());
        // The real table does not exist yet
        assert!(snapshot.table("scratch_notes").is_none());

        pilot.reject(record.id, "operator declined").unwrap();
        let snapshot = Introspector::new(&pilot.storage).snapshot().unwrap();
        assert!(snapshot.table(&shadow).is_none());
    }

    #[test]
    fn sandbox_capacity_is_capped() {
        let pilot = pilot(1);
        for i in 0..2 {
            let r = pilot
                .propose(&format!("CREATE TABLE scratch_{i} (id INTEGER PRIMARY KEY)"), None)
                .unwrap();
            pilot.sandbox(r.id).unwrap();
        }
        let r = pilot
            .propose("CREATE TABLE scratch_overflow (id INTEGER PRIMARY KEY)", None)
            .unwrap();
        let err = pilot.sandbox(r.id);
        assert!(matches!(err, Err(EngramError::Config(_))));
    }

    #[test]
    fn state_machine_rejects_out_of_order_moves() {
        let pilot = pilot(1);
        let record = pilot
            .propose("CREATE INDEX idx_x ON agent_goals(title)", None)
            .unwrap();
        // Cannot verify or promote straight from proposed
        assert!(matches!(
            pilot.begin_verification(record.id),
            Err(EngramError::IllegalTransition { .. })
        ));
        assert!(matches!(pilot.promote(record.id), Err(EngramError::IllegalTransition { .. })));
        // Cannot revert something never promoted
        assert!(matches!(pilot.revert(record.id), Err(EngramError::IllegalTransition { .. })));
    }

    #[test]
    fn revert_latest_promoted_picks_newest() {
        let pilot = pilot(1);
        let first = drive_to_verified(&pilot, "CREATE INDEX idx_a ON agent_goals(title)", 1);
        pilot.promote(first).unwrap();
        let second = drive_to_verified(&pilot, "CREATE INDEX idx_b ON agent_goals(status)", 1);
        pilot.promote(second).unwrap();

        let reverted = pilot.revert_latest_promoted().unwrap().unwrap();
        assert_eq!(reverted.id, second);
        let snapshot = Introspector::new(&pilot.storage).snapshot().unwrap();
        assert!(snapshot.has_index("idx_a"));
        assert!(!snapshot.has_index("idx_b"));
    }

    #[test]
    fn add_column_sandbox_clones_the_target() {
        let pilot = pilot(1);
        let record = pilot
            .propose("ALTER TABLE agent_goals ADD COLUMN due_at TEXT", None)
            .unwrap();
        let sandboxed = pilot.sandbox(record.id).unwrap();
        let shadow = sandboxed.sandbox_name.clone().unwrap();
        let snapshot = Introspector::new(&pilot.storage).snapshot().unwrap();
        let shadow_table = snapshot.table(&shadow).unwrap();
        assert!(shadow_table.columns.iter().any(|c| c.name == "due_at"));
        // Live table untouched
        assert!(!snapshot
            .table("agent_goals")
            .unwrap()
            .columns
            .iter()
            .any(|c| c.name == "due_at"));
        pilot.reject(record.id, "done inspecting").unwrap();
    }
}
