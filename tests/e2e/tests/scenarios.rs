//! End-to-end scenarios: the full cognitive loop exercised through the
//! public cortex surface against real on-disk databases.

use chrono::{Duration, Utc};
use engram_core::{
    validate_identifier, ActionStatus, DistillDecision, EngramError, Frequency, MutationState,
    RitualKind, RitualStatus, StorageTuner, TABLE_COUNT,
};
use engram_e2e_tests::harness::TestCortex;

// ------------------------------------------------------------------
// Scenario 1: bootstrap on an empty file
// ------------------------------------------------------------------

#[test]
fn bootstrap_on_empty_file() {
    let t = TestCortex::new_temp();

    let snapshot = t.cortex.introspect().unwrap();
    assert_eq!(snapshot.tables.len(), TABLE_COUNT, "all agent tables created");
    assert!(snapshot.table("agent_sessions").is_some());

    let stats = t.cortex.stats().unwrap();
    assert_eq!(stats.sessions, 0, "fresh store holds no sessions");

    let journal_mode = StorageTuner::new(t.cortex.storage()).journal_mode().unwrap();
    assert_eq!(journal_mode, "wal", "WAL is on for file-backed stores");
}

// ------------------------------------------------------------------
// Scenario 2: action lifecycle
// ------------------------------------------------------------------

#[test]
fn action_lifecycle() {
    let t = TestCortex::new_temp();

    let session = t.cortex.open_session(Some("s1")).unwrap();
    let action = t.cortex.append_action(session.id, "calc", "{}").unwrap();
    assert_eq!(action.status, ActionStatus::Pending);

    let done = t
        .cortex
        .complete_action(action.id, ActionStatus::Success, "42", 12)
        .unwrap();
    assert_eq!(done.status, ActionStatus::Success);
    assert_eq!(done.outcome.as_deref(), Some("42"));
    assert_eq!(done.duration_ms, Some(12));

    let err = t
        .cortex
        .complete_action(action.id, ActionStatus::Success, "43", 1);
    assert!(matches!(err, Err(EngramError::ActionAlreadyFinalized(id)) if id == action.id));
}

// ------------------------------------------------------------------
// Scenario 3: knowledge dedup
// ------------------------------------------------------------------

#[test]
fn knowledge_dedup() {
    let t = TestCortex::new_temp();

    let first = t.cortex.distill("arch", "WAL is 3x faster", 0.9).unwrap();
    let second = t.cortex.distill("arch", "WAL is 3x faster", 0.9).unwrap();
    assert_eq!(first.id, second.id, "exactly one knowledge item survives");

    let stats = t.cortex.stats().unwrap();
    assert_eq!(stats.knowledge_items, 1);
    assert!(
        stats.bloom.bloom_rejections >= 1 || stats.bloom.semantic_confirmations == 1,
        "the gate either fast-pathed the first insert or confirmed the duplicate"
    );

    let item = t.cortex.knowledge().get(first.id).unwrap().unwrap();
    assert!(
        (item.confidence - 0.9).abs() < 1e-9,
        "identical confidence stays put under the weighted merge"
    );
}

#[test]
fn knowledge_dedup_through_embedder() {
    let t = TestCortex::with_embedder(16);
    let first = t.cortex.distill("arch", "WAL is 3x faster", 0.9).unwrap();
    // Different surface form, identical normalized content
    let second = t.cortex.distill("arch", "wal IS   3x faster", 0.9).unwrap();
    assert_eq!(first.id, second.id);
    assert!(matches!(second.decision, DistillDecision::Merged { .. }));
    assert_eq!(t.cortex.stats().unwrap().knowledge_items, 1);
}

// ------------------------------------------------------------------
// Scenario 4: autonomous DDL with rollback
// ------------------------------------------------------------------

#[test]
fn autonomous_ddl_and_rollback() {
    let t = TestCortex::with_config(|config| {
        config.agentic.evolution.verification_window = 1;
    });
    let before = t.cortex.introspect().unwrap();

    let record = t
        .cortex
        .propose_mutation(
            "CREATE INDEX idx_kb_entity ON agent_knowledge_base(entity)",
            Some("advisor"),
        )
        .unwrap();
    t.cortex.evolution().sandbox(record.id).unwrap();
    t.cortex.evolution().begin_verification(record.id).unwrap();
    t.cortex.evolution().record_verification(record.id, true).unwrap();
    let promoted = t.cortex.evolution().promote(record.id).unwrap();

    assert_eq!(promoted.state, MutationState::Promoted);
    assert_eq!(
        promoted.inverse.as_deref(),
        Some("DROP INDEX \"idx_kb_entity\""),
        "inverse persisted at promotion"
    );
    let snapshot_id = promoted.snapshot_id.expect("snapshot taken before the mutation");
    assert!(t.cortex.introspect().unwrap().has_index("idx_kb_entity"));

    // Force rollback
    let reverted = t.cortex.evolution().revert(record.id).unwrap();
    assert_eq!(reverted.state, MutationState::Reverted);

    let after = t.cortex.introspect().unwrap();
    assert!(!after.has_index("idx_kb_entity"), "index gone after rollback");
    assert_eq!(after, before, "no other schema delta");
    assert_eq!(
        after,
        t.cortex.dna().load_snapshot(snapshot_id).unwrap(),
        "schema equals the pre-mutation snapshot"
    );
}

// ------------------------------------------------------------------
// Scenario 5: identifier attack
// ------------------------------------------------------------------

#[test]
fn identifier_attack_is_rejected() {
    let t = TestCortex::new_temp();
    let before = t.cortex.introspect().unwrap();

    let err = validate_identifier("id; DROP TABLE agent_sessions--");
    assert!(matches!(err, Err(EngramError::InvalidIdentifier { .. })));

    // The same payload through every identifier-bearing surface
    assert!(engram_core::Identifier::new("id; DROP TABLE agent_sessions--").is_err());
    assert!(t
        .cortex
        .propose_mutation("CREATE INDEX \"idx; DROP TABLE agent_sessions--\" ON t(c)", None)
        .is_err());

    assert_eq!(t.cortex.introspect().unwrap(), before, "no table change");
    assert!(t.cortex.introspect().unwrap().table("agent_sessions").is_some());
}

// ------------------------------------------------------------------
// Scenario 6: ritual tick
// ------------------------------------------------------------------

#[test]
fn ritual_tick_runs_due_rituals_once() {
    let t = TestCortex::new_temp();
    t.cortex
        .rituals()
        .define(
            "compress",
            RitualKind::Compression,
            Frequency::Hourly,
            serde_json::json!({"keepRecent": 10}),
            10,
        )
        .unwrap();

    // Not due yet
    assert!(t.cortex.rituals().run_pending(Utc::now(), None).unwrap().is_empty());

    // Manually advance time past the interval
    let later = Utc::now() + Duration::hours(1) + Duration::seconds(5);
    let reports = t.cortex.rituals().run_pending(later, None).unwrap();
    assert_eq!(reports.len(), 1, "executed exactly once");
    assert!(reports[0].succeeded);

    // Same tick again: nothing due
    assert!(t.cortex.rituals().run_pending(later, None).unwrap().is_empty());

    let ritual = t.cortex.rituals().get_by_name("compress").unwrap().unwrap();
    assert_eq!(ritual.status, RitualStatus::Succeeded);
    assert_eq!(ritual.last_run.unwrap(), later, "last_run updated");
    assert_eq!(
        ritual.next_run.unwrap(),
        later + Duration::hours(1),
        "next_run = last_run + 1h"
    );
}

// ------------------------------------------------------------------
// The loop end to end: journal -> distill -> reflect -> evolve -> govern
// ------------------------------------------------------------------

#[test]
fn closed_cognitive_loop() {
    let t = TestCortex::with_config(|config| {
        config.agentic.evolution.verification_window = 1;
    });

    // Journal a working session
    let session = t.cortex.open_session(Some("research")).unwrap();
    let episode = t.cortex.sessions().start_episode(session.id, "gather").unwrap();
    for i in 0..3 {
        let action = t.cortex.append_action(session.id, "fetch", "{}").unwrap();
        let status = if i == 2 { ActionStatus::Failure } else { ActionStatus::Success };
        t.cortex
            .complete_action(action.id, status, "done", 40)
            .unwrap();
    }
    t.cortex.sessions().close_episode(episode.id, Some("gathered")).unwrap();

    // Distill what was learned
    t.cortex.distill("fetch", "two of three fetches succeed", 0.7).unwrap();

    // Reflect on the episode
    let reflection = t
        .cortex
        .reflection()
        .reflect_on_episode(t.cortex.sessions(), episode.id)
        .unwrap();
    assert!(reflection.outcome.contains("2/3 actions succeeded"));

    // Evolve the schema and let the governor see healthy outcomes
    let record = t
        .cortex
        .propose_mutation("CREATE INDEX idx_kb_fact ON agent_knowledge_base(fact)", None)
        .unwrap();
    t.cortex.evolution().sandbox(record.id).unwrap();
    t.cortex.evolution().begin_verification(record.id).unwrap();
    t.cortex.evolution().record_verification(record.id, true).unwrap();
    t.cortex.evolution().promote(record.id).unwrap();
    for _ in 0..30 {
        t.cortex.meta().record_outcome(true, 10.0);
    }
    assert!(t.cortex.meta().evaluate(t.cortex.evolution()).unwrap().is_none());

    // Account the spend
    t.cortex
        .resources()
        .record(session.id, "fast-model", 900, 250, 0.004, "USD", Some("agent-1"))
        .unwrap();

    let stats = t.cortex.stats().unwrap();
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.actions, 3);
    assert_eq!(stats.knowledge_items, 1);
    assert!(stats.global_cost > 0.0);
    assert!(stats
        .mutation_states
        .iter()
        .any(|(state, n)| state == "promoted" && *n == 1));
}
