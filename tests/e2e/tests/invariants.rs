//! Cross-component invariants exercised against real on-disk databases.

use engram_core::{
    ActionStatus, BloomProxy, EngramError, Fingerprint, MessageRole, MutationState,
};
use engram_e2e_tests::harness::TestCortex;

// ------------------------------------------------------------------
// Bootstrap idempotency
// ------------------------------------------------------------------

#[test]
fn bootstrap_twice_yields_identical_schema() {
    let t = TestCortex::new_temp();
    let first = t.cortex.introspect().unwrap();

    // A second cortex over the same file re-runs bootstrap
    let second_cortex = t.reopen();
    let second = second_cortex.introspect().unwrap();
    assert_eq!(first, second);
}

#[test]
fn bootstrap_preserves_existing_rows() {
    let t = TestCortex::new_temp();
    let session = t.cortex.open_session(Some("survivor")).unwrap();

    let reopened = t.reopen();
    let found = reopened.sessions().get_session(session.id).unwrap().unwrap();
    assert_eq!(found.name, "survivor");
}

// ------------------------------------------------------------------
// DDL inversion law: apply M then its inverse == pre-mutation schema
// ------------------------------------------------------------------

#[test]
fn ddl_inversion_round_trips_schema() {
    let t = TestCortex::new_temp();
    let mutations = [
        "CREATE TABLE side_notes (id INTEGER PRIMARY KEY AUTOINCREMENT, body TEXT NOT NULL)",
        "CREATE UNIQUE INDEX idx_probe_names ON agent_logic_probes(name, script)",
        "ALTER TABLE agent_goals ADD COLUMN due_at TEXT",
    ];
    for ddl in mutations {
        let before = t.cortex.introspect().unwrap();
        let applied = t.cortex.dna().apply(ddl, "inversion-law").unwrap();
        assert_ne!(t.cortex.introspect().unwrap(), before, "{ddl} must change the schema");
        let matched = t.cortex.dna().rollback(&applied.inverse, applied.snapshot_id).unwrap();
        assert!(matched, "{ddl} inverse must restore snapshot fidelity");
        assert_eq!(t.cortex.introspect().unwrap(), before);
    }
}

// ------------------------------------------------------------------
// Action finalization: at most one non-pending status is ever observed
// ------------------------------------------------------------------

#[test]
fn actions_finalize_at_most_once_under_contention() {
    let t = TestCortex::new_temp();
    let session = t.cortex.open_session(Some("s")).unwrap();
    let action = t.cortex.append_action(session.id, "calc", "{}").unwrap();

    let journal = t.cortex.sessions();
    let mut outcomes = Vec::new();
    for attempt in 0..4 {
        let status = if attempt % 2 == 0 { ActionStatus::Success } else { ActionStatus::Failure };
        outcomes.push(journal.complete_action(action.id, status, &format!("o{attempt}"), attempt));
    }
    let wins = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1, "exactly one finalization wins");

    let stored = journal.get_action(action.id).unwrap().unwrap();
    assert_eq!(stored.status, ActionStatus::Success);
    assert_eq!(stored.outcome.as_deref(), Some("o0"));
}

// ------------------------------------------------------------------
// Bloom soundness: might_contain == false implies never inserted
// ------------------------------------------------------------------

#[test]
fn bloom_never_forgets_an_insert() {
    let bloom = BloomProxy::new(5_000, 0.01);
    let inserted: Vec<Fingerprint> = (0..2_500)
        .map(|i| Fingerprint::of("soundness", &format!("member {i}")))
        .collect();
    for fp in &inserted {
        bloom.insert(*fp);
    }
    // Soundness: no false negatives, ever
    assert!(inserted.iter().all(|fp| bloom.might_contain(*fp)));
}

// ------------------------------------------------------------------
// Vector dimension: every stored embedding matches the configured D
// ------------------------------------------------------------------

#[test]
fn stored_embeddings_always_match_dimensions() {
    let t = TestCortex::with_config(|config| config.agentic.vector.dimensions = 8);
    for i in 0..10 {
        let v = vec![i as f32; 8];
        t.cortex.vectors_add(&format!("row {i}"), &v).unwrap();
    }
    assert!(matches!(
        t.cortex.vectors_add("ragged", &[1.0; 7]),
        Err(EngramError::VectorDimensionMismatch { expected: 8, got: 7 })
    ));

    for id in 1..=10 {
        let record = t.cortex.vectors().get(id).unwrap().unwrap();
        assert_eq!(record.embedding.len(), 8);
    }
}

// ------------------------------------------------------------------
// Epoch disjointness across compression calls
// ------------------------------------------------------------------

#[test]
fn epochs_stay_disjoint_per_session() {
    let t = TestCortex::new_temp();
    let session = t.cortex.open_session(Some("s")).unwrap();
    let mut ids = Vec::new();
    for i in 0..12 {
        ids.push(
            t.cortex
                .sessions()
                .append_message(session.id, MessageRole::User, &format!("m{i}"), None)
                .unwrap()
                .id,
        );
    }
    t.cortex.sessions().compress_range(session.id, ids[0], ids[3]).unwrap();
    t.cortex.sessions().compress_range(session.id, ids[4], ids[7]).unwrap();

    // Every overlapping shape is rejected
    for (from, to) in [(ids[0], ids[1]), (ids[3], ids[4]), (ids[2], ids[9]), (ids[7], ids[7])] {
        assert!(
            t.cortex.sessions().compress_range(session.id, from, to).is_err(),
            "[{from}, {to}] overlaps"
        );
    }

    let epochs = t.cortex.sessions().list_epochs(session.id).unwrap();
    assert_eq!(epochs.len(), 2);
    for window in epochs.windows(2) {
        assert!(window[0].end_message_id < window[1].start_message_id);
    }

    // A different session is free to cover the same id range
    let other = t.cortex.open_session(Some("other")).unwrap();
    let m = t
        .cortex
        .sessions()
        .append_message(other.id, MessageRole::User, "solo", None)
        .unwrap();
    t.cortex.sessions().compress_range(other.id, m.id, m.id).unwrap();
}

// ------------------------------------------------------------------
// Rollback guarantee: regression rollback restores the snapshot schema
// ------------------------------------------------------------------

#[test]
fn regression_rollback_restores_snapshot_schema() {
    let t = TestCortex::with_config(|config| {
        config.agentic.evolution.verification_window = 1;
    });

    let pre_mutation = t.cortex.introspect().unwrap();
    let record = t
        .cortex
        .propose_mutation("CREATE INDEX idx_regress ON agent_goals(status)", None)
        .unwrap();
    t.cortex.evolution().sandbox(record.id).unwrap();
    t.cortex.evolution().begin_verification(record.id).unwrap();
    t.cortex.evolution().record_verification(record.id, true).unwrap();
    let promoted = t.cortex.evolution().promote(record.id).unwrap();
    let snapshot_id = promoted.snapshot_id.unwrap();

    // Healthy history, then a collapsed window triggers the governor
    for _ in 0..200 {
        t.cortex.meta().record_outcome(true, 5.0);
    }
    for _ in 0..15 {
        t.cortex.meta().record_outcome(false, 5.0);
    }
    for _ in 0..35 {
        t.cortex.meta().record_outcome(false, 5.0);
    }
    let decision = t.cortex.meta().evaluate(t.cortex.evolution()).unwrap();
    assert!(decision.is_some(), "collapse must trigger the governor");

    let reverted = t.cortex.evolution().get(record.id).unwrap().unwrap();
    assert_eq!(reverted.state, MutationState::Reverted);

    let after = t.cortex.introspect().unwrap();
    assert_eq!(after, t.cortex.dna().load_snapshot(snapshot_id).unwrap());
    assert_eq!(after, pre_mutation);
}

// ------------------------------------------------------------------
// Distill idempotence law
// ------------------------------------------------------------------

#[test]
fn distill_twice_is_one_item_and_counted_once() {
    let t = TestCortex::new_temp();
    let before = t.cortex.stats().unwrap().bloom;

    t.cortex.distill("law", "same fact", 0.8).unwrap();
    t.cortex.distill("law", "same fact", 0.8).unwrap();

    let after = t.cortex.stats().unwrap().bloom;
    assert_eq!(t.cortex.stats().unwrap().knowledge_items, 1);
    let rejections_grew = after.bloom_rejections == before.bloom_rejections + 1;
    let confirmed_once = after.semantic_confirmations == before.semantic_confirmations + 1;
    assert!(rejections_grew && confirmed_once);
}
