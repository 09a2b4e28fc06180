//! Schema bootstrap
//!
//! Idempotently creates the 20 agentic tables. Foreign keys are declared
//! inline at table creation (the embedded engine cannot add them later), so
//! the DDL below is ordered parents-first. Running bootstrap on an already
//! initialized store is a no-op and tolerates pre-existing rows.

use crate::error::{EngramError, Result};
use crate::storage::{init_lock_for, Storage};

/// Every persisted agent table, in FK dependency order.
pub const AGENT_TABLES: &[&str] = &[
    "agent_sessions",
    "agent_messages",
    "agent_actions",
    "agent_episodes",
    "agent_epochs",
    "agent_reflections",
    "agent_goals",
    "agent_knowledge_base",
    "agent_knowledge_links",
    "agent_memories",
    "agent_capabilities",
    "agent_policies",
    "agent_rituals",
    "agent_rules",
    "agent_snapshots",
    "agent_logic_probes",
    "agent_resource_usage",
    "agent_personas",
    "agent_mutations",
    "agent_meta_events",
];

/// Number of agent tables the bootstrap creates.
pub const TABLE_COUNT: usize = 20;

const BOOTSTRAP_SQL: &str = r#"
-- Sessions own messages, actions, episodes, reflections, and resource rows
CREATE TABLE IF NOT EXISTS agent_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Immutable conversational journal
CREATE TABLE IF NOT EXISTS agent_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES agent_sessions(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON agent_messages(session_id);

-- Append-only tool invocation journal
CREATE TABLE IF NOT EXISTS agent_actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES agent_sessions(id) ON DELETE CASCADE,
    message_id INTEGER REFERENCES agent_messages(id) ON DELETE SET NULL,
    tool_name TEXT NOT NULL,
    arguments TEXT NOT NULL DEFAULT '{}',
    outcome TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    duration_ms INTEGER,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_actions_session ON agent_actions(session_id);
CREATE INDEX IF NOT EXISTS idx_actions_status ON agent_actions(status);

CREATE TABLE IF NOT EXISTS agent_episodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES agent_sessions(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    summary TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    start_time TEXT NOT NULL,
    end_time TEXT
);

CREATE INDEX IF NOT EXISTS idx_episodes_session ON agent_episodes(session_id);

-- Compressed message ranges; ranges never overlap within a session
CREATE TABLE IF NOT EXISTS agent_epochs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES agent_sessions(id) ON DELETE CASCADE,
    summary TEXT NOT NULL,
    start_message_id INTEGER NOT NULL,
    end_message_id INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_epochs_session ON agent_epochs(session_id);

CREATE TABLE IF NOT EXISTS agent_reflections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER REFERENCES agent_sessions(id) ON DELETE CASCADE,
    episode_id INTEGER REFERENCES agent_episodes(id) ON DELETE CASCADE,
    outcome TEXT NOT NULL,
    lessons_learned TEXT NOT NULL DEFAULT '[]',
    suggested_actions TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reflections_session ON agent_reflections(session_id);

CREATE TABLE IF NOT EXISTS agent_goals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER REFERENCES agent_sessions(id) ON DELETE SET NULL,
    title TEXT NOT NULL,
    description TEXT,
    status TEXT NOT NULL DEFAULT 'open',
    priority INTEGER NOT NULL DEFAULT 2,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Uniqueness of knowledge is semantic, enforced by the distiller, not here
CREATE TABLE IF NOT EXISTS agent_knowledge_base (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity TEXT NOT NULL,
    fact TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0.5,
    source_session_id INTEGER REFERENCES agent_sessions(id) ON DELETE SET NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    challenge_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_knowledge_entity ON agent_knowledge_base(entity);

-- Directed edges; cycles permitted, stored by id only
CREATE TABLE IF NOT EXISTS agent_knowledge_links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL REFERENCES agent_knowledge_base(id) ON DELETE CASCADE,
    target_id INTEGER NOT NULL REFERENCES agent_knowledge_base(id) ON DELETE CASCADE,
    relationship TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_links_source ON agent_knowledge_links(source_id);
CREATE INDEX IF NOT EXISTS idx_links_target ON agent_knowledge_links(target_id);

-- Embedding rows; dimension enforced at the vector store boundary
CREATE TABLE IF NOT EXISTS agent_memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER REFERENCES agent_sessions(id) ON DELETE SET NULL,
    content TEXT NOT NULL,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memories_session ON agent_memories(session_id);

CREATE TABLE IF NOT EXISTS agent_capabilities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    description TEXT,
    status TEXT NOT NULL DEFAULT 'experimental',
    reliability REAL NOT NULL DEFAULT 0.5,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (name, version)
);

CREATE TABLE IF NOT EXISTS agent_policies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    policy_type TEXT NOT NULL,
    definition TEXT NOT NULL DEFAULT '{}',
    enabled INTEGER NOT NULL DEFAULT 1,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_rituals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    ritual_type TEXT NOT NULL,
    definition TEXT NOT NULL DEFAULT '{}',
    frequency TEXT NOT NULL DEFAULT 'daily',
    priority INTEGER NOT NULL DEFAULT 100,
    last_run TEXT,
    next_run TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_rituals_next_run ON agent_rituals(next_run);

CREATE TABLE IF NOT EXISTS agent_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    operation TEXT NOT NULL,
    action TEXT NOT NULL,
    script TEXT NOT NULL DEFAULT '{}',
    enabled INTEGER NOT NULL DEFAULT 1,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rules_table_op ON agent_rules(table_name, operation);

-- Serialized schema (DNA) captured before every autonomous mutation
CREATE TABLE IF NOT EXISTS agent_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    dna TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_logic_probes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    script TEXT NOT NULL,
    expected_outcome TEXT,
    last_run TEXT,
    last_status TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_resource_usage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES agent_sessions(id) ON DELETE CASCADE,
    agent_id TEXT,
    model_name TEXT NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cost REAL NOT NULL DEFAULT 0,
    currency TEXT NOT NULL DEFAULT 'USD',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_resource_session ON agent_resource_usage(session_id);

CREATE TABLE IF NOT EXISTS agent_personas (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    role TEXT,
    capabilities TEXT NOT NULL DEFAULT '[]',
    policies TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Evolutionary pilot state machine, persisted
CREATE TABLE IF NOT EXISTS agent_mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ddl TEXT NOT NULL,
    inverse TEXT,
    state TEXT NOT NULL DEFAULT 'proposed',
    snapshot_id INTEGER REFERENCES agent_snapshots(id) ON DELETE SET NULL,
    sandbox_name TEXT,
    target_table TEXT,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    note TEXT,
    proposed_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mutations_state ON agent_mutations(state);

-- Meta-evolution audit trail
CREATE TABLE IF NOT EXISTS agent_meta_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    z_score REAL,
    aggressiveness REAL NOT NULL,
    verification_window INTEGER NOT NULL,
    detail TEXT,
    created_at TEXT NOT NULL
);
"#;

/// Create the agent tables if absent.
///
/// Serialized across concurrent instances pointing at the same database by
/// the per-path initialization lock, which is held only for the duration of
/// this call.
pub fn bootstrap(storage: &Storage) -> Result<()> {
    let lock = init_lock_for(&storage.target().lock_key());
    let _guard = lock.lock().map_err(|_| EngramError::LockPoisoned("init lock"))?;

    storage
        .raw_batch(BOOTSTRAP_SQL)
        .map_err(|e| EngramError::MigrationFailed(format!("bootstrap failed: {e}")))?;
    tracing::info!(tables = TABLE_COUNT, "agent schema bootstrapped");
    Ok(())
}

/// True when every agent table exists.
pub fn is_bootstrapped(storage: &Storage) -> Result<bool> {
    let count: i64 = storage.with_reader(|conn| {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name LIKE 'agent_%'",
            [],
            |row| row.get(0),
        )
    })?;
    Ok(count as usize >= TABLE_COUNT)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionSettings, OptimizationConfig};
    use crate::storage::Introspector;

    fn memory_storage() -> Storage {
        Storage::open(
            &ConnectionSettings::Embedded { path: None },
            &OptimizationConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn creates_exactly_the_agent_tables() {
        let storage = memory_storage();
        bootstrap(&storage).unwrap();
        let snapshot = Introspector::new(&storage).snapshot().unwrap();
        let mut expected: Vec<&str> = AGENT_TABLES.to_vec();
        expected.sort_unstable();
        assert_eq!(snapshot.table_names(), expected);
        assert_eq!(snapshot.tables.len(), TABLE_COUNT);
        assert!(is_bootstrapped(&storage).unwrap());
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let storage = memory_storage();
        bootstrap(&storage).unwrap();
        let first = Introspector::new(&storage).snapshot().unwrap();
        bootstrap(&storage).unwrap();
        let second = Introspector::new(&storage).snapshot().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn bootstrap_tolerates_existing_rows() {
        let storage = memory_storage();
        bootstrap(&storage).unwrap();
        storage
            .with_writer(|conn| {
                conn.execute(
                    "INSERT INTO agent_sessions (name, created_at, updated_at) \
                     VALUES ('s', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                    [],
                )
            })
            .unwrap();
        bootstrap(&storage).unwrap();
        let count: i64 = storage
            .with_reader(|conn| {
                conn.query_row("SELECT COUNT(*) FROM agent_sessions", [], |r| r.get(0))
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn session_delete_cascades() {
        let storage = memory_storage();
        bootstrap(&storage).unwrap();
        storage
            .with_writer(|conn| {
                conn.execute_batch(
                    "INSERT INTO agent_sessions (id, name, created_at, updated_at)
                     VALUES (1, 's', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z');
                     INSERT INTO agent_messages (session_id, role, content, created_at)
                     VALUES (1, 'user', 'hi', '2026-01-01T00:00:00Z');
                     INSERT INTO agent_actions (session_id, tool_name, created_at)
                     VALUES (1, 'calc', '2026-01-01T00:00:00Z');
                     DELETE FROM agent_sessions WHERE id = 1;",
                )
            })
            .unwrap();
        let orphans: i64 = storage
            .with_reader(|conn| {
                conn.query_row(
                    "SELECT (SELECT COUNT(*) FROM agent_messages) + (SELECT COUNT(*) FROM agent_actions)",
                    [],
                    |r| r.get(0),
                )
            })
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn knowledge_link_endpoints_cascade() {
        let storage = memory_storage();
        bootstrap(&storage).unwrap();
        storage
            .with_writer(|conn| {
                conn.execute_batch(
                    "INSERT INTO agent_knowledge_base (id, entity, fact, confidence, created_at, updated_at)
                     VALUES (1, 'a', 'f1', 0.9, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z'),
                            (2, 'b', 'f2', 0.9, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z');
                     INSERT INTO agent_knowledge_links (source_id, target_id, relationship, created_at)
                     VALUES (1, 2, 'supports', '2026-01-01T00:00:00Z');
                     DELETE FROM agent_knowledge_base WHERE id = 2;",
                )
            })
            .unwrap();
        let links: i64 = storage
            .with_reader(|conn| {
                conn.query_row("SELECT COUNT(*) FROM agent_knowledge_links", [], |r| r.get(0))
            })
            .unwrap();
        assert_eq!(links, 0);
    }
}
