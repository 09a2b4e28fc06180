//! Error taxonomy
//!
//! One `#[non_exhaustive]` enum covers every terminal error the engine
//! surfaces. Callers pattern-match on variants instead of catching; each
//! variant answers `kind()` and `suggestion()` so terminal errors can be
//! reported as `{kind, operation, suggestion}` without leaking payloads.

use std::fmt;

// ============================================================================
// ERROR KINDS
// ============================================================================

/// Broad classification of an error, used for propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Identifier, dimension, or config validation failed
    Validation,
    /// Policy deny, rule veto, rate limit
    Authorization,
    /// Not initialized or illegal status transition
    State,
    /// Foreign key or uniqueness violation
    Integrity,
    /// I/O, timeout, migration
    Operational,
    /// Internal regression event (z-score rollback), not a caller fault
    Consistency,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authorization => "authorization",
            ErrorKind::State => "state",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Operational => "operational",
            ErrorKind::Consistency => "consistency",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// ERROR TYPE
// ============================================================================

/// Engine error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngramError {
    /// The cortex was used before `initialize` completed
    #[error("engine not initialized")]
    NotInitialized,

    /// A named table does not exist in the store
    #[error("table not found: {table}")]
    TableNotFound {
        /// Requested table
        table: String,
        /// Tables that do exist
        available: Vec<String>,
    },

    /// A named column does not exist on the table
    #[error("column not found: {column} on {table}")]
    ColumnNotFound {
        /// Requested column
        column: String,
        /// Owning table
        table: String,
        /// Columns that do exist
        available: Vec<String>,
    },

    /// A knowledge link endpoint or relationship label was not found
    #[error("relationship not found: {0}")]
    RelationshipNotFound(String),

    /// Identifier failed the safety pipeline
    #[error("invalid identifier {name:?}: {reason}")]
    InvalidIdentifier {
        /// Offending candidate (truncated to 64 chars by the validator)
        name: String,
        /// Which check rejected it
        reason: &'static str,
    },

    /// DDL outside the autonomous whitelist
    #[error("DDL not allowed: {0}")]
    DdlNotAllowed(String),

    /// Embedding length differs from the configured dimension
    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    VectorDimensionMismatch {
        /// Configured dimension
        expected: usize,
        /// Supplied length
        got: usize,
    },

    /// `complete_action` called on a non-pending action
    #[error("action {0} already finalized")]
    ActionAlreadyFinalized(i64),

    /// A rule vetoed the mutation
    #[error("rule {rule_id} vetoed operation: {reason}")]
    RuleVeto {
        /// Vetoing rule id
        rule_id: i64,
        /// Rule-supplied reason
        reason: String,
    },

    /// A deny policy matched
    #[error("policy {policy} denied operation")]
    PolicyDeny {
        /// Denying policy name
        policy: String,
    },

    /// Token bucket for the key is exhausted
    #[error("rate limit exceeded for key {key}")]
    RateLimitExceeded {
        /// Bucket key
        key: String,
    },

    /// Deadline expired before the operation finished
    #[error("timeout during {operation}")]
    Timeout {
        /// What was running
        operation: &'static str,
    },

    /// Foreign key or uniqueness violation surfaced by the store
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// Bootstrap or DDL application failed and was rolled back
    #[error("migration failed: {0}")]
    MigrationFailed(String),

    /// Operation requires an active session
    #[error("session {id} is not active (status {status})")]
    SessionNotActive {
        /// Session id
        id: i64,
        /// Current status
        status: String,
    },

    /// Illegal status transition (terminal statuses are one-way)
    #[error("illegal transition for {entity} {id}: {from} -> {to}")]
    IllegalTransition {
        /// Entity name ("session", "episode", ...)
        entity: &'static str,
        /// Row id
        id: i64,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Row lookup by id failed
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity name
        entity: &'static str,
        /// Row id
        id: i64,
    },

    /// Configuration rejected at load
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Internal lock poisoned by a panicking thread
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Engine result type
pub type Result<T> = std::result::Result<T, EngramError>;

impl EngramError {
    /// Broad classification for the propagation policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngramError::InvalidIdentifier { .. }
            | EngramError::DdlNotAllowed(_)
            | EngramError::VectorDimensionMismatch { .. }
            | EngramError::Config(_) => ErrorKind::Validation,

            EngramError::RuleVeto { .. }
            | EngramError::PolicyDeny { .. }
            | EngramError::RateLimitExceeded { .. } => ErrorKind::Authorization,

            EngramError::NotInitialized
            | EngramError::ActionAlreadyFinalized(_)
            | EngramError::SessionNotActive { .. }
            | EngramError::IllegalTransition { .. } => ErrorKind::State,

            EngramError::IntegrityViolation(_) => ErrorKind::Integrity,

            EngramError::TableNotFound { .. }
            | EngramError::ColumnNotFound { .. }
            | EngramError::RelationshipNotFound(_)
            | EngramError::NotFound { .. } => ErrorKind::State,

            EngramError::Timeout { .. }
            | EngramError::MigrationFailed(_)
            | EngramError::LockPoisoned(_)
            | EngramError::Database(_)
            | EngramError::Io(_)
            | EngramError::Serialization(_) => ErrorKind::Operational,
        }
    }

    /// A short, payload-free hint for the caller.
    pub fn suggestion(&self) -> &'static str {
        match self {
            EngramError::NotInitialized => "call Cortex::open before any operation",
            EngramError::TableNotFound { .. } => "run bootstrap or check the table name",
            EngramError::ColumnNotFound { .. } => "re-introspect the schema; a mutation may have changed it",
            EngramError::RelationshipNotFound(_) => "both link endpoints must exist before linking",
            EngramError::InvalidIdentifier { .. } => "identifiers are [A-Za-z_][A-Za-z0-9_]* with at most two dots",
            EngramError::DdlNotAllowed(_) => {
                "autonomous DDL is limited to CREATE TABLE, CREATE [UNIQUE] INDEX, ADD COLUMN, DROP INDEX"
            }
            EngramError::VectorDimensionMismatch { .. } => "embedding length is fixed at initialization",
            EngramError::ActionAlreadyFinalized(_) => "actions leave pending exactly once",
            EngramError::RuleVeto { .. } => "disable or amend the vetoing rule",
            EngramError::PolicyDeny { .. } => "a deny policy matched; adjust policies if intended",
            EngramError::RateLimitExceeded { .. } => "wait for the bucket to refill or raise its capacity",
            EngramError::Timeout { .. } => "raise the deadline or reduce the scan cap",
            EngramError::IntegrityViolation(_) => "check foreign keys and uniqueness constraints",
            EngramError::MigrationFailed(_) => "the transaction was rolled back; inspect the DDL",
            EngramError::SessionNotActive { .. } => "journals only grow under an active session",
            EngramError::IllegalTransition { .. } => "closed sessions and episodes cannot re-open",
            EngramError::NotFound { .. } => "the row may have been cascaded away",
            EngramError::Config(_) => "fix the configuration value and reload",
            EngramError::LockPoisoned(_) => "a previous panic corrupted shared state; restart",
            EngramError::Database(_) | EngramError::Io(_) => "transient I/O is retried internally; this is terminal",
            EngramError::Serialization(_) => "metadata columns must hold valid JSON",
        }
    }

    /// True when the storage adapter should retry with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            EngramError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Map SQLite constraint failures onto the integrity variant.
    pub(crate) fn from_sqlite(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(e, ref msg) = err {
            if e.code == rusqlite::ErrorCode::ConstraintViolation {
                return EngramError::IntegrityViolation(
                    msg.clone().unwrap_or_else(|| "constraint violation".to_string()),
                );
            }
        }
        EngramError::Database(err)
    }
}

// ============================================================================
// TESTS
// ============================================================================
