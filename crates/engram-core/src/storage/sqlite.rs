//! SQLite storage adapter
//!
//! Separate reader/writer connections behind mutexes give interior
//! mutability: all methods take `&self`, so the engine can be shared as
//! `Arc<Storage>` across threads. The writer path is single-writer by
//! construction (engine-enforced); readers proceed concurrently under WAL.
//!
//! Transient contention (SQLITE_BUSY / SQLITE_LOCKED) is retried here with
//! exponential backoff and nowhere else; higher layers see either success or
//! a terminal error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use rusqlite::{Connection, OpenFlags};

use crate::capture::QueryCapture;
use crate::config::{ConnectionSettings, OptimizationConfig};
use crate::error::{EngramError, Result};
use crate::sql::Query;

/// Retry attempts for transient contention before surfacing the error
const MAX_RETRIES: u32 = 5;

/// Base backoff; doubles per attempt (10ms, 20ms, 40ms, ...)
const BACKOFF_BASE: Duration = Duration::from_millis(10);

// ============================================================================
// TARGET
// ============================================================================

/// Where the embedded store lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    /// On-disk database file
    File(PathBuf),
    /// Shared-cache in-memory database, unique per `Storage`
    Memory(String),
}

impl StorageTarget {
    /// Key used for the global initialization lock.
    pub fn lock_key(&self) -> String {
        match self {
            StorageTarget::File(path) => path.to_string_lossy().into_owned(),
            StorageTarget::Memory(name) => format!(":memory:{name}"),
        }
    }

    /// True for in-memory stores (WAL unavailable).
    pub fn is_memory(&self) -> bool {
        matches!(self, StorageTarget::Memory(_))
    }

    fn uri(&self) -> String {
        match self {
            StorageTarget::File(path) => path.to_string_lossy().into_owned(),
            // Named shared-cache memory DB so reader and writer see one store
            StorageTarget::Memory(name) => {
                format!("file:{name}?mode=memory&cache=shared")
            }
        }
    }

    fn open_flags(&self) -> OpenFlags {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if self.is_memory() {
            flags |= OpenFlags::SQLITE_OPEN_URI;
        }
        flags
    }
}

// ============================================================================
// GLOBAL INIT LOCK
// ============================================================================

/// Per-storage-path initialization locks.
///
/// Serializes bootstrap across concurrent instances pointing at the same
/// database file. Held only across bootstrap.
pub fn init_lock_for(key: &str) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    let registry = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    map.entry(key.to_string()).or_default().clone()
}

// ============================================================================
// STORAGE
// ============================================================================

/// Embedded storage adapter with reader/writer connection split
pub struct Storage {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    target: StorageTarget,
    capture: QueryCapture,
}

impl Storage {
    /// Open storage for a connection target and apply the tuning profile.
    ///
    /// The networked dialect is served by an external engine adapter and is
    /// rejected here; only SQL rendering supports it.
    pub fn open(settings: &ConnectionSettings, profile: &OptimizationConfig) -> Result<Self> {
        let target = match settings {
            ConnectionSettings::Embedded { path: Some(path) } => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                StorageTarget::File(path.clone())
            }
            ConnectionSettings::Embedded { path: None } => {
                StorageTarget::Memory(format!("engram_{}", uuid::Uuid::new_v4().simple()))
            }
            ConnectionSettings::Networked { .. } => {
                return Err(EngramError::Config(
                    "networked connections are served by the external engine adapter".into(),
                ));
            }
        };

        let writer = Connection::open_with_flags(target.uri(), target.open_flags())?;
        let reader = Connection::open_with_flags(target.uri(), target.open_flags())?;
        writer.busy_timeout(Duration::from_millis(5_000))?;
        reader.busy_timeout(Duration::from_millis(5_000))?;

        let storage = Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            target,
            capture: QueryCapture::default(),
        };

        if profile.apply_on_startup {
            super::tuner::StorageTuner::new(&storage).apply_profile(profile)?;
        }

        Ok(storage)
    }

    /// The storage target.
    pub fn target(&self) -> &StorageTarget {
        &self.target
    }

    /// The shared query-capture ring.
    pub fn capture(&self) -> &QueryCapture {
        &self.capture
    }

    // ------------------------------------------------------------------
    // Connection access
    // ------------------------------------------------------------------

    /// Run a read-only operation on the reader connection, retrying
    /// transient contention.
    pub fn with_reader<T>(&self, f: impl Fn(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .reader
            .lock()
            .map_err(|_| EngramError::LockPoisoned("storage reader"))?;
        retry(|| f(&conn))
    }

    /// Run a mutating operation on the writer connection, retrying
    /// transient contention.
    ///
    /// The closure must be repeatable: it may run more than once when the
    /// engine reports SQLITE_BUSY.
    pub fn with_writer<T>(&self, f: impl Fn(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .writer
            .lock()
            .map_err(|_| EngramError::LockPoisoned("storage writer"))?;
        retry(|| f(&conn))
    }

    /// Run a closure inside a single writer transaction.
    ///
    /// The whole transaction is one attempt; an `Err` from the closure rolls
    /// everything back and observers never see partial writes.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self
            .writer
            .lock()
            .map_err(|_| EngramError::LockPoisoned("storage writer"))?;
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(EngramError::from_sqlite)?;
        let value = f(&tx)?;
        tx.commit().map_err(EngramError::from_sqlite)?;
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Node execution (captured)
    // ------------------------------------------------------------------

    /// Render an operation node for the embedded dialect and execute it on
    /// the writer, recording the statement in the capture ring.
    pub fn execute_node(&self, query: &Query) -> Result<usize> {
        let rendered = crate::config::Dialect::Embedded.render(query);
        let table = node_table(query).map(str::to_string);
        let start = Instant::now();
        let changed = self.with_writer(|conn| {
            conn.execute(&rendered.sql, rusqlite::params_from_iter(rendered.params.iter()))
        })?;
        self.capture.record(
            &rendered.sql,
            start.elapsed().as_secs_f64() * 1_000.0,
            table.as_deref(),
        );
        Ok(changed)
    }

    /// Record an externally executed statement in the capture ring.
    pub fn record_statement(&self, sql: &str, elapsed_ms: f64, table: Option<&str>) {
        self.capture.record(sql, elapsed_ms, table);
    }

    // ------------------------------------------------------------------
    // Raw escape hatch
    // ------------------------------------------------------------------

    /// Execute a raw SQL batch on the writer.
    ///
    /// This is the single escape hatch around the node layer. It exists for
    /// pragmas and for whitelisted autonomous DDL whose identifiers were
    /// already validated; nothing else may call it.
    pub(crate) fn raw_batch(&self, sql: &str) -> Result<()> {
        let conn = self
            .writer
            .lock()
            .map_err(|_| EngramError::LockPoisoned("storage writer"))?;
        retry(|| conn.execute_batch(sql))
    }

    /// Query a single pragma value as text from both connections, returning
    /// the writer's answer.
    pub(crate) fn pragma_query(&self, name: &str) -> Result<String> {
        let conn = self
            .writer
            .lock()
            .map_err(|_| EngramError::LockPoisoned("storage writer"))?;
        let value: String = conn.query_row(&format!("PRAGMA {name}"), [], |row| {
            // Pragmas answer integers or text depending on the key
            let v: rusqlite::types::Value = row.get(0)?;
            Ok(match v {
                rusqlite::types::Value::Text(s) => s,
                rusqlite::types::Value::Integer(i) => i.to_string(),
                rusqlite::types::Value::Real(r) => r.to_string(),
                _ => String::new(),
            })
        })?;
        Ok(value)
    }

    /// Apply a pragma on both connections.
    pub(crate) fn pragma_update_all(&self, name: &str, value: &str) -> Result<()> {
        for lock in [&self.writer, &self.reader] {
            let conn = lock
                .lock()
                .map_err(|_| EngramError::LockPoisoned("storage connection"))?;
            conn.pragma_update(None, name, value)
                .map_err(EngramError::from_sqlite)?;
        }
        Ok(())
    }
}

/// Table hint for the capture ring, when the node names one.
fn node_table(query: &Query) -> Option<&str> {
    match query {
        Query::Select(q) => Some(q.table.name.as_str()),
        Query::Insert(q) => Some(q.table.name.as_str()),
        Query::Update(q) => Some(q.table.name.as_str()),
        Query::Delete(q) => Some(q.table.name.as_str()),
        Query::CreateTable(q) => Some(q.table.name.as_str()),
        Query::CreateIndex(q) => Some(q.table.name.as_str()),
        Query::DropTable(q) => Some(q.table.name.as_str()),
        Query::AddColumn(q) => Some(q.table.name.as_str()),
        Query::DropColumn(q) => Some(q.table.name.as_str()),
        Query::DropIndex(_) => None,
    }
}

fn retry<T>(mut f: impl FnMut() -> rusqlite::Result<T>) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) => {
                let mapped = EngramError::from_sqlite(err);
                if mapped.is_transient() && attempt < MAX_RETRIES {
                    let delay = BACKOFF_BASE * 2u32.pow(attempt);
                    tracing::debug!(attempt, ?delay, "transient contention, backing off");
                    std::thread::sleep(delay);
                    attempt += 1;
                    continue;
                }
                return Err(mapped);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
