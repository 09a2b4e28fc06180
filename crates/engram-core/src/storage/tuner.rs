//! Storage tuner
//!
//! Idempotent pragma management. A default profile (WAL, foreign keys,
//! 64 MiB page cache, synchronous=NORMAL, temp_store=MEMORY) is applied at
//! startup unless configuration disables it. In-memory stores cannot use WAL;
//! the request is skipped with a warning.

use crate::config::{OptimizationConfig, SynchronousLevel, TempStore};
use crate::error::Result;
use crate::storage::Storage;

/// Pragma manager over an open storage
pub struct StorageTuner<'a> {
    storage: &'a Storage,
}

impl<'a> StorageTuner<'a> {
    /// Wrap an open storage.
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Apply a full tuning profile. Safe to call repeatedly.
    pub fn apply_profile(&self, profile: &OptimizationConfig) -> Result<()> {
        if profile.wal {
            self.enable_wal()?;
        }
        if profile.foreign_keys {
            self.enable_foreign_keys()?;
        }
        self.set_cache(profile.cache_size_kib_neg)?;
        self.set_synchronous(profile.synchronous)?;
        self.set_temp_store(profile.temp_store)?;
        tracing::info!(
            wal = profile.wal,
            foreign_keys = profile.foreign_keys,
            cache_kib = profile.cache_size_kib_neg,
            synchronous = profile.synchronous.as_str(),
            "storage tuning profile applied"
        );
        Ok(())
    }

    /// Switch journaling to write-ahead logging.
    ///
    /// In-memory stores only support MEMORY journaling; the request is
    /// skipped with a warning rather than failing startup.
    pub fn enable_wal(&self) -> Result<()> {
        if self.storage.target().is_memory() {
            tracing::warn!("WAL unavailable for in-memory store, skipping");
            return Ok(());
        }
        self.storage.pragma_update_all("journal_mode", "WAL")?;
        Ok(())
    }

    /// Current journal mode, lowercase ("wal", "memory", ...).
    pub fn journal_mode(&self) -> Result<String> {
        Ok(self.storage.pragma_query("journal_mode")?.to_lowercase())
    }

    /// Enforce foreign keys on every connection.
    pub fn enable_foreign_keys(&self) -> Result<()> {
        self.storage.pragma_update_all("foreign_keys", "ON")
    }

    /// Set the page-cache size. Negative values are KiB per SQLite
    /// convention (-65536 = 64 MiB).
    pub fn set_cache(&self, kib_negative: i64) -> Result<()> {
        self.storage
            .pragma_update_all("cache_size", &kib_negative.to_string())
    }

    /// Set the fsync level.
    pub fn set_synchronous(&self, level: SynchronousLevel) -> Result<()> {
        self.storage.pragma_update_all("synchronous", level.as_str())
    }

    /// Set temp-table placement.
    pub fn set_temp_store(&self, mode: TempStore) -> Result<()> {
        self.storage.pragma_update_all("temp_store", mode.as_str())
    }

    /// Refresh planner statistics.
    pub fn analyze(&self) -> Result<()> {
        self.storage.raw_batch("ANALYZE;")
    }

    /// Rewrite the database file, reclaiming free pages.
    ///
    /// Cannot run inside a transaction; callers must not hold one.
    pub fn vacuum(&self) -> Result<()> {
        self.storage.raw_batch("VACUUM;")
    }
}

// ============================================================================
// TESTS
// ============================================================================
