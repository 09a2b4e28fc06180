//! Test Cortex Manager
//!
//! Creates isolated cortex instances for each test to prevent interference.
//! The temporary directory (and the database in it) is deleted when the
//! manager is dropped.

use std::path::PathBuf;
use std::sync::Arc;

use engram_core::{Cortex, EmbeddingFn, EngramConfig};
use tempfile::TempDir;

/// Manager for test cortex instances
///
/// # Example
///
/// ```rust,ignore
/// let t = TestCortex::new_temp();
/// let session = t.cortex.open_session(Some("s1")).unwrap();
/// // Database is deleted when `t` goes out of scope
/// ```
pub struct TestCortex {
    /// The cortex under test
    pub cortex: Cortex,
    /// Path to the database file
    pub db_path: PathBuf,
    /// Temporary directory (kept alive to prevent premature deletion)
    _temp_dir: TempDir,
}

impl TestCortex {
    /// A cortex over a fresh temporary on-disk database.
    pub fn new_temp() -> Self {
        Self::with(|_| {}, None)
    }

    /// A cortex with a config tweak applied before opening.
    pub fn with_config(tweak: impl FnOnce(&mut EngramConfig)) -> Self {
        Self::with(tweak, None)
    }

    /// A cortex with the toy embedder installed.
    pub fn with_embedder(dims: usize) -> Self {
        Self::with(
            move |config| config.agentic.vector.dimensions = dims,
            Some(super::toy_embedder(dims)),
        )
    }

    fn with(tweak: impl FnOnce(&mut EngramConfig), embedder: Option<Arc<EmbeddingFn>>) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let db_path = temp_dir.path().join("engram_test.db");

        let mut config =
            EngramConfig::from_connection_string(&format!("embedded:{}", db_path.display()))
                .expect("connection string");
        tweak(&mut config);

        let mut builder = Cortex::builder(config);
        if let Some(embedder) = embedder {
            builder = builder.embedder(embedder);
        }
        let cortex = builder.build().expect("failed to open test cortex");

        Self { cortex, db_path, _temp_dir: temp_dir }
    }

    /// Re-open a second cortex over the same database file (bootstrap
    /// idempotency / shared-store tests).
    pub fn reopen(&self) -> Cortex {
        Cortex::open(Some(&format!("embedded:{}", self.db_path.display())))
            .expect("failed to reopen cortex")
    }
}
