//! Test harness
//!
//! Provides isolated cortex instances for testing:
//! - Temporary on-disk databases that are automatically cleaned up
//! - Concurrent test isolation (one directory per instance)
//! - A deterministic toy embedder for semantic-path tests

mod db_manager;

pub use db_manager::TestCortex;

use std::sync::Arc;

use engram_core::EmbeddingFn;

/// Deterministic toy embedding: a character histogram folded into `dims`
/// buckets. Identical normalized text embeds identically, so semantic
/// dedup paths can be exercised without a model.
pub fn toy_embedder(dims: usize) -> Arc<EmbeddingFn> {
    Arc::new(move |text: &str| {
        let mut v = vec![0.0f32; dims];
        for (i, b) in engram_core::normalize_fact(text).bytes().enumerate() {
            v[(b as usize + i) % dims] += 1.0;
        }
        v
    })
}
