//! Vector indexer
//!
//! Stores `(id, content, embedding, metadata)` rows with the embedding as a
//! little-endian f32 blob. The dimension is fixed at initialization;
//! inserting a mismatched vector fails with `VectorDimensionMismatch`.
//!
//! Retrieval is top-N nearest by the configured metric (L2 default, cosine
//! optional). The embedded engine has no native vector indexes, so the
//! baseline is a linear scan bounded by `scan_cap` and cooperative with the
//! caller's deadline. The optional `vector-search` feature drops in an HNSW
//! accelerator with the same contract.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{DistanceMetric, VectorConfig};
use crate::error::{EngramError, Result};
use crate::storage::Storage;

// ============================================================================
// EMBEDDING CODEC
// ============================================================================

/// Encode an embedding as a little-endian f32 blob.
pub fn embedding_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a little-endian f32 blob. Returns `None` on ragged input.
pub fn embedding_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Squared-root Euclidean distance.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Cosine distance (`1 - similarity`); zero vectors are maximally distant.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - (dot / (norm_a * norm_b))
}

impl DistanceMetric {
    /// Distance between two equal-length vectors.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::L2 => l2_distance(a, b),
            DistanceMetric::Cosine => cosine_distance(a, b),
        }
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// One stored vector row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorRecord {
    /// Row id
    pub id: i64,
    /// Owning session, when any
    pub session_id: Option<i64>,
    /// Source text
    pub content: String,
    /// The embedding
    pub embedding: Vec<f32>,
    /// JSON metadata
    pub metadata: serde_json::Value,
    /// Insertion time
    pub created_at: DateTime<Utc>,
}

/// One nearest-neighbour result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorMatch {
    /// Matched row
    pub record: VectorRecord,
    /// Distance under the configured metric (smaller is closer)
    pub distance: f32,
}

// ============================================================================
// STORE
// ============================================================================

/// Vector rows over `agent_memories` with dimension enforcement
pub struct VectorStore {
    storage: Arc<Storage>,
    config: VectorConfig,
    #[cfg(feature = "vector-search")]
    ann: std::sync::Mutex<ann::AnnIndex>,
}

impl VectorStore {
    /// Bind to an open storage with the given vector configuration.
    pub fn new(storage: Arc<Storage>, config: VectorConfig) -> Result<Self> {
        #[cfg(feature = "vector-search")]
        let ann = std::sync::Mutex::new(ann::AnnIndex::new(&config)?);
        Ok(Self {
            storage,
            config,
            #[cfg(feature = "vector-search")]
            ann,
        })
    }

    /// Configured dimension.
    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.dimensions {
            return Err(EngramError::VectorDimensionMismatch {
                expected: self.config.dimensions,
                got: vector.len(),
            });
        }
        Ok(())
    }

    /// Insert a vector row.
    pub fn insert(
        &self,
        content: &str,
        embedding: &[f32],
        session_id: Option<i64>,
        metadata: serde_json::Value,
    ) -> Result<i64> {
        self.check_dimensions(embedding)?;
        let blob = embedding_to_bytes(embedding);
        let now = Utc::now().to_rfc3339();
        let dims = self.config.dimensions as i64;
        let meta = metadata.to_string();
        let id = self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_memories (session_id, content, embedding, dimensions, metadata, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![session_id, content, blob, dims, meta, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        #[cfg(feature = "vector-search")]
        if let Ok(mut ann) = self.ann.lock() {
            if let Err(e) = ann.add(id, embedding) {
                tracing::warn!(id, "ann index add failed, falling back to scans: {e}");
            }
        }

        Ok(id)
    }

    /// Fetch one row by id.
    pub fn get(&self, id: i64) -> Result<Option<VectorRecord>> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT id, session_id, content, embedding, metadata, created_at \
                 FROM agent_memories WHERE id = ?1",
                [id],
                row_to_record,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    /// Delete one row by id. Returns whether it existed.
    pub fn delete(&self, id: i64) -> Result<bool> {
        let deleted = self
            .storage
            .with_writer(|conn| conn.execute("DELETE FROM agent_memories WHERE id = ?1", [id]))?;
        #[cfg(feature = "vector-search")]
        if deleted > 0 {
            if let Ok(mut ann) = self.ann.lock() {
                let _ = ann.remove(id);
            }
        }
        Ok(deleted > 0)
    }

    /// Stored row count.
    pub fn count(&self) -> Result<i64> {
        self.storage
            .with_reader(|conn| conn.query_row("SELECT COUNT(*) FROM agent_memories", [], |r| r.get(0)))
    }

    /// Top-N nearest rows by the configured metric.
    ///
    /// The scan visits at most `scan_cap` rows (newest first) and honors the
    /// deadline cooperatively; on expiry it fails with `Timeout` having
    /// written nothing.
    pub fn search(
        &self,
        query: &[f32],
        top_n: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<VectorMatch>> {
        self.check_dimensions(query)?;
        if top_n == 0 {
            return Ok(Vec::new());
        }

        #[cfg(feature = "vector-search")]
        {
            if let Ok(ann) = self.ann.lock() {
                if let Some(hits) = ann.search(query, top_n)? {
                    let mut matches = Vec::with_capacity(hits.len());
                    for (id, distance) in hits {
                        if let Some(record) = self.get(id)? {
                            matches.push(VectorMatch { record, distance });
                        }
                    }
                    return Ok(matches);
                }
            }
        }

        self.linear_scan(query, top_n, deadline)
    }

    fn linear_scan(
        &self,
        query: &[f32],
        top_n: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<VectorMatch>> {
        let cap = self.config.scan_cap.max(top_n) as i64;
        let rows: Vec<VectorRecord> = self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, content, embedding, metadata, created_at \
                 FROM agent_memories ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([cap], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut matches = Vec::with_capacity(rows.len().min(top_n * 2));
        for (i, record) in rows.into_iter().enumerate() {
            if i % 256 == 0 {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return Err(EngramError::Timeout { operation: "vector scan" });
                    }
                }
            }
            if record.embedding.len() != query.len() {
                continue;
            }
            let distance = self.config.metric.distance(query, &record.embedding);
            matches.push(VectorMatch { record, distance });
        }
        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        matches.truncate(top_n);
        Ok(matches)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<VectorRecord> {
    let blob: Vec<u8> = row.get(3)?;
    let meta: String = row.get(4)?;
    let created: String = row.get(5)?;
    Ok(VectorRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        content: row.get(2)?,
        embedding: embedding_from_bytes(&blob).unwrap_or_default(),
        metadata: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
        created_at: created.parse().unwrap_or_else(|_| Utc::now()),
    })
}

// ============================================================================
// OPTIONAL ANN ACCELERATOR
// ============================================================================

#[cfg(feature = "vector-search")]
mod ann {
    //! HNSW accelerator with the same nearest-neighbour contract as the
    //! bounded scan. Falls back to `None` on any index-side failure so the
    //! store can degrade to scanning.

    use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

    use crate::config::{DistanceMetric, VectorConfig};
    use crate::error::{EngramError, Result};

    pub struct AnnIndex {
        index: Index,
    }

    impl AnnIndex {
        pub fn new(config: &VectorConfig) -> Result<Self> {
            let options = IndexOptions {
                dimensions: config.dimensions,
                metric: match config.metric {
                    DistanceMetric::L2 => MetricKind::L2sq,
                    DistanceMetric::Cosine => MetricKind::Cos,
                },
                quantization: ScalarKind::F32,
                connectivity: 16,
                expansion_add: 128,
                expansion_search: 64,
                multi: false,
            };
            let index = Index::new(&options)
                .map_err(|e| EngramError::Config(format!("ann index creation failed: {e}")))?;
            Ok(Self { index })
        }

        pub fn add(&mut self, id: i64, vector: &[f32]) -> Result<()> {
            if self.index.size() >= self.index.capacity() {
                let new_capacity = (self.index.capacity() * 2).max(16);
                self.index
                    .reserve(new_capacity)
                    .map_err(|e| EngramError::Config(format!("ann reserve failed: {e}")))?;
            }
            self.index
                .add(id as u64, vector)
                .map_err(|e| EngramError::Config(format!("ann add failed: {e}")))?;
            Ok(())
        }

        pub fn remove(&mut self, id: i64) -> Result<()> {
            self.index
                .remove(id as u64)
                .map_err(|e| EngramError::Config(format!("ann remove failed: {e}")))?;
            Ok(())
        }

        /// `None` means the caller should fall back to the linear scan.
        pub fn search(&self, query: &[f32], top_n: usize) -> Result<Option<Vec<(i64, f32)>>> {
            if self.index.size() == 0 {
                return Ok(Some(Vec::new()));
            }
            match self.index.search(query, top_n) {
                Ok(results) => Ok(Some(
                    results
                        .keys
                        .iter()
                        .zip(results.distances.iter())
                        .map(|(k, d)| (*k as i64, *d))
                        .collect(),
                )),
                Err(_) => Ok(None),
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionSettings, OptimizationConfig};
    use crate::storage::bootstrap;

    fn store(dimensions: usize, metric: DistanceMetric) -> VectorStore {
        let storage = Arc::new(
            Storage::open(
                &ConnectionSettings::Embedded { path: None },
                &OptimizationConfig::default(),
            )
            .unwrap(),
        );
        bootstrap(&storage).unwrap();
        let config = VectorConfig { dimensions, metric, ..Default::default() };
        VectorStore::new(storage, config).unwrap()
    }

    #[test]
    fn codec_roundtrip() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(embedding_from_bytes(&embedding_to_bytes(&v)).unwrap(), v);
        assert!(embedding_from_bytes(&[1, 2, 3]).is_none());
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let store = store(4, DistanceMetric::L2);
        let err = store.insert("x", &[1.0, 2.0], None, serde_json::json!({}));
        assert!(matches!(
            err,
            Err(EngramError::VectorDimensionMismatch { expected: 4, got: 2 })
        ));
        let err = store.search(&[1.0; 3], 5, None);
        assert!(matches!(err, Err(EngramError::VectorDimensionMismatch { .. })));
    }

    #[test]
    fn stored_embeddings_keep_their_dimension() {
        let store = store(3, DistanceMetric::L2);
        let id = store
            .insert("hello", &[1.0, 0.0, 0.0], None, serde_json::json!({"k": 1}))
            .unwrap();
        let record = store.get(id).unwrap().unwrap();
        assert_eq!(record.embedding.len(), 3);
        assert_eq!(record.content, "hello");
        assert_eq!(record.metadata["k"], 1);
    }

    #[test]
    fn l2_search_orders_by_distance() {
        let store = store(3, DistanceMetric::L2);
        store.insert("near", &[1.0, 0.0, 0.0], None, serde_json::json!({})).unwrap();
        store.insert("far", &[10.0, 10.0, 10.0], None, serde_json::json!({})).unwrap();
        store.insert("nearest", &[0.9, 0.1, 0.0], None, serde_json::json!({})).unwrap();

        let matches = store.search(&[1.0, 0.0, 0.0], 2, None).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].record.content, "near");
        assert_eq!(matches[1].record.content, "nearest");
        assert!(matches[0].distance <= matches[1].distance);
    }

    #[test]
    fn cosine_ignores_magnitude() {
        let store = store(2, DistanceMetric::Cosine);
        store.insert("same direction", &[10.0, 0.0], None, serde_json::json!({})).unwrap();
        store.insert("orthogonal", &[0.0, 1.0], None, serde_json::json!({})).unwrap();

        let matches = store.search(&[1.0, 0.0], 2, None).unwrap();
        assert_eq!(matches[0].record.content, "same direction");
        assert!(matches[0].distance < 1e-5);
        assert!((matches[1].distance - 1.0).abs() < 1e-5);
    }

    #[test]
    fn expired_deadline_times_out() {
        let store = store(2, DistanceMetric::L2);
        store.insert("x", &[0.0, 0.0], None, serde_json::json!({})).unwrap();
        let past = Instant::now() - std::time::Duration::from_millis(1);
        let err = store.search(&[0.0, 0.0], 1, Some(past));
        assert!(matches!(err, Err(EngramError::Timeout { operation: "vector scan" })));
    }

    #[test]
    fn delete_removes_row() {
        let store = store(2, DistanceMetric::L2);
        let id = store.insert("x", &[0.0, 1.0], None, serde_json::json!({})).unwrap();
        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn zero_vector_cosine_is_max_distance() {
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }
}
