//! Knowledge distiller
//!
//! Deduplicating ingestion: a Bloom filter gives a definitive "never seen"
//! fast path; positives fall through to semantic comparison against the
//! vector store (or exact comparison when no embedder is installed). Matches
//! merge by weighted-average confidence; everything else inserts.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::bloom::{normalize_fact, BloomProxy, Fingerprint};
use crate::config::DistillConfig;
use crate::error::{EngramError, Result};
use crate::knowledge::types::{row_to_item, KnowledgeItem, ITEM_COLUMNS};
use crate::storage::Storage;
use crate::vector::VectorStore;

/// Caller-provided embedding function (`text -> vector[D]`).
pub type EmbeddingFn = dyn Fn(&str) -> Vec<f32> + Send + Sync;

/// Lowest alpha a decayed challenge blend can reach
const ALPHA_FLOOR: f64 = 0.1;

// ============================================================================
// OUTCOMES
// ============================================================================

/// How a `distill` call resolved
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DistillDecision {
    /// The Bloom filter proved the fact was never seen; fast-path insert
    InsertedFresh,
    /// Bloom positive, but the comparison disproved it; new item inserted
    InsertedNovel,
    /// Confirmed duplicate; the existing item absorbed the confidence
    Merged {
        /// Distance (semantic) or 0.0 (exact match)
        distance: f32,
    },
}

/// Result of one distillation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistillOutcome {
    /// Surviving knowledge item id
    pub id: i64,
    /// What happened
    pub decision: DistillDecision,
}

/// Options for one distillation
#[derive(Debug, Clone, Default)]
pub struct DistillOptions {
    /// Session that produced the fact
    pub source_session_id: Option<i64>,
    /// Tags stored on insert
    pub tags: Vec<String>,
}

// ============================================================================
// DISTILLER
// ============================================================================

/// Deduplicating knowledge ingestion over Bloom + vector recall
pub struct KnowledgeDistiller {
    storage: Arc<Storage>,
    bloom: Arc<BloomProxy>,
    vectors: Arc<VectorStore>,
    embedder: Option<Arc<EmbeddingFn>>,
    config: DistillConfig,
}

impl KnowledgeDistiller {
    /// Bind to shared storage, Bloom gate, and vector store.
    pub fn new(
        storage: Arc<Storage>,
        bloom: Arc<BloomProxy>,
        vectors: Arc<VectorStore>,
        config: DistillConfig,
    ) -> Self {
        Self { storage, bloom, vectors, embedder: None, config }
    }

    /// Install the caller-provided embedding function.
    pub fn with_embedder(mut self, embedder: Arc<EmbeddingFn>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// The shared Bloom gate (metrics live there).
    pub fn bloom(&self) -> &BloomProxy {
        &self.bloom
    }

    /// Ingest a fact, deduplicating through the Bloom -> vector pipeline.
    pub fn distill(
        &self,
        entity: &str,
        fact: &str,
        confidence: f64,
        options: DistillOptions,
    ) -> Result<DistillOutcome> {
        let confidence = clamp_confidence(confidence);
        let fp = Fingerprint::of(entity, fact);

        if !self.bloom.might_contain(fp) {
            // Definitive miss: ingest without further checks
            let id = self.insert_item(entity, fact, confidence, &options)?;
            self.bloom.insert(fp);
            self.bloom.record_rejection();
            return Ok(DistillOutcome { id, decision: DistillDecision::InsertedFresh });
        }

        // Probably present: semantic comparison decides
        match self.find_duplicate(entity, fact)? {
            Some((existing, distance)) => {
                self.bloom.record_confirmation();
                let merged_confidence = self.config.blend_alpha * existing.confidence
                    + (1.0 - self.config.blend_alpha) * confidence;
                let now = Utc::now().to_rfc3339();
                self.storage.with_writer(|conn| {
                    conn.execute(
                        "UPDATE agent_knowledge_base SET confidence = ?1, updated_at = ?2 WHERE id = ?3",
                        params![merged_confidence, now, existing.id],
                    )
                })?;
                Ok(DistillOutcome { id: existing.id, decision: DistillDecision::Merged { distance } })
            }
            None => {
                self.bloom.record_false_positive();
                let id = self.insert_item(entity, fact, confidence, &options)?;
                self.bloom.insert(fp);
                Ok(DistillOutcome { id, decision: DistillDecision::InsertedNovel })
            }
        }
    }

    /// Challenge existing knowledge with new evidence.
    ///
    /// Blends `c' = alpha * c_old + (1 - alpha) * new_confidence` where alpha
    /// starts at the configured blend and decays multiplicatively per
    /// successive challenge of the same item (floored). A reflection entry is
    /// scheduled against the item's source session.
    pub fn challenge(&self, entity: &str, evidence: &str, new_confidence: f64) -> Result<KnowledgeItem> {
        let new_confidence = clamp_confidence(new_confidence);
        let item = self
            .find_duplicate(entity, evidence)?
            .map(|(item, _)| item)
            .or_else(|| self.latest_for_entity(entity).ok().flatten())
            .ok_or_else(|| EngramError::RelationshipNotFound(format!("no knowledge for entity {entity}")))?;

        let alpha = (self.config.blend_alpha
            * self.config.alpha_decay.powi(item.challenge_count as i32))
        .max(ALPHA_FLOOR);
        let blended = alpha * item.confidence + (1.0 - alpha) * new_confidence;
        let now = Utc::now().to_rfc3339();

        self.storage.transaction(|tx| {
            tx.execute(
                "UPDATE agent_knowledge_base \
                 SET confidence = ?1, challenge_count = challenge_count + 1, updated_at = ?2 \
                 WHERE id = ?3",
                params![blended, now, item.id],
            )?;
            tx.execute(
                "INSERT INTO agent_reflections \
                 (session_id, outcome, lessons_learned, suggested_actions, created_at) \
                 VALUES (?1, ?2, ?3, '[]', ?4)",
                params![
                    item.source_session_id,
                    format!("knowledge challenged: {entity}"),
                    serde_json::json!([format!(
                        "confidence moved {:.3} -> {:.3} on new evidence",
                        item.confidence, blended
                    )])
                    .to_string(),
                    now
                ],
            )?;
            Ok(())
        })?;

        self.get(item.id)?.ok_or(EngramError::NotFound { entity: "knowledge item", id: item.id })
    }

    /// Fetch one item by id.
    pub fn get(&self, id: i64) -> Result<Option<KnowledgeItem>> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM agent_knowledge_base WHERE id = ?1"),
                [id],
                row_to_item,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    /// Items about an entity, newest update first.
    pub fn for_entity(&self, entity: &str) -> Result<Vec<KnowledgeItem>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ITEM_COLUMNS} FROM agent_knowledge_base \
                 WHERE entity = ?1 ORDER BY updated_at DESC, id DESC"
            ))?;
            let rows = stmt
                .query_map([entity], row_to_item)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Total stored items.
    pub fn count(&self) -> Result<i64> {
        self.storage
            .with_reader(|conn| conn.query_row("SELECT COUNT(*) FROM agent_knowledge_base", [], |r| r.get(0)))
    }

    /// Prune low-confidence items older than `min_age_days`. Returns how
    /// many were removed (links cascade).
    pub fn prune(&self, confidence_below: f64, min_age_days: i64) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::days(min_age_days)).to_rfc3339();
        let removed = self.storage.with_writer(|conn| {
            conn.execute(
                "DELETE FROM agent_knowledge_base WHERE confidence < ?1 AND updated_at < ?2",
                params![confidence_below, cutoff],
            )
        })?;
        if removed > 0 {
            tracing::info!(removed, "low-confidence knowledge pruned");
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn insert_item(
        &self,
        entity: &str,
        fact: &str,
        confidence: f64,
        options: &DistillOptions,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let tags = serde_json::to_string(&options.tags)?;
        let id = self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_knowledge_base \
                 (entity, fact, confidence, source_session_id, tags, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![entity, fact, confidence, options.source_session_id, tags, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        // Mirror into the vector store so future positives can be compared
        if let Some(embedder) = &self.embedder {
            let embedding = embedder(fact);
            match self.vectors.insert(
                fact,
                &embedding,
                options.source_session_id,
                serde_json::json!({ "knowledgeId": id, "entity": entity }),
            ) {
                Ok(_) => {}
                Err(EngramError::VectorDimensionMismatch { .. }) => {
                    return Err(EngramError::VectorDimensionMismatch {
                        expected: self.vectors.dimensions(),
                        got: embedding.len(),
                    });
                }
                Err(other) => return Err(other),
            }
        }
        Ok(id)
    }

    /// Locate a semantic (or exact) duplicate of the fact under the entity.
    fn find_duplicate(&self, entity: &str, fact: &str) -> Result<Option<(KnowledgeItem, f32)>> {
        if let Some(embedder) = &self.embedder {
            let embedding = embedder(fact);
            let matches = self.vectors.search(&embedding, 5, None)?;
            for m in matches {
                if m.distance > self.config.dup_threshold {
                    break;
                }
                if m.record.metadata["entity"] != entity {
                    continue;
                }
                if let Some(id) = m.record.metadata["knowledgeId"].as_i64() {
                    if let Some(item) = self.get(id)? {
                        return Ok(Some((item, m.distance)));
                    }
                }
            }
            return Ok(None);
        }

        // Structural fallback: exact match on the normalized fact
        let wanted = normalize_fact(fact);
        let item = self
            .for_entity(entity)?
            .into_iter()
            .find(|item| normalize_fact(&item.fact) == wanted);
        Ok(item.map(|item| (item, 0.0)))
    }

    fn latest_for_entity(&self, entity: &str) -> Result<Option<KnowledgeItem>> {
        Ok(self.for_entity(entity)?.into_iter().next())
    }
}

fn clamp_confidence(confidence: f64) -> f64 {
    if !(0.0..=1.0).contains(&confidence) {
        tracing::warn!(confidence, "confidence clamped to [0, 1]");
    }
    confidence.clamp(0.0, 1.0)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionSettings, DistanceMetric, OptimizationConfig, VectorConfig};
    use crate::storage::bootstrap;

    fn distiller(embedder: bool) -> KnowledgeDistiller {
        let storage = Arc::new(
            Storage::open(
                &ConnectionSettings::Embedded { path: None },
                &OptimizationConfig::default(),
            )
            .unwrap(),
        );
        bootstrap(&storage).unwrap();
        let vectors = Arc::new(
            VectorStore::new(
                storage.clone(),
                VectorConfig { dimensions: 8, metric: DistanceMetric::Cosine, ..Default::default() },
            )
            .unwrap(),
        );
        let d = KnowledgeDistiller::new(
            storage,
            Arc::new(BloomProxy::new(10_000, 0.01)),
            vectors,
            DistillConfig::default(),
        );
        if embedder {
            d.with_embedder(Arc::new(toy_embedder))
        } else {
            d
        }
    }

    /// Deterministic toy embedding: 8 buckets of character histogram
    fn toy_embedder(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 8];
        for (i, c) in normalize_fact(text).bytes().enumerate() {
            v[(c as usize + i) % 8] += 1.0;
        }
        v
    }

    #[test]
    fn first_distill_is_a_bloom_fast_path() {
        let d = distiller(false);
        let outcome = d
            .distill("arch", "WAL is 3x faster", 0.9, DistillOptions::default())
            .unwrap();
        assert_eq!(outcome.decision, DistillDecision::InsertedFresh);
        assert_eq!(d.bloom().metrics().bloom_rejections, 1);
        assert_eq!(d.count().unwrap(), 1);
    }

    #[test]
    fn identical_distill_merges_into_one_item() {
        let d = distiller(false);
        let first = d.distill("arch", "WAL is 3x faster", 0.9, DistillOptions::default()).unwrap();
        let second = d.distill("arch", "WAL is 3x faster", 0.9, DistillOptions::default()).unwrap();

        assert_eq!(first.id, second.id);
        assert!(matches!(second.decision, DistillDecision::Merged { .. }));
        assert_eq!(d.count().unwrap(), 1);

        let metrics = d.bloom().metrics();
        assert!(metrics.bloom_rejections >= 1 || metrics.semantic_confirmations == 1);

        // Confidence unchanged (weighted toward the same 0.9)
        let item = d.get(first.id).unwrap().unwrap();
        assert!((item.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn formatting_differences_still_merge() {
        let d = distiller(false);
        let first = d.distill("arch", "WAL is 3x faster", 0.8, DistillOptions::default()).unwrap();
        let second = d.distill("arch", "  wal   IS 3x FASTER ", 0.9, DistillOptions::default()).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(d.count().unwrap(), 1);
        let item = d.get(first.id).unwrap().unwrap();
        // 0.7 * 0.8 + 0.3 * 0.9, monotone toward the new evidence
        assert!(item.confidence > 0.8 && item.confidence < 0.9);
    }

    #[test]
    fn different_facts_stay_distinct() {
        let d = distiller(false);
        let a = d.distill("arch", "WAL is faster", 0.9, DistillOptions::default()).unwrap();
        let b = d.distill("arch", "fsync is expensive", 0.9, DistillOptions::default()).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(d.count().unwrap(), 2);
    }

    #[test]
    fn semantic_merge_through_embedder() {
        let d = distiller(true);
        let first = d.distill("arch", "WAL is 3x faster", 0.9, DistillOptions::default()).unwrap();
        // Same normalized content embeds identically -> distance 0
        let second = d.distill("arch", "wal is 3x faster", 0.9, DistillOptions::default()).unwrap();
        assert_eq!(first.id, second.id);
        match second.decision {
            DistillDecision::Merged { distance } => assert!(distance <= 0.15),
            other => panic!("expected merge, got {other:?}"),
        }
        assert_eq!(d.bloom().metrics().semantic_confirmations, 1);
    }

    #[test]
    fn confidence_is_clamped() {
        let d = distiller(false);
        let outcome = d.distill("e", "f", 7.5, DistillOptions::default()).unwrap();
        assert_eq!(d.get(outcome.id).unwrap().unwrap().confidence, 1.0);
    }

    #[test]
    fn challenge_blends_and_decays_alpha() {
        let d = distiller(false);
        let outcome = d.distill("arch", "WAL is faster", 1.0, DistillOptions::default()).unwrap();

        // First challenge: alpha = 0.7
        let item = d.challenge("arch", "WAL is faster", 0.0).unwrap();
        assert!((item.confidence - 0.7).abs() < 1e-9);
        assert_eq!(item.challenge_count, 1);

        // Second challenge: alpha = 0.7 * 0.9 = 0.63
        let item = d.challenge("arch", "WAL is faster", 0.0).unwrap();
        assert!((item.confidence - 0.7 * 0.63).abs() < 1e-6);
        assert_eq!(item.challenge_count, 2);

        // Reflection entries were scheduled
        let reflections: i64 = d
            .storage
            .with_reader(|conn| conn.query_row("SELECT COUNT(*) FROM agent_reflections", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(reflections, 2);
        assert_eq!(outcome.decision, DistillDecision::InsertedFresh);
    }

    #[test]
    fn challenge_unknown_entity_fails() {
        let d = distiller(false);
        let err = d.challenge("ghost", "anything", 0.5);
        assert!(matches!(err, Err(EngramError::RelationshipNotFound(_))));
    }

    #[test]
    fn prune_removes_stale_low_confidence() {
        let d = distiller(false);
        d.distill("e", "weak fact", 0.05, DistillOptions::default()).unwrap();
        d.distill("e", "strong fact", 0.95, DistillOptions::default()).unwrap();
        // Age the rows
        d.storage
            .with_writer(|conn| {
                conn.execute(
                    "UPDATE agent_knowledge_base SET updated_at = '2020-01-01T00:00:00+00:00'",
                    [],
                )
            })
            .unwrap();
        let removed = d.prune(0.1, 30).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(d.count().unwrap(), 1);
    }
}
