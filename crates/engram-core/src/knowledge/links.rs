//! Knowledge link graph
//!
//! Directed edges between knowledge items, stored by id only. Cycles are
//! permitted; traversal carries an explicit visited set.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use rusqlite::params;

use crate::error::{EngramError, Result};
use crate::knowledge::types::{row_to_link, KnowledgeLink};
use crate::storage::Storage;

/// Which edge direction to follow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// Edges leaving the node
    Outgoing,
    /// Edges arriving at the node
    Incoming,
}

/// Link operations over an open storage
pub struct LinkGraph {
    storage: Arc<Storage>,
}

impl LinkGraph {
    /// Bind to an open storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Create a directed link. Both endpoints must exist.
    pub fn link(
        &self,
        source_id: i64,
        target_id: i64,
        relationship: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<KnowledgeLink> {
        for id in [source_id, target_id] {
            let exists: i64 = self.storage.with_reader(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM agent_knowledge_base WHERE id = ?1",
                    [id],
                    |row| row.get(0),
                )
            })?;
            if exists == 0 {
                return Err(EngramError::RelationshipNotFound(format!(
                    "knowledge item {id} does not exist"
                )));
            }
        }
        let now = Utc::now().to_rfc3339();
        let meta = metadata.unwrap_or_else(|| serde_json::json!({})).to_string();
        let id = self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_knowledge_links \
                 (source_id, target_id, relationship, metadata, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![source_id, target_id, relationship, meta, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get(id)?.ok_or(EngramError::NotFound { entity: "knowledge link", id })
    }

    /// Fetch one link by id.
    pub fn get(&self, id: i64) -> Result<Option<KnowledgeLink>> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT id, source_id, target_id, relationship, metadata, created_at \
                 FROM agent_knowledge_links WHERE id = ?1",
                [id],
                row_to_link,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    /// Edges of one node in the given direction.
    pub fn links_of(&self, item_id: i64, direction: LinkDirection) -> Result<Vec<KnowledgeLink>> {
        let column = match direction {
            LinkDirection::Outgoing => "source_id",
            LinkDirection::Incoming => "target_id",
        };
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, source_id, target_id, relationship, metadata, created_at \
                 FROM agent_knowledge_links WHERE {column} = ?1 ORDER BY id ASC"
            ))?;
            let rows = stmt
                .query_map([item_id], row_to_link)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Delete a link by id.
    pub fn unlink(&self, id: i64) -> Result<bool> {
        let deleted = self.storage.with_writer(|conn| {
            conn.execute("DELETE FROM agent_knowledge_links WHERE id = ?1", [id])
        })?;
        Ok(deleted > 0)
    }

    /// Breadth-first reachability from `start`, following outgoing edges up
    /// to `max_depth`. Cycle-safe through the visited set; `start` itself is
    /// not returned.
    pub fn traverse(&self, start: i64, max_depth: usize) -> Result<Vec<i64>> {
        let mut visited: HashSet<i64> = HashSet::from([start]);
        let mut order = Vec::new();
        let mut frontier = VecDeque::from([(start, 0usize)]);

        while let Some((node, depth)) = frontier.pop_front() {
            if depth == max_depth {
                continue;
            }
            for link in self.links_of(node, LinkDirection::Outgoing)? {
                if visited.insert(link.target_id) {
                    order.push(link.target_id);
                    frontier.push_back((link.target_id, depth + 1));
                }
            }
        }
        Ok(order)
    }
}

// ============================================================================
// TESTS
// ============================================================================
