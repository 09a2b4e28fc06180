//! Knowledge row types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One knowledge fact. Uniqueness is semantic, enforced by the distiller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeItem {
    /// Row id
    pub id: i64,
    /// Subject the fact is about
    pub entity: String,
    /// The fact itself
    pub fact: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Session that produced the fact, when known
    pub source_session_id: Option<i64>,
    /// Tags
    pub tags: Vec<String>,
    /// JSON metadata
    pub metadata: serde_json::Value,
    /// Number of challenges this item absorbed (drives alpha decay)
    pub challenge_count: i64,
    /// Insertion time
    pub created_at: DateTime<Utc>,
    /// Last confidence or content update
    pub updated_at: DateTime<Utc>,
}

/// A directed edge between two knowledge items. Cycles are permitted;
/// traversal uses explicit visited sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeLink {
    /// Row id
    pub id: i64,
    /// Edge source
    pub source_id: i64,
    /// Edge target
    pub target_id: i64,
    /// Relationship label
    pub relationship: String,
    /// JSON metadata
    pub metadata: serde_json::Value,
    /// Insertion time
    pub created_at: DateTime<Utc>,
}

pub(crate) fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeItem> {
    let tags: String = row.get(5)?;
    let meta: String = row.get(6)?;
    let created: String = row.get(8)?;
    let updated: String = row.get(9)?;
    Ok(KnowledgeItem {
        id: row.get(0)?,
        entity: row.get(1)?,
        fact: row.get(2)?,
        confidence: row.get(3)?,
        source_session_id: row.get(4)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        metadata: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
        challenge_count: row.get(7)?,
        created_at: created.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: updated.parse().unwrap_or_else(|_| Utc::now()),
    })
}

pub(crate) const ITEM_COLUMNS: &str = "id, entity, fact, confidence, source_session_id, tags, \
                                       metadata, challenge_count, created_at, updated_at";

pub(crate) fn row_to_link(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeLink> {
    let meta: String = row.get(4)?;
    let created: String = row.get(5)?;
    Ok(KnowledgeLink {
        id: row.get(0)?,
        source_id: row.get(1)?,
        target_id: row.get(2)?,
        relationship: row.get(3)?,
        metadata: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
        created_at: created.parse().unwrap_or_else(|_| Utc::now()),
    })
}
