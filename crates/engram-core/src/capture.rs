//! Query capture & auto-indexer
//!
//! Executed statements are recorded into a bounded in-memory ring (never
//! persisted). The advisor periodically analyzes the ring against the
//! introspected schema and produces index recommendations:
//!
//! - `WHERE col = ?` on an un-indexed column -> medium
//! - `JOIN ... ON a.x = b.y` where the join key lacks an index -> high
//! - `ORDER BY col` with `LIMIT` and no index on col -> medium
//! - `GROUP BY c1, c2, ...` -> composite prefix recommendation
//!
//! Duplicate recommendations merge; the highest priority wins.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sql::CreateIndex;
use crate::storage::SchemaSnapshot;

/// Default ring capacity
pub const DEFAULT_RING_CAPACITY: usize = 1_000;

// ============================================================================
// CAPTURED STATEMENTS
// ============================================================================

/// One recorded statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedQuery {
    /// Normalized SQL (literals replaced, whitespace collapsed, lowercased)
    pub sql: String,
    /// Wall-clock execution time
    pub execution_time_ms: f64,
    /// Table hint supplied by the executor, when known
    pub table: Option<String>,
}

/// Bounded ring of executed statements, safe for concurrent use.
///
/// The lock is held only for the O(1) push, never across I/O.
pub struct QueryCapture {
    ring: Mutex<VecDeque<CapturedQuery>>,
    capacity: usize,
}

impl Default for QueryCapture {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }
}

impl QueryCapture {
    /// Ring with an explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { ring: Mutex::new(VecDeque::with_capacity(capacity.max(1))), capacity: capacity.max(1) }
    }

    /// Record a statement. The oldest entry falls off past capacity.
    pub fn record(&self, sql: &str, execution_time_ms: f64, table: Option<&str>) {
        let entry = CapturedQuery {
            sql: normalize_sql(sql),
            execution_time_ms,
            table: table.map(str::to_string),
        };
        let mut ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    /// Entries currently held.
    pub fn len(&self) -> usize {
        self.ring.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// True when nothing was recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the ring, oldest first.
    pub fn snapshot(&self) -> Vec<CapturedQuery> {
        self.ring.lock().unwrap_or_else(|p| p.into_inner()).iter().cloned().collect()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.ring.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

/// Normalize SQL for capture: single-quoted strings and numeric literals
/// become `?`, identifier quotes are stripped, whitespace collapses, and
/// everything lowercases.
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut pending_space = false;
    let mut prev_ident = false;

    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            pending_space = true;
            prev_ident = false;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;

        match c {
            '\'' => {
                // String literal, '' escapes a quote
                loop {
                    match chars.next() {
                        Some('\'') => {
                            if chars.peek() == Some(&'\'') {
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                out.push('?');
                prev_ident = false;
            }
            '"' => {
                // Identifier quoting is an encoding detail
                prev_ident = true;
            }
            '0'..='9' if !prev_ident => {
                while chars.peek().is_some_and(|n| n.is_ascii_digit() || *n == '.') {
                    chars.next();
                }
                out.push('?');
            }
            _ => {
                for lower in c.to_lowercase() {
                    out.push(lower);
                }
                prev_ident = c.is_ascii_alphanumeric() || c == '_' || c == '.';
            }
        }
    }
    out
}

// ============================================================================
// RECOMMENDATIONS
// ============================================================================

/// Recommendation urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Nice to have
    Low,
    /// Worth creating soon
    Medium,
    /// Hot path is scanning
    High,
}

/// Index structure to create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Ordinary ordered index
    Btree,
    /// Hash index (networked engines only; embedded falls back to btree)
    Hash,
    /// Unique index
    Unique,
}

/// One recommended index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRecommendation {
    /// Target table
    pub table: String,
    /// Indexed columns in order
    pub columns: Vec<String>,
    /// Index structure
    pub kind: IndexKind,
    /// Human-readable rationale
    pub reason: String,
    /// Urgency
    pub priority: Priority,
    /// Total captured milliseconds the index would have served
    pub estimated_gain: f64,
}

impl IndexRecommendation {
    /// Conventional index name: `idx_<table-sans-prefix>_<cols>`.
    pub fn index_name(&self) -> String {
        let table = self.table.strip_prefix("agent_").unwrap_or(&self.table);
        format!("idx_{}_{}", table, self.columns.join("_"))
    }

    /// The recommendation as a validated operation node.
    ///
    /// Table and column names originate in captured production SQL, so they
    /// re-enter the safety pipeline here; a name that fails identifier
    /// validation fails the conversion.
    pub fn to_create_index(&self) -> Result<CreateIndex> {
        let mut node =
            CreateIndex::new(self.index_name(), self.table.clone(), self.columns.iter().cloned())?;
        node.unique = self.kind == IndexKind::Unique;
        Ok(node)
    }
}

// ============================================================================
// ADVISOR
// ============================================================================

/// Analyzes captured statements against the current schema
pub struct IndexAdvisor;

impl IndexAdvisor {
    /// Produce deduplicated recommendations, highest priority first.
    pub fn analyze(queries: &[CapturedQuery], schema: &SchemaSnapshot) -> Vec<IndexRecommendation> {
        let mut merged: HashMap<(String, Vec<String>), IndexRecommendation> = HashMap::new();
        let mut push = |rec: IndexRecommendation| {
            let key = (rec.table.clone(), rec.columns.clone());
            merged
                .entry(key)
                .and_modify(|existing| {
                    existing.estimated_gain += rec.estimated_gain;
                    if rec.priority > existing.priority {
                        existing.priority = rec.priority;
                        existing.reason = rec.reason.clone();
                    }
                })
                .or_insert(rec);
        };

        for q in queries {
            let table = q.table.clone().or_else(|| first_table(&q.sql));
            let Some(table) = table else { continue };
            if schema.table(&table).is_none() {
                continue;
            }

            for col in where_eq_columns(&q.sql) {
                if column_exists(schema, &table, &col) && !schema.has_leading_index(&table, &col) {
                    push(IndexRecommendation {
                        table: table.clone(),
                        columns: vec![col.clone()],
                        kind: IndexKind::Btree,
                        reason: format!("equality filter on {table}.{col} without a usable index"),
                        priority: Priority::Medium,
                        estimated_gain: q.execution_time_ms,
                    });
                }
            }

            for (join_table, join_col) in join_key_columns(&q.sql) {
                if schema.table(&join_table).is_some()
                    && column_exists(schema, &join_table, &join_col)
                    && !schema.has_leading_index(&join_table, &join_col)
                {
                    push(IndexRecommendation {
                        table: join_table.clone(),
                        columns: vec![join_col.clone()],
                        kind: IndexKind::Btree,
                        reason: format!("join key {join_table}.{join_col} lacks an index"),
                        priority: Priority::High,
                        estimated_gain: q.execution_time_ms,
                    });
                }
            }

            if let Some(col) = order_by_with_limit(&q.sql) {
                if column_exists(schema, &table, &col) && !schema.has_leading_index(&table, &col) {
                    push(IndexRecommendation {
                        table: table.clone(),
                        columns: vec![col.clone()],
                        kind: IndexKind::Btree,
                        reason: format!("ORDER BY {col} with LIMIT scans without an index"),
                        priority: Priority::Medium,
                        estimated_gain: q.execution_time_ms,
                    });
                }
            }

            let group_cols = group_by_columns(&q.sql);
            if group_cols.len() >= 2
                && group_cols.iter().all(|c| column_exists(schema, &table, c))
                && !has_prefix_index(schema, &table, &group_cols)
            {
                push(IndexRecommendation {
                    table: table.clone(),
                    columns: group_cols.clone(),
                    kind: IndexKind::Btree,
                    reason: format!("GROUP BY ({}) would be served by a composite index", group_cols.join(", ")),
                    priority: Priority::Medium,
                    estimated_gain: q.execution_time_ms,
                });
            }
        }

        let mut recommendations: Vec<IndexRecommendation> = merged.into_values().collect();
        recommendations.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.estimated_gain.total_cmp(&a.estimated_gain))
                .then(a.table.cmp(&b.table))
        });
        recommendations
    }
}

fn column_exists(schema: &SchemaSnapshot, table: &str, column: &str) -> bool {
    schema
        .table(table)
        .is_some_and(|t| t.columns.iter().any(|c| c.name == column))
}

fn has_prefix_index(schema: &SchemaSnapshot, table: &str, columns: &[String]) -> bool {
    schema.table(table).is_some_and(|t| {
        t.indexes
            .iter()
            .any(|i| i.columns.len() >= columns.len() && i.columns[..columns.len()] == *columns)
    })
}

// ------------------------------------------------------------------
// Normalized-SQL pattern extraction
// ------------------------------------------------------------------

fn tokens(sql: &str) -> Vec<&str> {
    sql.split(|c: char| c.is_whitespace() || c == ',' || c == '(' || c == ')')
        .filter(|t| !t.is_empty())
        .collect()
}

fn bare(column: &str) -> String {
    column.rsplit('.').next().unwrap_or(column).to_string()
}

fn first_table(sql: &str) -> Option<String> {
    let toks = tokens(sql);
    for (i, t) in toks.iter().enumerate() {
        if matches!(*t, "from" | "update" | "into") {
            return toks.get(i + 1).map(|s| s.to_string());
        }
    }
    None
}

fn where_eq_columns(sql: &str) -> Vec<String> {
    let Some(pos) = sql.find(" where ") else { return Vec::new() };
    let clause = &sql[pos + 7..];
    let end = [" order by ", " group by ", " limit "]
        .iter()
        .filter_map(|k| clause.find(k))
        .min()
        .unwrap_or(clause.len());
    let clause = &clause[..end];

    let mut columns = Vec::new();
    let toks = tokens(clause);
    let mut i = 0;
    while i + 2 < toks.len() {
        if toks[i + 1] == "=" && toks[i + 2] == "?" {
            columns.push(bare(toks[i]));
            i += 3;
        } else {
            i += 1;
        }
    }
    columns
}

fn join_key_columns(sql: &str) -> Vec<(String, String)> {
    let mut keys = Vec::new();
    let toks = tokens(sql);
    let mut i = 0;
    while i < toks.len() {
        if toks[i] == "join" {
            // join <table> on <a.x> = <b.y>
            if let (Some(on_pos), Some(_)) = (
                toks[i..].iter().position(|t| *t == "on").map(|p| p + i),
                toks.get(i + 1),
            ) {
                if on_pos + 3 < toks.len() && toks[on_pos + 2] == "=" {
                    for side in [toks[on_pos + 1], toks[on_pos + 3]] {
                        if let Some((table, column)) = side.split_once('.') {
                            keys.push((table.to_string(), column.to_string()));
                        }
                    }
                }
            }
        }
        i += 1;
    }
    keys
}

fn order_by_with_limit(sql: &str) -> Option<String> {
    if !sql.contains(" limit ") && !sql.ends_with(" limit ?") {
        return None;
    }
    let pos = sql.find(" order by ")?;
    let clause = &sql[pos + 10..];
    tokens(clause).first().map(|t| bare(t))
}

fn group_by_columns(sql: &str) -> Vec<String> {
    let Some(pos) = sql.find(" group by ") else { return Vec::new() };
    let clause = &sql[pos + 10..];
    let end = [" order by ", " limit ", " having "]
        .iter()
        .filter_map(|k| clause.find(k))
        .min()
        .unwrap_or(clause.len());
    clause[..end]
        .split(',')
        .map(|c| bare(c.trim()))
        .filter(|c| !c.is_empty())
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionSettings, OptimizationConfig};
    use crate::storage::{Introspector, Storage};

    #[test]
    fn normalization_replaces_literals() {
        assert_eq!(
            normalize_sql("SELECT * FROM t WHERE a = 'x''y'  AND  b = 42"),
            "select * from t where a = ? and b = ?"
        );
        assert_eq!(
            normalize_sql(r#"SELECT "id" FROM "agent_actions" LIMIT 10"#),
            "select id from agent_actions limit ?"
        );
    }

    #[test]
    fn ring_is_bounded() {
        let capture = QueryCapture::with_capacity(3);
        for i in 0..5 {
            capture.record(&format!("SELECT {i}"), 1.0, None);
        }
        let entries = capture.snapshot();
        assert_eq!(entries.len(), 3);
        // Oldest two fell off
        assert_eq!(entries[0].sql, "select ?");
        assert_eq!(capture.len(), 3);
        capture.clear();
        assert!(capture.is_empty());
    }

    fn advisor_schema() -> SchemaSnapshot {
        let storage = Storage::open(
            &ConnectionSettings::Embedded { path: None },
            &OptimizationConfig::default(),
        )
        .unwrap();
        storage
            .with_writer(|conn| {
                conn.execute_batch(
                    "CREATE TABLE orders (
                         id INTEGER PRIMARY KEY,
                         customer_id INTEGER,
                         region TEXT,
                         kind TEXT,
                         placed_at TEXT
                     );
                     CREATE TABLE customers (id INTEGER PRIMARY KEY, email TEXT);
                     CREATE INDEX idx_orders_region ON orders(region);",
                )
            })
            .unwrap();
        Introspector::new(&storage).snapshot().unwrap()
    }

    fn captured(sql: &str, ms: f64) -> CapturedQuery {
        CapturedQuery { sql: normalize_sql(sql), execution_time_ms: ms, table: None }
    }

    #[test]
    fn where_eq_on_unindexed_column_is_medium() {
        let schema = advisor_schema();
        let queries = vec![captured("SELECT * FROM orders WHERE customer_id = 7", 12.0)];
        let recs = IndexAdvisor::analyze(&queries, &schema);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].table, "orders");
        assert_eq!(recs[0].columns, vec!["customer_id"]);
        assert_eq!(recs[0].priority, Priority::Medium);
        assert_eq!(recs[0].index_name(), "idx_orders_customer_id");
    }

    #[test]
    fn indexed_column_is_not_recommended() {
        let schema = advisor_schema();
        let queries = vec![captured("SELECT * FROM orders WHERE region = 'eu'", 3.0)];
        assert!(IndexAdvisor::analyze(&queries, &schema).is_empty());
    }

    #[test]
    fn join_key_is_high_priority() {
        let schema = advisor_schema();
        let queries = vec![captured(
            "SELECT * FROM customers JOIN orders ON orders.customer_id = customers.id",
            40.0,
        )];
        let recs = IndexAdvisor::analyze(&queries, &schema);
        assert!(recs
            .iter()
            .any(|r| r.table == "orders" && r.columns == vec!["customer_id"] && r.priority == Priority::High));
    }

    #[test]
    fn order_by_with_limit_is_medium() {
        let schema = advisor_schema();
        let queries = vec![captured("SELECT * FROM orders ORDER BY placed_at DESC LIMIT 20", 9.0)];
        let recs = IndexAdvisor::analyze(&queries, &schema);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].columns, vec!["placed_at"]);
        assert_eq!(recs[0].priority, Priority::Medium);
    }

    #[test]
    fn order_by_without_limit_is_ignored() {
        let schema = advisor_schema();
        let queries = vec![captured("SELECT * FROM orders ORDER BY placed_at", 9.0)];
        assert!(IndexAdvisor::analyze(&queries, &schema).is_empty());
    }

    #[test]
    fn group_by_prefix_composite() {
        let schema = advisor_schema();
        let queries = vec![captured(
            "SELECT kind, region, COUNT(*) FROM orders GROUP BY kind, region",
            15.0,
        )];
        let recs = IndexAdvisor::analyze(&queries, &schema);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].columns, vec!["kind", "region"]);
    }

    #[test]
    fn recommendations_convert_to_index_nodes() {
        let schema = advisor_schema();
        let queries = vec![captured("SELECT * FROM orders WHERE customer_id = 7", 12.0)];
        let recs = IndexAdvisor::analyze(&queries, &schema);
        let node = recs[0].to_create_index().unwrap();
        let rendered = crate::config::Dialect::Embedded.render(&crate::sql::Query::CreateIndex(node));
        assert_eq!(
            rendered.sql,
            r#"CREATE INDEX "idx_orders_customer_id" ON "orders" ("customer_id")"#
        );
    }

    #[test]
    fn hostile_captured_names_fail_node_conversion() {
        let rec = IndexRecommendation {
            table: "orders; DROP TABLE x--".to_string(),
            columns: vec!["customer_id".to_string()],
            kind: IndexKind::Btree,
            reason: String::new(),
            priority: Priority::Medium,
            estimated_gain: 0.0,
        };
        assert!(rec.to_create_index().is_err());
    }

    #[test]
    fn duplicates_merge_keeping_highest_priority() {
        let schema = advisor_schema();
        let queries = vec![
            captured("SELECT * FROM orders WHERE customer_id = 7", 5.0),
            captured(
                "SELECT * FROM customers JOIN orders ON orders.customer_id = customers.id",
                30.0,
            ),
        ];
        let recs = IndexAdvisor::analyze(&queries, &schema);
        let rec = recs
            .iter()
            .find(|r| r.table == "orders" && r.columns == vec!["customer_id"])
            .unwrap();
        assert_eq!(rec.priority, Priority::High);
        assert!(rec.estimated_gain >= 35.0);
    }
}
