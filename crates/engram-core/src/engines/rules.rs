//! Rule engine
//!
//! Rules are data, not code: each row binds `(table_name, operation)` to an
//! action (`veto`, `annotate`, `log`) guarded by a JSON condition script.
//! On a matching mutation the engine evaluates rules in id order; a veto
//! aborts the mutation with `RuleVeto`, annotations accumulate.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::{EngramError, Result};
use crate::storage::Storage;

// ============================================================================
// RULE DATA
// ============================================================================

/// Mutation class a rule watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOperation {
    /// Row inserts
    Insert,
    /// Row updates
    Update,
    /// Row deletes
    Delete,
    /// Reads
    Select,
}

impl RuleOperation {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleOperation::Insert => "insert",
            RuleOperation::Update => "update",
            RuleOperation::Delete => "delete",
            RuleOperation::Select => "select",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "update" => RuleOperation::Update,
            "delete" => RuleOperation::Delete,
            "select" => RuleOperation::Select,
            _ => RuleOperation::Insert,
        }
    }
}

/// What a matching rule does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Abort the mutation
    Veto,
    /// Attach a note, let the mutation proceed
    Annotate,
    /// Emit a tracing event only
    Log,
}

impl RuleAction {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Veto => "veto",
            RuleAction::Annotate => "annotate",
            RuleAction::Log => "log",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "veto" => RuleAction::Veto,
            "log" => RuleAction::Log,
            _ => RuleAction::Annotate,
        }
    }
}

/// Field comparison inside a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOp {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Numerically greater
    Gt,
    /// Numerically smaller
    Lt,
    /// String or array containment
    Contains,
    /// Field is present and non-null
    Exists,
}

/// JSON-loadable condition tree evaluated against the mutated row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "when")]
pub enum Condition {
    /// Always matches
    Always,
    /// Single field comparison
    Field {
        /// Row field name
        field: String,
        /// Comparison
        op: FieldOp,
        /// Right-hand value (ignored by `Exists`)
        #[serde(default)]
        value: serde_json::Value,
    },
    /// Every child matches
    AllOf {
        /// Children
        conditions: Vec<Condition>,
    },
    /// Any child matches
    AnyOf {
        /// Children
        conditions: Vec<Condition>,
    },
    /// Child does not match
    Not {
        /// Child
        condition: Box<Condition>,
    },
}

impl Condition {
    /// Evaluate against a row rendered as a JSON object.
    pub fn matches(&self, row: &serde_json::Value) -> bool {
        match self {
            Condition::Always => true,
            Condition::Field { field, op, value } => {
                let actual = &row[field.as_str()];
                match op {
                    FieldOp::Exists => !actual.is_null(),
                    FieldOp::Eq => actual == value,
                    FieldOp::Ne => actual != value,
                    FieldOp::Gt => match (actual.as_f64(), value.as_f64()) {
                        (Some(a), Some(b)) => a > b,
                        _ => false,
                    },
                    FieldOp::Lt => match (actual.as_f64(), value.as_f64()) {
                        (Some(a), Some(b)) => a < b,
                        _ => false,
                    },
                    FieldOp::Contains => match (actual, value.as_str()) {
                        (serde_json::Value::String(s), Some(needle)) => s.contains(needle),
                        (serde_json::Value::Array(items), _) => items.contains(value),
                        _ => false,
                    },
                }
            }
            Condition::AllOf { conditions } => conditions.iter().all(|c| c.matches(row)),
            Condition::AnyOf { conditions } => conditions.iter().any(|c| c.matches(row)),
            Condition::Not { condition } => !condition.matches(row),
        }
    }
}

/// One stored rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Row id (also the evaluation order)
    pub id: i64,
    /// Watched table
    pub table_name: String,
    /// Watched operation
    pub operation: RuleOperation,
    /// Action on match
    pub action: RuleAction,
    /// Condition script
    pub script: Condition,
    /// Whether the rule participates in evaluation
    pub enabled: bool,
    /// JSON metadata (a "reason" key feeds veto messages)
    pub metadata: serde_json::Value,
    /// Insertion time
    pub created_at: DateTime<Utc>,
}

/// A non-veto match left on the mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleAnnotation {
    /// Annotating rule
    pub rule_id: i64,
    /// Note (metadata "reason", or a default)
    pub note: String,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Rule evaluation over an open storage
pub struct RuleEngine {
    storage: Arc<Storage>,
}

impl RuleEngine {
    /// Bind to an open storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Register a rule.
    pub fn register(
        &self,
        table_name: &str,
        operation: RuleOperation,
        action: RuleAction,
        script: Condition,
        metadata: Option<serde_json::Value>,
    ) -> Result<Rule> {
        let now = Utc::now().to_rfc3339();
        let script_json = serde_json::to_string(&script)?;
        let meta = metadata.unwrap_or_else(|| serde_json::json!({})).to_string();
        let id = self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_rules (table_name, operation, action, script, metadata, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![table_name, operation.as_str(), action.as_str(), script_json, meta, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get(id)?.ok_or(EngramError::NotFound { entity: "rule", id })
    }

    /// Fetch one rule by id.
    pub fn get(&self, id: i64) -> Result<Option<Rule>> {
        let rules = self.query_rules("id = ?1", params![id])?;
        Ok(rules.into_iter().next())
    }

    /// Enable or disable a rule.
    pub fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let changed = self.storage.with_writer(|conn| {
            conn.execute(
                "UPDATE agent_rules SET enabled = ?1 WHERE id = ?2",
                params![enabled as i64, id],
            )
        })?;
        if changed == 0 {
            return Err(EngramError::NotFound { entity: "rule", id });
        }
        Ok(())
    }

    /// Every enabled rule, in id order.
    pub fn enabled_rules(&self) -> Result<Vec<Rule>> {
        self.query_rules("enabled = 1", params![])
    }

    /// Evaluate rules matching `(table, operation)` against the row, in id
    /// order. A veto aborts with `RuleVeto`; annotations accumulate; `log`
    /// rules emit a tracing event.
    pub fn evaluate(
        &self,
        table_name: &str,
        operation: RuleOperation,
        row: &serde_json::Value,
    ) -> Result<Vec<RuleAnnotation>> {
        let rules = self.query_rules(
            "enabled = 1 AND table_name = ?1 AND operation = ?2",
            params![table_name, operation.as_str()],
        )?;
        let mut annotations = Vec::new();
        for rule in rules {
            if !rule.script.matches(row) {
                continue;
            }
            let reason = rule.metadata["reason"]
                .as_str()
                .unwrap_or("rule matched")
                .to_string();
            match rule.action {
                RuleAction::Veto => {
                    return Err(EngramError::RuleVeto { rule_id: rule.id, reason });
                }
                RuleAction::Annotate => {
                    annotations.push(RuleAnnotation { rule_id: rule.id, note: reason });
                }
                RuleAction::Log => {
                    tracing::info!(rule = rule.id, table = table_name, "rule matched: {reason}");
                }
            }
        }
        Ok(annotations)
    }

    fn query_rules(&self, filter: &str, params: impl rusqlite::Params + Copy) -> Result<Vec<Rule>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, table_name, operation, action, script, enabled, metadata, created_at \
                 FROM agent_rules WHERE {filter} ORDER BY id ASC"
            ))?;
            let rows = stmt
                .query_map(params, |row| {
                    let script: String = row.get(4)?;
                    let meta: String = row.get(6)?;
                    let created: String = row.get(7)?;
                    Ok(Rule {
                        id: row.get(0)?,
                        table_name: row.get(1)?,
                        operation: RuleOperation::parse_name(&row.get::<_, String>(2)?),
                        action: RuleAction::parse_name(&row.get::<_, String>(3)?),
                        script: serde_json::from_str(&script).unwrap_or(Condition::Always),
                        enabled: row.get::<_, i64>(5)? != 0,
                        metadata: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
                        created_at: created.parse().unwrap_or_else(|_| Utc::now()),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
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

    fn engine() -> RuleEngine {
        let storage = Arc::new(
            Storage::open(
                &ConnectionSettings::Embedded { path: None },
                &OptimizationConfig::default(),
            )
            .unwrap(),
        );
        bootstrap(&storage).unwrap();
        RuleEngine::new(storage)
    }

    #[test]
    fn conditions_evaluate_against_rows() {
        let row = serde_json::json!({
            "status": "active",
            "confidence": 0.9,
            "tags": ["hot"],
        });
        assert!(Condition::Always.matches(&row));
        assert!(Condition::Field {
            field: "status".into(),
            op: FieldOp::Eq,
            value: serde_json::json!("active")
        }
        .matches(&row));
        assert!(Condition::Field {
            field: "confidence".into(),
            op: FieldOp::Gt,
            value: serde_json::json!(0.5)
        }
        .matches(&row));
        assert!(Condition::Field {
            field: "tags".into(),
            op: FieldOp::Contains,
            value: serde_json::json!("hot")
        }
        .matches(&row));
        assert!(!Condition::Field {
            field: "missing".into(),
            op: FieldOp::Exists,
            value: serde_json::Value::Null
        }
        .matches(&row));
    }

    #[test]
    fn condition_scripts_load_from_json() {
        let json = r#"{"when":"all_of","conditions":[
            {"when":"field","field":"status","op":"eq","value":"active"},
            {"when":"not","condition":{"when":"field","field":"cost","op":"gt","value":10}}
        ]}"#;
        let condition: Condition = serde_json::from_str(json).unwrap();
        assert!(condition.matches(&serde_json::json!({"status": "active", "cost": 5})));
        assert!(!condition.matches(&serde_json::json!({"status": "active", "cost": 50})));
    }

    #[test]
    fn veto_aborts_with_rule_id() {
        let engine = engine();
        let rule = engine
            .register(
                "agent_knowledge_base",
                RuleOperation::Delete,
                RuleAction::Veto,
                Condition::Field {
                    field: "confidence".into(),
                    op: FieldOp::Gt,
                    value: serde_json::json!(0.8),
                },
                Some(serde_json::json!({"reason": "high-confidence knowledge is protected"})),
            )
            .unwrap();

        let err = engine.evaluate(
            "agent_knowledge_base",
            RuleOperation::Delete,
            &serde_json::json!({"confidence": 0.95}),
        );
        match err {
            Err(EngramError::RuleVeto { rule_id, reason }) => {
                assert_eq!(rule_id, rule.id);
                assert!(reason.contains("protected"));
            }
            other => panic!("expected veto, got {other:?}"),
        }

        // Below the threshold the delete passes
        let annotations = engine
            .evaluate(
                "agent_knowledge_base",
                RuleOperation::Delete,
                &serde_json::json!({"confidence": 0.2}),
            )
            .unwrap();
        assert!(annotations.is_empty());
    }

    #[test]
    fn rules_evaluate_in_id_order_and_annotate() {
        let engine = engine();
        engine
            .register(
                "agent_goals",
                RuleOperation::Insert,
                RuleAction::Annotate,
                Condition::Always,
                Some(serde_json::json!({"reason": "first"})),
            )
            .unwrap();
        engine
            .register(
                "agent_goals",
                RuleOperation::Insert,
                RuleAction::Annotate,
                Condition::Always,
                Some(serde_json::json!({"reason": "second"})),
            )
            .unwrap();

        let annotations = engine
            .evaluate("agent_goals", RuleOperation::Insert, &serde_json::json!({}))
            .unwrap();
        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations[0].note, "first");
        assert_eq!(annotations[1].note, "second");
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let engine = engine();
        let rule = engine
            .register(
                "agent_goals",
                RuleOperation::Insert,
                RuleAction::Veto,
                Condition::Always,
                None,
            )
            .unwrap();
        engine.set_enabled(rule.id, false).unwrap();
        let annotations = engine
            .evaluate("agent_goals", RuleOperation::Insert, &serde_json::json!({}))
            .unwrap();
        assert!(annotations.is_empty());
    }

    #[test]
    fn other_tables_are_untouched() {
        let engine = engine();
        engine
            .register("agent_goals", RuleOperation::Insert, RuleAction::Veto, Condition::Always, None)
            .unwrap();
        assert!(engine
            .evaluate("agent_sessions", RuleOperation::Insert, &serde_json::json!({}))
            .is_ok());
        assert!(engine
            .evaluate("agent_goals", RuleOperation::Update, &serde_json::json!({}))
            .is_ok());
    }
}
