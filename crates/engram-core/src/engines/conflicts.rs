//! Rule conflict resolver
//!
//! Scans active rules for semantic overlaps and reports contradictions.
//! It never auto-resolves; the report is for the operator (or a reflection
//! ritual) to act on.

use serde::{Deserialize, Serialize};

use crate::engines::rules::{Condition, Rule, RuleAction};
use crate::error::Result;

/// One detected contradiction between two rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConflict {
    /// Shared table
    pub table_name: String,
    /// Shared operation
    pub operation: String,
    /// Lower-id rule
    pub rule_a: i64,
    /// Higher-id rule
    pub rule_b: i64,
    /// What contradicts
    pub description: String,
}

/// Conflict scanning over rule lists
pub struct ConflictResolver;

impl ConflictResolver {
    /// Report contradictions among the given rules.
    ///
    /// Two rules contradict when they watch the same `(table, operation)`,
    /// their conditions can overlap, and one vetoes what the other lets
    /// through. Overlap detection is conservative: equal conditions, or
    /// either side being `Always`.
    pub fn scan(rules: &[Rule]) -> Result<Vec<RuleConflict>> {
        let mut conflicts = Vec::new();
        for (i, a) in rules.iter().enumerate() {
            for b in rules.iter().skip(i + 1) {
                if a.table_name != b.table_name || a.operation != b.operation {
                    continue;
                }
                if !conditions_overlap(&a.script, &b.script) {
                    continue;
                }
                let one_vetoes = (a.action == RuleAction::Veto) != (b.action == RuleAction::Veto);
                if one_vetoes {
                    conflicts.push(RuleConflict {
                        table_name: a.table_name.clone(),
                        operation: a.operation.as_str().to_string(),
                        rule_a: a.id.min(b.id),
                        rule_b: a.id.max(b.id),
                        description: format!(
                            "rule {} ({}) and rule {} ({}) overlap on {}.{}",
                            a.id,
                            a.action.as_str(),
                            b.id,
                            b.action.as_str(),
                            a.table_name,
                            a.operation.as_str()
                        ),
                    });
                }
            }
        }
        Ok(conflicts)
    }
}

fn conditions_overlap(a: &Condition, b: &Condition) -> bool {
    matches!(a, Condition::Always) || matches!(b, Condition::Always) || a == b
}

// ============================================================================
// TESTS
// ============================================================================
