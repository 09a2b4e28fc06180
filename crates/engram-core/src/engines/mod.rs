//! Reflection, rule, and policy engines
//!
//! - `reflection` condenses terminated episodes into lessons
//! - `rules` evaluates data-driven guards on matching mutations
//! - `policy` is the advisory boundary layer (allow/deny/guard/rate-limit)
//! - `conflicts` reports contradictions between active rules

mod conflicts;
mod policy;
mod reflection;
mod rules;

pub use conflicts::{ConflictResolver, RuleConflict};
pub use policy::{Policy, PolicyEngine, PolicyKind, PolicyVerdict};
pub use reflection::{Reflection, ReflectionEngine};
pub use rules::{
    Condition, FieldOp, Rule, RuleAction, RuleAnnotation, RuleEngine, RuleOperation,
};
