//! Policy engine
//!
//! Advisory guard rails at API boundaries. Policies are rows of kind
//! `allow`, `deny`, `guard`, or `rate_limit`; their JSON definition names
//! the operations they cover. Rate limiting is a token bucket per key:
//! capacity N, refilling N per window W.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::{EngramError, Result};
use crate::storage::Storage;

// ============================================================================
// POLICY DATA
// ============================================================================

/// Policy flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Explicit allow (documents intent; never blocks)
    Allow,
    /// Deny matching operations outright
    Deny,
    /// Let the operation proceed, attaching advisory notes
    Guard,
    /// Token-bucket rate limit per key
    RateLimit,
}

impl PolicyKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Allow => "allow",
            PolicyKind::Deny => "deny",
            PolicyKind::Guard => "guard",
            PolicyKind::RateLimit => "rate_limit",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "deny" => PolicyKind::Deny,
            "guard" => PolicyKind::Guard,
            "rate_limit" => PolicyKind::RateLimit,
            _ => PolicyKind::Allow,
        }
    }
}

/// One stored policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Row id
    pub id: i64,
    /// Unique name
    pub name: String,
    /// Flavor
    pub kind: PolicyKind,
    /// JSON definition: `operations` list (supports `*` wildcard), plus
    /// `capacity`/`windowMs` for rate limits and `note` for guards
    pub definition: serde_json::Value,
    /// Participates in checks
    pub enabled: bool,
    /// JSON metadata
    pub metadata: serde_json::Value,
    /// Insertion time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    fn covers(&self, operation: &str) -> bool {
        match self.definition["operations"].as_array() {
            Some(ops) => ops.iter().any(|op| {
                op.as_str().is_some_and(|pattern| {
                    pattern == "*"
                        || pattern == operation
                        || pattern
                            .strip_suffix(".*")
                            .is_some_and(|prefix| operation.starts_with(prefix))
                })
            }),
            None => false,
        }
    }
}

/// Non-failing outcome of a policy check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyVerdict {
    /// No policy objected
    Allowed,
    /// Guard policies left advisory notes
    Guarded(Vec<String>),
}

// ============================================================================
// TOKEN BUCKET
// ============================================================================

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_ms: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, window_ms: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_ms: capacity / window_ms.max(1.0),
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_refill).as_secs_f64() * 1_000.0;
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Policy checks over an open storage
pub struct PolicyEngine {
    storage: Arc<Storage>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl PolicyEngine {
    /// Bind to an open storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage, buckets: Mutex::new(HashMap::new()) }
    }

    /// Define (or replace) a policy by unique name.
    pub fn define(
        &self,
        name: &str,
        kind: PolicyKind,
        definition: serde_json::Value,
    ) -> Result<Policy> {
        let now = Utc::now().to_rfc3339();
        let def = definition.to_string();
        self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_policies (name, policy_type, definition, enabled, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, 1, ?4, ?4) \
                 ON CONFLICT(name) DO UPDATE SET \
                     policy_type = excluded.policy_type, \
                     definition = excluded.definition, \
                     updated_at = excluded.updated_at",
                params![name, kind.as_str(), def, now],
            )?;
            Ok(())
        })?;
        self.get_by_name(name)?
            .ok_or(EngramError::NotFound { entity: "policy", id: 0 })
    }

    /// Fetch a policy by name.
    pub fn get_by_name(&self, name: &str) -> Result<Option<Policy>> {
        let rows = self.query_policies("name = ?1", params![name])?;
        Ok(rows.into_iter().next())
    }

    /// Enable or disable a policy by name.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let changed = self.storage.with_writer(|conn| {
            conn.execute(
                "UPDATE agent_policies SET enabled = ?1, updated_at = ?2 WHERE name = ?3",
                params![enabled as i64, Utc::now().to_rfc3339(), name],
            )
        })?;
        if changed == 0 {
            return Err(EngramError::NotFound { entity: "policy", id: 0 });
        }
        Ok(())
    }

    /// Every enabled policy in id order.
    pub fn enabled_policies(&self) -> Result<Vec<Policy>> {
        self.query_policies("enabled = 1", params![])
    }

    /// Check an operation key (e.g. `"knowledge.distill"`) against every
    /// enabled policy.
    ///
    /// Deny fails with `PolicyDeny`; an exhausted rate limit fails with
    /// `RateLimitExceeded`; guards accumulate advisory notes. `rate_key`
    /// scopes the token bucket (caller id, session id, ...).
    pub fn check(&self, operation: &str, rate_key: &str) -> Result<PolicyVerdict> {
        let mut notes = Vec::new();
        for policy in self.enabled_policies()? {
            if !policy.covers(operation) {
                continue;
            }
            match policy.kind {
                PolicyKind::Allow => {}
                PolicyKind::Deny => {
                    return Err(EngramError::PolicyDeny { policy: policy.name });
                }
                PolicyKind::Guard => {
                    let note = policy.definition["note"]
                        .as_str()
                        .unwrap_or("guarded operation")
                        .to_string();
                    notes.push(note);
                }
                PolicyKind::RateLimit => {
                    let capacity = policy.definition["capacity"].as_f64().unwrap_or(10.0).max(1.0);
                    let window_ms = policy.definition["windowMs"].as_f64().unwrap_or(60_000.0);
                    let bucket_key = format!("{}:{}", policy.name, rate_key);
                    let mut buckets = self
                        .buckets
                        .lock()
                        .map_err(|_| EngramError::LockPoisoned("policy buckets"))?;
                    let bucket = buckets
                        .entry(bucket_key.clone())
                        .or_insert_with(|| TokenBucket::new(capacity, window_ms));
                    if !bucket.try_take() {
                        return Err(EngramError::RateLimitExceeded { key: bucket_key });
                    }
                }
            }
        }
        if notes.is_empty() {
            Ok(PolicyVerdict::Allowed)
        } else {
            Ok(PolicyVerdict::Guarded(notes))
        }
    }

    fn query_policies(&self, filter: &str, params: impl rusqlite::Params + Copy) -> Result<Vec<Policy>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, name, policy_type, definition, enabled, metadata, created_at, updated_at \
                 FROM agent_policies WHERE {filter} ORDER BY id ASC"
            ))?;
            let rows = stmt
                .query_map(params, |row| {
                    let def: String = row.get(3)?;
                    let meta: String = row.get(5)?;
                    let created: String = row.get(6)?;
                    let updated: String = row.get(7)?;
                    Ok(Policy {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        kind: PolicyKind::parse_name(&row.get::<_, String>(2)?),
                        definition: serde_json::from_str(&def).unwrap_or(serde_json::Value::Null),
                        enabled: row.get::<_, i64>(4)? != 0,
                        metadata: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
                        created_at: created.parse().unwrap_or_else(|_| Utc::now()),
                        updated_at: updated.parse().unwrap_or_else(|_| Utc::now()),
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

    fn engine() -> PolicyEngine {
        let storage = Arc::new(
            Storage::open(
                &ConnectionSettings::Embedded { path: None },
                &OptimizationConfig::default(),
            )
            .unwrap(),
        );
        bootstrap(&storage).unwrap();
        PolicyEngine::new(storage)
    }

    #[test]
    fn unmatched_operations_are_allowed() {
        let engine = engine();
        assert_eq!(engine.check("sessions.open", "k").unwrap(), PolicyVerdict::Allowed);
    }

    #[test]
    fn deny_blocks_matching_operations() {
        let engine = engine();
        engine
            .define(
                "no-evolution",
                PolicyKind::Deny,
                serde_json::json!({"operations": ["evolution.*"]}),
            )
            .unwrap();
        let err = engine.check("evolution.propose", "k");
        assert!(matches!(err, Err(EngramError::PolicyDeny { policy }) if policy == "no-evolution"));
        // Prefix wildcard does not leak to other namespaces
        assert!(engine.check("knowledge.distill", "k").is_ok());
    }

    #[test]
    fn guard_attaches_notes() {
        let engine = engine();
        engine
            .define(
                "watch-deletes",
                PolicyKind::Guard,
                serde_json::json!({"operations": ["sessions.delete"], "note": "deletes are audited"}),
            )
            .unwrap();
        match engine.check("sessions.delete", "k").unwrap() {
            PolicyVerdict::Guarded(notes) => assert_eq!(notes, vec!["deletes are audited"]),
            other => panic!("expected guard, got {other:?}"),
        }
    }

    #[test]
    fn rate_limit_exhausts_and_scopes_by_key() {
        let engine = engine();
        engine
            .define(
                "distill-budget",
                PolicyKind::RateLimit,
                serde_json::json!({"operations": ["knowledge.distill"], "capacity": 3, "windowMs": 3_600_000}),
            )
            .unwrap();

        for _ in 0..3 {
            engine.check("knowledge.distill", "caller-a").unwrap();
        }
        let err = engine.check("knowledge.distill", "caller-a");
        assert!(matches!(err, Err(EngramError::RateLimitExceeded { .. })));

        // Separate key, separate bucket
        assert!(engine.check("knowledge.distill", "caller-b").is_ok());
    }

    #[test]
    fn disabled_policies_do_not_fire() {
        let engine = engine();
        engine
            .define("deny-all", PolicyKind::Deny, serde_json::json!({"operations": ["*"]}))
            .unwrap();
        engine.set_enabled("deny-all", false).unwrap();
        assert!(engine.check("anything.at.all", "k").is_ok());
    }

    #[test]
    fn define_replaces_by_name() {
        let engine = engine();
        engine
            .define("p", PolicyKind::Deny, serde_json::json!({"operations": ["x"]}))
            .unwrap();
        let updated = engine
            .define("p", PolicyKind::Guard, serde_json::json!({"operations": ["x"], "note": "n"}))
            .unwrap();
        assert_eq!(updated.kind, PolicyKind::Guard);
        assert!(engine.check("x", "k").is_ok());
    }
}
