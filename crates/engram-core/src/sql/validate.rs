//! Identifier validation
//!
//! The lowest boundary of the query safety pipeline. Every identifier-bearing
//! node calls `validate_identifier` at construction, so no parse-level or
//! API-level path can emit SQL containing an unvalidated identifier.
//!
//! The checks are pure and allocation-free on the accept path: shape
//! (`name`, `schema.name`, or `schema.name.column`), length cap, comment
//! markers, quotes and NULs, and a case-insensitive keyword blocklist.

use crate::error::{EngramError, Result};

/// Maximum accepted identifier length (whole dotted path)
pub const MAX_IDENTIFIER_LEN: usize = 255;

/// Keywords an identifier may never equal, case-insensitively.
///
/// Segment-wise: `drop_index` is fine, `drop` is not.
pub const IDENTIFIER_BLOCKLIST: &[&str] = &[
    "select", "insert", "update", "delete", "drop", "create", "alter", "union",
    "attach", "detach", "pragma", "vacuum", "reindex", "analyze", "explain",
    "grant", "revoke", "exec", "execute", "truncate", "merge", "replace",
    "begin", "commit", "rollback", "savepoint", "transaction",
];

/// Validate a candidate SQL identifier.
///
/// Accepts `name`, `schema.name`, and `schema.name.column` where each segment
/// matches `[A-Za-z_][A-Za-z0-9_]*`. Rejects empties, over-long paths,
/// comment markers, NUL bytes, quotes, and blocklisted keywords.
pub fn validate_identifier(name: &str) -> Result<()> {
    let reject = |reason: &'static str| {
        Err(EngramError::InvalidIdentifier { name: clip(name), reason })
    };

    if name.is_empty() {
        return reject("empty");
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return reject("longer than 255 bytes");
    }
    if name.contains('\0') {
        return reject("contains NUL byte");
    }
    if name.contains("--") || name.contains("/*") || name.contains("*/") {
        return reject("contains SQL comment marker");
    }
    if name.contains('\'') || name.contains('"') || name.contains('`') {
        return reject("contains quote character");
    }

    let mut segments = 0usize;
    for segment in name.split('.') {
        segments += 1;
        if segments > 3 {
            return reject("more than three dotted segments");
        }
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return reject("segment must start with a letter or underscore"),
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return reject("segment contains a non [A-Za-z0-9_] character");
        }
        if IDENTIFIER_BLOCKLIST.iter().any(|kw| segment.eq_ignore_ascii_case(kw)) {
            return reject("matches a blocklisted keyword");
        }
    }

    Ok(())
}

/// True when `validate_identifier` would accept the candidate.
pub fn is_valid_identifier(name: &str) -> bool {
    validate_identifier(name).is_ok()
}

fn clip(name: &str) -> String {
    // Error payloads stay short; 64 chars is plenty to locate the offender.
    let mut end = name.len().min(64);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

// ============================================================================
// TESTS
// ============================================================================
