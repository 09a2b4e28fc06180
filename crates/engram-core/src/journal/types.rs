//! Journal row types
//!
//! Sessions own messages, actions, episodes, and epochs. Status enums carry
//! `as_str`/`parse_name` pairs because the store keeps them as text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// STATUS ENUMS
// ============================================================================

/// Session lifecycle; `Closed` and `Archived` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting journal appends
    #[default]
    Active,
    /// Frozen; journals no longer grow
    Closed,
    /// Frozen and shelved
    Archived,
}

impl SessionStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
            SessionStatus::Archived => "archived",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "closed" => SessionStatus::Closed,
            "archived" => SessionStatus::Archived,
            _ => SessionStatus::Active,
        }
    }

    /// One-way transition check.
    pub fn can_become(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Active, SessionStatus::Closed)
                | (SessionStatus::Active, SessionStatus::Archived)
                | (SessionStatus::Closed, SessionStatus::Archived)
        )
    }
}

/// Message author role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Human input
    User,
    /// Model output
    Assistant,
    /// Tool result
    Tool,
    /// System directive
    System,
}

impl MessageRole {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
            MessageRole::System => "system",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "assistant" => MessageRole::Assistant,
            "tool" => MessageRole::Tool,
            "system" => MessageRole::System,
            _ => MessageRole::User,
        }
    }
}

/// Action lifecycle; leaves `Pending` exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    /// Dispatched, outcome unknown
    #[default]
    Pending,
    /// Finished successfully
    Success,
    /// Finished with an error
    Failure,
}

impl ActionStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Success => "success",
            ActionStatus::Failure => "failure",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        match s {
            "success" => ActionStatus::Success,
            "failure" => ActionStatus::Failure,
            _ => ActionStatus::Pending,
        }
    }
}

/// Episode lifecycle; `Closed` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeStatus {
    /// Running
    #[default]
    Active,
    /// Ended; `end_time` is set exactly once
    Closed,
}

impl EpisodeStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeStatus::Active => "active",
            EpisodeStatus::Closed => "closed",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Self {
        if s == "closed" { EpisodeStatus::Closed } else { EpisodeStatus::Active }
    }
}

// ============================================================================
// ROWS
// ============================================================================

/// One agent session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Row id
    pub id: i64,
    /// Human-readable name
    pub name: String,
    /// Lifecycle status
    pub status: SessionStatus,
    /// JSON metadata
    pub metadata: serde_json::Value,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

/// One immutable message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Row id (monotonic within a session)
    pub id: i64,
    /// Owning session
    pub session_id: i64,
    /// Author role
    pub role: MessageRole,
    /// Message body
    pub content: String,
    /// JSON metadata
    pub metadata: serde_json::Value,
    /// Insertion time
    pub created_at: DateTime<Utc>,
}

/// One journaled tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// Row id
    pub id: i64,
    /// Owning session
    pub session_id: i64,
    /// Triggering message, when any
    pub message_id: Option<i64>,
    /// Invoked tool
    pub tool_name: String,
    /// Opaque argument blob (JSON text by convention)
    pub arguments: String,
    /// Result, filled once on finalization
    pub outcome: Option<String>,
    /// Lifecycle status
    pub status: ActionStatus,
    /// Wall-clock duration, filled on finalization
    pub duration_ms: Option<i64>,
    /// Insertion time
    pub created_at: DateTime<Utc>,
}

/// One episode (a named span of work inside a session)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    /// Row id
    pub id: i64,
    /// Owning session
    pub session_id: i64,
    /// Episode name
    pub name: String,
    /// Closing summary
    pub summary: Option<String>,
    /// Lifecycle status
    pub status: EpisodeStatus,
    /// Start time
    pub start_time: DateTime<Utc>,
    /// End time; set exactly once, never before `start_time`
    pub end_time: Option<DateTime<Utc>>,
}

/// One compressed message range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Epoch {
    /// Row id
    pub id: i64,
    /// Owning session
    pub session_id: i64,
    /// Compressed summary
    pub summary: String,
    /// First message id in the range (inclusive)
    pub start_message_id: i64,
    /// Last message id in the range (inclusive)
    pub end_message_id: i64,
}

// ============================================================================
// TESTS
// ============================================================================
