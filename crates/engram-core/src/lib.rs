//! # Engram Core
//!
//! Self-evolving cognitive persistence engine for autonomous agents. An
//! agentic "cortex" layered over an embedded relational store gives an agent
//! a durable world-model of sessions, episodes, goals, knowledge, skills,
//! policies, rituals, and logic probes — with the closed cognitive loop:
//!
//! ingest -> distill -> reflect -> mutate -> verify -> rollback-on-regression
//!
//! - **Safety pipeline**: every dynamically named identifier flows through
//!   validated query-tree nodes before SQL exists (embedded `?` and
//!   networked `$N` dialects)
//! - **Schema bootstrap & DNA evolution**: 20 agentic tables created
//!   idempotently; autonomous DDL is whitelisted, snapshotted, and inverted
//!   so every promoted mutation can be rolled back
//! - **Bloom-gated knowledge distillation**: probabilistic dedup in front of
//!   vector recall, with confidence blending and challenges
//! - **Journals**: append-only sessions/messages/actions/episodes bounded by
//!   epoch compression
//! - **Rituals & meta-evolution**: a cooperative, caller-ticked scheduler for
//!   compression, pruning, re-indexing, probing, and evolution, governed by
//!   success-rate z-scores
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use engram_core::{ActionStatus, Cortex};
//!
//! // Open (or create) the mind file; 20 agent tables bootstrap idempotently
//! let cortex = Cortex::open(Some("embedded:./mind.db"))?;
//!
//! // Journal some work
//! let session = cortex.open_session(Some("s1"))?;
//! let action = cortex.append_action(session.id, "calc", "{}")?;
//! cortex.complete_action(action.id, ActionStatus::Success, "42", 12)?;
//!
//! // Distill knowledge (deduplicated through the Bloom -> vector pipeline)
//! cortex.distill("arch", "WAL is 3x faster", 0.9)?;
//!
//! // Tick the background rituals
//! let reports = cortex.run_pending()?;
//! ```
//!
//! ## Feature Flags
//!
//! - `vector-search`: HNSW-accelerated nearest-neighbour via USearch; the
//!   default build uses the bounded linear scan

// Only warn about missing docs at the crate level; internal struct fields
// and enum variants don't need documentation
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod bloom;
pub mod cache;
pub mod capture;
pub mod config;
pub mod cortex;
pub mod dna;
pub mod engines;
pub mod error;
pub mod evolution;
pub mod goals;
pub mod journal;
pub mod knowledge;
pub mod persona;
pub mod probes;
pub mod resources;
pub mod rituals;
pub mod skills;
pub mod sql;
pub mod storage;
pub mod vector;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Errors
pub use error::{EngramError, ErrorKind, Result};

// Configuration
pub use config::{
    AgenticConfig, AutomationConfig, CacheConfig, CacheStrategy, ConnectionSettings, Dialect,
    DistanceMetric, DistillConfig, EngramConfig, EvolutionConfig, IntrospectionConfig,
    LoggingConfig, LogLevel, OptimizationConfig, PerformanceConfig, PoolSettings,
    SynchronousLevel, TempStore, VectorConfig,
};

// Safety pipeline
pub use sql::{
    is_valid_identifier, quote_identifier, validate_identifier, ColumnDef, ColumnRef, CreateIndex,
    CreateTable, DropColumn, DropIndex, DropTable, Identifier, Predicate, Query, RenderedQuery,
    SelectQuery, SqlType, SqlValue, TableRef, IDENTIFIER_BLOCKLIST, MAX_IDENTIFIER_LEN,
};

// Storage layer
pub use storage::{
    bootstrap, is_bootstrapped, ColumnInfo, ForeignKeyInfo, IndexInfo, Introspector,
    SchemaSnapshot, Storage, StorageTuner, TableInfo, AGENT_TABLES, TABLE_COUNT,
};

// DNA evolution
pub use dna::{classify_ddl, AllowedDdl, AppliedMutation, DnaInverter};

// Cache, capture, bloom, vectors
pub use bloom::{normalize_fact, BloomMetrics, BloomProxy, Fingerprint};
pub use cache::{CacheStats, TtlCache};
pub use capture::{
    normalize_sql, CapturedQuery, IndexAdvisor, IndexKind, IndexRecommendation, Priority,
    QueryCapture, DEFAULT_RING_CAPACITY,
};
pub use vector::{
    cosine_distance, embedding_from_bytes, embedding_to_bytes, l2_distance, VectorMatch,
    VectorRecord, VectorStore,
};

// Journals & resources
pub use journal::{
    Action, ActionStatus, Episode, EpisodeStatus, Epoch, Message, MessageRole, Session,
    SessionJournal, SessionStatus, Summarizer,
};
pub use resources::{ModelUsage, ResourceMonitor, ResourceUsage};

// Knowledge
pub use knowledge::{
    DistillDecision, DistillOptions, DistillOutcome, EmbeddingFn, KnowledgeDistiller,
    KnowledgeItem, KnowledgeLink, LinkDirection, LinkGraph,
};

// Engines
pub use engines::{
    Condition, ConflictResolver, FieldOp, Policy, PolicyEngine, PolicyKind, PolicyVerdict,
    Reflection, ReflectionEngine, Rule, RuleAction, RuleAnnotation, RuleConflict, RuleEngine,
    RuleOperation,
};

// Evolution
pub use evolution::{
    EvolutionTuning, EvolutionaryPilot, MetaConfig, MetaDecision, MetaEvent,
    MetaEvolutionController, MutationRecord, MutationState, OutcomeSample,
};

// Rituals & probes
pub use probes::{LogicProbe, ProbeEngine, ProbeResult};
pub use rituals::{
    Frequency, Ritual, RitualHandler, RitualKind, RitualListener, RitualOrchestrator,
    RitualRunReport, RitualStatus,
};

// Identity & goals
pub use goals::{Goal, GoalStatus, GoalTracker};
pub use persona::{Persona, PersonaRegistry};
pub use skills::{Capability, CapabilityRegistry, CapabilityStatus};

// Façade
pub use cortex::{Cortex, CortexBuilder, CortexStats};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        ActionStatus, Cortex, CortexStats, DistillDecision, DistillOutcome, EngramConfig,
        EngramError, Frequency, MessageRole, MutationState, Result, RitualKind, Session,
        SessionStatus,
    };

    pub use crate::{
        BloomProxy, CapabilityRegistry, DnaInverter, KnowledgeDistiller, PolicyEngine,
        RitualOrchestrator, SessionJournal, Storage, TtlCache, VectorStore,
    };
}
