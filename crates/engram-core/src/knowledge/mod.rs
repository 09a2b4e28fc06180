//! Knowledge base
//!
//! Facts with confidence and provenance, deduplicated on the way in by a
//! Bloom gate backed by vector recall, linked into a directed (possibly
//! cyclic) graph, and revisable through challenges.

mod distill;
mod links;
mod types;

pub use distill::{
    DistillDecision, DistillOptions, DistillOutcome, EmbeddingFn, KnowledgeDistiller,
};
pub use links::{LinkDirection, LinkGraph};
pub use types::{KnowledgeItem, KnowledgeLink};
