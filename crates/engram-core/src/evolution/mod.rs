//! Schema evolution
//!
//! The pilot drives candidate mutations through sandbox, verification,
//! promotion, and revert; the meta-evolution controller tunes the pilot's
//! aggressiveness and verification window from success-rate z-scores.

mod meta;
mod pilot;

pub use meta::{MetaConfig, MetaDecision, MetaEvent, MetaEvolutionController, OutcomeSample};
pub use pilot::{EvolutionTuning, EvolutionaryPilot, MutationRecord, MutationState};
