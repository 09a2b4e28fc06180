//! Cortex façade
//!
//! Composes the journals, knowledge base, vector store, engines, pilot, and
//! orchestrator behind one stable surface. The façade adds no logic beyond
//! composition and guardrails: public operations run a policy check first,
//! and every write flows through the same storage safety pipeline.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::bloom::{BloomMetrics, BloomProxy};
use crate::cache::{CacheStats, TtlCache};
use crate::capture::{IndexAdvisor, IndexRecommendation};
use crate::config::{Dialect, EngramConfig};
use crate::dna::DnaInverter;
use crate::engines::{PolicyEngine, ReflectionEngine, RuleEngine};
use crate::error::{EngramError, Result};
use crate::evolution::{
    EvolutionTuning, EvolutionaryPilot, MetaConfig, MetaEvolutionController, MutationState,
};
use crate::goals::GoalTracker;
use crate::journal::{Action, ActionStatus, SessionJournal, Session, Summarizer};
use crate::knowledge::{
    DistillOptions, DistillOutcome, EmbeddingFn, KnowledgeDistiller, LinkGraph,
};
use crate::persona::PersonaRegistry;
use crate::probes::ProbeEngine;
use crate::resources::ResourceMonitor;
use crate::rituals::{Ritual, RitualHandler, RitualKind, RitualOrchestrator, RitualRunReport};
use crate::skills::CapabilityRegistry;
use crate::sql::Query;
use crate::storage::{bootstrap, Introspector, SchemaSnapshot, Storage, StorageTuner};
use crate::vector::{VectorMatch, VectorStore};

// ============================================================================
// STATS
// ============================================================================

/// Roll-up of the engine's state for the metrics surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CortexStats {
    /// Row counts keyed by entity
    pub sessions: i64,
    /// Stored messages
    pub messages: i64,
    /// Journaled actions
    pub actions: i64,
    /// Knowledge items
    pub knowledge_items: i64,
    /// Knowledge links
    pub knowledge_links: i64,
    /// Vector rows
    pub memories: i64,
    /// Registered capabilities
    pub capabilities: i64,
    /// Defined rituals
    pub rituals: i64,
    /// Goals
    pub goals: i64,
    /// Cache counters
    pub cache: CacheStats,
    /// Bloom gate counters
    pub bloom: BloomMetrics,
    /// Statements currently in the capture ring
    pub captured_statements: usize,
    /// Mutation counts per state
    pub mutation_states: Vec<(String, i64)>,
    /// Total recorded cost
    pub global_cost: f64,
}

// ============================================================================
// BUILDER
// ============================================================================

/// Staged construction for hosts that install callbacks
pub struct CortexBuilder {
    config: EngramConfig,
    embedder: Option<Arc<EmbeddingFn>>,
    summarizer: Option<Arc<Summarizer>>,
}

impl CortexBuilder {
    /// Install the embedding function used by distillation and recall.
    pub fn embedder(mut self, embedder: Arc<EmbeddingFn>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Install the summarizer used by epoch compression.
    pub fn summarizer(mut self, summarizer: Arc<Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Open storage, bootstrap, and wire every subsystem.
    pub fn build(self) -> Result<Cortex> {
        Cortex::assemble(self.config, self.embedder, self.summarizer)
    }
}

// ============================================================================
// CORTEX
// ============================================================================

/// The agent-facing engine surface
pub struct Cortex {
    config: EngramConfig,
    storage: Arc<Storage>,
    journal: Arc<SessionJournal>,
    resources: ResourceMonitor,
    vectors: Arc<VectorStore>,
    distiller: Arc<KnowledgeDistiller>,
    links: LinkGraph,
    rules: RuleEngine,
    policies: Arc<PolicyEngine>,
    reflection: ReflectionEngine,
    probes: Arc<ProbeEngine>,
    capabilities: CapabilityRegistry,
    personas: PersonaRegistry,
    goals: GoalTracker,
    dna: Arc<DnaInverter>,
    pilot: Arc<EvolutionaryPilot>,
    meta: Arc<MetaEvolutionController>,
    rituals: RitualOrchestrator,
    cache: TtlCache<String, serde_json::Value>,
}

impl Cortex {
    /// Open with an optional connection string
    /// (`embedded:PATH` / `sqlite:PATH` / `:memory:` / `postgres://...`);
    /// absent, the `ENGRAM_DATABASE_URL` environment variable and then the
    /// platform data directory apply.
    pub fn open(connection_string: Option<&str>) -> Result<Self> {
        let connection = crate::config::ConnectionSettings::resolve(connection_string)?;
        let dialect = connection.dialect();
        let config = EngramConfig { dialect, connection, ..Default::default() };
        Self::with_config(config)
    }

    /// Open with a full configuration.
    pub fn with_config(config: EngramConfig) -> Result<Self> {
        Self::assemble(config, None, None)
    }

    /// Staged construction for installing callbacks.
    pub fn builder(config: EngramConfig) -> CortexBuilder {
        CortexBuilder { config, embedder: None, summarizer: None }
    }

    fn assemble(
        config: EngramConfig,
        embedder: Option<Arc<EmbeddingFn>>,
        summarizer: Option<Arc<Summarizer>>,
    ) -> Result<Self> {
        config.validate()?;
        let storage = Arc::new(Storage::open(&config.connection, &config.optimization)?);
        bootstrap(&storage)?;

        let mut journal = SessionJournal::new(storage.clone());
        if let Some(summarizer) = summarizer {
            journal = journal.with_summarizer(summarizer);
        }
        let journal = Arc::new(journal);

        let bloom = Arc::new(BloomProxy::default());
        let vectors = Arc::new(VectorStore::new(storage.clone(), config.agentic.vector.clone())?);
        let mut distiller = KnowledgeDistiller::new(
            storage.clone(),
            bloom,
            vectors.clone(),
            config.agentic.distill.clone(),
        );
        if let Some(embedder) = embedder {
            distiller = distiller.with_embedder(embedder);
        }
        let distiller = Arc::new(distiller);

        let tuning = Arc::new(Mutex::new(EvolutionTuning {
            mutation_aggressiveness: config.agentic.evolution.mutation_aggressiveness,
            verification_window: config.agentic.evolution.verification_window,
            max_sandbox_skills: config.agentic.evolution.max_sandbox_skills,
        }));
        let dna = Arc::new(DnaInverter::new(storage.clone()));
        let pilot = Arc::new(EvolutionaryPilot::new(storage.clone(), dna.clone(), tuning.clone()));
        let meta = Arc::new(MetaEvolutionController::new(
            storage.clone(),
            tuning,
            MetaConfig::default(),
        ));
        let probes = Arc::new(ProbeEngine::new(storage.clone()));

        let rituals = RitualOrchestrator::new(storage.clone());
        rituals.attach_meta(meta.clone());
        rituals.register_handler(
            RitualKind::Compression,
            Arc::new(CompressionHandler { journal: journal.clone() }),
        );
        rituals.register_handler(
            RitualKind::Pruning,
            Arc::new(PruningHandler { distiller: distiller.clone() }),
        );
        rituals.register_handler(
            RitualKind::Reindex,
            Arc::new(ReindexHandler {
                storage: storage.clone(),
                dna: dna.clone(),
                auto_index: config.automation.auto_index,
                recommendations_enabled: config.automation.index_recommendations,
                auto_optimize: config.automation.auto_optimize,
            }),
        );
        rituals.register_handler(
            RitualKind::Evolution,
            Arc::new(EvolutionHandler {
                storage: storage.clone(),
                pilot: pilot.clone(),
                meta: meta.clone(),
                migration_generation: config.automation.migration_generation,
            }),
        );
        rituals.register_handler(RitualKind::Probe, Arc::new(ProbeHandler { probes: probes.clone() }));

        let cache = TtlCache::from_config(&config.cache);

        Ok(Self {
            resources: ResourceMonitor::new(storage.clone()),
            links: LinkGraph::new(storage.clone()),
            rules: RuleEngine::new(storage.clone()),
            policies: Arc::new(PolicyEngine::new(storage.clone())),
            reflection: ReflectionEngine::new(storage.clone()),
            capabilities: CapabilityRegistry::new(storage.clone()),
            personas: PersonaRegistry::new(storage.clone()),
            goals: GoalTracker::new(storage.clone()),
            config,
            storage,
            journal,
            vectors,
            distiller,
            probes,
            dna,
            pilot,
            meta,
            rituals,
            cache,
        })
    }

    // ------------------------------------------------------------------
    // Component access
    // ------------------------------------------------------------------

    /// Active configuration.
    pub fn config(&self) -> &EngramConfig {
        &self.config
    }

    /// The shared storage adapter.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Session / message / action / episode / epoch journals.
    pub fn sessions(&self) -> &SessionJournal {
        &self.journal
    }

    /// Knowledge distillation and challenges.
    pub fn knowledge(&self) -> &KnowledgeDistiller {
        &self.distiller
    }

    /// The knowledge link graph.
    pub fn links(&self) -> &LinkGraph {
        &self.links
    }

    /// The vector store.
    pub fn vectors(&self) -> &VectorStore {
        &self.vectors
    }

    /// Resource usage accounting.
    pub fn resources(&self) -> &ResourceMonitor {
        &self.resources
    }

    /// Capability registry.
    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    /// Persona registry.
    pub fn personas(&self) -> &PersonaRegistry {
        &self.personas
    }

    /// Goal tracker.
    pub fn goals(&self) -> &GoalTracker {
        &self.goals
    }

    /// Rule engine.
    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    /// Policy engine.
    pub fn policies(&self) -> &PolicyEngine {
        &self.policies
    }

    /// Reflection engine.
    pub fn reflection(&self) -> &ReflectionEngine {
        &self.reflection
    }

    /// Logic probes.
    pub fn probes(&self) -> &ProbeEngine {
        &self.probes
    }

    /// Ritual orchestrator.
    pub fn rituals(&self) -> &RitualOrchestrator {
        &self.rituals
    }

    /// Evolutionary pilot.
    pub fn evolution(&self) -> &EvolutionaryPilot {
        &self.pilot
    }

    /// Meta-evolution controller.
    pub fn meta(&self) -> &MetaEvolutionController {
        &self.meta
    }

    /// DNA inverter (snapshots, inverses, rollback).
    pub fn dna(&self) -> &DnaInverter {
        &self.dna
    }

    /// General-purpose bounded cache.
    pub fn cache(&self) -> &TtlCache<String, serde_json::Value> {
        &self.cache
    }

    // ------------------------------------------------------------------
    // Guard-railed operations (policy check, then the component)
    // ------------------------------------------------------------------

    /// Open a session (policy key `sessions.open`).
    pub fn open_session(&self, name: Option<&str>) -> Result<Session> {
        self.policies.check("sessions.open", name.unwrap_or("anonymous"))?;
        self.journal.open_session(name, None)
    }

    /// Append a pending action (policy key `actions.append`).
    pub fn append_action(&self, session_id: i64, tool: &str, args: &str) -> Result<Action> {
        self.policies.check("actions.append", &session_id.to_string())?;
        self.journal.append_action(session_id, tool, args, None)
    }

    /// Finalize an action (policy key `actions.complete`).
    pub fn complete_action(
        &self,
        action_id: i64,
        status: ActionStatus,
        outcome: &str,
        duration_ms: i64,
    ) -> Result<Action> {
        self.policies.check("actions.complete", &action_id.to_string())?;
        self.journal.complete_action(action_id, status, outcome, duration_ms)
    }

    /// Distill a fact (policy key `knowledge.distill`).
    pub fn distill(&self, entity: &str, fact: &str, confidence: f64) -> Result<DistillOutcome> {
        self.policies.check("knowledge.distill", entity)?;
        self.distiller.distill(entity, fact, confidence, DistillOptions::default())
    }

    /// Challenge existing knowledge (policy key `knowledge.challenge`).
    pub fn challenge(
        &self,
        entity: &str,
        evidence: &str,
        new_confidence: f64,
    ) -> Result<crate::knowledge::KnowledgeItem> {
        self.policies.check("knowledge.challenge", entity)?;
        self.distiller.challenge(entity, evidence, new_confidence)
    }

    /// Add a vector row (policy key `vectors.add`).
    pub fn vectors_add(&self, content: &str, embedding: &[f32]) -> Result<i64> {
        self.policies.check("vectors.add", "default")?;
        self.vectors.insert(content, embedding, None, serde_json::json!({}))
    }

    /// Nearest-neighbour search (policy key `vectors.search`).
    pub fn vectors_search(
        &self,
        embedding: &[f32],
        top_n: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<VectorMatch>> {
        self.policies.check("vectors.search", "default")?;
        self.vectors.search(embedding, top_n, deadline)
    }

    /// Propose a mutation (policy key `evolution.propose`).
    pub fn propose_mutation(&self, ddl: &str, note: Option<&str>) -> Result<crate::evolution::MutationRecord> {
        self.policies.check("evolution.propose", "default")?;
        self.pilot.propose(ddl, note)
    }

    /// Run every due ritual now.
    pub fn run_pending(&self) -> Result<Vec<RitualRunReport>> {
        self.rituals.run_pending(Utc::now(), None)
    }

    /// Introspect the live schema.
    pub fn introspect(&self) -> Result<SchemaSnapshot> {
        Introspector::with_config(&self.storage, self.config.introspection.clone()).snapshot()
    }

    /// Refresh planner statistics.
    pub fn optimize(&self) -> Result<()> {
        StorageTuner::new(&self.storage).analyze()
    }

    /// Current index recommendations from the capture ring.
    pub fn index_recommendations(&self) -> Result<Vec<IndexRecommendation>> {
        let schema = self.introspect()?;
        Ok(IndexAdvisor::analyze(&self.storage.capture().snapshot(), &schema))
    }

    /// Metrics roll-up.
    pub fn stats(&self) -> Result<CortexStats> {
        let count = |table: &str| -> Result<i64> {
            self.storage
                .with_reader(|conn| conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0)))
        };
        Ok(CortexStats {
            sessions: count("agent_sessions")?,
            messages: count("agent_messages")?,
            actions: count("agent_actions")?,
            knowledge_items: count("agent_knowledge_base")?,
            knowledge_links: count("agent_knowledge_links")?,
            memories: count("agent_memories")?,
            capabilities: count("agent_capabilities")?,
            rituals: count("agent_rituals")?,
            goals: count("agent_goals")?,
            cache: self.cache.stats(),
            bloom: self.distiller.bloom().metrics(),
            captured_statements: self.storage.capture().len(),
            mutation_states: self.pilot.state_counts()?,
            global_cost: self.resources.global_total_cost()?,
        })
    }
}

// ============================================================================
// RITUAL HANDLERS
// ============================================================================

/// Compresses each session's oldest uncovered messages into epochs,
/// keeping a recent tail uncompressed (`keepRecent`, default 20).
struct CompressionHandler {
    journal: Arc<SessionJournal>,
}

impl RitualHandler for CompressionHandler {
    fn execute(&self, ritual: &Ritual, deadline: Option<Instant>) -> Result<String> {
        let keep_recent = ritual.definition["keepRecent"].as_u64().unwrap_or(20) as usize;
        let mut compressed = 0usize;
        for session in self.journal.list_sessions(None)? {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(EngramError::Timeout { operation: "compression ritual" });
                }
            }
            let messages = self.journal.list_messages(session.id, None)?;
            if messages.len() <= keep_recent {
                continue;
            }
            let covered_up_to = self
                .journal
                .list_epochs(session.id)?
                .iter()
                .map(|e| e.end_message_id)
                .max()
                .unwrap_or(0);
            let cutoff = messages[messages.len() - keep_recent - 1].id;
            let from = messages.iter().map(|m| m.id).find(|id| *id > covered_up_to);
            match from {
                Some(from) if from <= cutoff => {
                    self.journal.compress_range(session.id, from, cutoff)?;
                    compressed += 1;
                }
                _ => {}
            }
        }
        Ok(format!("compressed ranges in {compressed} sessions"))
    }
}

/// Prunes stale low-confidence knowledge
/// (`confidenceBelow` default 0.2, `minAgeDays` default 30).
struct PruningHandler {
    distiller: Arc<KnowledgeDistiller>,
}

impl RitualHandler for PruningHandler {
    fn execute(&self, ritual: &Ritual, _deadline: Option<Instant>) -> Result<String> {
        let below = ritual.definition["confidenceBelow"].as_f64().unwrap_or(0.2);
        let min_age = ritual.definition["minAgeDays"].as_i64().unwrap_or(30);
        let removed = self.distiller.prune(below, min_age)?;
        Ok(format!("pruned {removed} knowledge items"))
    }
}

/// Refreshes planner statistics and, when automation allows, turns capture
/// analysis into revertible index mutations through the DNA inverter.
struct ReindexHandler {
    storage: Arc<Storage>,
    dna: Arc<DnaInverter>,
    auto_index: bool,
    recommendations_enabled: bool,
    auto_optimize: bool,
}

impl RitualHandler for ReindexHandler {
    fn execute(&self, _ritual: &Ritual, _deadline: Option<Instant>) -> Result<String> {
        if self.auto_optimize {
            StorageTuner::new(&self.storage).analyze()?;
        }
        if !self.recommendations_enabled {
            return Ok("statistics refreshed".to_string());
        }
        let schema = Introspector::new(&self.storage).snapshot()?;
        let recommendations = IndexAdvisor::analyze(&self.storage.capture().snapshot(), &schema);
        if !self.auto_index {
            return Ok(format!("{} index recommendations pending", recommendations.len()));
        }
        let mut created = 0usize;
        for rec in &recommendations {
            let name = rec.index_name();
            if schema.has_index(&name) {
                continue;
            }
            // Captured names re-enter the safety pipeline as nodes
            let node = match rec.to_create_index() {
                Ok(node) => node,
                Err(e) => {
                    tracing::warn!(index = %name, "skipping recommendation: {e}");
                    continue;
                }
            };
            let ddl = Dialect::Embedded.render(&Query::CreateIndex(node)).sql;
            self.dna.apply(&ddl, &format!("auto-index {name}"))?;
            created += 1;
        }
        Ok(format!("created {created} of {} recommended indexes", recommendations.len()))
    }
}

/// Advances the mutation state machine one step per tick and lets the
/// meta-controller react to the health window.
struct EvolutionHandler {
    storage: Arc<Storage>,
    pilot: Arc<EvolutionaryPilot>,
    meta: Arc<MetaEvolutionController>,
    migration_generation: bool,
}

impl RitualHandler for EvolutionHandler {
    fn execute(&self, _ritual: &Ritual, _deadline: Option<Instant>) -> Result<String> {
        let tuning = self.pilot.tuning()?;
        let mut steps = Vec::new();

        // Proposals from capture analysis, gated by aggressiveness
        if self.migration_generation && tuning.mutation_aggressiveness > 0.0 {
            let schema = Introspector::new(&self.storage).snapshot()?;
            let recommendations = IndexAdvisor::analyze(&self.storage.capture().snapshot(), &schema);
            let budget = (tuning.mutation_aggressiveness * 4.0).ceil() as usize;
            let existing = self.pilot.list(None)?;
            for rec in recommendations.iter().take(budget) {
                // Captured names re-enter the safety pipeline as nodes;
                // the render matches the pilot's stored canonical form
                let node = match rec.to_create_index() {
                    Ok(node) => node,
                    Err(e) => {
                        tracing::warn!(index = %rec.index_name(), "skipping recommendation: {e}");
                        continue;
                    }
                };
                let ddl = Dialect::Embedded.render(&Query::CreateIndex(node)).sql;
                if existing.iter().any(|m| m.ddl == ddl) || schema.has_index(&rec.index_name()) {
                    continue;
                }
                self.pilot.propose(&ddl, Some(&rec.reason))?;
                steps.push(format!("proposed {}", rec.index_name()));
            }
        }

        // Advance each live mutation one step
        for record in self.pilot.list(Some(MutationState::Proposed))? {
            match self.pilot.sandbox(record.id) {
                Ok(_) => steps.push(format!("sandboxed #{}", record.id)),
                Err(e) => steps.push(format!("rejected #{}: {e}", record.id)),
            }
        }
        for record in self.pilot.list(Some(MutationState::Sandboxed))? {
            self.pilot.begin_verification(record.id)?;
            steps.push(format!("verifying #{}", record.id));
        }
        for record in self.pilot.list(Some(MutationState::Verifying))? {
            // Shadow one production-representative operation per tick
            let shadow_ok = match &record.target_table {
                Some(table) => self
                    .storage
                    .with_reader(|conn| {
                        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| {
                            r.get::<_, i64>(0)
                        })
                    })
                    .is_ok(),
                None => true,
            };
            let updated = self.pilot.record_verification(record.id, shadow_ok)?;
            if updated.success_count >= tuning.verification_window as i64 {
                self.pilot.promote(record.id)?;
                steps.push(format!("promoted #{}", record.id));
            }
        }

        if let Some(decision) = self.meta.evaluate(&self.pilot)? {
            steps.push(format!("meta: {decision:?}"));
        }

        if steps.is_empty() {
            Ok("no evolution work".to_string())
        } else {
            Ok(steps.join("; "))
        }
    }
}

/// Runs every logic probe.
struct ProbeHandler {
    probes: Arc<ProbeEngine>,
}

impl RitualHandler for ProbeHandler {
    fn execute(&self, _ritual: &Ritual, _deadline: Option<Instant>) -> Result<String> {
        let results = self.probes.run_all()?;
        let passed = results.iter().filter(|r| r.passed != Some(false)).count();
        Ok(format!("{passed}/{} probes healthy", results.len()))
    }
}

// ============================================================================
// TESTS
// ============================================================================
