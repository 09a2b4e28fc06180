//! Meta-evolution controller
//!
//! Watches a rolling window of ritual/skill outcomes and compares the
//! window's success rate against the long-run baseline with a z-score. A
//! regression beyond the threshold lowers mutation aggressiveness, extends
//! the verification window, and rolls back the most recently promoted
//! mutation; sustained improvement raises aggressiveness (capped in [0, 1]).
//! Every adjustment is audited to `agent_meta_events`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::{EngramError, Result};
use crate::evolution::pilot::{EvolutionTuning, EvolutionaryPilot};
use crate::storage::Storage;

// ============================================================================
// CONFIG & SAMPLES
// ============================================================================

/// Controller tuning
#[derive(Debug, Clone)]
pub struct MetaConfig {
    /// Rolling window size
    pub window_size: usize,
    /// Samples required before the controller acts
    pub min_samples: usize,
    /// |z| beyond which the controller reacts
    pub z_threshold: f64,
    /// Aggressiveness delta per reaction
    pub aggressiveness_step: f64,
    /// Verification window growth factor on regression
    pub window_extension_factor: f64,
    /// Verification window hard cap
    pub max_verification_window: u32,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            min_samples: 10,
            z_threshold: 2.0,
            aggressiveness_step: 0.05,
            window_extension_factor: 1.5,
            max_verification_window: 10_000,
        }
    }
}

/// One observed outcome
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutcomeSample {
    /// Whether the operation succeeded
    pub success: bool,
    /// Observed latency
    pub latency_ms: f64,
}

/// What the controller decided on an evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum MetaDecision {
    /// Success rate regressed; brakes applied
    Regression {
        /// Observed z-score
        z_score: f64,
        /// Mutation rolled back, when one was promoted
        reverted_mutation: Option<i64>,
    },
    /// Success rate improved; aggressiveness raised
    Improvement {
        /// Observed z-score
        z_score: f64,
    },
}

/// One audited adjustment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaEvent {
    /// Row id
    pub id: i64,
    /// `"regression"`, `"improvement"`, or `"rollback"`
    pub event_type: String,
    /// z-score at decision time, when applicable
    pub z_score: Option<f64>,
    /// Aggressiveness after the adjustment
    pub aggressiveness: f64,
    /// Verification window after the adjustment
    pub verification_window: i64,
    /// Free-form detail
    pub detail: Option<String>,
    /// Insertion time
    pub created_at: DateTime<Utc>,
}

struct Baseline {
    samples: u64,
    successes: u64,
}

// ============================================================================
// CONTROLLER
// ============================================================================

/// Z-score driven governor over the evolutionary pilot's tuning
pub struct MetaEvolutionController {
    storage: Arc<Storage>,
    tuning: Arc<Mutex<EvolutionTuning>>,
    config: MetaConfig,
    window: Mutex<VecDeque<OutcomeSample>>,
    baseline: Mutex<Baseline>,
}

impl MetaEvolutionController {
    /// Bind to storage and the shared tuning cell.
    pub fn new(
        storage: Arc<Storage>,
        tuning: Arc<Mutex<EvolutionTuning>>,
        config: MetaConfig,
    ) -> Self {
        Self {
            storage,
            tuning,
            config,
            window: Mutex::new(VecDeque::new()),
            baseline: Mutex::new(Baseline { samples: 0, successes: 0 }),
        }
    }

    /// Record one outcome into the rolling window and the baseline.
    ///
    /// O(1); the lock is never held across I/O.
    pub fn record_outcome(&self, success: bool, latency_ms: f64) {
        {
            let mut window = self.window.lock().unwrap_or_else(|p| p.into_inner());
            if window.len() == self.config.window_size {
                window.pop_front();
            }
            window.push_back(OutcomeSample { success, latency_ms });
        }
        let mut baseline = self.baseline.lock().unwrap_or_else(|p| p.into_inner());
        baseline.samples += 1;
        if success {
            baseline.successes += 1;
        }
    }

    /// Current window z-score against the baseline, when computable.
    pub fn z_score(&self) -> Option<f64> {
        let window = self.window.lock().unwrap_or_else(|p| p.into_inner());
        let n = window.len();
        if n < self.config.min_samples {
            return None;
        }
        let window_rate = window.iter().filter(|s| s.success).count() as f64 / n as f64;
        drop(window);

        let baseline = self.baseline.lock().unwrap_or_else(|p| p.into_inner());
        if baseline.samples == 0 {
            return None;
        }
        let p = baseline.successes as f64 / baseline.samples as f64;
        let variance = p * (1.0 - p);
        if variance <= f64::EPSILON {
            // Degenerate baseline (all success or all failure): any deviation
            // in the window is a full-strength signal
            return Some(if (window_rate - p).abs() <= f64::EPSILON {
                0.0
            } else if window_rate > p {
                self.config.z_threshold + 1.0
            } else {
                -(self.config.z_threshold + 1.0)
            });
        }
        Some((window_rate - p) / (variance / n as f64).sqrt())
    }

    /// Evaluate the window and adjust the pilot's tuning when the z-score
    /// crosses the threshold. Returns what was decided, if anything.
    pub fn evaluate(&self, pilot: &EvolutionaryPilot) -> Result<Option<MetaDecision>> {
        let Some(z) = self.z_score() else { return Ok(None) };

        if z <= -self.config.z_threshold {
            let (aggressiveness, window) = {
                let mut tuning = self
                    .tuning
                    .lock()
                    .map_err(|_| EngramError::LockPoisoned("evolution tuning"))?;
                tuning.mutation_aggressiveness =
                    (tuning.mutation_aggressiveness - self.config.aggressiveness_step).max(0.0);
                let extended =
                    (tuning.verification_window as f64 * self.config.window_extension_factor).ceil();
                tuning.verification_window =
                    (extended as u32).min(self.config.max_verification_window).max(1);
                (tuning.mutation_aggressiveness, tuning.verification_window)
            };
            self.audit("regression", Some(z), aggressiveness, window, None)?;

            let reverted = pilot.revert_latest_promoted()?;
            if let Some(record) = &reverted {
                self.audit(
                    "rollback",
                    Some(z),
                    aggressiveness,
                    window,
                    Some(&format!("reverted mutation {}", record.id)),
                )?;
            }
            self.drain_window();
            tracing::warn!(z, aggressiveness, window, "meta-evolution regression response");
            return Ok(Some(MetaDecision::Regression {
                z_score: z,
                reverted_mutation: reverted.map(|r| r.id),
            }));
        }

        if z >= self.config.z_threshold {
            let (aggressiveness, window) = {
                let mut tuning = self
                    .tuning
                    .lock()
                    .map_err(|_| EngramError::LockPoisoned("evolution tuning"))?;
                tuning.mutation_aggressiveness =
                    (tuning.mutation_aggressiveness + self.config.aggressiveness_step).min(1.0);
                (tuning.mutation_aggressiveness, tuning.verification_window)
            };
            self.audit("improvement", Some(z), aggressiveness, window, None)?;
            self.drain_window();
            tracing::info!(z, aggressiveness, "meta-evolution raised aggressiveness");
            return Ok(Some(MetaDecision::Improvement { z_score: z }));
        }

        Ok(None)
    }

    /// Audited adjustments, newest first.
    pub fn events(&self) -> Result<Vec<MetaEvent>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_type, z_score, aggressiveness, verification_window, detail, created_at \
                 FROM agent_meta_events ORDER BY id DESC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let created: String = row.get(6)?;
                    Ok(MetaEvent {
                        id: row.get(0)?,
                        event_type: row.get(1)?,
                        z_score: row.get(2)?,
                        aggressiveness: row.get(3)?,
                        verification_window: row.get(4)?,
                        detail: row.get(5)?,
                        created_at: created.parse().unwrap_or_else(|_| Utc::now()),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn audit(
        &self,
        event_type: &str,
        z: Option<f64>,
        aggressiveness: f64,
        verification_window: u32,
        detail: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_meta_events \
                 (event_type, z_score, aggressiveness, verification_window, detail, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![event_type, z, aggressiveness, verification_window as i64, detail, now],
            )?;
            Ok(())
        })
    }

    fn drain_window(&self) {
        self.window.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionSettings, OptimizationConfig};
    use crate::dna::DnaInverter;
    use crate::storage::{bootstrap, Introspector};

    fn setup() -> (MetaEvolutionController, EvolutionaryPilot, Arc<Storage>) {
        let storage = Arc::new(
            Storage::open(
                &ConnectionSettings::Embedded { path: None },
                &OptimizationConfig::default(),
            )
            .unwrap(),
        );
        bootstrap(&storage).unwrap();
        let tuning = Arc::new(Mutex::new(EvolutionTuning {
            mutation_aggressiveness: 0.5,
            verification_window: 10,
            max_sandbox_skills: 4,
        }));
        let pilot = EvolutionaryPilot::new(
            storage.clone(),
            Arc::new(DnaInverter::new(storage.clone())),
            tuning.clone(),
        );
        let controller = MetaEvolutionController::new(
            storage.clone(),
            tuning,
            MetaConfig { window_size: 20, min_samples: 10, ..Default::default() },
        );
        (controller, pilot, storage)
    }

    fn seed_baseline(controller: &MetaEvolutionController, successes: usize, failures: usize) {
        for _ in 0..successes {
            controller.record_outcome(true, 10.0);
        }
        for _ in 0..failures {
            controller.record_outcome(false, 10.0);
        }
    }

    #[test]
    fn no_decision_below_min_samples() {
        let (controller, pilot, _storage) = setup();
        controller.record_outcome(true, 1.0);
        assert_eq!(controller.evaluate(&pilot).unwrap(), None);
    }

    #[test]
    fn stable_rate_takes_no_action() {
        let (controller, pilot, _storage) = setup();
        // Mixed baseline, window matches it
        for i in 0..100 {
            controller.record_outcome(i % 2 == 0, 5.0);
        }
        assert_eq!(controller.evaluate(&pilot).unwrap(), None);
    }

    #[test]
    fn regression_brakes_and_rolls_back() {
        let (controller, pilot, storage) = setup();

        // Promote something to roll back
        {
            let mut tuning = pilot.tuning().unwrap();
            tuning.verification_window = 1;
            // write back through the shared cell
            *controller.tuning.lock().unwrap() = tuning;
        }
        let record = pilot
            .propose("CREATE INDEX idx_meta_test ON agent_goals(title)", None)
            .unwrap();
        pilot.sandbox(record.id).unwrap();
        pilot.begin_verification(record.id).unwrap();
        pilot.record_verification(record.id, true).unwrap();
        pilot.promote(record.id).unwrap();

        // Healthy history, then a collapse confined to the window
        seed_baseline(&controller, 500, 25);
        for _ in 0..20 {
            controller.record_outcome(false, 50.0);
        }

        let before = pilot.tuning().unwrap();
        let decision = controller.evaluate(&pilot).unwrap().unwrap();
        match decision {
            MetaDecision::Regression { z_score, reverted_mutation } => {
                assert!(z_score <= -2.0);
                assert_eq!(reverted_mutation, Some(record.id));
            }
            other => panic!("expected regression, got {other:?}"),
        }

        let after = pilot.tuning().unwrap();
        assert!(after.mutation_aggressiveness < before.mutation_aggressiveness);
        assert!(after.verification_window > before.verification_window);

        // Index rolled back, schema matches the pre-mutation snapshot
        let snapshot = Introspector::new(&storage).snapshot().unwrap();
        assert!(!snapshot.has_index("idx_meta_test"));

        // Audited
        let events = controller.events().unwrap();
        assert!(events.iter().any(|e| e.event_type == "regression"));
        assert!(events.iter().any(|e| e.event_type == "rollback"));
    }

    #[test]
    fn improvement_raises_aggressiveness_capped() {
        let (controller, pilot, _storage) = setup();
        // Weak baseline, then a strong window
        seed_baseline(&controller, 250, 250);
        for _ in 0..20 {
            controller.record_outcome(true, 5.0);
        }
        let decision = controller.evaluate(&pilot).unwrap().unwrap();
        assert!(matches!(decision, MetaDecision::Improvement { .. }));
        let tuning = pilot.tuning().unwrap();
        assert!(tuning.mutation_aggressiveness > 0.5);
        assert!(tuning.mutation_aggressiveness <= 1.0);

        // Monotone and capped under repeated improvement
        for _ in 0..30 {
            seed_baseline(&controller, 10, 10);
            for _ in 0..20 {
                controller.record_outcome(true, 5.0);
            }
            controller.evaluate(&pilot).unwrap();
        }
        assert!(pilot.tuning().unwrap().mutation_aggressiveness <= 1.0);
    }
}
