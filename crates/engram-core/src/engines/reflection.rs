//! Reflection engine
//!
//! Condenses a terminated episode's actions into `{outcome, lessons_learned,
//! suggested_actions}`. The condensation is heuristic (failure clusters,
//! slow tools, overall success ratio); hosts wanting prose install an LLM
//! summarizer at the journal layer instead.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::{EngramError, Result};
use crate::journal::{Action, ActionStatus, Episode, EpisodeStatus, SessionJournal};
use crate::storage::Storage;

/// Tools averaging above this duration get a "slow" lesson
const SLOW_TOOL_MS: f64 = 1_000.0;

// ============================================================================
// ROWS
// ============================================================================

/// One stored reflection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reflection {
    /// Row id
    pub id: i64,
    /// Owning session, when any
    pub session_id: Option<i64>,
    /// Reflected episode, when any
    pub episode_id: Option<i64>,
    /// Condensed outcome line
    pub outcome: String,
    /// Derived lessons
    pub lessons_learned: Vec<String>,
    /// Derived follow-ups
    pub suggested_actions: Vec<String>,
    /// Insertion time
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Episode condensation over an open storage
pub struct ReflectionEngine {
    storage: Arc<Storage>,
}

impl ReflectionEngine {
    /// Bind to an open storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Reflect on a closed episode, persisting the result.
    ///
    /// Active episodes cannot be reflected; close them first.
    pub fn reflect_on_episode(&self, journal: &SessionJournal, episode_id: i64) -> Result<Reflection> {
        let episode = journal
            .get_episode(episode_id)?
            .ok_or(EngramError::NotFound { entity: "episode", id: episode_id })?;
        if episode.status != EpisodeStatus::Closed {
            return Err(EngramError::IllegalTransition {
                entity: "episode",
                id: episode_id,
                from: "active".to_string(),
                to: "reflected".to_string(),
            });
        }

        let actions = self.actions_in_window(journal, &episode)?;
        let (outcome, lessons, suggestions) = condense(&episode, &actions);
        self.insert(Some(episode.session_id), Some(episode_id), &outcome, &lessons, &suggestions)
    }

    /// Reflections of a session, newest first.
    pub fn for_session(&self, session_id: i64) -> Result<Vec<Reflection>> {
        self.storage.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, episode_id, outcome, lessons_learned, suggested_actions, created_at \
                 FROM agent_reflections WHERE session_id = ?1 ORDER BY id DESC",
            )?;
            let rows = stmt
                .query_map([session_id], row_to_reflection)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn actions_in_window(&self, journal: &SessionJournal, episode: &Episode) -> Result<Vec<Action>> {
        let end = episode.end_time.unwrap_or_else(Utc::now);
        Ok(journal
            .list_actions(episode.session_id)?
            .into_iter()
            .filter(|a| a.created_at >= episode.start_time && a.created_at <= end)
            .collect())
    }

    fn insert(
        &self,
        session_id: Option<i64>,
        episode_id: Option<i64>,
        outcome: &str,
        lessons: &[String],
        suggestions: &[String],
    ) -> Result<Reflection> {
        let now = Utc::now().to_rfc3339();
        let lessons_json = serde_json::to_string(lessons)?;
        let suggestions_json = serde_json::to_string(suggestions)?;
        let id = self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_reflections \
                 (session_id, episode_id, outcome, lessons_learned, suggested_actions, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![session_id, episode_id, outcome, lessons_json, suggestions_json, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get(id)?.ok_or(EngramError::NotFound { entity: "reflection", id })
    }

    fn get(&self, id: i64) -> Result<Option<Reflection>> {
        self.storage.with_reader(|conn| {
            conn.query_row(
                "SELECT id, session_id, episode_id, outcome, lessons_learned, suggested_actions, created_at \
                 FROM agent_reflections WHERE id = ?1",
                [id],
                row_to_reflection,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }
}

/// Heuristic condensation of an episode's actions.
fn condense(episode: &Episode, actions: &[Action]) -> (String, Vec<String>, Vec<String>) {
    let total = actions.len();
    let failures: Vec<&Action> =
        actions.iter().filter(|a| a.status == ActionStatus::Failure).collect();
    let unfinished = actions.iter().filter(|a| a.status == ActionStatus::Pending).count();
    let successes = total - failures.len() - unfinished;

    let outcome = format!(
        "episode {:?}: {successes}/{total} actions succeeded, {} failed, {unfinished} unfinished",
        episode.name,
        failures.len(),
    );

    let mut lessons = Vec::new();
    let mut suggestions = Vec::new();

    // Failure clusters by tool
    let mut failures_by_tool: HashMap<&str, usize> = HashMap::new();
    for action in &failures {
        *failures_by_tool.entry(action.tool_name.as_str()).or_default() += 1;
    }
    let mut clusters: Vec<(&str, usize)> = failures_by_tool.into_iter().collect();
    clusters.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    for (tool, count) in clusters {
        if count >= 2 {
            lessons.push(format!("tool {tool} failed {count} times"));
            suggestions.push(format!("review arguments or reliability of tool {tool}"));
        }
    }

    // Slow tools by average duration
    let mut durations: HashMap<&str, (f64, usize)> = HashMap::new();
    for action in actions {
        if let Some(ms) = action.duration_ms {
            let entry = durations.entry(action.tool_name.as_str()).or_default();
            entry.0 += ms as f64;
            entry.1 += 1;
        }
    }
    let mut slow: Vec<(&str, f64)> = durations
        .into_iter()
        .filter_map(|(tool, (sum, n))| {
            let avg = sum / n as f64;
            (avg > SLOW_TOOL_MS).then_some((tool, avg))
        })
        .collect();
    slow.sort_by(|a, b| b.1.total_cmp(&a.1));
    for (tool, avg) in slow {
        lessons.push(format!("tool {tool} averaged {avg:.0}ms"));
    }

    if unfinished > 0 {
        lessons.push(format!("{unfinished} actions never finalized"));
        suggestions.push("finalize or abandon pending actions before closing episodes".to_string());
    }
    if total > 0 && failures.is_empty() && unfinished == 0 {
        lessons.push("all actions completed cleanly".to_string());
    }

    (outcome, lessons, suggestions)
}

fn row_to_reflection(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reflection> {
    let lessons: String = row.get(4)?;
    let suggestions: String = row.get(5)?;
    let created: String = row.get(6)?;
    Ok(Reflection {
        id: row.get(0)?,
        session_id: row.get(1)?,
        episode_id: row.get(2)?,
        outcome: row.get(3)?,
        lessons_learned: serde_json::from_str(&lessons).unwrap_or_default(),
        suggested_actions: serde_json::from_str(&suggestions).unwrap_or_default(),
        created_at: created.parse().unwrap_or_else(|_| Utc::now()),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionSettings, OptimizationConfig};
    use crate::storage::bootstrap;

    fn setup() -> (ReflectionEngine, SessionJournal) {
        let storage = Arc::new(
            Storage::open(
                &ConnectionSettings::Embedded { path: None },
                &OptimizationConfig::default(),
            )
            .unwrap(),
        );
        bootstrap(&storage).unwrap();
        (ReflectionEngine::new(storage.clone()), SessionJournal::new(storage))
    }

    #[test]
    fn active_episodes_cannot_be_reflected() {
        let (engine, journal) = setup();
        let session = journal.open_session(Some("s"), None).unwrap();
        let episode = journal.start_episode(session.id, "work").unwrap();
        let err = engine.reflect_on_episode(&journal, episode.id);
        assert!(matches!(err, Err(EngramError::IllegalTransition { .. })));
    }

    #[test]
    fn reflection_counts_outcomes_and_derives_lessons() {
        let (engine, journal) = setup();
        let session = journal.open_session(Some("s"), None).unwrap();
        let episode = journal.start_episode(session.id, "work").unwrap();

        let ok = journal.append_action(session.id, "calc", "{}", None).unwrap();
        journal.complete_action(ok.id, ActionStatus::Success, "4", 10).unwrap();
        for _ in 0..2 {
            let failing = journal.append_action(session.id, "fetch", "{}", None).unwrap();
            journal
                .complete_action(failing.id, ActionStatus::Failure, "timeout", 2_500)
                .unwrap();
        }
        journal.close_episode(episode.id, None).unwrap();

        let reflection = engine.reflect_on_episode(&journal, episode.id).unwrap();
        assert!(reflection.outcome.contains("1/3 actions succeeded"));
        assert!(reflection.lessons_learned.iter().any(|l| l.contains("fetch failed 2 times")));
        assert!(reflection
            .suggested_actions
            .iter()
            .any(|s| s.contains("reliability of tool fetch")));
        assert_eq!(reflection.episode_id, Some(episode.id));

        let listed = engine.for_session(session.id).unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn clean_episode_gets_positive_lesson() {
        let (engine, journal) = setup();
        let session = journal.open_session(Some("s"), None).unwrap();
        let episode = journal.start_episode(session.id, "smooth").unwrap();
        let a = journal.append_action(session.id, "calc", "{}", None).unwrap();
        journal.complete_action(a.id, ActionStatus::Success, "ok", 5).unwrap();
        journal.close_episode(episode.id, None).unwrap();

        let reflection = engine.reflect_on_episode(&journal, episode.id).unwrap();
        assert!(reflection
            .lessons_learned
            .iter()
            .any(|l| l.contains("completed cleanly")));
        assert!(reflection.suggested_actions.is_empty());
    }
}
