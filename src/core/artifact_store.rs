//! Run-scoped artifact store.
//!
//! Artifacts are keyed by (run id, producer stage id, name). A lookup never
//! crosses runs. Once a producer stage reaches a terminal state it is
//! sealed, which turns "nothing matches yet" into a permanent miss.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use glob::Pattern;
use thiserror::Error;
use tokio::sync::{Notify, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{ArtifactRecord, StageState};

/// A registered artifact and its bytes
#[derive(Debug, Clone)]
pub struct Artifact {
    pub record: ArtifactRecord,
    pub content: Arc<[u8]>,
}

/// Lookup failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactNotFoundError {
    /// Producer has not finished yet; the caller may wait
    #[error("Stage '{stage}' has not yet produced an artifact matching '{rule}'")]
    NotYetAvailable { stage: String, rule: String },

    /// Producer finished without a match; waiting will not help
    #[error("Stage '{stage}' ended {state} without producing an artifact matching '{rule}'")]
    Unavailable {
        stage: String,
        rule: String,
        state: StageState,
    },

    #[error("Invalid artifact rule '{rule}': {message}")]
    InvalidRule { rule: String, message: String },
}

impl ArtifactNotFoundError {
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::NotYetAvailable { .. })
    }
}

type StageKey = (Uuid, String);

#[derive(Debug, Default)]
struct StoreState {
    /// (run, stage) -> name -> artifact
    artifacts: HashMap<StageKey, BTreeMap<String, Artifact>>,

    /// (run, stage) -> terminal state of the producer
    sealed: HashMap<StageKey, StageState>,
}

/// In-memory artifact store shared by all stages of all runs
#[derive(Debug, Default)]
pub struct ArtifactStore {
    state: RwLock<StoreState>,
    changed: Notify,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an artifact. Writing the same (run, stage, name) again
    /// replaces the earlier content.
    pub async fn put(
        &self,
        run_id: Uuid,
        stage_id: &str,
        name: &str,
        content: Vec<u8>,
    ) -> ArtifactRecord {
        let record = ArtifactRecord::new(run_id, stage_id, name, &content);
        let artifact = Artifact {
            record: record.clone(),
            content: content.into(),
        };

        {
            let mut state = self.state.write().await;
            state
                .artifacts
                .entry((run_id, stage_id.to_string()))
                .or_default()
                .insert(name.to_string(), artifact);
        }

        debug!(%run_id, stage = stage_id, name, size = record.size_bytes, "Artifact registered");
        self.changed.notify_waiters();
        record
    }

    /// Record the terminal state of a producer stage
    pub async fn seal(&self, run_id: Uuid, stage_id: &str, state: StageState) {
        self.state
            .write()
            .await
            .sealed
            .insert((run_id, stage_id.to_string()), state);
        self.changed.notify_waiters();
    }

    /// Every artifact of `stage_id` in `run_id` whose name matches `rule`,
    /// sorted by name
    pub async fn get(
        &self,
        run_id: Uuid,
        stage_id: &str,
        rule: &str,
    ) -> Result<Vec<Artifact>, ArtifactNotFoundError> {
        let pattern = Pattern::new(rule).map_err(|e| ArtifactNotFoundError::InvalidRule {
            rule: rule.to_string(),
            message: e.to_string(),
        })?;

        let key = (run_id, stage_id.to_string());
        let state = self.state.read().await;

        let found: Vec<Artifact> = state
            .artifacts
            .get(&key)
            .map(|by_name| {
                by_name
                    .values()
                    .filter(|a| pattern.matches(&a.record.name))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if !found.is_empty() {
            return Ok(found);
        }

        match state.sealed.get(&key) {
            Some(&terminal) => Err(ArtifactNotFoundError::Unavailable {
                stage: stage_id.to_string(),
                rule: rule.to_string(),
                state: terminal,
            }),
            None => Err(ArtifactNotFoundError::NotYetAvailable {
                stage: stage_id.to_string(),
                rule: rule.to_string(),
            }),
        }
    }

    /// Like [`get`](Self::get), but suspends while the result is
    /// `NotYetAvailable`
    pub async fn wait_for(
        &self,
        run_id: Uuid,
        stage_id: &str,
        rule: &str,
    ) -> Result<Vec<Artifact>, ArtifactNotFoundError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register interest before looking, so a put between the lookup
            // and the await is not missed.
            notified.as_mut().enable();

            match self.get(run_id, stage_id, rule).await {
                Err(ArtifactNotFoundError::NotYetAvailable { .. }) => {
                    debug!(%run_id, stage = stage_id, rule, "Waiting for artifact");
                    notified.await;
                }
                other => return other,
            }
        }
    }

    /// Drop everything held for a finished run
    pub async fn evict(&self, run_id: Uuid) {
        let mut state = self.state.write().await;
        state.artifacts.retain(|(run, _), _| *run != run_id);
        state.sealed.retain(|(run, _), _| *run != run_id);
        debug!(%run_id, "Evicted run artifacts");
    }

    /// Records of every artifact registered in a run
    pub async fn records(&self, run_id: Uuid) -> Vec<ArtifactRecord> {
        let state = self.state.read().await;
        let mut records: Vec<ArtifactRecord> = state
            .artifacts
            .iter()
            .filter(|((run, _), _)| *run == run_id)
            .flat_map(|(_, by_name)| by_name.values().map(|a| a.record.clone()))
            .collect();
        records.sort_by(|a, b| {
            (&a.producer_stage_id, &a.name).cmp(&(&b.producer_stage_id, &b.name))
        });
        records
    }
}
