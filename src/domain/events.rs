//! Event types for the run audit log.
//!
//! Every state change of a run is recorded as an immutable event in an
//! append-only log. A run can be reconstructed by replaying its events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::ArtifactRecord;
use super::run::FailureKind;
use super::trigger::TriggerEvent;

/// A single event in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Stage the event refers to (None for run-level events)
    pub stage_id: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary
    pub summary: String,

    /// Pipeline name (run start only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,

    /// Declared stage ids in declaration order (run start only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<String>,

    /// Event that admitted the run (run start only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerEvent>,

    /// Attempt number (stage events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    /// Time taken in milliseconds (for finished stages)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Failure classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,

    /// Error message if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Registered artifact (artifact events only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRecord>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        stage_id: Option<String>,
        event_type: EventType,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            stage_id,
            event_type,
            summary: summary.into(),
            pipeline: None,
            stages: Vec::new(),
            trigger: None,
            attempt: None,
            duration_ms: None,
            failure_kind: None,
            error: None,
            artifact: None,
        }
    }

    /// Shorthand for a stage-level event
    pub fn stage(
        run_id: Uuid,
        stage_id: &str,
        event_type: EventType,
        summary: impl Into<String>,
    ) -> Self {
        Self::new(run_id, Some(stage_id.to_string()), event_type, summary)
    }

    /// Attach the pipeline layout recorded at run start
    pub fn with_pipeline(mut self, name: &str, stages: Vec<String>, trigger: TriggerEvent) -> Self {
        self.pipeline = Some(name.to_string());
        self.stages = stages;
        self.trigger = Some(trigger);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_failure(mut self, kind: FailureKind, error: impl Into<String>) -> Self {
        self.failure_kind = Some(kind);
        self.error = Some(error.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_artifact(mut self, record: ArtifactRecord) -> Self {
        self.artifact = Some(record);
        self
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A run was admitted and started
    RunStarted,

    /// Every non-skipped stage succeeded
    RunSucceeded,

    /// At least one stage failed
    RunFailed,

    /// The run was aborted externally
    RunCancelled,

    /// A stage was dispatched to the executor
    StageStarted,

    /// A stage attempt failed and will be retried
    StageRetrying,

    /// A stage finished successfully
    StageSucceeded,

    /// A stage finished unsuccessfully
    StageFailed,

    /// A stage was held back by a failed dependency or unmet requirement
    StageBlocked,

    /// A stage will never run in this run
    StageSkipped,

    /// A stage registered an artifact
    ArtifactRegistered,
}
