//! Run state and reconstruction from events.
//!
//! A Run represents a single execution of a pipeline, from the moment its
//! trigger is admitted until every stage reaches a terminal state.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::ArtifactRecord;
use super::events::{Event, EventType};
use super::trigger::TriggerEvent;

/// A pipeline execution run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Name of the pipeline being executed
    pub pipeline_name: String,

    /// Event that admitted this run
    pub trigger: TriggerEvent,

    /// Current state of the run
    pub state: RunState,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run completed (if applicable)
    pub completed_at: Option<DateTime<Utc>>,

    /// Stage ids in declaration order
    pub stage_order: Vec<String>,

    /// Per-stage execution records
    pub stages: HashMap<String, StageRecord>,

    /// Artifacts registered during the run
    pub artifacts: Vec<ArtifactRecord>,
}

impl Run {
    /// Create a new run with every stage pending
    pub fn new(
        id: Uuid,
        pipeline_name: String,
        trigger: TriggerEvent,
        stage_order: Vec<String>,
    ) -> Self {
        let stages = stage_order
            .iter()
            .map(|id| (id.clone(), StageRecord::default()))
            .collect();

        Self {
            id,
            pipeline_name,
            trigger,
            state: RunState::Running,
            started_at: Utc::now(),
            completed_at: None,
            stage_order,
            stages,
            artifacts: Vec::new(),
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;

        let mut run = Self::new(
            first.run_id,
            String::new(),
            first.trigger.clone().unwrap_or_else(TriggerEvent::manual),
            first.stages.clone(),
        );
        run.started_at = first.timestamp;

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
                if let Some(ref name) = event.pipeline {
                    self.pipeline_name = name.clone();
                }
                if let Some(ref trigger) = event.trigger {
                    self.trigger = trigger.clone();
                }
                for stage in &event.stages {
                    if !self.stages.contains_key(stage) {
                        self.stage_order.push(stage.clone());
                        self.stages.insert(stage.clone(), StageRecord::default());
                    }
                }
            }
            EventType::RunSucceeded => {
                self.state = RunState::Succeeded;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                self.state = RunState::Failed {
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunCancelled => {
                self.state = RunState::Cancelled;
                self.completed_at = Some(event.timestamp);
            }
            EventType::StageStarted => {
                if let Some(record) = self.stage_record_mut(event) {
                    record.state = StageState::Running;
                    record.started_at = Some(event.timestamp);
                }
            }
            EventType::StageRetrying => {
                if let Some(record) = self.stage_record_mut(event) {
                    record.attempts = event.attempt.unwrap_or(record.attempts);
                }
            }
            EventType::StageSucceeded => {
                if let Some(record) = self.stage_record_mut(event) {
                    record.state = StageState::Succeeded;
                    record.attempts = event.attempt.unwrap_or(record.attempts);
                    record.completed_at = Some(event.timestamp);
                }
            }
            EventType::StageFailed => {
                if let Some(record) = self.stage_record_mut(event) {
                    record.state = StageState::Failed;
                    record.attempts = event.attempt.unwrap_or(record.attempts);
                    record.completed_at = Some(event.timestamp);
                    record.failure = event.failure_kind.map(|kind| StageFailure {
                        kind,
                        message: event.error.clone().unwrap_or_default(),
                    });
                }
            }
            EventType::StageBlocked => {
                if let Some(record) = self.stage_record_mut(event) {
                    record.state = StageState::Blocked;
                }
            }
            EventType::StageSkipped => {
                if let Some(record) = self.stage_record_mut(event) {
                    record.state = StageState::Skipped;
                    record.completed_at = Some(event.timestamp);
                    record.note = event.error.clone();
                }
            }
            EventType::ArtifactRegistered => {
                if let Some(ref artifact) = event.artifact {
                    self.artifacts.push(artifact.clone());
                }
            }
        }
    }

    fn stage_record_mut(&mut self, event: &Event) -> Option<&mut StageRecord> {
        event
            .stage_id
            .as_ref()
            .and_then(|id| self.stages.get_mut(id))
    }

    /// Current state of a stage
    pub fn stage_state(&self, stage_id: &str) -> Option<StageState> {
        self.stages.get(stage_id).map(|r| r.state)
    }

    /// Execution record of a stage
    pub fn stage(&self, stage_id: &str) -> Option<&StageRecord> {
        self.stages.get(stage_id)
    }

    /// Move a stage to a new state
    pub fn transition(&mut self, stage_id: &str, state: StageState) {
        if let Some(record) = self.stages.get_mut(stage_id) {
            record.state = state;
            match state {
                StageState::Running => record.started_at = Some(Utc::now()),
                s if s.is_terminal() => record.completed_at = Some(Utc::now()),
                _ => {}
            }
        }
    }

    /// Mark a stage failed with the originating error
    pub fn fail_stage(&mut self, stage_id: &str, failure: StageFailure) {
        self.transition(stage_id, StageState::Failed);
        if let Some(record) = self.stages.get_mut(stage_id) {
            record.failure = Some(failure);
        }
    }

    /// Mark a stage skipped, remembering why
    pub fn skip_stage(&mut self, stage_id: &str, reason: impl Into<String>) {
        self.transition(stage_id, StageState::Skipped);
        if let Some(record) = self.stages.get_mut(stage_id) {
            record.note = Some(reason.into());
        }
    }

    /// Check whether every stage reached a terminal state
    pub fn all_terminal(&self) -> bool {
        self.stages.values().all(|r| r.state.is_terminal())
    }

    /// Stage ids that ended in `Failed`, in declaration order
    pub fn failed_stages(&self) -> Vec<&str> {
        self.stage_order
            .iter()
            .filter(|id| self.stage_state(id) == Some(StageState::Failed))
            .map(String::as_str)
            .collect()
    }

    /// Compute the final run state from the stage states
    pub fn conclude(&mut self, cancelled: bool) {
        let failed = self.failed_stages();
        self.state = if cancelled {
            RunState::Cancelled
        } else if failed.is_empty() {
            RunState::Succeeded
        } else {
            RunState::Failed {
                error: format!("Failed stages: {}", failed.join(", ")),
            }
        };
        self.completed_at = Some(Utc::now());
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }

    /// Failure kinds of every failed stage
    pub fn failure_kinds(&self) -> Vec<FailureKind> {
        self.stage_order
            .iter()
            .filter_map(|id| self.stages.get(id))
            .filter_map(|r| r.failure.as_ref().map(|f| f.kind))
            .collect()
    }

    /// Final report listing every stage's state
    pub fn report(&self) -> RunReport<'_> {
        RunReport { run: self }
    }
}

/// State of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Stages are still executing
    Running,

    /// Every non-skipped stage succeeded
    Succeeded,

    /// At least one stage failed
    Failed { error: String },

    /// Aborted externally
    Cancelled,
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { .. } => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// State of a single stage within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Waiting for upstream stages
    Pending,

    /// Held back by a dependency or requirement
    Blocked,

    /// Currently executing
    Running,

    /// Finished successfully
    Succeeded,

    /// Finished unsuccessfully
    Failed,

    /// Will never execute in this run
    Skipped,
}

impl StageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl Default for StageState {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Classification of why a stage failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A parameter value was rejected at bind time
    ParameterValidation,

    /// A declared requirement was not satisfied
    RequirementNotMet,

    /// A consumed artifact will never be available
    ArtifactNotFound,

    /// A step failed or the stage ran out of time
    StepExecution,

    /// Failure cascaded from an upstream stage
    UpstreamFailed,

    /// The run was aborted while the stage was running
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ParameterValidation => "ParameterValidationError",
            Self::RequirementNotMet => "RequirementNotMet",
            Self::ArtifactNotFound => "ArtifactNotFoundError",
            Self::StepExecution => "StepExecutionError",
            Self::UpstreamFailed => "UpstreamFailed",
            Self::Cancelled => "CancelledError",
        };
        f.write_str(s)
    }
}

/// The originating error of a failed stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Per-run execution record of a stage, retained for audit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageRecord {
    pub state: StageState,

    /// Number of attempts made
    pub attempts: u32,

    /// Effective parameter values the stage ran with
    pub parameters: BTreeMap<String, String>,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Originating error, for failed stages
    pub failure: Option<StageFailure>,

    /// Why the stage was skipped, if it was
    pub note: Option<String>,
}

/// Printable final report of a run
pub struct RunReport<'a> {
    run: &'a Run,
}

impl fmt::Display for RunReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let run = self.run;
        writeln!(f, "Run {} ({})", run.id, run.pipeline_name)?;
        writeln!(f, "Trigger: {}", run.trigger.describe())?;
        writeln!(f, "State: {}", run.state)?;
        writeln!(f)?;
        writeln!(f, "{:<24} {:<10} {:<8} DETAIL", "STAGE", "STATE", "ATTEMPTS")?;
        writeln!(f, "{}", "-".repeat(72))?;

        for id in &run.stage_order {
            let Some(record) = run.stages.get(id) else {
                continue;
            };
            let detail = match (&record.failure, &record.note) {
                (Some(failure), _) => failure.to_string(),
                (None, Some(note)) => note.clone(),
                (None, None) => String::new(),
            };
            writeln!(
                f,
                "{:<24} {:<10} {:<8} {}",
                id,
                record.state.to_string(),
                record.attempts,
                detail
            )?;
        }

        if !run.artifacts.is_empty() {
            writeln!(f)?;
            writeln!(f, "Artifacts:")?;
            for artifact in &run.artifacts {
                writeln!(
                    f,
                    "  {}/{} ({} bytes, sha256:{})",
                    artifact.producer_stage_id,
                    artifact.name,
                    artifact.size_bytes,
                    &artifact.content_ref[..artifact.content_ref.len().min(12)]
                )?;
            }
        }

        Ok(())
    }
}
