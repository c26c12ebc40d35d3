//! Stage executor interfaces.
//!
//! The scheduler never interprets what a step does. It hands each step to a
//! [`StageExecutor`] and observes only success or failure and the artifacts
//! the executor reports.

pub mod shell;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::core::params::BoundParameters;
use crate::core::pipeline::{ProduceRule, Requirement, StepSpec};
use crate::domain::ArtifactRecord;

// Re-export the shell executor
pub use shell::ShellExecutor;

/// Everything a step may see while executing
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: Uuid,

    pub stage_id: String,

    /// Stage working directory; consumed artifacts are placed here
    pub workspace: PathBuf,

    /// Effective parameter values of the stage
    pub parameters: BoundParameters,

    /// Artifacts pulled from upstream stages
    pub artifacts: Vec<ArtifactRecord>,

    /// Produce rules of the stage
    pub produces: Vec<ProduceRule>,
}

/// A file or blob a step reports as output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedArtifact {
    pub name: String,
    pub content: Vec<u8>,
}

/// Output from a successful step
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Artifacts the step reports; only names matching the stage's produce
    /// rules are registered, once per name
    pub produced: Vec<ProducedArtifact>,

    /// Captured standard output
    pub log: String,
}

impl StepOutput {
    pub fn new(log: impl Into<String>) -> Self {
        Self {
            produced: Vec::new(),
            log: log.into(),
        }
    }

    pub fn with_artifact(mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.produced.push(ProducedArtifact {
            name: name.into(),
            content: content.into(),
        });
        self
    }
}

/// Step failures reported by an executor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("Step '{step}' exited with code {code}: {stderr}")]
    Exit {
        step: String,
        code: i32,
        stderr: String,
    },

    #[error("Step '{step}' could not be started: {message}")]
    Spawn { step: String, message: String },

    #[error("Step '{step}' failed: {message}")]
    Failed { step: String, message: String },
}

/// Trait for external stage executors
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Human-readable executor name
    fn name(&self) -> &str;

    /// Check a stage precondition before any step runs
    async fn check_requirement(&self, requirement: &Requirement) -> bool;

    /// Execute one step. May take arbitrarily long; the caller enforces
    /// timeouts and cancellation by dropping the future.
    async fn execute(&self, step: &StepSpec, ctx: &StepContext) -> Result<StepOutput, StepError>;

    /// Report outputs left behind once every step of an attempt succeeded.
    /// Called once per successful attempt, after the last step.
    async fn collect_outputs(&self, _ctx: &StepContext) -> Vec<ProducedArtifact> {
        Vec::new()
    }
}
