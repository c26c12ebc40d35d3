//! shipyard - Event-sourced build pipeline orchestrator
//!
//! Runs pipelines of named stages over a dependency graph. Independent
//! stages run in parallel, artifacts flow from producer to consumer stages
//! of the same run, and a per-edge failure policy decides what happens
//! downstream of a failed stage.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - All state changes of a run are recorded as immutable events
//! - Current state is derived by replaying events
//! - Every finished run ends with a report of each stage's terminal state
//!
//! # Modules
//!
//! - `adapters`: Stage executors (shell)
//! - `core`: Orchestration logic (Pipeline, DependencyGraph, ArtifactStore,
//!   TriggerEvaluator, EventStore, Orchestrator)
//! - `domain`: Data structures (Event, Run, ArtifactRecord, TriggerEvent)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline for a branch push
//! shipyard run pipeline.yaml --trigger-ref refs/heads/main --param DEPLOY_ENV=staging
//!
//! # Show the execution order
//! shipyard plan pipeline.yaml
//!
//! # Check run status
//! shipyard status <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{ShellExecutor, StageExecutor};
pub use core::{CancellationToken, CompiledPipeline, Orchestrator, ParameterResolver, Pipeline};
pub use domain::{Event, EventType, Run, RunState, StageState, TriggerEvent};
