//! Core orchestration logic.
//!
//! This module contains:
//! - Pipeline: Definitions, loading and validation
//! - DependencyGraph: Stage ordering and cycle detection
//! - ParameterResolver: Parameter binding and environment dispatch
//! - TriggerEvaluator: Branch filters deciding which events start runs
//! - ArtifactStore: Run-scoped artifact hand-off between stages
//! - EventStore: Append-only event logging
//! - Orchestrator: Main execution engine

pub mod artifact_store;
pub mod cancel;
pub mod event_store;
pub mod graph;
pub mod orchestrator;
pub mod params;
pub mod pipeline;
pub mod trigger;

// Re-export commonly used types
pub use artifact_store::{Artifact, ArtifactNotFoundError, ArtifactStore};
pub use cancel::CancellationToken;
pub use event_store::EventStore;
pub use graph::{DependencyEdge, DependencyGraph, FailurePolicy};
pub use orchestrator::Orchestrator;
pub use params::{BoundParameters, Dispatch, ParameterDecl, ParameterResolver, ParameterValidationError};
pub use pipeline::{
    CompiledPipeline, DefinitionError, Dependency, Pipeline, ProduceRule, Requirement,
    RetryPolicy, Stage, StepSpec,
};
pub use trigger::{BranchFilter, BranchRule, FilterAction, TriggerEvaluator};
