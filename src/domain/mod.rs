//! Domain types for the shipyard orchestrator.
//!
//! This module contains the core data structures:
//! - Events: Immutable records of run state changes
//! - Run: Pipeline execution state and per-stage records
//! - Artifact: Metadata of stage outputs
//! - Trigger: Change notifications that start runs

pub mod artifact;
pub mod events;
pub mod run;
pub mod trigger;

// Re-export commonly used types
pub use artifact::{content_digest, ArtifactRecord};
pub use events::{Event, EventType};
pub use run::{FailureKind, Run, RunReport, RunState, StageFailure, StageRecord, StageState};
pub use trigger::TriggerEvent;
