//! Shared types for the Handoff pipeline.
//!
//! These are the types that cross the boundary between the orchestration
//! engine and the outside world: what a stage executor receives and returns,
//! how failures are classified, which decisions a coordinator can make, and
//! the events observers see. The engine itself lives in `handoff-pipeline`;
//! the trait is defined here so executors can be written without depending
//! on it.

pub mod artifact;
pub mod decision;
pub mod error;
pub mod event;
pub mod executor;
pub mod failure;

pub use artifact::{Artifact, ArtifactDraft, ArtifactId};
pub use decision::{Decision, DecisionOption, DecisionRequest};
pub use error::{Error, Result};
pub use event::{EngineEvent, EventKind};
pub use executor::{ExecutorInput, SharedStageExecutor, StageExecutor, WorkItem};
pub use failure::{FailureClass, StageFailure};

/// Identifier used for workflows, assignments, and decision requests.
pub type Id = String;

/// UTC timestamp used throughout the pipeline.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a fresh random identifier.
pub fn new_id() -> Id {
    uuid::Uuid::new_v4().to_string()
}

/// Current UTC time.
pub fn now() -> Timestamp {
    chrono::Utc::now()
}
