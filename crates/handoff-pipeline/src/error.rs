//! Error types for the pipeline engine.

use thiserror::Error;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur during pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// An artifact id is already bound to different content, or a record's
    /// id does not match its content hash.
    #[error("Integrity violation for artifact {id}: {detail}")]
    Integrity { id: String, detail: String },

    /// A checkpoint failed hash verification or could not be decoded.
    #[error("Corrupt checkpoint {id}: {detail}")]
    CorruptCheckpoint { id: String, detail: String },

    /// The backing store could not be read or written.
    #[error("Storage unavailable: {0}")]
    Storage(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    /// A declared dependency has not been stored.
    #[error("Artifact {artifact} depends on unknown artifact {missing}")]
    MissingDependency { artifact: String, missing: String },

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Task assignment not found: {0}")]
    AssignmentNotFound(String),

    #[error("Decision request not found: {0}")]
    DecisionNotFound(String),

    /// The requested state change is not allowed from the current state.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The decision is not among the options offered.
    #[error("Invalid decision: {0}")]
    InvalidDecision(String),

    /// Invalid workflow submission.
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Configuration error: {0}")]
    Config(#[from] handoff_config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Infrastructure faults that halt the affected workflow.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            PipelineError::Integrity { .. }
                | PipelineError::CorruptCheckpoint { .. }
                | PipelineError::Storage(_)
        )
    }

    pub(crate) fn storage(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        PipelineError::Storage(format!("{}: {}", context, err))
    }
}
