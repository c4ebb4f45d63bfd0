//! Coordinator decisions for failures the engine will not resolve on its own.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{FailureClass, Id, Timestamp};

/// A response from the external coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Run the failed stage again with a fresh retry budget.
    Retry,
    /// Accept the artifact despite its blocking consistency violations.
    AcceptDeviation,
    /// Roll the workflow back to a checkpoint and continue from there.
    RestartFromCheckpoint { checkpoint_id: String },
    /// Stop the workflow permanently.
    Halt,
}

impl Decision {
    /// The option this decision answers.
    pub fn option(&self) -> DecisionOption {
        match self {
            Decision::Retry => DecisionOption::Retry,
            Decision::AcceptDeviation => DecisionOption::AcceptDeviation,
            Decision::RestartFromCheckpoint { .. } => DecisionOption::RestartFromCheckpoint,
            Decision::Halt => DecisionOption::Halt,
        }
    }
}

/// The kinds of decision a request can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOption {
    Retry,
    AcceptDeviation,
    RestartFromCheckpoint,
    Halt,
}

impl DecisionOption {
    /// Options offered for a failure class.
    ///
    /// `AcceptDeviation` only makes sense when there is an artifact to accept,
    /// i.e. for consistency failures. Critical failures halt the workflow and
    /// can only be acknowledged.
    pub fn for_class(class: FailureClass) -> Vec<DecisionOption> {
        match class {
            FailureClass::ConsistencyError => vec![
                DecisionOption::Retry,
                DecisionOption::AcceptDeviation,
                DecisionOption::RestartFromCheckpoint,
                DecisionOption::Halt,
            ],
            FailureClass::Critical => vec![DecisionOption::Halt],
            FailureClass::Transient | FailureClass::FormatError | FailureClass::AgentError => vec![
                DecisionOption::Retry,
                DecisionOption::RestartFromCheckpoint,
                DecisionOption::Halt,
            ],
        }
    }
}

impl fmt::Display for DecisionOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionOption::Retry => "retry",
            DecisionOption::AcceptDeviation => "accept_deviation",
            DecisionOption::RestartFromCheckpoint => "restart_from_checkpoint",
            DecisionOption::Halt => "halt",
        };
        f.write_str(s)
    }
}

/// Emitted whenever a failure needs an explicit coordinator decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub id: Id,
    pub workflow_id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub failure_class: FailureClass,
    pub detail: String,
    pub options: Vec<DecisionOption>,
    /// Last good checkpoint, the natural target for a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<String>,
    pub created_at: Timestamp,
}

impl DecisionRequest {
    /// Whether the request offers the given decision.
    pub fn allows(&self, decision: &Decision) -> bool {
        self.options.contains(&decision.option())
    }
}
