//! Status events emitted on significant transitions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Id, Timestamp, now};

/// The only event kinds observers ever see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Completed,
    Failed,
    Delayed,
    Inconsistent,
    Recovered,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Completed => "COMPLETED",
            EventKind::Failed => "FAILED",
            EventKind::Delayed => "DELAYED",
            EventKind::Inconsistent => "INCONSISTENT",
            EventKind::Recovered => "RECOVERED",
        };
        f.write_str(s)
    }
}

/// One engine event.
///
/// `stage` is absent for workflow-level events such as workflow completion
/// or a restore from checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Monotonic sequence number assigned by the engine.
    pub seq: u64,
    pub kind: EventKind,
    pub workflow_id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<Id>,
    pub detail: String,
    pub at: Timestamp,
}

impl EngineEvent {
    pub fn new(kind: EventKind, workflow_id: impl Into<Id>, detail: impl Into<String>) -> Self {
        Self {
            seq: 0,
            kind,
            workflow_id: workflow_id.into(),
            stage: None,
            assignment_id: None,
            detail: detail.into(),
            at: now(),
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_assignment(mut self, assignment_id: impl Into<Id>) -> Self {
        self.assignment_id = Some(assignment_id.into());
        self
    }
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.workflow_id)?;
        if let Some(ref stage) = self.stage {
            write!(f, " [{}]", stage)?;
        }
        if !self.detail.is_empty() {
            write!(f, " {}", self.detail)?;
        }
        Ok(())
    }
}
