//! Failure classification and response policy.
//!
//! | Class | Response |
//! |---|---|
//! | `TRANSIENT` | retry after the configured delay; escalate as `AGENT_ERROR` once retries are spent |
//! | `FORMAT_ERROR` | back to the backlog with violations attached; escalate once re-attempts are spent |
//! | `CONSISTENCY_ERROR` | escalate: assignment failed, workflow paused, decision requested |
//! | `AGENT_ERROR` | escalate |
//! | `CRITICAL` | halt the workflow |
//!
//! The controller only decides. The engine applies the decision to the
//! scheduler and workflow.

use std::time::Duration;

use handoff_config::{HandoffConfig, RetrySection};
use handoff_types::{FailureClass, Id, Timestamp};
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointId;

/// What to do about one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Requeue after `delay_ms`; this is retry number `retry`.
    Retry { retry: u32, delay_ms: u64 },
    /// Back to the backlog with violations; this is re-attempt `reattempt`.
    ReturnToBacklog { reattempt: u32 },
    /// Fail the assignment, pause the workflow, and ask the coordinator.
    Escalate { class: FailureClass },
    /// Stop the workflow.
    Halt,
}

/// Structured record kept for every failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: Id,
    pub workflow_id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub class: FailureClass,
    pub detail: String,
    /// Attempt number of the failed assignment (0 when no assignment).
    pub attempt: u32,
    pub action: RecoveryAction,
    /// Last good checkpoint at the time of failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<CheckpointId>,
    pub recorded_at: Timestamp,
}

/// Applies the retry and escalation policy.
#[derive(Debug, Clone)]
pub struct RecoveryController {
    retry: RetrySection,
    escalate_partial_after: Option<u32>,
}

impl RecoveryController {
    pub fn new(retry: RetrySection, escalate_partial_after: Option<u32>) -> Self {
        Self {
            retry,
            escalate_partial_after,
        }
    }

    pub fn from_config(config: &HandoffConfig) -> Self {
        Self::new(config.retry(), config.validation().escalate_partial_after)
    }

    /// Decide the response to a failure.
    ///
    /// `retries` counts transient retries already taken on the assignment;
    /// `reattempts` counts format re-attempts already taken.
    pub fn decide(&self, class: FailureClass, retries: u32, reattempts: u32) -> RecoveryAction {
        match class {
            FailureClass::Transient if retries < self.retry.max_retries => {
                let retry = retries + 1;
                RecoveryAction::Retry {
                    retry,
                    delay_ms: duration_ms(self.retry.delay_for(retry)),
                }
            }
            FailureClass::Transient => RecoveryAction::Escalate {
                class: FailureClass::AgentError,
            },
            FailureClass::FormatError if reattempts < self.retry.format_reattempts => {
                RecoveryAction::ReturnToBacklog {
                    reattempt: reattempts + 1,
                }
            }
            FailureClass::FormatError => RecoveryAction::Escalate {
                class: FailureClass::FormatError,
            },
            FailureClass::ConsistencyError | FailureClass::AgentError => {
                RecoveryAction::Escalate { class }
            }
            FailureClass::Critical => RecoveryAction::Halt,
        }
    }

    /// Whether new PARTIAL warnings should block, given how many the
    /// workflow has already accumulated.
    pub fn partial_blocks(&self, accumulated: u32, new_warnings: usize) -> bool {
        match self.escalate_partial_after {
            Some(threshold) => new_warnings > 0 && accumulated >= threshold,
            None => false,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> RecoveryController {
        RecoveryController::new(RetrySection::default(), None)
    }

    #[test]
    fn test_transient_retry_schedule() {
        let c = controller();
        let delays: Vec<_> = (0..3)
            .map(|used| match c.decide(FailureClass::Transient, used, 0) {
                RecoveryAction::Retry { delay_ms, .. } => delay_ms,
                other => panic!("expected retry, got {:?}", other),
            })
            .collect();
        assert_eq!(delays, vec![1_000, 5_000, 15_000]);
        assert_eq!(
            c.decide(FailureClass::Transient, 3, 0),
            RecoveryAction::Escalate {
                class: FailureClass::AgentError
            }
        );
    }

    #[test]
    fn test_format_error_single_reattempt() {
        let c = controller();
        assert_eq!(
            c.decide(FailureClass::FormatError, 0, 0),
            RecoveryAction::ReturnToBacklog { reattempt: 1 }
        );
        // transient retries taken do not affect the format budget
        assert_eq!(
            c.decide(FailureClass::FormatError, 3, 0),
            RecoveryAction::ReturnToBacklog { reattempt: 1 }
        );
        assert_eq!(
            c.decide(FailureClass::FormatError, 0, 1),
            RecoveryAction::Escalate {
                class: FailureClass::FormatError
            }
        );
    }

    #[test]
    fn test_escalation_classes() {
        let c = controller();
        assert_eq!(
            c.decide(FailureClass::ConsistencyError, 0, 0),
            RecoveryAction::Escalate {
                class: FailureClass::ConsistencyError
            }
        );
        assert_eq!(
            c.decide(FailureClass::AgentError, 0, 0),
            RecoveryAction::Escalate {
                class: FailureClass::AgentError
            }
        );
        assert_eq!(c.decide(FailureClass::Critical, 0, 0), RecoveryAction::Halt);
    }

    #[test]
    fn test_partial_escalation_policy() {
        assert!(!controller().partial_blocks(100, 1));

        let c = RecoveryController::new(RetrySection::default(), Some(2));
        assert!(!c.partial_blocks(1, 1));
        assert!(c.partial_blocks(2, 1));
        assert!(!c.partial_blocks(5, 0));
    }

    #[test]
    fn test_action_serde() {
        let json = serde_json::to_value(RecoveryAction::Retry {
            retry: 2,
            delay_ms: 5_000,
        })
        .unwrap();
        assert_eq!(json["action"], "retry");
        assert_eq!(json["delay_ms"], 5_000);
    }
}
