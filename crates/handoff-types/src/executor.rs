//! The stage executor contract.
//!
//! The engine never performs stage work itself. For every admitted task
//! assignment it hands an [`ExecutorInput`] to a [`StageExecutor`] and
//! inspects only the structure of what comes back.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Artifact, ArtifactDraft, ArtifactId, Id, StageFailure};

/// A discrete unit of committed Scrum work, derived at the transition gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    /// Story-point estimate.
    pub estimate: u32,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// The Kanban artifact this item was derived from.
    pub source_artifact: ArtifactId,
}

/// Everything an executor receives for one task assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInput {
    pub assignment_id: Id,
    pub workflow_id: Id,
    pub stage: String,
    /// Validated upstream artifacts this stage builds on.
    #[serde(default)]
    pub input_artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item: Option<WorkItem>,
    /// 1-based attempt number for this assignment.
    pub attempt: u32,
    /// Structural violations from the previous attempt, if it was returned
    /// to the backlog for a format error.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
}

/// Trait implemented once per stage kind.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Perform the stage's work and return its artifact or a classified failure.
    async fn execute(&self, input: ExecutorInput) -> Result<ArtifactDraft, StageFailure>;

    /// Identity recorded on the task assignment.
    fn identity(&self) -> String {
        "executor".to_string()
    }
}

/// Shared executor type for registries.
pub type SharedStageExecutor = Arc<dyn StageExecutor>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl StageExecutor for Echo {
        async fn execute(&self, input: ExecutorInput) -> Result<ArtifactDraft, StageFailure> {
            Ok(ArtifactDraft::new(
                input.stage.clone(),
                json!({"attempt": input.attempt}),
            ))
        }
    }

    fn input() -> ExecutorInput {
        ExecutorInput {
            assignment_id: "a1".into(),
            workflow_id: "w1".into(),
            stage: "spike".into(),
            input_artifacts: vec![],
            work_item: None,
            attempt: 2,
            violations: vec![],
        }
    }

    #[tokio::test]
    async fn test_executor_trait_object() {
        let exec: SharedStageExecutor = Arc::new(Echo);
        let draft = exec.execute(input()).await.unwrap();
        assert_eq!(draft.artifact_type, "spike");
        assert_eq!(draft.payload["attempt"], 2);
        assert_eq!(exec.identity(), "executor");
    }

    #[test]
    fn test_input_serializes_without_empty_violations() {
        let json = serde_json::to_value(input()).unwrap();
        assert!(json.get("violations").is_none());
        assert!(json.get("work_item").is_none());
    }
}
