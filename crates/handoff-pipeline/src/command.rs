//! Shell-command stage executor.
//!
//! Runs a configured command with `sh -c`, passing the assignment over a
//! JSON stdin/stdout protocol.
//!
//! ## Protocol
//!
//! **stdin** (JSON): the [`ExecutorInput`].
//!
//! **stdout** (JSON): one of:
//! - a bare [`ArtifactDraft`]: `{"artifact_type": "...", "payload": {...}}`
//! - `{"status": "ok", "artifact": {...}}`
//! - `{"status": "error", "error": "...", "class": "TRANSIENT"}`; `class`
//!   defaults to `AGENT_ERROR`
//!
//! **exit code**: 75 (`EX_TEMPFAIL`) is transient, any other non-zero exit
//! is an agent error. A timeout is transient.
//!
//! **stderr**: logged at debug level.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use handoff_config::StageConfig;
use handoff_types::{ArtifactDraft, ExecutorInput, FailureClass, StageExecutor, StageFailure};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

/// Exit status asking for a retry.
pub const EXIT_TEMPFAIL: i32 = 75;

/// A stage executor backed by a shell command.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    stage: String,
    command: String,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(stage: impl Into<String>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            stage: stage.into(),
            command: command.into(),
            timeout,
            working_dir: None,
        }
    }

    /// Executor for a configured stage, if it has a command.
    pub fn from_stage(stage: &StageConfig) -> Option<Self> {
        stage
            .command
            .as_ref()
            .map(|command| Self::new(stage.name.clone(), command.clone(), stage.timeout()))
    }

    /// Run the command in `dir` instead of the current directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum CommandOutput {
    Ok {
        artifact: ArtifactDraft,
    },
    Error {
        error: String,
        #[serde(default)]
        class: Option<FailureClass>,
    },
}

/// Interpret a command's stdout.
fn parse_output(stdout: &str) -> Result<ArtifactDraft, StageFailure> {
    let value: serde_json::Value = serde_json::from_str(stdout)
        .map_err(|e| StageFailure::agent(format!("stdout is not JSON: {}", e)))?;

    if value.get("status").is_none() {
        return serde_json::from_value(value)
            .map_err(|e| StageFailure::agent(format!("stdout is not an artifact: {}", e)));
    }
    match serde_json::from_value(value) {
        Ok(CommandOutput::Ok { artifact }) => Ok(artifact),
        Ok(CommandOutput::Error { error, class }) => Err(StageFailure::new(
            class.unwrap_or(FailureClass::AgentError),
            error,
        )),
        Err(e) => Err(StageFailure::agent(format!("malformed command output: {}", e))),
    }
}

#[async_trait]
impl StageExecutor for CommandExecutor {
    async fn execute(&self, input: ExecutorInput) -> Result<ArtifactDraft, StageFailure> {
        let input_json = serde_json::to_vec(&input)
            .map_err(|e| StageFailure::agent(format!("cannot encode executor input: {}", e)))?;

        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("HANDOFF_STAGE", &input.stage)
            .env("HANDOFF_WORKFLOW_ID", &input.workflow_id)
            .env("HANDOFF_ASSIGNMENT_ID", &input.assignment_id)
            .env("HANDOFF_ATTEMPT", input.attempt.to_string())
            .kill_on_drop(true);
        if let Some(ref item) = input.work_item {
            command.env("HANDOFF_WORK_ITEM", &item.id);
        }
        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            StageFailure::transient(format!("failed to spawn '{}': {}", self.command, e))
        })?;

        // Feed stdin while collecting output so a command that never reads
        // its input cannot stall the write past the timeout.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input_json).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let run = async move { tokio::join!(feed, child.wait_with_output()) };

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok((fed, Ok(output))) => {
                if let Err(e) = fed {
                    tracing::debug!(
                        stage = %self.stage,
                        assignment_id = %input.assignment_id,
                        error = %e,
                        "Stage command did not consume its input"
                    );
                }
                output
            }
            Ok((_, Err(e))) => {
                return Err(StageFailure::transient(format!("process error: {}", e)));
            }
            Err(_) => {
                return Err(StageFailure::transient(format!(
                    "stage '{}' timed out after {}s",
                    self.stage,
                    self.timeout.as_secs_f64()
                )));
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::debug!(
                stage = %self.stage,
                assignment_id = %input.assignment_id,
                stderr = %stderr.trim(),
                "Stage command stderr"
            );
        }

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let class = if code == EXIT_TEMPFAIL {
                FailureClass::Transient
            } else {
                FailureClass::AgentError
            };
            let detail = if stderr.trim().is_empty() {
                format!("stage '{}' exited with code {}", self.stage, code)
            } else {
                format!(
                    "stage '{}' exited with code {}: {}",
                    self.stage,
                    code,
                    stderr.trim()
                )
            };
            return Err(StageFailure::new(class, detail));
        }

        parse_output(String::from_utf8_lossy(&output.stdout).trim())
    }

    fn identity(&self) -> String {
        format!("command:{}", self.stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input() -> ExecutorInput {
        ExecutorInput {
            assignment_id: "a-1".into(),
            workflow_id: "wf-1".into(),
            stage: "spike".into(),
            input_artifacts: Vec::new(),
            work_item: None,
            attempt: 1,
            violations: Vec::new(),
        }
    }

    fn executor(command: &str) -> CommandExecutor {
        CommandExecutor::new("spike", command, Duration::from_secs(10))
    }

    #[test]
    fn test_parse_bare_draft_and_envelopes() {
        let draft = parse_output(r#"{"artifact_type": "spike_report", "payload": {"k": 1}}"#).unwrap();
        assert_eq!(draft.artifact_type, "spike_report");

        let draft =
            parse_output(r#"{"status": "ok", "artifact": {"artifact_type": "plan", "payload": {}}}"#)
                .unwrap();
        assert_eq!(draft.artifact_type, "plan");

        let failure = parse_output(r#"{"status": "error", "error": "quota", "class": "TRANSIENT"}"#)
            .unwrap_err();
        assert_eq!(failure.class, FailureClass::Transient);
        assert_eq!(failure.detail, "quota");

        let failure = parse_output(r#"{"status": "error", "error": "no idea"}"#).unwrap_err();
        assert_eq!(failure.class, FailureClass::AgentError);

        assert_eq!(parse_output("not json").unwrap_err().class, FailureClass::AgentError);
    }

    #[tokio::test]
    async fn test_input_arrives_on_stdin() {
        let exec = executor(r#"printf '{"artifact_type":"echo","payload":'; cat; printf '}'"#);
        let draft = exec.execute(input()).await.unwrap();
        assert_eq!(draft.payload["stage"], json!("spike"));
        assert_eq!(draft.payload["attempt"], json!(1));
    }

    #[tokio::test]
    async fn test_environment_is_set() {
        let exec = executor(
            r#"cat >/dev/null; printf '{"artifact_type":"env","payload":{"wf":"%s"}}' "$HANDOFF_WORKFLOW_ID""#,
        );
        let draft = exec.execute(input()).await.unwrap();
        assert_eq!(draft.payload["wf"], json!("wf-1"));
    }

    #[tokio::test]
    async fn test_exit_codes_classify() {
        let failure = executor("exit 75").execute(input()).await.unwrap_err();
        assert_eq!(failure.class, FailureClass::Transient);

        let failure = executor("echo broken >&2; exit 3")
            .execute(input())
            .await
            .unwrap_err();
        assert_eq!(failure.class, FailureClass::AgentError);
        assert!(failure.detail.contains("broken"));
    }

    #[tokio::test]
    async fn test_timeout_holds_when_command_ignores_large_input() {
        let mut big = input();
        big.work_item = Some(handoff_types::WorkItem {
            id: "W-1".into(),
            title: "x".repeat(512 * 1024),
            estimate: 1,
            acceptance_criteria: Vec::new(),
            source_artifact: "src".into(),
        });
        let exec = CommandExecutor::new("spike", "sleep 30", Duration::from_millis(100));

        let failure = tokio::time::timeout(Duration::from_secs(5), exec.execute(big))
            .await
            .expect("execute must return once its own timeout expires")
            .unwrap_err();
        assert_eq!(failure.class, FailureClass::Transient);
        assert!(failure.detail.contains("timed out"));
    }

    #[tokio::test]
    async fn test_command_may_exit_without_reading_input() {
        let mut big = input();
        big.violations = vec!["y".repeat(256 * 1024)];
        let exec = executor(r#"echo '{"artifact_type":"note","payload":{}}'"#);
        let draft = exec.execute(big).await.unwrap();
        assert_eq!(draft.artifact_type, "note");
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let exec = CommandExecutor::new("spike", "sleep 5", Duration::from_millis(100));
        let failure = exec.execute(input()).await.unwrap_err();
        assert_eq!(failure.class, FailureClass::Transient);
        assert!(failure.detail.contains("timed out"));
    }

    #[test]
    fn test_from_stage_requires_command() {
        let stage = StageConfig::kanban("spike", "spike_report");
        assert!(CommandExecutor::from_stage(&stage).is_none());

        let mut stage = stage;
        stage.command = Some("true".into());
        stage.timeout_secs = Some(7);
        let exec = CommandExecutor::from_stage(&stage).unwrap();
        assert_eq!(exec.timeout, Duration::from_secs(7));
        assert_eq!(exec.identity(), "command:spike");
    }
}
