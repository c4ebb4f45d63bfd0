//! Pull loop that feeds admitted assignments to stage executors.
//!
//! The engine never calls executors. The driver admits work for every
//! stage that has an executor, runs the executors concurrently and reports
//! each result back, until there is nothing left it can do.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use handoff_config::HandoffConfig;
use handoff_types::{
    ArtifactDraft, DecisionRequest, Id, SharedStageExecutor, StageFailure, Timestamp,
};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::command::CommandExecutor;
use crate::engine::{Engine, Outcome};
use crate::error::Result;
use crate::workflow::Phase;

/// Upper bound on one idle wait when work is queued but not admissible.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Stage name → executor.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, SharedStageExecutor>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Command executors for every stage that configures a `command`.
    pub fn from_config(config: &HandoffConfig) -> Self {
        let mut registry = Self::new();
        for stage in &config.stages {
            if let Some(executor) = CommandExecutor::from_stage(stage) {
                registry.register(stage.name.clone(), Arc::new(executor));
            }
        }
        registry
    }

    pub fn register(&mut self, stage: impl Into<String>, executor: SharedStageExecutor) {
        self.executors.insert(stage.into(), executor);
    }

    pub fn get(&self, stage: &str) -> Option<&SharedStageExecutor> {
        self.executors.get(stage)
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.executors.contains_key(stage)
    }

    /// Configured stages with no executor.
    pub fn missing(&self, config: &HandoffConfig) -> Vec<String> {
        config
            .stage_names()
            .into_iter()
            .filter(|s| !self.contains(s))
            .collect()
    }
}

/// Tally of one [`Driver::run`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriveReport {
    /// Scheduling passes over the stages.
    pub passes: usize,
    /// Executor invocations.
    pub executed: usize,
    pub accepted: usize,
    pub retried: usize,
    pub returned: usize,
    pub discarded: usize,
    /// Decision requests raised during the run, halts included.
    pub decisions: Vec<DecisionRequest>,
    /// Stages left with queued work and no executor.
    pub stalled: Vec<String>,
    /// Phase of the target workflow when the run ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_phase: Option<Phase>,
}

impl DriveReport {
    fn tally(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Accepted { .. } => self.accepted += 1,
            Outcome::Retrying { .. } => self.retried += 1,
            Outcome::ReturnedToBacklog { .. } => self.returned += 1,
            Outcome::Discarded => self.discarded += 1,
            Outcome::AwaitingDecision { request } | Outcome::Halted { request } => {
                if !self.decisions.iter().any(|r| r.id == request.id) {
                    self.decisions.push(request);
                }
            }
        }
    }
}

type TaskResult = (Id, std::result::Result<ArtifactDraft, StageFailure>);

/// Drives an engine with a set of executors.
pub struct Driver {
    engine: Arc<Engine>,
    registry: ExecutorRegistry,
}

impl Driver {
    pub fn new(engine: Arc<Engine>, registry: ExecutorRegistry) -> Self {
        Self { engine, registry }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run until there is nothing left to do.
    ///
    /// With a `target`, stops once that workflow is terminal or paused.
    /// Without one, stops when no unpaused workflow has live work. In both
    /// cases in-flight executors are awaited and their results reported.
    pub async fn run(&self, target: Option<&str>) -> Result<DriveReport> {
        let mut report = DriveReport::default();
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, Id> = HashMap::new();
        let mut events = self.engine.subscribe();
        let stages = self.engine.stage_names();

        loop {
            report.passes += 1;
            let stop = self.should_stop(target)?;
            if !stop {
                for stage in &stages {
                    let Some(executor) = self.registry.get(stage) else {
                        continue;
                    };
                    while let Some(admission) =
                        self.engine.admit_next(stage, &executor.identity())?
                    {
                        let executor = executor.clone();
                        let assignment_id = admission.assignment.id.clone();
                        debug!(
                            stage = %stage,
                            assignment_id = %assignment_id,
                            attempt = admission.input.attempt,
                            "Dispatching assignment"
                        );
                        let handle = tasks.spawn(async move {
                            let id = admission.assignment.id.clone();
                            (id, executor.execute(admission.input).await)
                        });
                        in_flight.insert(handle.id(), assignment_id);
                        report.executed += 1;
                    }
                }
            }

            if tasks.is_empty() {
                if stop || self.engine.is_idle() {
                    break;
                }
                let wake = self.next_wake()?;
                let Some(wake) = wake else {
                    report.stalled = self.stalled_stages()?;
                    if !report.stalled.is_empty() {
                        warn!(stages = ?report.stalled, "Queued work has no executor");
                    }
                    break;
                };
                // Work that is ready now is blocked on a slot held outside
                // this driver.
                let delay = match until(wake, self.engine.clock().now()) {
                    delay if delay.is_zero() => POLL_INTERVAL,
                    delay => delay.min(POLL_INTERVAL),
                };
                tokio::select! {
                    received = events.recv() => {
                        if let Err(RecvError::Closed) = received {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            // Wake early only for a backoff that expires later. Ready work
            // here sits behind a full stage until a task finishes.
            let delay = match self.next_wake()? {
                Some(wake) if !stop => Some(until(wake, self.engine.clock().now())),
                _ => None,
            }
            .filter(|d| !d.is_zero());
            let joined = match delay {
                Some(delay) => tokio::select! {
                    joined = tasks.join_next_with_id() => joined,
                    _ = tokio::time::sleep(delay) => None,
                },
                None => tasks.join_next_with_id().await,
            };
            let Some(joined) = joined else {
                continue;
            };

            let (assignment_id, result) = match joined {
                Ok((task, (assignment_id, result))) => {
                    in_flight.remove(&task);
                    (assignment_id, result)
                }
                Err(e) => {
                    let Some(assignment_id) = in_flight.remove(&e.id()) else {
                        continue;
                    };
                    (
                        assignment_id,
                        Err(StageFailure::agent(format!("executor task failed: {}", e))),
                    )
                }
            };
            let outcome = match result {
                Ok(draft) => self.engine.complete(&assignment_id, draft)?,
                Err(failure) => self.engine.fail(&assignment_id, failure)?,
            };
            debug!(assignment_id = %assignment_id, outcome = ?outcome, "Reported result");
            report.tally(outcome);
        }

        if let Some(workflow_id) = target {
            report.final_phase = Some(self.engine.phase(workflow_id)?);
        }
        info!(
            passes = report.passes,
            executed = report.executed,
            accepted = report.accepted,
            retried = report.retried,
            decisions = report.decisions.len(),
            "Drive finished"
        );
        Ok(report)
    }

    fn should_stop(&self, target: Option<&str>) -> Result<bool> {
        match target {
            Some(workflow_id) => {
                let phase = self.engine.phase(workflow_id)?;
                Ok(phase.is_terminal() || phase.is_paused())
            }
            None => Ok(false),
        }
    }

    /// Earliest time queued work becomes admissible on a stage we can run.
    /// `Some(now)` means work is ready but its stage is full.
    fn next_wake(&self) -> Result<Option<Timestamp>> {
        let mut wake: Option<Timestamp> = None;
        for stage in self.engine.stage_names() {
            if !self.registry.contains(&stage) {
                continue;
            }
            if let Some(at) = self.engine.next_eligible_at(&stage)? {
                wake = Some(wake.map_or(at, |w| w.min(at)));
            }
        }
        Ok(wake)
    }

    fn stalled_stages(&self) -> Result<Vec<String>> {
        let mut stalled = Vec::new();
        for stage in self.engine.stage_names() {
            if !self.registry.contains(&stage) && self.engine.next_eligible_at(&stage)?.is_some() {
                stalled.push(stage);
            }
        }
        Ok(stalled)
    }
}

fn until(at: Timestamp, now: Timestamp) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use handoff_types::{ExecutorInput, StageExecutor};
    use parking_lot::Mutex;
    use serde_json::json;

    const CONFIG: &str = r#"
[retry]
delays_ms = [10, 10, 10]

[[stages]]
name = "spike"
output_schema = "note"

[[stages]]
name = "spec"
output_schema = "note"

[schemas.note]
artifact_type = "note"
[[schemas.note.fields]]
name = "text"
type = "string"
"#;

    /// Fails transiently a fixed number of times, then succeeds.
    struct Flaky {
        failures: Mutex<u32>,
    }

    #[async_trait]
    impl StageExecutor for Flaky {
        async fn execute(&self, _input: ExecutorInput) -> std::result::Result<ArtifactDraft, StageFailure> {
            let mut left = self.failures.lock();
            if *left > 0 {
                *left -= 1;
                return Err(StageFailure::transient("busy"));
            }
            Ok(ArtifactDraft::new("note", json!({"text": "ok"})))
        }
    }

    /// Takes a while, then succeeds.
    struct Slow;

    #[async_trait]
    impl StageExecutor for Slow {
        async fn execute(&self, _input: ExecutorInput) -> std::result::Result<ArtifactDraft, StageFailure> {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(ArtifactDraft::new("note", json!({"text": "slow"})))
        }
    }

    struct Broken;

    #[async_trait]
    impl StageExecutor for Broken {
        async fn execute(&self, _input: ExecutorInput) -> std::result::Result<ArtifactDraft, StageFailure> {
            Err(StageFailure::agent("cannot do this"))
        }
    }

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::in_memory(HandoffConfig::from_toml(CONFIG).unwrap()).unwrap())
    }

    #[tokio::test]
    async fn test_drives_workflow_to_completion_through_retries() {
        let engine = engine();
        let mut registry = ExecutorRegistry::new();
        registry.register("spike", Arc::new(Flaky { failures: Mutex::new(2) }));
        registry.register("spec", Arc::new(Flaky { failures: Mutex::new(0) }));
        let wf = engine.submit(None, 0).unwrap();

        let report = Driver::new(engine.clone(), registry)
            .run(Some(&wf))
            .await
            .unwrap();
        assert_eq!(report.final_phase, Some(Phase::Complete));
        assert_eq!(report.retried, 2);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.executed, 4);
    }

    #[tokio::test]
    async fn test_full_stage_waits_for_running_task() {
        let engine = engine();
        let mut registry = ExecutorRegistry::new();
        registry.register("spike", Arc::new(Slow));
        registry.register("spec", Arc::new(Slow));
        engine.submit(None, 0).unwrap();
        engine.submit(None, 0).unwrap();
        assert_eq!(engine.snapshot("spike").unwrap().wip_limit, Some(1));

        let report = Driver::new(engine.clone(), registry).run(None).await.unwrap();
        assert_eq!(report.accepted, 4);
        assert_eq!(report.executed, 4);
        // one pass per admission round and per finished task, no spinning
        assert!(report.passes <= 10, "{} passes", report.passes);
    }

    #[tokio::test]
    async fn test_stops_on_pause_with_decision() {
        let engine = engine();
        let mut registry = ExecutorRegistry::new();
        registry.register("spike", Arc::new(Broken));
        registry.register("spec", Arc::new(Broken));
        let wf = engine.submit(None, 0).unwrap();

        let report = Driver::new(engine.clone(), registry).run(Some(&wf)).await.unwrap();
        assert!(report.final_phase.unwrap().is_paused());
        assert_eq!(report.decisions.len(), 1);
        assert_eq!(engine.pending_decisions().len(), 1);
    }

    #[tokio::test]
    async fn test_reports_stages_without_executor() {
        let engine = engine();
        let mut registry = ExecutorRegistry::new();
        registry.register("spike", Arc::new(Flaky { failures: Mutex::new(0) }));
        engine.submit(None, 0).unwrap();

        let report = Driver::new(engine.clone(), registry.clone()).run(None).await.unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.stalled, vec!["spec".to_string()]);
        assert_eq!(registry.missing(engine.config()), vec!["spec".to_string()]);
    }
}
