//! The orchestration engine.
//!
//! `Engine` is the one entry point executors and coordinators talk to. It
//! owns the scheduler, the validator and the stores, and applies the
//! recovery policy. It never performs stage work.
//!
//! ```text
//! submit ──▶ backlog ──admit_next──▶ executor ──complete(draft)──▶ review
//!                                        │                          │
//!                                   fail(failure)          validate + audit
//!                                        │                 ┌────────┼─────────────┐
//!                                        ▼               pass   structural    blocking
//!                               retry / backlog /          │        │             │
//!                               escalate / halt     store+checkpoint backlog   pause + decision
//!                                                          │
//!                                                   advance phase ──▶ next backlog
//! ```
//!
//! Calls are synchronous and short. Each workflow has its own lock, each
//! stage has a review gate so at most one artifact per stage is under
//! validation, and no lock is held while an executor runs.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use handoff_config::{HandoffConfig, ProcessMode};
use handoff_types::{
    Artifact, ArtifactDraft, ArtifactId, Decision, DecisionOption, DecisionRequest, EngineEvent,
    EventKind, ExecutorInput, FailureClass, Id, StageFailure, Timestamp, new_id,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEntry, AuditLog};
use crate::checkpoint::{
    Checkpoint, CheckpointId, CheckpointManager, CheckpointStore, FsCheckpointStore,
    MemoryCheckpointStore,
};
use crate::clock::{self, Clock, SystemClock};
use crate::error::{PipelineError, Result};
use crate::events::EventBus;
use crate::recovery::{FailureRecord, RecoveryAction, RecoveryController};
use crate::scheduler::{AssignmentStatus, StageScheduler, StageSnapshot, TaskAssignment};
use crate::store::{ArtifactStore, FsArtifactStore, MemoryArtifactStore, ProvenanceRecord, seal};
use crate::validator::{ReasonCode, RuleViolation, SchemaValidator};
use crate::workflow::{CompletedAssignment, Phase, SprintPlan, WorkflowState, build_work_items};

// ─────────────────────────────────────────────────────────────────────────────
// Public types
// ─────────────────────────────────────────────────────────────────────────────

/// An admitted assignment and everything its executor needs.
#[derive(Debug, Clone)]
pub struct Admission {
    pub assignment: TaskAssignment,
    pub input: ExecutorInput,
}

/// What the engine did with a completion or failure report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The artifact passed validation and was stored.
    Accepted {
        artifact_id: ArtifactId,
        /// PARTIAL consistency warnings recorded against the artifact.
        warnings: Vec<RuleViolation>,
        /// Workflow phase after the handoff.
        phase: Phase,
    },
    /// Transient failure; the assignment is requeued with backoff.
    Retrying { retry: u32, not_before: Timestamp },
    /// Structural failure; the assignment is back in the backlog.
    ReturnedToBacklog { violations: Vec<String> },
    /// The workflow is paused until the request is decided.
    AwaitingDecision { request: DecisionRequest },
    /// The workflow is halted.
    Halted { request: DecisionRequest },
    /// The assignment was abandoned before the report arrived.
    Discarded,
}

/// Read-only view of one workflow.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowView {
    pub state: WorkflowState,
    pub last_checkpoint: Option<CheckpointId>,
    pub pending_decision: Option<DecisionRequest>,
    pub assignments: Vec<TaskAssignment>,
}

/// A workflow whose latest checkpoint is not terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoverableWorkflow {
    pub workflow_id: Id,
    pub checkpoint_id: CheckpointId,
    pub sequence: u64,
    pub phase: Phase,
    pub captured_at: Timestamp,
    /// Whether this engine instance currently holds the workflow.
    pub loaded: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Assembles an [`Engine`]. Anything not set explicitly defaults to the
/// filesystem backend under `state_dir` when one is given, and to memory
/// otherwise.
pub struct EngineBuilder {
    config: HandoffConfig,
    clock: Option<Arc<dyn Clock>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    audit: Option<AuditLog>,
    state_dir: Option<PathBuf>,
}

impl EngineBuilder {
    pub fn new(config: HandoffConfig) -> Self {
        Self {
            config,
            clock: None,
            artifacts: None,
            checkpoints: None,
            audit: None,
            state_dir: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;

        if let Some(ref dir) = self.state_dir {
            std::fs::create_dir_all(dir).map_err(|e| PipelineError::storage(dir.display(), e))?;
        }
        let artifacts: Arc<dyn ArtifactStore> = match (self.artifacts, &self.state_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FsArtifactStore::open(dir)?),
            (None, None) => Arc::new(MemoryArtifactStore::new()),
        };
        let checkpoints: Arc<dyn CheckpointStore> = match (self.checkpoints, &self.state_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FsCheckpointStore::open(dir)?),
            (None, None) => Arc::new(MemoryCheckpointStore::new()),
        };
        let audit = match (self.audit, &self.state_dir) {
            (Some(audit), _) => audit,
            (None, Some(dir)) => AuditLog::open(dir)?,
            (None, None) => AuditLog::memory(),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let review_gates = self
            .config
            .stages
            .iter()
            .map(|s| (s.name.clone(), Mutex::new(())))
            .collect();

        info!(
            stages = self.config.stages.len(),
            state_dir = self
                .state_dir
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "memory".to_string()),
            "Engine ready"
        );

        Ok(Engine {
            scheduler: StageScheduler::from_config(&self.config, clock.clone()),
            validator: SchemaValidator::new(&self.config),
            recovery: RecoveryController::from_config(&self.config),
            events: EventBus::new(self.config.engine().event_buffer),
            checkpoints: CheckpointManager::new(checkpoints, artifacts.clone()),
            artifacts,
            audit,
            clock,
            review_gates,
            workflows: RwLock::new(HashMap::new()),
            decisions: RwLock::new(HashMap::new()),
            state_dir: self.state_dir,
            config: self.config,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

struct PendingDecision {
    request: DecisionRequest,
    /// The rejected artifact, kept so a deviation can be accepted.
    artifact: Option<Artifact>,
    warnings: Vec<RuleViolation>,
}

struct WorkflowRecord {
    state: WorkflowState,
    last_checkpoint: Option<CheckpointId>,
    pending: Option<PendingDecision>,
}

/// The workflow orchestration engine.
pub struct Engine {
    config: HandoffConfig,
    clock: Arc<dyn Clock>,
    artifacts: Arc<dyn ArtifactStore>,
    checkpoints: CheckpointManager,
    validator: SchemaValidator,
    recovery: RecoveryController,
    scheduler: StageScheduler,
    audit: AuditLog,
    events: EventBus,
    review_gates: HashMap<String, Mutex<()>>,
    workflows: RwLock<HashMap<Id, Arc<Mutex<WorkflowRecord>>>>,
    /// Open decision request id → workflow id.
    decisions: RwLock<HashMap<Id, Id>>,
    state_dir: Option<PathBuf>,
}

impl Engine {
    /// Engine with in-memory stores.
    pub fn in_memory(config: HandoffConfig) -> Result<Self> {
        EngineBuilder::new(config).build()
    }

    /// Engine persisting under `state_dir`. Existing artifacts, checkpoints
    /// and audit entries are loaded; no workflow is resumed.
    pub fn open(config: HandoffConfig, state_dir: impl AsRef<Path>) -> Result<Self> {
        EngineBuilder::new(config)
            .state_dir(state_dir.as_ref())
            .build()
    }

    pub fn builder(config: HandoffConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn state_dir(&self) -> Option<&Path> {
        self.state_dir.as_deref()
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn emit(&self, mut event: EngineEvent) {
        event.at = self.now();
        self.events.emit(event);
    }

    fn record(&self, workflow_id: &str) -> Result<Arc<Mutex<WorkflowRecord>>> {
        self.workflows
            .read()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| PipelineError::WorkflowNotFound(workflow_id.to_string()))
    }

    fn review_gate(&self, stage: &str) -> Result<&Mutex<()>> {
        self.review_gates
            .get(stage)
            .ok_or_else(|| PipelineError::UnknownStage(stage.to_string()))
    }

    /// Fetch artifacts a workflow references. A referenced artifact that is
    /// missing means the store lost data.
    fn load_artifacts(&self, ids: &[ArtifactId]) -> Result<Vec<Artifact>> {
        ids.iter()
            .map(|id| match self.artifacts.get(id) {
                Err(PipelineError::ArtifactNotFound(_)) => Err(PipelineError::Integrity {
                    id: id.clone(),
                    detail: "referenced artifact is missing from the store".to_string(),
                }),
                other => other,
            })
            .collect()
    }

    // ── Submission ──────────────────────────────────────────────────────

    /// Create a workflow over `stages` (every configured stage when `None`)
    /// and put its first stage in the backlog.
    pub fn submit(&self, stages: Option<Vec<String>>, priority: i32) -> Result<Id> {
        let (kanban, scrum) = self.plan_stages(stages)?;
        let workflow_id = new_id();
        let now = self.now();

        let mut state = WorkflowState::new(workflow_id.clone(), kanban, scrum, priority, now);
        state.begin(now)?;
        let checkpoint = self.checkpoints.capture(&state, now)?;

        let record = Arc::new(Mutex::new(WorkflowRecord {
            state,
            last_checkpoint: Some(checkpoint.id),
            pending: None,
        }));
        self.workflows
            .write()
            .insert(workflow_id.clone(), record.clone());

        let rec = record.lock();
        self.reconcile(&rec.state)?;
        info!(
            workflow_id = %workflow_id,
            stages = ?rec.state.stages(),
            priority,
            "Workflow submitted"
        );
        Ok(workflow_id)
    }

    fn plan_stages(&self, stages: Option<Vec<String>>) -> Result<(Vec<String>, Vec<String>)> {
        let names = stages.unwrap_or_else(|| self.config.stage_names());
        if names.is_empty() {
            return Err(PipelineError::InvalidWorkflow(
                "a workflow needs at least one stage".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut kanban = Vec::new();
        let mut scrum = Vec::new();
        for name in names {
            let stage = self
                .config
                .stage(&name)
                .ok_or_else(|| PipelineError::UnknownStage(name.clone()))?;
            if !seen.insert(name.clone()) {
                return Err(PipelineError::InvalidWorkflow(format!(
                    "stage '{}' is listed twice",
                    name
                )));
            }
            match stage.mode {
                ProcessMode::Kanban if !scrum.is_empty() => {
                    return Err(PipelineError::InvalidWorkflow(format!(
                        "kanban stage '{}' is listed after a scrum stage",
                        name
                    )));
                }
                ProcessMode::Kanban => kanban.push(name),
                ProcessMode::Scrum => scrum.push(name),
            }
        }
        if kanban.is_empty() {
            return Err(PipelineError::InvalidWorkflow(
                "a workflow needs at least one kanban stage".to_string(),
            ));
        }
        Ok((kanban, scrum))
    }

    /// Enqueue every piece of pending work that has no live assignment.
    fn reconcile(&self, state: &WorkflowState) -> Result<usize> {
        if state.is_terminal() {
            return Ok(0);
        }
        let live: Vec<TaskAssignment> = self
            .scheduler
            .for_workflow(&state.workflow_id)
            .into_iter()
            .filter(|a| a.status.is_live())
            .collect();

        let mut enqueued = 0;
        for work in state.pending_work() {
            let item_id = work.work_item.as_ref().map(|i| i.id.as_str());
            if live
                .iter()
                .any(|a| a.stage == work.stage && a.work_item_id() == item_id)
            {
                continue;
            }
            self.scheduler.enqueue(
                &state.workflow_id,
                &work.stage,
                work.work_item,
                state.priority,
            )?;
            enqueued += 1;
        }
        Ok(enqueued)
    }

    // ── Executor side ───────────────────────────────────────────────────

    /// Admit the next assignment of `stage` for `executor`, with its input.
    ///
    /// Never blocks. `None` means nothing is admissible right now.
    pub fn admit_next(&self, stage: &str, executor: &str) -> Result<Option<Admission>> {
        let Some(assignment) = self.scheduler.admit_next(stage, executor)? else {
            return Ok(None);
        };
        let record = self.record(&assignment.workflow_id)?;
        let mut rec = record.lock();
        if rec.state.is_terminal() {
            self.scheduler.abandon(&assignment.id)?;
            return Ok(None);
        }

        let ids = rec
            .state
            .input_artifacts(stage, assignment.work_item.as_ref());
        let input_artifacts = match self.load_artifacts(&ids) {
            Ok(artifacts) => artifacts,
            Err(e) if e.is_critical() => {
                self.halt_workflow(&mut rec, Some(&assignment), FailureClass::Critical, e.to_string());
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let input = ExecutorInput {
            assignment_id: assignment.id.clone(),
            workflow_id: assignment.workflow_id.clone(),
            stage: stage.to_string(),
            input_artifacts,
            work_item: assignment.work_item.clone(),
            attempt: assignment.attempt,
            violations: assignment.violations.clone(),
        };
        Ok(Some(Admission { assignment, input }))
    }

    /// Hand in an executor's artifact for validation.
    pub fn complete(&self, assignment_id: &str, draft: ArtifactDraft) -> Result<Outcome> {
        let assignment = self.scheduler.get(assignment_id)?;
        let _review = self.review_gate(&assignment.stage)?.lock();
        if let Err(e) = self.scheduler.begin_review(assignment_id) {
            return self.discarded_or(assignment_id, e);
        }

        let record = self.record(&assignment.workflow_id)?;
        let mut rec = record.lock();
        let assignment = self.scheduler.get(assignment_id)?;
        if assignment.status != AssignmentStatus::Review {
            return Ok(Outcome::Discarded);
        }
        if rec.state.is_terminal() {
            self.scheduler.abandon(assignment_id)?;
            return Ok(Outcome::Discarded);
        }

        match self.review(&mut rec, &assignment, draft) {
            Err(e) if e.is_critical() => Ok(Outcome::Halted {
                request: self.halt_workflow(&mut rec, Some(&assignment), FailureClass::Critical, e.to_string()),
            }),
            other => other,
        }
    }

    /// Report that an executor could not produce an artifact.
    pub fn fail(&self, assignment_id: &str, failure: StageFailure) -> Result<Outcome> {
        let assignment = self.scheduler.get(assignment_id)?;
        let record = self.record(&assignment.workflow_id)?;
        let mut rec = record.lock();

        let assignment = self.scheduler.get(assignment_id)?;
        match assignment.status {
            AssignmentStatus::InProgress => {}
            AssignmentStatus::Abandoned => return Ok(Outcome::Discarded),
            other => {
                return Err(PipelineError::InvalidTransition(format!(
                    "assignment {} is {}",
                    assignment_id, other
                )));
            }
        }
        if rec.state.is_terminal() {
            self.scheduler.abandon(assignment_id)?;
            return Ok(Outcome::Discarded);
        }

        let violations = if failure.class == FailureClass::FormatError {
            vec![failure.detail.clone()]
        } else {
            Vec::new()
        };
        match self.respond(&mut rec, &assignment, failure.class, failure.detail, violations) {
            Err(e) if e.is_critical() => Ok(Outcome::Halted {
                request: self.halt_workflow(&mut rec, Some(&assignment), FailureClass::Critical, e.to_string()),
            }),
            other => other,
        }
    }

    fn discarded_or(&self, assignment_id: &str, err: PipelineError) -> Result<Outcome> {
        if self.scheduler.get(assignment_id)?.status == AssignmentStatus::Abandoned {
            Ok(Outcome::Discarded)
        } else {
            Err(err)
        }
    }

    /// Seal, validate and act on a draft. The assignment is in review.
    fn review(
        &self,
        rec: &mut WorkflowRecord,
        assignment: &TaskAssignment,
        mut draft: ArtifactDraft,
    ) -> Result<Outcome> {
        let now = self.now();
        let item = assignment.work_item_id();
        let schema = self.validator.schema_for_stage(&assignment.stage)?;

        if draft.depends_on.is_empty() {
            draft.depends_on = rec
                .state
                .input_artifacts(&assignment.stage, assignment.work_item.as_ref());
        }
        let artifact = seal(
            draft,
            &assignment.workflow_id,
            &assignment.stage,
            item,
            schema.version,
            now,
        )?;
        for dependency in &artifact.depends_on {
            if !self.artifacts.contains(dependency)? {
                let detail = format!("depends_on references unknown artifact {}", dependency);
                return self.respond(rec, assignment, FailureClass::FormatError, detail.clone(), vec![detail]);
            }
        }
        let prior = self.load_artifacts(&rec.state.prior_artifacts(item))?;
        let result = self.validator.validate_handoff(
            &artifact,
            schema,
            &prior,
            rec.state.next_stage(&assignment.stage),
        );

        self.audit.record(AuditEntry::Validation {
            workflow_id: assignment.workflow_id.clone(),
            stage: assignment.stage.clone(),
            assignment_id: assignment.id.clone(),
            artifact_id: artifact.id.clone(),
            result: result.clone(),
            at: now,
        })?;
        debug!(
            workflow_id = %assignment.workflow_id,
            stage = %assignment.stage,
            assignment_id = %assignment.id,
            verdict = ?result.verdict,
            "Validated artifact"
        );

        let warnings: Vec<RuleViolation> = result.warnings().cloned().collect();
        match result.reason {
            Some(ReasonCode::Structural) => self.respond(
                rec,
                assignment,
                FailureClass::FormatError,
                result.summary(),
                result.violation_lines(),
            ),
            Some(ReasonCode::ConsistencyBlocking) => self.escalate(
                rec,
                assignment,
                FailureClass::ConsistencyError,
                result.summary(),
                Some(artifact),
                warnings,
                EventKind::Inconsistent,
            ),
            None if self
                .recovery
                .partial_blocks(rec.state.partial_warnings, warnings.len()) =>
            {
                let detail = format!(
                    "{} accumulated partial warning(s); new: {}",
                    rec.state.partial_warnings,
                    warnings
                        .iter()
                        .map(|w| format!("{}: {}", w.rule_id, w.detail))
                        .collect::<Vec<_>>()
                        .join("; ")
                );
                self.escalate(
                    rec,
                    assignment,
                    FailureClass::ConsistencyError,
                    detail,
                    Some(artifact),
                    warnings,
                    EventKind::Inconsistent,
                )
            }
            None => self.accept(rec, assignment, artifact, warnings, false),
        }
    }

    /// Store an artifact, finish its assignment and advance the workflow.
    ///
    /// The advanced state is built and checkpointed on a copy. The
    /// assignment and the live state only change once that succeeded.
    fn accept(
        &self,
        rec: &mut WorkflowRecord,
        assignment: &TaskAssignment,
        artifact: Artifact,
        warnings: Vec<RuleViolation>,
        deviation: bool,
    ) -> Result<Outcome> {
        let now = self.now();
        let artifact_id = self.artifacts.put(artifact)?;

        let mut next = rec.state.clone();
        let state = &mut next;
        state.partial_warnings = state
            .partial_warnings
            .saturating_add(u32::try_from(warnings.len()).unwrap_or(u32::MAX));
        state.record_completion(CompletedAssignment {
            assignment_id: assignment.id.clone(),
            stage: assignment.stage.clone(),
            work_item: assignment.work_item_id().map(str::to_string),
            artifact_id: artifact_id.clone(),
            executor: assignment.executor.clone().unwrap_or_default(),
            retries: assignment.retries,
            started_at: assignment.started_at,
            finished_at: now,
        });

        let phase = match assignment.work_item_id() {
            None => {
                let index = state
                    .kanban_stages
                    .iter()
                    .position(|s| *s == assignment.stage)
                    .ok_or_else(|| PipelineError::UnknownStage(assignment.stage.clone()))?;
                match state.kanban_done(index, now)? {
                    Phase::TransitionGate => self.run_gate(state, now)?,
                    phase => phase,
                }
            }
            Some(item) => state.scrum_item_done(item, now)?,
        };
        let checkpoint = self.checkpoints.capture(&next, now)?;

        if deviation {
            self.scheduler.accept_failed(&assignment.id)?;
        } else {
            self.scheduler.finish(&assignment.id)?;
        }
        rec.state = next;
        rec.last_checkpoint = Some(checkpoint.id);

        let detail = if warnings.is_empty() {
            format!("artifact {}", short(&artifact_id))
        } else {
            format!(
                "artifact {} with {} warning(s)",
                short(&artifact_id),
                warnings.len()
            )
        };
        self.emit(
            EngineEvent::new(EventKind::Completed, assignment.workflow_id.clone(), detail)
                .with_stage(assignment.stage.clone())
                .with_assignment(assignment.id.clone()),
        );
        self.announce_completion(&rec.state);
        self.reconcile(&rec.state)?;

        Ok(Outcome::Accepted {
            artifact_id,
            warnings,
            phase,
        })
    }

    /// Build work items from the Kanban artifacts and commit the sprints.
    fn run_gate(&self, state: &mut WorkflowState, now: Timestamp) -> Result<Phase> {
        let gate = self.config.gate();
        let sprint = self.config.sprint();

        let mut sources = self.load_artifacts(&state.kanban_artifacts())?;
        if let Some(ref artifact_type) = gate.source_type {
            sources.retain(|a| &a.artifact_type == artifact_type);
        }
        let items = build_work_items(&sources, &gate, sprint.default_estimate);
        let plan = SprintPlan::pack(items, sprint.capacity_points);
        info!(
            workflow_id = %state.workflow_id,
            items = plan.items.len(),
            sprints = plan.sprints.len(),
            points = plan.committed_points(),
            "Transition gate committed sprint plan"
        );
        state.install_plan(plan, now)
    }

    fn announce_completion(&self, state: &WorkflowState) {
        if state.phase == Phase::Complete {
            info!(workflow_id = %state.workflow_id, "Workflow complete");
            self.emit(EngineEvent::new(
                EventKind::Completed,
                state.workflow_id.clone(),
                "workflow complete",
            ));
        }
    }

    // ── Failure handling ────────────────────────────────────────────────

    /// Apply the recovery policy to a failed attempt.
    fn respond(
        &self,
        rec: &mut WorkflowRecord,
        assignment: &TaskAssignment,
        class: FailureClass,
        detail: String,
        violations: Vec<String>,
    ) -> Result<Outcome> {
        let action = self
            .recovery
            .decide(class, assignment.retries, assignment.format_reattempts);
        match action {
            RecoveryAction::Retry { retry, delay_ms } => {
                let not_before = clock::add(self.now(), Duration::from_millis(delay_ms));
                self.scheduler.requeue_after(&assignment.id, not_before)?;
                self.log_failure(rec, Some(assignment), class, &detail, action)?;
                warn!(
                    workflow_id = %assignment.workflow_id,
                    stage = %assignment.stage,
                    assignment_id = %assignment.id,
                    retry,
                    delay_ms,
                    "Transient failure, retrying: {}",
                    detail
                );
                self.emit(
                    EngineEvent::new(
                        EventKind::Delayed,
                        assignment.workflow_id.clone(),
                        format!("retry {} in {}ms: {}", retry, delay_ms, detail),
                    )
                    .with_stage(assignment.stage.clone())
                    .with_assignment(assignment.id.clone()),
                );
                Ok(Outcome::Retrying { retry, not_before })
            }
            RecoveryAction::ReturnToBacklog { .. } => {
                self.scheduler
                    .return_to_backlog(&assignment.id, violations.clone())?;
                self.log_failure(rec, Some(assignment), class, &detail, action)?;
                warn!(
                    workflow_id = %assignment.workflow_id,
                    stage = %assignment.stage,
                    assignment_id = %assignment.id,
                    "Artifact rejected, back to backlog: {}",
                    detail
                );
                self.emit(
                    EngineEvent::new(
                        EventKind::Failed,
                        assignment.workflow_id.clone(),
                        format!("returned to backlog: {}", detail),
                    )
                    .with_stage(assignment.stage.clone())
                    .with_assignment(assignment.id.clone()),
                );
                Ok(Outcome::ReturnedToBacklog { violations })
            }
            RecoveryAction::Escalate { class } => self.escalate(
                rec,
                assignment,
                class,
                detail,
                None,
                Vec::new(),
                EventKind::Failed,
            ),
            RecoveryAction::Halt => Ok(Outcome::Halted {
                request: self.halt_workflow(rec, Some(assignment), class, detail),
            }),
        }
    }

    /// Fail the assignment, pause the workflow and ask for a decision. A
    /// workflow has at most one open request; later escalations while
    /// paused only add failure records.
    #[allow(clippy::too_many_arguments)]
    fn escalate(
        &self,
        rec: &mut WorkflowRecord,
        assignment: &TaskAssignment,
        class: FailureClass,
        detail: String,
        artifact: Option<Artifact>,
        warnings: Vec<RuleViolation>,
        kind: EventKind,
    ) -> Result<Outcome> {
        self.scheduler.mark_failed(&assignment.id)?;
        self.log_failure(
            rec,
            Some(assignment),
            class,
            &detail,
            RecoveryAction::Escalate { class },
        )?;

        let request = match rec.pending {
            Some(ref pending) => pending.request.clone(),
            None => {
                rec.state.pause(self.now());
                self.scheduler.hold(&assignment.workflow_id);
                self.request_decision(rec, Some(assignment), class, detail.clone(), artifact, warnings)
            }
        };

        warn!(
            workflow_id = %assignment.workflow_id,
            stage = %assignment.stage,
            assignment_id = %assignment.id,
            class = %class,
            request_id = %request.id,
            "Workflow paused for decision: {}",
            detail
        );
        self.emit(
            EngineEvent::new(kind, assignment.workflow_id.clone(), format!("{}: {}", class, detail))
                .with_stage(assignment.stage.clone())
                .with_assignment(assignment.id.clone()),
        );
        Ok(Outcome::AwaitingDecision { request })
    }

    /// Halt a workflow after a critical fault. Abandons its work and
    /// replaces any open request with an acknowledge-only one.
    fn halt_workflow(
        &self,
        rec: &mut WorkflowRecord,
        assignment: Option<&TaskAssignment>,
        class: FailureClass,
        detail: String,
    ) -> DecisionRequest {
        let workflow_id = rec.state.workflow_id.clone();
        if let Some(a) = assignment {
            match self.scheduler.mark_failed(&a.id) {
                Ok(_) => {}
                Err(PipelineError::InvalidTransition(reason)) => {
                    debug!(assignment_id = %a.id, "Halted assignment already settled: {}", reason);
                }
                Err(e) => warn!(
                    workflow_id = %workflow_id,
                    assignment_id = %a.id,
                    error = %e,
                    "Could not mark halted assignment failed"
                ),
            }
        }
        rec.state.halt(self.now());
        let abandoned = self.scheduler.abandon_workflow(&workflow_id);
        self.scheduler.release(&workflow_id);
        if let Some(old) = rec.pending.take() {
            self.decisions.write().remove(&old.request.id);
        }

        if let Err(e) = self.log_failure(rec, assignment, class, &detail, RecoveryAction::Halt) {
            error!(workflow_id = %workflow_id, error = %e, "Could not record halt in audit log");
        }
        let request = self.request_decision(rec, assignment, FailureClass::Critical, detail.clone(), None, Vec::new());

        error!(
            workflow_id = %workflow_id,
            abandoned = abandoned.len(),
            last_checkpoint = rec.last_checkpoint.as_deref().unwrap_or("-"),
            "Workflow halted: {}",
            detail
        );
        let mut event = EngineEvent::new(EventKind::Failed, workflow_id, format!("halted: {}", detail));
        if let Some(a) = assignment {
            event = event.with_stage(a.stage.clone()).with_assignment(a.id.clone());
        }
        self.emit(event);
        request
    }

    fn request_decision(
        &self,
        rec: &mut WorkflowRecord,
        assignment: Option<&TaskAssignment>,
        class: FailureClass,
        detail: String,
        artifact: Option<Artifact>,
        warnings: Vec<RuleViolation>,
    ) -> DecisionRequest {
        let mut options = DecisionOption::for_class(class);
        if artifact.is_none() {
            options.retain(|o| *o != DecisionOption::AcceptDeviation);
        }
        let request = DecisionRequest {
            id: new_id(),
            workflow_id: rec.state.workflow_id.clone(),
            assignment_id: assignment.map(|a| a.id.clone()),
            stage: assignment.map(|a| a.stage.clone()),
            failure_class: class,
            detail,
            options,
            last_checkpoint: rec.last_checkpoint.clone(),
            created_at: self.now(),
        };
        self.decisions
            .write()
            .insert(request.id.clone(), request.workflow_id.clone());
        rec.pending = Some(PendingDecision {
            request: request.clone(),
            artifact,
            warnings,
        });
        request
    }

    fn log_failure(
        &self,
        rec: &WorkflowRecord,
        assignment: Option<&TaskAssignment>,
        class: FailureClass,
        detail: &str,
        action: RecoveryAction,
    ) -> Result<()> {
        let record = FailureRecord {
            id: new_id(),
            workflow_id: rec.state.workflow_id.clone(),
            assignment_id: assignment.map(|a| a.id.clone()),
            stage: assignment.map(|a| a.stage.clone()),
            class,
            detail: detail.to_string(),
            attempt: assignment.map_or(0, |a| a.attempt),
            action,
            last_checkpoint: rec.last_checkpoint.clone(),
            recorded_at: self.now(),
        };
        self.audit.record(AuditEntry::Failure { record })
    }

    // ── Coordinator side ────────────────────────────────────────────────

    /// Answer an open decision request. Returns the workflow's phase after
    /// the decision took effect.
    pub fn decide(&self, request_id: &str, decision: Decision) -> Result<Phase> {
        let workflow_id = self
            .decisions
            .read()
            .get(request_id)
            .cloned()
            .ok_or_else(|| PipelineError::DecisionNotFound(request_id.to_string()))?;
        let record = self.record(&workflow_id)?;
        let mut rec = record.lock();

        let Some(pending) = rec.pending.as_ref().filter(|p| p.request.id == request_id) else {
            return Err(PipelineError::DecisionNotFound(request_id.to_string()));
        };
        if !pending.request.allows(&decision) {
            return Err(PipelineError::InvalidDecision(format!(
                "{} is not offered for {}; options: {}",
                decision.option(),
                pending.request.failure_class,
                pending
                    .request
                    .options
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        if let Decision::AcceptDeviation = decision
            && pending.artifact.is_none()
        {
            return Err(PipelineError::InvalidDecision(
                "there is no artifact to accept".to_string(),
            ));
        }

        self.audit.record(AuditEntry::Decision {
            request_id: request_id.to_string(),
            workflow_id: workflow_id.clone(),
            decision: decision.clone(),
            at: self.now(),
        })?;
        let Some(pending) = rec.pending.take() else {
            return Err(PipelineError::DecisionNotFound(request_id.to_string()));
        };
        self.decisions.write().remove(request_id);
        info!(
            workflow_id = %workflow_id,
            request_id = %request_id,
            decision = %decision.option(),
            "Decision received"
        );

        if let Err(e) = self.apply_decision(&mut rec, pending, decision) {
            if !e.is_critical() {
                return Err(e);
            }
            self.halt_workflow(&mut rec, None, FailureClass::Critical, e.to_string());
        }
        Ok(rec.state.phase.clone())
    }

    fn apply_decision(
        &self,
        rec: &mut WorkflowRecord,
        pending: PendingDecision,
        decision: Decision,
    ) -> Result<()> {
        let workflow_id = rec.state.workflow_id.clone();
        let now = self.now();
        match decision {
            Decision::Retry => {
                rec.state.unpause(now);
                self.scheduler.release(&workflow_id);
                self.emit(EngineEvent::new(
                    EventKind::Recovered,
                    workflow_id,
                    format!("retrying after {}", pending.request.failure_class),
                ));
                self.announce_completion(&rec.state);
                self.reconcile(&rec.state)?;
            }
            Decision::AcceptDeviation => {
                let (Some(artifact), Some(assignment_id)) =
                    (pending.artifact, pending.request.assignment_id.as_deref())
                else {
                    return Err(PipelineError::InvalidDecision(
                        "there is no artifact to accept".to_string(),
                    ));
                };
                let assignment = self.scheduler.get(assignment_id)?;
                rec.state.unpause(now);
                self.scheduler.release(&workflow_id);
                self.emit(
                    EngineEvent::new(EventKind::Recovered, workflow_id, "deviation accepted")
                        .with_stage(assignment.stage.clone())
                        .with_assignment(assignment.id.clone()),
                );
                self.accept(rec, &assignment, artifact, pending.warnings, true)?;
            }
            Decision::RestartFromCheckpoint { checkpoint_id } => {
                self.restore_locked(rec, &checkpoint_id)?;
            }
            Decision::Halt => {
                if !matches!(rec.state.phase, Phase::Halted { .. }) {
                    rec.state.halt(now);
                    let abandoned = self.scheduler.abandon_workflow(&workflow_id);
                    self.scheduler.release(&workflow_id);
                    info!(workflow_id = %workflow_id, abandoned = abandoned.len(), "Workflow halted by decision");
                    self.emit(EngineEvent::new(
                        EventKind::Failed,
                        workflow_id,
                        "halted by coordinator",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Replace a workflow's state with a checkpoint's. Live assignments are
    /// abandoned and any open request is dropped.
    fn restore_locked(&self, rec: &mut WorkflowRecord, checkpoint_id: &str) -> Result<()> {
        let checkpoint: Checkpoint = self.checkpoints.load(checkpoint_id)?;
        let workflow_id = rec.state.workflow_id.clone();
        if checkpoint.workflow_id() != workflow_id {
            return Err(PipelineError::InvalidDecision(format!(
                "checkpoint {} belongs to workflow {}",
                short(checkpoint_id),
                checkpoint.workflow_id()
            )));
        }
        if checkpoint.phase().is_terminal() {
            return Err(PipelineError::InvalidTransition(format!(
                "checkpoint {} records a finished workflow ({})",
                short(checkpoint_id),
                checkpoint.phase()
            )));
        }

        let now = self.now();
        let abandoned = self.scheduler.abandon_workflow(&workflow_id);
        self.scheduler.release(&workflow_id);
        if let Some(old) = rec.pending.take() {
            self.decisions.write().remove(&old.request.id);
        }

        let id = checkpoint.id.clone();
        let mut state = checkpoint.body.state;
        state.mark_restored(now);
        rec.state = state;
        rec.last_checkpoint = Some(id.clone());

        self.audit.record(AuditEntry::Restore {
            workflow_id: workflow_id.clone(),
            checkpoint_id: id.clone(),
            at: now,
        })?;
        info!(
            workflow_id = %workflow_id,
            checkpoint_id = %id,
            phase = %rec.state.phase,
            abandoned = abandoned.len(),
            "Restored workflow from checkpoint"
        );
        self.emit(EngineEvent::new(
            EventKind::Recovered,
            workflow_id,
            format!("restored from checkpoint {} at {}", short(&id), rec.state.phase),
        ));
        self.reconcile(&rec.state)?;
        Ok(())
    }

    /// Restart a workflow from a checkpoint (its latest when `None`).
    ///
    /// Works for paused and halted workflows, for running workflows when a
    /// checkpoint is named explicitly, and for workflows this engine has
    /// not loaded (after a restart).
    pub fn resume(&self, workflow_id: &str, checkpoint_id: Option<&str>) -> Result<Phase> {
        let existing = self.workflows.read().get(workflow_id).cloned();
        if let Some(record) = existing {
            let mut rec = record.lock();
            match rec.state.phase {
                Phase::Complete | Phase::Cancelled => {
                    return Err(PipelineError::InvalidTransition(format!(
                        "workflow {} is {}; nothing to resume",
                        workflow_id, rec.state.phase
                    )));
                }
                Phase::Paused { .. } | Phase::Halted { .. } => {}
                _ if checkpoint_id.is_none() => {
                    return Err(PipelineError::InvalidTransition(format!(
                        "workflow {} is running; name a checkpoint to roll back",
                        workflow_id
                    )));
                }
                _ => {}
            }
            let target = match checkpoint_id {
                Some(id) => id.to_string(),
                None => self
                    .checkpoints
                    .latest(workflow_id)?
                    .ok_or_else(|| PipelineError::CheckpointNotFound(workflow_id.to_string()))?,
            };
            self.restore_locked(&mut rec, &target)?;
            return Ok(rec.state.phase.clone());
        }

        let target = match checkpoint_id {
            Some(id) => id.to_string(),
            None => self
                .checkpoints
                .latest(workflow_id)?
                .ok_or_else(|| PipelineError::WorkflowNotFound(workflow_id.to_string()))?,
        };
        let checkpoint = self.checkpoints.load(&target)?;
        if checkpoint.workflow_id() != workflow_id {
            return Err(PipelineError::InvalidTransition(format!(
                "checkpoint {} belongs to workflow {}",
                short(&target),
                checkpoint.workflow_id()
            )));
        }
        let record = self
            .workflows
            .write()
            .entry(workflow_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(WorkflowRecord {
                    state: checkpoint.body.state.clone(),
                    last_checkpoint: Some(target.clone()),
                    pending: None,
                }))
            })
            .clone();
        let mut rec = record.lock();
        self.restore_locked(&mut rec, &target)?;
        Ok(rec.state.phase.clone())
    }

    /// Cancel a workflow. Returns `false` if it was already cancelled.
    pub fn cancel(&self, workflow_id: &str) -> Result<bool> {
        let record = self.record(workflow_id)?;
        let mut rec = record.lock();
        let now = self.now();
        if !rec.state.cancel(now)? {
            return Ok(false);
        }

        let abandoned = self.scheduler.abandon_workflow(workflow_id);
        self.scheduler.release(workflow_id);
        if let Some(old) = rec.pending.take() {
            self.decisions.write().remove(&old.request.id);
        }
        match self.checkpoints.capture(&rec.state, now) {
            Ok(checkpoint) => rec.last_checkpoint = Some(checkpoint.id),
            Err(e) => warn!(workflow_id = %workflow_id, error = %e, "Could not checkpoint cancellation"),
        }

        info!(workflow_id = %workflow_id, abandoned = abandoned.len(), "Workflow cancelled");
        self.emit(EngineEvent::new(
            EventKind::Failed,
            workflow_id,
            format!("cancelled; {} assignment(s) abandoned", abandoned.len()),
        ));
        Ok(true)
    }

    /// Carry a work item into the next sprint. Returns its points.
    pub fn defer(&self, workflow_id: &str, item: &str) -> Result<u32> {
        let record = self.record(workflow_id)?;
        let mut rec = record.lock();
        let now = self.now();

        let mut next = rec.state.clone();
        let points = next.defer(item, now)?;
        for assignment in self.scheduler.for_workflow(workflow_id) {
            if assignment.status.is_live() && assignment.work_item_id() == Some(item) {
                self.scheduler.abandon(&assignment.id)?;
            }
        }
        rec.state = next;
        let checkpoint = self.checkpoints.capture(&rec.state, now)?;
        rec.last_checkpoint = Some(checkpoint.id);

        info!(workflow_id = %workflow_id, item = %item, points, "Work item deferred");
        self.emit(EngineEvent::new(
            EventKind::Delayed,
            workflow_id,
            format!("item {} ({} pts) deferred to the next sprint", item, points),
        ));
        self.announce_completion(&rec.state);
        self.reconcile(&rec.state)?;
        Ok(points)
    }

    /// Snapshot a workflow now.
    pub fn capture(&self, workflow_id: &str) -> Result<CheckpointId> {
        let record = self.record(workflow_id)?;
        let mut rec = record.lock();
        let checkpoint = self.checkpoints.capture(&rec.state, self.now())?;
        rec.last_checkpoint = Some(checkpoint.id.clone());
        Ok(checkpoint.id)
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn workflow(&self, workflow_id: &str) -> Result<WorkflowView> {
        let record = self.record(workflow_id)?;
        let rec = record.lock();
        Ok(WorkflowView {
            state: rec.state.clone(),
            last_checkpoint: rec.last_checkpoint.clone(),
            pending_decision: rec.pending.as_ref().map(|p| p.request.clone()),
            assignments: self.scheduler.for_workflow(workflow_id),
        })
    }

    /// Ids of the workflows this engine holds.
    pub fn workflow_ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self.workflows.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn phase(&self, workflow_id: &str) -> Result<Phase> {
        Ok(self.record(workflow_id)?.lock().state.phase.clone())
    }

    /// Open decision requests, oldest first.
    pub fn pending_decisions(&self) -> Vec<DecisionRequest> {
        let records: Vec<_> = self.workflows.read().values().cloned().collect();
        let mut requests: Vec<DecisionRequest> = records
            .iter()
            .filter_map(|r| r.lock().pending.as_ref().map(|p| p.request.clone()))
            .collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// Failure records of a workflow, oldest first.
    pub fn failures(&self, workflow_id: &str) -> Vec<FailureRecord> {
        self.audit.failures(workflow_id)
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Workflows with a non-terminal latest checkpoint.
    pub fn recoverable_workflows(&self) -> Result<Vec<RecoverableWorkflow>> {
        let mut recoverable = Vec::new();
        for workflow_id in self.checkpoints.workflows()? {
            let Some(id) = self.checkpoints.latest(&workflow_id)? else {
                continue;
            };
            let checkpoint = match self.checkpoints.load(&id) {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    warn!(workflow_id = %workflow_id, checkpoint_id = %id, error = %e, "Skipping unreadable checkpoint");
                    continue;
                }
            };
            if checkpoint.phase().is_terminal() {
                continue;
            }
            recoverable.push(RecoverableWorkflow {
                loaded: self.workflows.read().contains_key(&workflow_id),
                workflow_id,
                sequence: checkpoint.sequence(),
                phase: checkpoint.phase().clone(),
                captured_at: checkpoint.body.created_at,
                checkpoint_id: checkpoint.id,
            });
        }
        recoverable.sort_by_key(|r| r.captured_at);
        Ok(recoverable)
    }

    /// Every checkpoint of a workflow, oldest first.
    pub fn checkpoint_chain(&self, workflow_id: &str) -> Result<Vec<Checkpoint>> {
        self.checkpoints.chain(workflow_id)
    }

    pub fn artifact(&self, id: &str) -> Result<Artifact> {
        self.artifacts.get(id)
    }

    pub fn provenance(&self, id: &str) -> Result<ProvenanceRecord> {
        self.artifacts.provenance(id)
    }

    pub fn artifacts_for_workflow(&self, workflow_id: &str) -> Result<Vec<Artifact>> {
        self.artifacts.list_for_workflow(workflow_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn recent_events(&self) -> Vec<EngineEvent> {
        self.events.recent()
    }

    pub fn events_since(&self, seq: u64) -> Vec<EngineEvent> {
        self.events.since(seq)
    }

    pub fn snapshot(&self, stage: &str) -> Result<StageSnapshot> {
        self.scheduler.snapshot(stage)
    }

    pub fn next_eligible_at(&self, stage: &str) -> Result<Option<Timestamp>> {
        self.scheduler.next_eligible_at(stage)
    }

    pub fn assignment(&self, assignment_id: &str) -> Result<TaskAssignment> {
        self.scheduler.get(assignment_id)
    }

    /// Configured stage names in pipeline order.
    pub fn stage_names(&self) -> Vec<String> {
        self.config.stage_names()
    }

    /// No unheld workflow has live work.
    pub fn is_idle(&self) -> bool {
        !self.scheduler.has_live_work()
    }
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use handoff_config::{FieldType, SchemaConfig};
    use serde_json::json;

    const CONFIG: &str = r#"
[sprint]
capacity_points = 5

[[stages]]
name = "spike"
output_schema = "spike_report"

[[stages]]
name = "plan"
output_schema = "plan"

[[stages]]
name = "build"
mode = "scrum"
output_schema = "change"

[schemas.spike_report]
artifact_type = "spike_report"
[[schemas.spike_report.fields]]
name = "keywords"
type = "array"

[schemas.plan]
artifact_type = "plan"
[[schemas.plan.fields]]
name = "work_items"
type = "array"

[schemas.change]
artifact_type = "change"
[[schemas.change.fields]]
name = "summary"
type = "string"
"#;

    fn engine() -> (Engine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let config = HandoffConfig::from_toml(CONFIG).unwrap();
        let engine = Engine::builder(config).clock(clock.clone()).build().unwrap();
        (engine, clock)
    }

    fn run(engine: &Engine, stage: &str, draft: ArtifactDraft) -> Outcome {
        let admission = engine.admit_next(stage, "test").unwrap().unwrap();
        engine.complete(&admission.assignment.id, draft).unwrap()
    }

    fn spike() -> ArtifactDraft {
        ArtifactDraft::new("spike_report", json!({"keywords": ["cache"]}))
    }

    fn plan(points: &[u32]) -> ArtifactDraft {
        let items: Vec<_> = points
            .iter()
            .enumerate()
            .map(|(i, p)| json!({"id": format!("I-{}", i + 1), "title": "t", "estimate": p}))
            .collect();
        ArtifactDraft::new("plan", json!({ "work_items": items }))
    }

    fn change() -> ArtifactDraft {
        ArtifactDraft::new("change", json!({"summary": "done"}))
    }

    #[test]
    fn test_submit_rejects_bad_stage_lists() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.submit(Some(vec![]), 0),
            Err(PipelineError::InvalidWorkflow(_))
        ));
        assert!(matches!(
            engine.submit(Some(vec!["nope".into()]), 0),
            Err(PipelineError::UnknownStage(_))
        ));
        assert!(matches!(
            engine.submit(Some(vec!["build".into()]), 0),
            Err(PipelineError::InvalidWorkflow(_))
        ));
        assert!(matches!(
            engine.submit(Some(vec!["build".into(), "spike".into()]), 0),
            Err(PipelineError::InvalidWorkflow(_))
        ));
    }

    #[test]
    fn test_kanban_only_workflow_completes() {
        let (engine, _) = engine();
        let wf = engine
            .submit(Some(vec!["spike".into(), "plan".into()]), 0)
            .unwrap();
        assert_eq!(engine.phase(&wf).unwrap(), Phase::Kanban { stage: 0 });

        let outcome = run(&engine, "spike", spike());
        assert!(matches!(outcome, Outcome::Accepted { phase: Phase::Kanban { stage: 1 }, .. }));
        let outcome = run(&engine, "plan", plan(&[1]));
        assert!(matches!(outcome, Outcome::Accepted { phase: Phase::Complete, .. }));
        assert!(engine.is_idle());

        let view = engine.workflow(&wf).unwrap();
        assert_eq!(view.state.completed.len(), 2);
        // the second artifact records the first as provenance
        let second = engine.artifact(&view.state.artifacts[1]).unwrap();
        assert_eq!(second.depends_on, vec![view.state.artifacts[0].clone()]);
    }

    #[test]
    fn test_gate_packs_sprints_and_scrum_runs_per_item() {
        let (engine, _) = engine();
        let wf = engine.submit(None, 0).unwrap();
        run(&engine, "spike", spike());
        let outcome = run(&engine, "plan", plan(&[3, 3, 2]));
        assert!(matches!(
            outcome,
            Outcome::Accepted { phase: Phase::Scrum { sprint: 0, stage: 0 }, .. }
        ));

        let sprints = engine.workflow(&wf).unwrap().state.sprint_plan.unwrap().sprints;
        assert_eq!(sprints.len(), 2);
        assert_eq!(sprints[0].items, vec!["I-1".to_string()]);
        assert_eq!(sprints[1].items, vec!["I-2".to_string(), "I-3".to_string()]);

        let admission = engine.admit_next("build", "test").unwrap().unwrap();
        assert_eq!(admission.input.work_item.as_ref().unwrap().id, "I-1");
        assert_eq!(admission.input.input_artifacts[0].artifact_type, "plan");
        engine.complete(&admission.assignment.id, change()).unwrap();

        // sprint 2 items run in parallel on the unbounded scrum stage
        let a = engine.admit_next("build", "test").unwrap().unwrap();
        let b = engine.admit_next("build", "test").unwrap().unwrap();
        engine.complete(&a.assignment.id, change()).unwrap();
        let last = engine.complete(&b.assignment.id, change()).unwrap();
        assert!(matches!(last, Outcome::Accepted { phase: Phase::Complete, .. }));
    }

    #[test]
    fn test_defer_moves_item_and_abandons_its_work() {
        let (engine, _) = engine();
        let wf = engine.submit(None, 0).unwrap();
        run(&engine, "spike", spike());
        run(&engine, "plan", plan(&[2, 2]));

        let a = engine.admit_next("build", "test").unwrap().unwrap();
        let item = a.input.work_item.clone().unwrap().id;
        let points = engine.defer(&wf, &item).unwrap();
        assert_eq!(points, 2);
        assert_eq!(engine.complete(&a.assignment.id, change()).unwrap(), Outcome::Discarded);

        let plan = engine.workflow(&wf).unwrap().state.sprint_plan.unwrap();
        assert_eq!(plan.reduced_scope(), 2);
        assert_eq!(plan.sprints.len(), 2);
    }

    #[test]
    fn test_cancel_is_idempotent_and_abandons() {
        let (engine, _) = engine();
        let wf = engine.submit(None, 0).unwrap();
        let admission = engine.admit_next("spike", "test").unwrap().unwrap();

        assert!(engine.cancel(&wf).unwrap());
        assert!(!engine.cancel(&wf).unwrap());
        assert_eq!(engine.phase(&wf).unwrap(), Phase::Cancelled);
        assert_eq!(
            engine.fail(&admission.assignment.id, StageFailure::transient("late")).unwrap(),
            Outcome::Discarded
        );
        // cancellation never schedules a retry
        assert!(engine.failures(&wf).is_empty());
        assert!(engine.is_idle());
    }

    #[test]
    fn test_transient_failure_delays_then_readmits() {
        let (engine, clock) = engine();
        engine.submit(None, 0).unwrap();
        let admission = engine.admit_next("spike", "test").unwrap().unwrap();
        let outcome = engine
            .fail(&admission.assignment.id, StageFailure::transient("rate limited"))
            .unwrap();
        assert!(matches!(outcome, Outcome::Retrying { retry: 1, .. }));
        assert!(engine.admit_next("spike", "test").unwrap().is_none());

        clock.advance(Duration::from_secs(1));
        let again = engine.admit_next("spike", "test").unwrap().unwrap();
        assert_eq!(again.input.attempt, 2);
        let kinds: Vec<_> = engine.recent_events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Delayed]);
    }

    #[test]
    fn test_agent_error_retry_decision_reenqueues() {
        let (engine, _) = engine();
        let wf = engine.submit(None, 0).unwrap();
        let admission = engine.admit_next("spike", "test").unwrap().unwrap();
        let Outcome::AwaitingDecision { request } = engine
            .fail(&admission.assignment.id, StageFailure::agent("cannot"))
            .unwrap()
        else {
            panic!("expected a decision request");
        };
        assert!(!request.options.contains(&DecisionOption::AcceptDeviation));
        assert!(engine.phase(&wf).unwrap().is_paused());
        assert!(engine.admit_next("spike", "test").unwrap().is_none());

        assert!(matches!(
            engine.decide(&request.id, Decision::AcceptDeviation),
            Err(PipelineError::InvalidDecision(_))
        ));
        assert_eq!(engine.decide(&request.id, Decision::Retry).unwrap(), Phase::Kanban { stage: 0 });
        let fresh = engine.admit_next("spike", "test").unwrap().unwrap();
        assert_ne!(fresh.assignment.id, admission.assignment.id);
        assert_eq!(fresh.assignment.retries, 0);
        assert!(matches!(
            engine.decide(&request.id, Decision::Retry),
            Err(PipelineError::DecisionNotFound(_))
        ));
    }

    #[test]
    fn test_restart_from_checkpoint_rolls_back() {
        let (engine, _) = engine();
        let wf = engine.submit(None, 0).unwrap();
        let first = engine.workflow(&wf).unwrap().last_checkpoint.unwrap();
        run(&engine, "spike", spike());
        let admission = engine.admit_next("plan", "test").unwrap().unwrap();
        let Outcome::AwaitingDecision { request } = engine
            .fail(&admission.assignment.id, StageFailure::agent("lost context"))
            .unwrap()
        else {
            panic!("expected a decision request");
        };

        let phase = engine
            .decide(&request.id, Decision::RestartFromCheckpoint { checkpoint_id: first })
            .unwrap();
        assert_eq!(phase, Phase::Kanban { stage: 0 });
        let view = engine.workflow(&wf).unwrap();
        assert!(view.state.completed.is_empty());
        assert!(view.state.history.last().unwrap().rollback);
        assert!(engine.admit_next("spike", "test").unwrap().is_some());
    }

    #[test]
    fn test_critical_failure_halts_with_acknowledge_only() {
        let (engine, _) = engine();
        let wf = engine.submit(None, 0).unwrap();
        let admission = engine.admit_next("spike", "test").unwrap().unwrap();
        let Outcome::Halted { request } = engine
            .fail(&admission.assignment.id, StageFailure::critical("disk gone"))
            .unwrap()
        else {
            panic!("expected halt");
        };
        assert_eq!(request.options, vec![DecisionOption::Halt]);
        assert!(matches!(engine.phase(&wf).unwrap(), Phase::Halted { .. }));
        assert_eq!(
            engine.assignment(&admission.assignment.id).unwrap().status,
            AssignmentStatus::Failed
        );
        assert!(engine.decide(&request.id, Decision::Retry).is_err());
        engine.decide(&request.id, Decision::Halt).unwrap();
        assert!(engine.pending_decisions().is_empty());

        // a halted workflow is still recoverable from its last good checkpoint
        let recoverable = engine.recoverable_workflows().unwrap();
        assert_eq!(recoverable.len(), 1);
        assert_eq!(engine.resume(&wf, None).unwrap(), Phase::Kanban { stage: 0 });
    }

    /// Checkpoint store whose saves start failing on demand.
    #[derive(Default)]
    struct FailingSaves {
        inner: MemoryCheckpointStore,
        failing: std::sync::atomic::AtomicBool,
    }

    impl CheckpointStore for FailingSaves {
        fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(PipelineError::Storage("disk full".into()));
            }
            self.inner.save(checkpoint)
        }

        fn load(&self, id: &str) -> Result<Checkpoint> {
            self.inner.load(id)
        }

        fn ids_for_workflow(&self, workflow_id: &str) -> Result<Vec<CheckpointId>> {
            self.inner.ids_for_workflow(workflow_id)
        }

        fn workflows(&self) -> Result<Vec<Id>> {
            self.inner.workflows()
        }
    }

    #[test]
    fn test_failed_checkpoint_does_not_record_completion() {
        let store = Arc::new(FailingSaves::default());
        let config = HandoffConfig::from_toml(CONFIG).unwrap();
        let engine = Engine::builder(config)
            .checkpoint_store(store.clone())
            .build()
            .unwrap();
        let wf = engine.submit(None, 0).unwrap();
        let admission = engine.admit_next("spike", "test").unwrap().unwrap();

        store.failing.store(true, std::sync::atomic::Ordering::SeqCst);
        let outcome = engine.complete(&admission.assignment.id, spike()).unwrap();
        assert!(matches!(outcome, Outcome::Halted { .. }));

        let view = engine.workflow(&wf).unwrap();
        assert!(view.state.completed.is_empty());
        assert!(matches!(view.state.phase, Phase::Halted { .. }));
        assert_eq!(
            engine.assignment(&admission.assignment.id).unwrap().status,
            AssignmentStatus::Failed
        );
    }

    #[test]
    fn test_artifact_must_fit_next_stage_input_schema() {
        let mut config = HandoffConfig::from_toml(CONFIG).unwrap();
        config.stages[1].input_schema = Some("findings".into());
        config.schemas.insert(
            "findings".into(),
            SchemaConfig::new("spike_report")
                .required("keywords", FieldType::Array)
                .required("risks", FieldType::Array),
        );
        let engine = Engine::in_memory(config).unwrap();
        let wf = engine.submit(None, 0).unwrap();

        let Outcome::ReturnedToBacklog { violations } = run(&engine, "spike", spike()) else {
            panic!("expected format error");
        };
        assert_eq!(violations, vec!["risks: missing required field (input of 'plan')"]);
        assert_eq!(engine.failures(&wf)[0].class, FailureClass::FormatError);

        let admission = engine.admit_next("spike", "test").unwrap().unwrap();
        assert_eq!(admission.input.violations, violations);
        let fixed = ArtifactDraft::new(
            "spike_report",
            json!({"keywords": ["cache"], "risks": ["eviction"]}),
        );
        let outcome = engine.complete(&admission.assignment.id, fixed).unwrap();
        assert!(matches!(outcome, Outcome::Accepted { .. }));
        assert_eq!(engine.phase(&wf).unwrap(), Phase::Kanban { stage: 1 });
    }
}
