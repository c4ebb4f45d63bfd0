//! Per-stage Kanban queues with WIP-bounded admission.
//!
//! Each stage has its own lock, so stages never contend with each other.
//! Every public call is a single transition on one assignment (or one
//! workflow) and returns without holding any lock.
//!
//! ```text
//! Backlog/Ready ──admit──▶ InProgress ──begin_review──▶ Review ──finish──▶ Done
//!      ▲                       │                          │
//!      └── requeue_after / return_to_backlog ◀────────────┤
//!                              └────── mark_failed ───────┴──▶ Failed
//! any live status ──abandon──▶ Abandoned
//! ```
//!
//! A WIP slot is held from admission until the assignment leaves
//! `InProgress`/`Review`, so `InProgress + Review <= wip_limit` always.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use handoff_config::HandoffConfig;
use handoff_types::{Id, Timestamp, WorkItem, new_id};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{PipelineError, Result};

/// Lifecycle of a task assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    /// Waiting, possibly with attached violations or a backoff time.
    Backlog,
    /// Waiting, freshly enqueued.
    Ready,
    InProgress,
    /// Artifact returned, validation running.
    Review,
    Done,
    Failed,
    /// Dropped by cancellation, halt, restore, or deferral.
    Abandoned,
}

impl AssignmentStatus {
    /// Waiting for admission.
    pub fn is_queued(&self) -> bool {
        matches!(self, AssignmentStatus::Backlog | AssignmentStatus::Ready)
    }

    /// Holding a WIP slot.
    pub fn occupies_slot(&self) -> bool {
        matches!(self, AssignmentStatus::InProgress | AssignmentStatus::Review)
    }

    /// Not yet in a terminal status.
    pub fn is_live(&self) -> bool {
        self.is_queued() || self.occupies_slot()
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssignmentStatus::Backlog => "backlog",
            AssignmentStatus::Ready => "ready",
            AssignmentStatus::InProgress => "in_progress",
            AssignmentStatus::Review => "review",
            AssignmentStatus::Done => "done",
            AssignmentStatus::Failed => "failed",
            AssignmentStatus::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// One unit of stage work for one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub id: Id,
    pub workflow_id: Id,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item: Option<WorkItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    pub status: AssignmentStatus,
    pub priority: i32,
    /// Enqueue order, for FIFO among equal priorities.
    pub seq: u64,
    /// Number of times admitted.
    pub attempt: u32,
    /// Transient retries taken.
    pub retries: u32,
    /// Format re-attempts taken.
    pub format_reattempts: u32,
    /// Not admissible before this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<Timestamp>,
    /// Structural violations from the previous attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
}

impl TaskAssignment {
    pub fn work_item_id(&self) -> Option<&str> {
        self.work_item.as_ref().map(|i| i.id.as_str())
    }

    fn eligible(&self, now: Timestamp) -> bool {
        self.status.is_queued() && self.not_before.is_none_or(|t| t <= now)
    }
}

/// Point-in-time view of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub stage: String,
    pub wip_limit: Option<usize>,
    /// Queued assignments in admission order.
    pub backlog: Vec<TaskAssignment>,
    pub in_progress: Vec<TaskAssignment>,
    pub review: Vec<TaskAssignment>,
    pub done: usize,
    pub failed: usize,
    pub abandoned: usize,
}

struct StageQueue {
    wip_limit: Option<usize>,
    assignments: Vec<TaskAssignment>,
}

impl StageQueue {
    fn occupied(&self) -> usize {
        self.assignments
            .iter()
            .filter(|a| a.status.occupies_slot())
            .count()
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut TaskAssignment> {
        self.assignments
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| PipelineError::AssignmentNotFound(id.to_string()))
    }
}

/// Admission order: higher priority first, then earlier enqueue.
fn admission_key(a: &TaskAssignment) -> (std::cmp::Reverse<i32>, u64) {
    (std::cmp::Reverse(a.priority), a.seq)
}

/// The stage scheduler.
pub struct StageScheduler {
    queues: HashMap<String, Mutex<StageQueue>>,
    locations: RwLock<HashMap<Id, String>>,
    held: RwLock<HashSet<Id>>,
    seq: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl StageScheduler {
    /// Create queues for `(stage, wip_limit)` pairs; `None` is unbounded.
    pub fn new(stages: impl IntoIterator<Item = (String, Option<usize>)>, clock: Arc<dyn Clock>) -> Self {
        let queues = stages
            .into_iter()
            .map(|(name, wip_limit)| {
                (
                    name,
                    Mutex::new(StageQueue {
                        wip_limit,
                        assignments: Vec::new(),
                    }),
                )
            })
            .collect();
        Self {
            queues,
            locations: RwLock::new(HashMap::new()),
            held: RwLock::new(HashSet::new()),
            seq: AtomicU64::new(0),
            clock,
        }
    }

    pub fn from_config(config: &HandoffConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config
                .stages
                .iter()
                .map(|s| (s.name.clone(), s.effective_wip_limit())),
            clock,
        )
    }

    fn queue(&self, stage: &str) -> Result<&Mutex<StageQueue>> {
        self.queues
            .get(stage)
            .ok_or_else(|| PipelineError::UnknownStage(stage.to_string()))
    }

    fn locate(&self, id: &str) -> Result<String> {
        self.locations
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::AssignmentNotFound(id.to_string()))
    }

    /// Apply `apply` to an assignment whose status is one of `from`.
    fn transition(
        &self,
        id: &str,
        from: &[AssignmentStatus],
        apply: impl FnOnce(&mut TaskAssignment, Timestamp),
    ) -> Result<TaskAssignment> {
        let stage = self.locate(id)?;
        let mut queue = self.queue(&stage)?.lock();
        let assignment = queue.find_mut(id)?;
        if !from.contains(&assignment.status) {
            return Err(PipelineError::InvalidTransition(format!(
                "assignment {} is {}",
                id, assignment.status
            )));
        }
        apply(assignment, self.clock.now());
        Ok(assignment.clone())
    }

    // ── Queueing ────────────────────────────────────────────────────────

    /// Put new work in a stage's backlog.
    pub fn enqueue(
        &self,
        workflow_id: &str,
        stage: &str,
        work_item: Option<WorkItem>,
        priority: i32,
    ) -> Result<TaskAssignment> {
        let queue = self.queue(stage)?;
        let assignment = TaskAssignment {
            id: new_id(),
            workflow_id: workflow_id.to_string(),
            stage: stage.to_string(),
            work_item,
            executor: None,
            status: AssignmentStatus::Ready,
            priority,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            attempt: 0,
            retries: 0,
            format_reattempts: 0,
            not_before: None,
            violations: Vec::new(),
            created_at: self.clock.now(),
            started_at: None,
            finished_at: None,
        };
        self.locations
            .write()
            .insert(assignment.id.clone(), stage.to_string());
        queue.lock().assignments.push(assignment.clone());

        tracing::debug!(
            workflow_id = %workflow_id,
            stage = %stage,
            assignment_id = %assignment.id,
            "Enqueued assignment"
        );
        Ok(assignment)
    }

    /// Admit the next eligible assignment if the stage has a free slot.
    ///
    /// Returns `None` when the stage is full, nothing is queued, every
    /// queued assignment is still backing off, or its workflow is on hold.
    pub fn admit_next(&self, stage: &str, executor: &str) -> Result<Option<TaskAssignment>> {
        let held = self.held.read().clone();
        let now = self.clock.now();
        let mut queue = self.queue(stage)?.lock();

        if let Some(limit) = queue.wip_limit
            && queue.occupied() >= limit
        {
            return Ok(None);
        }

        let candidate = queue
            .assignments
            .iter_mut()
            .filter(|a| a.eligible(now) && !held.contains(&a.workflow_id))
            .min_by_key(|a| admission_key(a));

        let Some(assignment) = candidate else {
            return Ok(None);
        };
        assignment.status = AssignmentStatus::InProgress;
        assignment.executor = Some(executor.to_string());
        assignment.attempt += 1;
        assignment.not_before = None;
        assignment.started_at = Some(now);
        assignment.finished_at = None;

        tracing::debug!(
            workflow_id = %assignment.workflow_id,
            stage = %stage,
            assignment_id = %assignment.id,
            attempt = assignment.attempt,
            "Admitted assignment"
        );
        Ok(Some(assignment.clone()))
    }

    // ── Transitions ─────────────────────────────────────────────────────

    /// Move an in-progress assignment into the stage's single review slot.
    pub fn begin_review(&self, id: &str) -> Result<TaskAssignment> {
        let stage = self.locate(id)?;
        let mut queue = self.queue(&stage)?.lock();
        if queue
            .assignments
            .iter()
            .any(|a| a.status == AssignmentStatus::Review)
        {
            return Err(PipelineError::InvalidTransition(format!(
                "review slot of stage {} is occupied",
                stage
            )));
        }
        let assignment = queue.find_mut(id)?;
        if assignment.status != AssignmentStatus::InProgress {
            return Err(PipelineError::InvalidTransition(format!(
                "assignment {} is {}",
                id, assignment.status
            )));
        }
        assignment.status = AssignmentStatus::Review;
        Ok(assignment.clone())
    }

    pub fn finish(&self, id: &str) -> Result<TaskAssignment> {
        self.transition(id, &[AssignmentStatus::Review], |a, now| {
            a.status = AssignmentStatus::Done;
            a.finished_at = Some(now);
        })
    }

    /// Send an assignment back for a re-attempt with violations attached.
    pub fn return_to_backlog(&self, id: &str, violations: Vec<String>) -> Result<TaskAssignment> {
        self.transition(
            id,
            &[AssignmentStatus::InProgress, AssignmentStatus::Review],
            |a, _| {
                a.status = AssignmentStatus::Backlog;
                a.format_reattempts += 1;
                a.violations = violations;
                a.executor = None;
            },
        )
    }

    /// Requeue after a transient failure; not admissible before `not_before`.
    pub fn requeue_after(&self, id: &str, not_before: Timestamp) -> Result<TaskAssignment> {
        self.transition(
            id,
            &[AssignmentStatus::InProgress, AssignmentStatus::Review],
            |a, _| {
                a.status = AssignmentStatus::Backlog;
                a.retries += 1;
                a.not_before = Some(not_before);
                a.executor = None;
            },
        )
    }

    pub fn mark_failed(&self, id: &str) -> Result<TaskAssignment> {
        self.transition(
            id,
            &[AssignmentStatus::InProgress, AssignmentStatus::Review],
            |a, now| {
                a.status = AssignmentStatus::Failed;
                a.finished_at = Some(now);
            },
        )
    }

    /// Accept a failed assignment's output after an explicit decision.
    pub fn accept_failed(&self, id: &str) -> Result<TaskAssignment> {
        self.transition(id, &[AssignmentStatus::Failed], |a, now| {
            a.status = AssignmentStatus::Done;
            a.finished_at = Some(now);
        })
    }

    /// Abandon one live assignment. Returns `false` if it was not live.
    pub fn abandon(&self, id: &str) -> Result<bool> {
        let stage = self.locate(id)?;
        let mut queue = self.queue(&stage)?.lock();
        let assignment = queue.find_mut(id)?;
        if !assignment.status.is_live() {
            return Ok(false);
        }
        assignment.status = AssignmentStatus::Abandoned;
        assignment.finished_at = Some(self.clock.now());
        Ok(true)
    }

    /// Abandon every live assignment of a workflow. Returns their ids.
    pub fn abandon_workflow(&self, workflow_id: &str) -> Vec<Id> {
        let now = self.clock.now();
        let mut abandoned = Vec::new();
        for queue in self.queues.values() {
            let mut queue = queue.lock();
            for a in queue
                .assignments
                .iter_mut()
                .filter(|a| a.workflow_id == workflow_id && a.status.is_live())
            {
                a.status = AssignmentStatus::Abandoned;
                a.finished_at = Some(now);
                abandoned.push(a.id.clone());
            }
        }
        abandoned
    }

    // ── Holds ───────────────────────────────────────────────────────────

    /// Stop admitting a workflow's assignments.
    pub fn hold(&self, workflow_id: &str) {
        self.held.write().insert(workflow_id.to_string());
    }

    pub fn release(&self, workflow_id: &str) {
        self.held.write().remove(workflow_id);
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Result<TaskAssignment> {
        let stage = self.locate(id)?;
        let mut queue = self.queue(&stage)?.lock();
        queue.find_mut(id).map(|a| a.clone())
    }

    /// Every assignment of a workflow, in enqueue order.
    pub fn for_workflow(&self, workflow_id: &str) -> Vec<TaskAssignment> {
        let mut all: Vec<TaskAssignment> = self
            .queues
            .values()
            .flat_map(|q| {
                q.lock()
                    .assignments
                    .iter()
                    .filter(|a| a.workflow_id == workflow_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        all.sort_by_key(|a| a.seq);
        all
    }

    /// Slots in use.
    pub fn occupied(&self, stage: &str) -> Result<usize> {
        Ok(self.queue(stage)?.lock().occupied())
    }

    pub fn wip_limit(&self, stage: &str) -> Result<Option<usize>> {
        Ok(self.queue(stage)?.lock().wip_limit)
    }

    pub fn snapshot(&self, stage: &str) -> Result<StageSnapshot> {
        let queue = self.queue(stage)?.lock();
        let mut backlog: Vec<TaskAssignment> = queue
            .assignments
            .iter()
            .filter(|a| a.status.is_queued())
            .cloned()
            .collect();
        backlog.sort_by_key(admission_key);
        let with = |status: AssignmentStatus| -> Vec<TaskAssignment> {
            queue
                .assignments
                .iter()
                .filter(|a| a.status == status)
                .cloned()
                .collect()
        };
        let count = |status: AssignmentStatus| queue.assignments.iter().filter(|a| a.status == status).count();
        Ok(StageSnapshot {
            stage: stage.to_string(),
            wip_limit: queue.wip_limit,
            backlog,
            in_progress: with(AssignmentStatus::InProgress),
            review: with(AssignmentStatus::Review),
            done: count(AssignmentStatus::Done),
            failed: count(AssignmentStatus::Failed),
            abandoned: count(AssignmentStatus::Abandoned),
        })
    }

    /// Earliest time a queued, unheld assignment of the stage becomes
    /// admissible. `None` if nothing is queued.
    pub fn next_eligible_at(&self, stage: &str) -> Result<Option<Timestamp>> {
        let held = self.held.read().clone();
        let now = self.clock.now();
        let queue = self.queue(stage)?.lock();
        Ok(queue
            .assignments
            .iter()
            .filter(|a| a.status.is_queued() && !held.contains(&a.workflow_id))
            .map(|a| a.not_before.map_or(now, |t| t.max(now)))
            .min())
    }

    /// Whether any unheld workflow has live work anywhere.
    pub fn has_live_work(&self) -> bool {
        let held = self.held.read().clone();
        self.queues.values().any(|q| {
            q.lock()
                .assignments
                .iter()
                .any(|a| a.status.is_live() && !held.contains(&a.workflow_id))
        })
    }

    pub fn stage_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;
    use std::time::Duration;

    fn scheduler(wip: Option<usize>) -> (StageScheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let s = StageScheduler::new(vec![("spike".to_string(), wip)], clock.clone());
        (s, clock)
    }

    #[test]
    fn test_admission_respects_wip() {
        let (s, _) = scheduler(Some(1));
        let a = s.enqueue("wf-a", "spike", None, 0).unwrap();
        let b = s.enqueue("wf-b", "spike", None, 0).unwrap();

        let first = s.admit_next("spike", "x").unwrap().unwrap();
        assert_eq!(first.id, a.id);
        assert!(s.admit_next("spike", "x").unwrap().is_none());

        s.begin_review(&a.id).unwrap();
        assert!(s.admit_next("spike", "x").unwrap().is_none());
        s.finish(&a.id).unwrap();

        let second = s.admit_next("spike", "x").unwrap().unwrap();
        assert_eq!(second.id, b.id);
    }

    #[test]
    fn test_priority_then_fifo() {
        let (s, _) = scheduler(None);
        let low = s.enqueue("wf-1", "spike", None, 0).unwrap();
        let high = s.enqueue("wf-2", "spike", None, 5).unwrap();
        let low2 = s.enqueue("wf-3", "spike", None, 0).unwrap();

        let order: Vec<_> = (0..3)
            .map(|_| s.admit_next("spike", "x").unwrap().unwrap().id)
            .collect();
        assert_eq!(order, vec![high.id, low.id, low2.id]);
    }

    #[test]
    fn test_backoff_delays_admission() {
        let (s, clock) = scheduler(Some(1));
        let a = s.enqueue("wf", "spike", None, 0).unwrap();
        s.admit_next("spike", "x").unwrap().unwrap();
        let until = clock.now() + chrono::Duration::seconds(5);
        s.requeue_after(&a.id, until).unwrap();

        assert!(s.admit_next("spike", "x").unwrap().is_none());
        assert_eq!(s.next_eligible_at("spike").unwrap(), Some(until));

        clock.advance(Duration::from_secs(5));
        let again = s.admit_next("spike", "x").unwrap().unwrap();
        assert_eq!(again.retries, 1);
        assert_eq!(again.attempt, 2);
    }

    #[test]
    fn test_return_to_backlog_attaches_violations() {
        let (s, _) = scheduler(Some(1));
        let a = s.enqueue("wf", "spike", None, 0).unwrap();
        s.admit_next("spike", "x").unwrap();
        s.begin_review(&a.id).unwrap();
        let back = s.return_to_backlog(&a.id, vec!["title: missing".into()]).unwrap();
        assert_eq!(back.status, AssignmentStatus::Backlog);
        assert_eq!(back.format_reattempts, 1);
        assert_eq!(back.retries, 0);
        assert_eq!(s.occupied("spike").unwrap(), 0);
    }

    #[test]
    fn test_single_review_slot() {
        let (s, _) = scheduler(Some(2));
        let a = s.enqueue("wf-a", "spike", None, 0).unwrap();
        let b = s.enqueue("wf-b", "spike", None, 0).unwrap();
        s.admit_next("spike", "x").unwrap();
        s.admit_next("spike", "x").unwrap();
        s.begin_review(&a.id).unwrap();
        assert!(s.begin_review(&b.id).is_err());
        s.finish(&a.id).unwrap();
        s.begin_review(&b.id).unwrap();
    }

    #[test]
    fn test_hold_blocks_admission() {
        let (s, _) = scheduler(None);
        s.enqueue("wf", "spike", None, 0).unwrap();
        s.hold("wf");
        assert!(s.admit_next("spike", "x").unwrap().is_none());
        assert!(!s.has_live_work());
        s.release("wf");
        assert!(s.admit_next("spike", "x").unwrap().is_some());
    }

    #[test]
    fn test_abandon_workflow_is_idempotent() {
        let (s, _) = scheduler(None);
        let a = s.enqueue("wf", "spike", None, 0).unwrap();
        s.enqueue("wf", "spike", None, 0).unwrap();
        s.enqueue("other", "spike", None, 0).unwrap();
        s.admit_next("spike", "x").unwrap();

        assert_eq!(s.abandon_workflow("wf").len(), 2);
        assert!(s.abandon_workflow("wf").is_empty());
        assert_eq!(s.get(&a.id).unwrap().status, AssignmentStatus::Abandoned);
        assert!(s.finish(&a.id).is_err());
    }

    #[test]
    fn test_unknown_stage() {
        let (s, _) = scheduler(None);
        assert!(matches!(
            s.admit_next("nope", "x"),
            Err(PipelineError::UnknownStage(_))
        ));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue(i32),
        Admit,
        Review(usize),
        Finish(usize),
        Fail(usize),
        Requeue(usize),
        Advance,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (-2i32..3).prop_map(Op::Enqueue),
            Just(Op::Admit),
            (0usize..8).prop_map(Op::Review),
            (0usize..8).prop_map(Op::Finish),
            (0usize..8).prop_map(Op::Fail),
            (0usize..8).prop_map(Op::Requeue),
            Just(Op::Advance),
        ]
    }

    proptest! {
        /// Property: no sequence of operations ever puts more than the WIP
        /// limit of assignments into InProgress + Review.
        #[test]
        fn wip_limit_never_exceeded(wip in 1usize..4, ops in prop::collection::vec(op(), 1..80)) {
            let (s, clock) = scheduler(Some(wip));
            let mut ids: Vec<Id> = Vec::new();
            fn pick(ids: &[Id], i: usize) -> Option<Id> {
                ids.get(i % ids.len().max(1)).cloned()
            }
            for op in ops {
                // Invalid transitions are expected and ignored.
                match op {
                    Op::Enqueue(p) => ids.push(s.enqueue("wf", "spike", None, p).unwrap().id),
                    Op::Admit => { let _ = s.admit_next("spike", "x"); }
                    Op::Review(i) => if let Some(id) = pick(&ids, i) { let _ = s.begin_review(&id); },
                    Op::Finish(i) => if let Some(id) = pick(&ids, i) { let _ = s.finish(&id); },
                    Op::Fail(i) => if let Some(id) = pick(&ids, i) { let _ = s.mark_failed(&id); },
                    Op::Requeue(i) => if let Some(id) = pick(&ids, i) {
                        let _ = s.requeue_after(&id, clock.now() + chrono::Duration::seconds(1));
                    },
                    Op::Advance => clock.advance(Duration::from_secs(1)),
                }
                let snap = s.snapshot("spike").unwrap();
                prop_assert!(snap.in_progress.len() + snap.review.len() <= wip);
                prop_assert!(snap.review.len() <= 1);
            }
        }
    }
}
