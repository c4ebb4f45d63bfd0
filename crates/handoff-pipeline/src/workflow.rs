//! Workflow state machine.
//!
//! ```text
//! Created → Kanban(0) → … → Kanban(n) → TransitionGate → Scrum{sprint, stage} … → Complete
//!                  Paused{resume_to} and Halted{at} reachable from any state
//!                  Cancelled terminal
//! ```
//!
//! A [`WorkflowState`] is a plain value: the engine owns the only mutable
//! copy and checkpoints snapshot it whole. Every mutation that changes the
//! phase goes through one place so the phase history stays complete.

use std::collections::HashSet;
use std::fmt;

use handoff_config::GateSection;
use handoff_types::{Artifact, ArtifactId, Id, Timestamp, WorkItem};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Phases
// ─────────────────────────────────────────────────────────────────────────────

/// Where a workflow is in its stage list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Created,
    /// Working on the Kanban stage at this index.
    Kanban { stage: usize },
    TransitionGate,
    /// Working on Scrum stage `stage` within sprint `sprint` (both 0-based).
    Scrum { sprint: usize, stage: usize },
    Complete,
    /// Waiting for a coordinator decision.
    Paused { resume_to: Box<Phase> },
    /// Stopped by a critical fault or a halt decision.
    Halted { at: Box<Phase> },
    Cancelled,
}

impl Phase {
    /// Ordering key over the stage list. Paused and halted phases rank as
    /// the phase they wrap.
    pub fn rank(&self) -> (u8, usize, usize) {
        match self {
            Phase::Created => (0, 0, 0),
            Phase::Kanban { stage } => (1, *stage, 0),
            Phase::TransitionGate => (2, 0, 0),
            Phase::Scrum { sprint, stage } => (3, *sprint, *stage),
            Phase::Complete => (4, 0, 0),
            Phase::Paused { resume_to } => resume_to.rank(),
            Phase::Halted { at } => at.rank(),
            Phase::Cancelled => (5, 0, 0),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Halted { .. } | Phase::Cancelled)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, Phase::Paused { .. })
    }

    /// The phase work continues in once any pause is lifted.
    pub fn resting(&self) -> &Phase {
        match self {
            Phase::Paused { resume_to } => resume_to.resting(),
            other => other,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Created => write!(f, "created"),
            Phase::Kanban { stage } => write!(f, "kanban({})", stage),
            Phase::TransitionGate => write!(f, "transition-gate"),
            Phase::Scrum { sprint, stage } => write!(f, "scrum(sprint {}, stage {})", sprint + 1, stage),
            Phase::Complete => write!(f, "complete"),
            Phase::Paused { resume_to } => write!(f, "paused({})", resume_to),
            Phase::Halted { at } => write!(f, "halted({})", at),
            Phase::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One entry in a workflow's phase history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseEntry {
    pub phase: Phase,
    pub at: Timestamp,
    /// Set when the entry was produced by restoring a checkpoint.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rollback: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Completed work and sprints
// ─────────────────────────────────────────────────────────────────────────────

/// A task assignment that reached `Done`. These are the only assignments
/// a checkpoint carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedAssignment {
    pub assignment_id: Id,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item: Option<String>,
    pub artifact_id: ArtifactId,
    pub executor: String,
    pub retries: u32,
    pub started_at: Option<Timestamp>,
    pub finished_at: Timestamp,
}

/// One committed batch of work items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sprint {
    /// 1-based sprint number.
    pub number: usize,
    /// Item ids committed to this sprint, in order.
    pub items: Vec<String>,
    pub committed_points: u32,
    /// Items done at the sprint's current Scrum stage.
    #[serde(default)]
    pub stage_done: Vec<String>,
    /// Items that passed every Scrum stage in this sprint.
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub deferred: Vec<String>,
    /// Points deferred out of this sprint.
    #[serde(default)]
    pub reduced_scope: u32,
}

impl Sprint {
    fn new(number: usize) -> Self {
        Self {
            number,
            items: Vec::new(),
            committed_points: 0,
            stage_done: Vec::new(),
            completed: Vec::new(),
            deferred: Vec::new(),
            reduced_scope: 0,
        }
    }

    /// Items still owed at the current Scrum stage.
    pub fn pending(&self) -> impl Iterator<Item = &String> {
        self.items
            .iter()
            .filter(|id| !self.deferred.contains(*id) && !self.stage_done.contains(*id))
    }
}

/// Work items and their packing into sprints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SprintPlan {
    pub capacity_points: u32,
    pub items: Vec<WorkItem>,
    pub sprints: Vec<Sprint>,
}

impl SprintPlan {
    /// Pack items in order into sprints of at most `capacity_points`. An
    /// item larger than the capacity gets a sprint of its own.
    pub fn pack(items: Vec<WorkItem>, capacity_points: u32) -> Self {
        let mut sprints: Vec<Sprint> = Vec::new();
        for item in &items {
            let fits = sprints.last().is_some_and(|s| {
                s.committed_points.saturating_add(item.estimate) <= capacity_points
            });
            if !fits {
                sprints.push(Sprint::new(sprints.len() + 1));
            }
            if let Some(sprint) = sprints.last_mut() {
                sprint.items.push(item.id.clone());
                sprint.committed_points = sprint.committed_points.saturating_add(item.estimate);
            }
        }
        Self {
            capacity_points,
            items,
            sprints,
        }
    }

    pub fn item(&self, id: &str) -> Option<&WorkItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn committed_points(&self) -> u32 {
        self.items.iter().map(|i| i.estimate).sum()
    }

    /// Total points deferred across all sprints.
    pub fn reduced_scope(&self) -> u32 {
        self.sprints.iter().map(|s| s.reduced_scope).sum()
    }
}

/// Build work items from the Kanban artifacts that reached the gate.
///
/// Each element of an artifact's items array becomes one item. If no
/// artifact carries such an array, the most recent artifact becomes a
/// single item. Estimates and criteria are read, never invented; missing
/// estimates fall back to `default_estimate`.
pub fn build_work_items(artifacts: &[Artifact], gate: &GateSection, default_estimate: u32) -> Vec<WorkItem> {
    let mut items = Vec::new();
    let mut ids = HashSet::new();

    for artifact in artifacts {
        let Some(Value::Array(entries)) = artifact.field(&gate.items_field) else {
            continue;
        };
        for entry in entries {
            let item = item_from(entry, artifact, gate, default_estimate, items.len() + 1, &mut ids);
            items.push(item);
        }
    }

    if items.is_empty()
        && let Some(artifact) = artifacts.last()
    {
        let item = item_from(&artifact.payload, artifact, gate, default_estimate, 1, &mut ids);
        items.push(item);
    }

    items
}

fn item_from(
    entry: &Value,
    source: &Artifact,
    gate: &GateSection,
    default_estimate: u32,
    position: usize,
    ids: &mut HashSet<String>,
) -> WorkItem {
    let base = entry
        .get(&gate.id_field)
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| format!("item-{}", position));
    let mut id = base.clone();
    let mut n = 2;
    while !ids.insert(id.clone()) {
        id = format!("{}-{}", base, n);
        n += 1;
    }

    let title = entry
        .get(&gate.title_field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{} from {}", source.artifact_type, source.stage));

    let estimate = entry
        .get(&gate.estimate_field)
        .and_then(Value::as_u64)
        .and_then(|e| u32::try_from(e).ok())
        .unwrap_or(default_estimate);

    let acceptance_criteria = match entry.get(&gate.criteria_field) {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };

    WorkItem {
        id,
        title,
        estimate,
        acceptance_criteria,
        source_artifact: source.id.clone(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Workflow state
// ─────────────────────────────────────────────────────────────────────────────

/// One piece of work the current phase still needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWork {
    pub stage: String,
    pub work_item: Option<WorkItem>,
}

/// Full state of one workflow. Checkpoints snapshot this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: Id,
    pub kanban_stages: Vec<String>,
    pub scrum_stages: Vec<String>,
    /// Higher is admitted first.
    pub priority: i32,
    pub phase: Phase,
    pub history: Vec<PhaseEntry>,
    pub created_at: Timestamp,
    pub completed: Vec<CompletedAssignment>,
    /// Validated handoff artifacts, in completion order.
    pub artifacts: Vec<ArtifactId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprint_plan: Option<SprintPlan>,
    /// Cumulative PARTIAL consistency warnings.
    #[serde(default)]
    pub partial_warnings: u32,
}

impl WorkflowState {
    pub fn new(
        workflow_id: impl Into<Id>,
        kanban_stages: Vec<String>,
        scrum_stages: Vec<String>,
        priority: i32,
        at: Timestamp,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            kanban_stages,
            scrum_stages,
            priority,
            phase: Phase::Created,
            history: vec![PhaseEntry {
                phase: Phase::Created,
                at,
                rollback: false,
            }],
            created_at: at,
            completed: Vec::new(),
            artifacts: Vec::new(),
            sprint_plan: None,
            partial_warnings: 0,
        }
    }

    /// Ordered stage names.
    pub fn stages(&self) -> Vec<String> {
        self.kanban_stages
            .iter()
            .chain(self.scrum_stages.iter())
            .cloned()
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn is_paused(&self) -> bool {
        self.phase.is_paused()
    }

    /// The phase work is (or will be, after a pause) happening in.
    pub fn active_phase(&self) -> &Phase {
        self.phase.resting()
    }

    /// Stage that receives `stage`'s artifact next. The last Kanban stage
    /// hands off to the first Scrum stage through the gate.
    pub fn next_stage(&self, stage: &str) -> Option<&str> {
        if let Some(i) = self.kanban_stages.iter().position(|s| s == stage) {
            return self
                .kanban_stages
                .get(i + 1)
                .or_else(|| self.scrum_stages.first())
                .map(String::as_str);
        }
        let j = self.scrum_stages.iter().position(|s| s == stage)?;
        self.scrum_stages.get(j + 1).map(String::as_str)
    }

    fn push_history(&mut self, at: Timestamp, rollback: bool) {
        self.history.push(PhaseEntry {
            phase: self.phase.clone(),
            at,
            rollback,
        });
    }

    /// Move the active phase forward. While paused, the phase to resume to
    /// moves instead.
    pub fn advance_to(&mut self, next: Phase, at: Timestamp) -> Result<()> {
        if self.is_terminal() {
            return Err(PipelineError::InvalidTransition(format!(
                "workflow {} is {}",
                self.workflow_id, self.phase
            )));
        }
        if next.rank() < self.active_phase().rank() {
            return Err(PipelineError::InvalidTransition(format!(
                "{} would move workflow {} backwards from {}",
                next,
                self.workflow_id,
                self.active_phase()
            )));
        }
        self.phase = match &self.phase {
            Phase::Paused { .. } => Phase::Paused {
                resume_to: Box::new(next),
            },
            _ => next,
        };
        self.push_history(at, false);
        Ok(())
    }

    /// Enter the first phase after creation.
    pub fn begin(&mut self, at: Timestamp) -> Result<()> {
        if *self.active_phase() != Phase::Created {
            return Ok(());
        }
        let first = if self.kanban_stages.is_empty() {
            Phase::Complete
        } else {
            Phase::Kanban { stage: 0 }
        };
        self.advance_to(first, at)
    }

    pub fn pause(&mut self, at: Timestamp) {
        if self.is_terminal() || self.is_paused() {
            return;
        }
        self.phase = Phase::Paused {
            resume_to: Box::new(self.phase.clone()),
        };
        self.push_history(at, false);
    }

    pub fn unpause(&mut self, at: Timestamp) {
        if let Phase::Paused { resume_to } = &self.phase {
            self.phase = resume_to.resting().clone();
            self.push_history(at, false);
        }
    }

    pub fn halt(&mut self, at: Timestamp) {
        if matches!(self.phase, Phase::Halted { .. } | Phase::Cancelled) {
            return;
        }
        self.phase = Phase::Halted {
            at: Box::new(self.active_phase().clone()),
        };
        self.push_history(at, false);
    }

    /// Returns `false` if the workflow was already cancelled.
    pub fn cancel(&mut self, at: Timestamp) -> Result<bool> {
        match self.phase {
            Phase::Cancelled => Ok(false),
            Phase::Complete | Phase::Halted { .. } => Err(PipelineError::InvalidTransition(format!(
                "workflow {} is {} and cannot be cancelled",
                self.workflow_id, self.phase
            ))),
            _ => {
                self.phase = Phase::Cancelled;
                self.push_history(at, false);
                Ok(true)
            }
        }
    }

    /// Record that this state was loaded from a checkpoint.
    pub fn mark_restored(&mut self, at: Timestamp) {
        self.push_history(at, true);
    }

    /// Record a Done assignment and its artifact.
    pub fn record_completion(&mut self, completed: CompletedAssignment) {
        if !self.artifacts.contains(&completed.artifact_id) {
            self.artifacts.push(completed.artifact_id.clone());
        }
        self.completed.push(completed);
    }

    /// Advance past a Done Kanban stage. Returns the new active phase.
    pub fn kanban_done(&mut self, stage: usize, at: Timestamp) -> Result<Phase> {
        if *self.active_phase() != (Phase::Kanban { stage }) {
            return Err(PipelineError::InvalidTransition(format!(
                "workflow {} is at {}, not kanban({})",
                self.workflow_id,
                self.active_phase(),
                stage
            )));
        }
        let next = if stage + 1 < self.kanban_stages.len() {
            Phase::Kanban { stage: stage + 1 }
        } else if self.scrum_stages.is_empty() {
            Phase::Complete
        } else {
            Phase::TransitionGate
        };
        self.advance_to(next, at)?;
        Ok(self.active_phase().clone())
    }

    /// Commit the sprint plan built at the transition gate.
    pub fn install_plan(&mut self, plan: SprintPlan, at: Timestamp) -> Result<Phase> {
        if *self.active_phase() != Phase::TransitionGate {
            return Err(PipelineError::InvalidTransition(format!(
                "workflow {} is not at the transition gate",
                self.workflow_id
            )));
        }
        let next = if plan.sprints.is_empty() {
            Phase::Complete
        } else {
            Phase::Scrum { sprint: 0, stage: 0 }
        };
        self.sprint_plan = Some(plan);
        self.advance_to(next, at)?;
        self.settle(at)?;
        Ok(self.active_phase().clone())
    }

    /// Mark an item done at the current Scrum stage. Returns the new
    /// active phase.
    pub fn scrum_item_done(&mut self, item: &str, at: Timestamp) -> Result<Phase> {
        let Phase::Scrum { sprint, .. } = *self.active_phase() else {
            return Err(PipelineError::InvalidTransition(format!(
                "workflow {} is not in a sprint",
                self.workflow_id
            )));
        };
        let current = self.sprint_mut(sprint)?;
        if !current.pending().any(|id| id == item) {
            return Err(PipelineError::InvalidTransition(format!(
                "item {} is not pending in sprint {}",
                item, current.number
            )));
        }
        current.stage_done.push(item.to_string());
        self.settle(at)?;
        Ok(self.active_phase().clone())
    }

    /// Carry an unfinished item into the next sprint. Returns the deferred
    /// points.
    pub fn defer(&mut self, item: &str, at: Timestamp) -> Result<u32> {
        let Phase::Scrum { sprint, .. } = *self.active_phase() else {
            return Err(PipelineError::InvalidTransition(format!(
                "workflow {} is not in a sprint",
                self.workflow_id
            )));
        };
        let estimate = self
            .sprint_plan
            .as_ref()
            .and_then(|p| p.item(item))
            .map(|i| i.estimate)
            .ok_or_else(|| PipelineError::InvalidTransition(format!("unknown work item {}", item)))?;

        let current = self.sprint_mut(sprint)?;
        if !current.items.iter().any(|id| id == item)
            || current.deferred.iter().any(|id| id == item)
            || current.completed.iter().any(|id| id == item)
        {
            return Err(PipelineError::InvalidTransition(format!(
                "item {} is not open in sprint {}",
                item, current.number
            )));
        }
        current.deferred.push(item.to_string());
        current.stage_done.retain(|id| id != item);
        current.reduced_scope = current.reduced_scope.saturating_add(estimate);

        let plan = self
            .sprint_plan
            .as_mut()
            .ok_or_else(|| PipelineError::InvalidTransition("no sprint plan".into()))?;
        if plan.sprints.len() == sprint + 1 {
            plan.sprints.push(Sprint::new(sprint + 2));
        }
        let next = &mut plan.sprints[sprint + 1];
        next.items.push(item.to_string());
        next.committed_points = next.committed_points.saturating_add(estimate);

        self.settle(at)?;
        Ok(estimate)
    }

    fn sprint_mut(&mut self, sprint: usize) -> Result<&mut Sprint> {
        self.sprint_plan
            .as_mut()
            .and_then(|p| p.sprints.get_mut(sprint))
            .ok_or_else(|| PipelineError::InvalidTransition(format!("sprint {} does not exist", sprint + 1)))
    }

    /// Advance through Scrum stages and sprints that have nothing pending.
    fn settle(&mut self, at: Timestamp) -> Result<()> {
        loop {
            let (sprint, stage) = match self.active_phase() {
                Phase::Scrum { sprint, stage } => (*sprint, *stage),
                _ => return Ok(()),
            };
            let scrum_len = self.scrum_stages.len();
            let current = self.sprint_mut(sprint)?;
            if current.pending().next().is_some() {
                return Ok(());
            }
            let next = if stage + 1 < scrum_len {
                current.stage_done.clear();
                Phase::Scrum {
                    sprint,
                    stage: stage + 1,
                }
            } else {
                current.completed = current
                    .items
                    .iter()
                    .filter(|id| !current.deferred.contains(*id))
                    .cloned()
                    .collect();
                current.stage_done.clear();
                let sprints = self.sprint_plan.as_ref().map_or(0, |p| p.sprints.len());
                if sprint + 1 < sprints {
                    Phase::Scrum {
                        sprint: sprint + 1,
                        stage: 0,
                    }
                } else {
                    Phase::Complete
                }
            };
            self.advance_to(next, at)?;
        }
    }

    /// Work the active phase still needs, in admission order.
    pub fn pending_work(&self) -> Vec<PendingWork> {
        match *self.active_phase() {
            Phase::Kanban { stage } => self
                .kanban_stages
                .get(stage)
                .map(|name| PendingWork {
                    stage: name.clone(),
                    work_item: None,
                })
                .into_iter()
                .collect(),
            Phase::Scrum { sprint, stage } => {
                let (Some(plan), Some(name)) = (&self.sprint_plan, self.scrum_stages.get(stage)) else {
                    return Vec::new();
                };
                let Some(current) = plan.sprints.get(sprint) else {
                    return Vec::new();
                };
                current
                    .pending()
                    .filter_map(|id| plan.item(id))
                    .map(|item| PendingWork {
                        stage: name.clone(),
                        work_item: Some(item.clone()),
                    })
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// Artifacts produced by Kanban stages, in completion order.
    pub fn kanban_artifacts(&self) -> Vec<ArtifactId> {
        self.completed
            .iter()
            .filter(|c| c.work_item.is_none())
            .map(|c| c.artifact_id.clone())
            .collect()
    }

    /// Artifacts an executor receives for a stage.
    ///
    /// Kanban stages get every earlier Kanban artifact. A Scrum stage gets
    /// the item's artifact from the previous Scrum stage, or the item's
    /// source artifact at the first Scrum stage.
    pub fn input_artifacts(&self, stage: &str, item: Option<&WorkItem>) -> Vec<ArtifactId> {
        let Some(item) = item else {
            return self.kanban_artifacts();
        };
        let position = self.scrum_stages.iter().position(|s| s == stage);
        match position {
            Some(j) if j > 0 => {
                let previous = &self.scrum_stages[j - 1];
                self.completed
                    .iter()
                    .rev()
                    .find(|c| c.work_item.as_deref() == Some(item.id.as_str()) && &c.stage == previous)
                    .map(|c| vec![c.artifact_id.clone()])
                    .unwrap_or_default()
            }
            _ => vec![item.source_artifact.clone()],
        }
    }

    /// Artifacts consistency rules may compare against: all Kanban
    /// artifacts plus the item's own Scrum artifacts.
    pub fn prior_artifacts(&self, item: Option<&str>) -> Vec<ArtifactId> {
        self.completed
            .iter()
            .filter(|c| c.work_item.is_none() || c.work_item.as_deref() == item)
            .map(|c| c.artifact_id.clone())
            .collect()
    }

    /// Phase sequence with paused entries dropped, for monotonicity checks.
    pub fn unpaused_history(&self) -> Vec<&PhaseEntry> {
        self.history.iter().filter(|e| !e.phase.is_paused()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::seal;
    use handoff_types::{ArtifactDraft, now};
    use serde_json::json;

    fn item(id: &str, estimate: u32) -> WorkItem {
        WorkItem {
            id: id.into(),
            title: id.into(),
            estimate,
            acceptance_criteria: vec![],
            source_artifact: "src".into(),
        }
    }

    fn state(kanban: &[&str], scrum: &[&str]) -> WorkflowState {
        WorkflowState::new(
            "wf",
            kanban.iter().map(|s| s.to_string()).collect(),
            scrum.iter().map(|s| s.to_string()).collect(),
            0,
            now(),
        )
    }

    #[test]
    fn test_pack_respects_capacity() {
        let plan = SprintPlan::pack(vec![item("a", 5), item("b", 5), item("c", 3), item("d", 30)], 10);
        let sprints: Vec<Vec<String>> = plan.sprints.iter().map(|s| s.items.clone()).collect();
        assert_eq!(sprints, vec![vec!["a", "b"], vec!["c"], vec!["d"]]);
        assert_eq!(plan.sprints[0].committed_points, 10);
        assert_eq!(plan.committed_points(), 43);
    }

    #[test]
    fn test_kanban_only_completes() {
        let mut s = state(&["a", "b"], &[]);
        s.begin(now()).unwrap();
        assert_eq!(s.phase, Phase::Kanban { stage: 0 });
        assert_eq!(s.kanban_done(0, now()).unwrap(), Phase::Kanban { stage: 1 });
        assert_eq!(s.kanban_done(1, now()).unwrap(), Phase::Complete);
        assert!(s.is_terminal());
    }

    #[test]
    fn test_kanban_done_rejects_wrong_stage() {
        let mut s = state(&["a", "b"], &[]);
        s.begin(now()).unwrap();
        assert!(s.kanban_done(1, now()).is_err());
    }

    #[test]
    fn test_sprint_progression() {
        let mut s = state(&["plan"], &["build", "review"]);
        s.begin(now()).unwrap();
        assert_eq!(s.kanban_done(0, now()).unwrap(), Phase::TransitionGate);

        let plan = SprintPlan::pack(vec![item("a", 2), item("b", 2), item("c", 2)], 4);
        assert_eq!(s.install_plan(plan, now()).unwrap(), Phase::Scrum { sprint: 0, stage: 0 });
        let work: Vec<_> = s.pending_work().iter().map(|w| w.work_item.clone().unwrap().id).collect();
        assert_eq!(work, vec!["a", "b"]);

        s.scrum_item_done("a", now()).unwrap();
        assert_eq!(s.scrum_item_done("b", now()).unwrap(), Phase::Scrum { sprint: 0, stage: 1 });
        s.scrum_item_done("b", now()).unwrap();
        assert_eq!(s.scrum_item_done("a", now()).unwrap(), Phase::Scrum { sprint: 1, stage: 0 });
        assert_eq!(s.sprint_plan.as_ref().unwrap().sprints[0].completed, vec!["a", "b"]);

        s.scrum_item_done("c", now()).unwrap();
        assert_eq!(s.scrum_item_done("c", now()).unwrap(), Phase::Complete);
    }

    #[test]
    fn test_defer_moves_item_and_records_scope() {
        let mut s = state(&["plan"], &["build"]);
        s.begin(now()).unwrap();
        s.kanban_done(0, now()).unwrap();
        s.install_plan(SprintPlan::pack(vec![item("a", 3), item("b", 5)], 10), now())
            .unwrap();

        s.scrum_item_done("a", now()).unwrap();
        assert_eq!(s.defer("b", now()).unwrap(), 5);
        // sprint 1 settles: a done, b deferred
        assert_eq!(*s.active_phase(), Phase::Scrum { sprint: 1, stage: 0 });
        let plan = s.sprint_plan.as_ref().unwrap();
        assert_eq!(plan.sprints[0].completed, vec!["a"]);
        assert_eq!(plan.sprints[0].reduced_scope, 5);
        assert_eq!(plan.sprints[1].items, vec!["b"]);
        assert_eq!(plan.reduced_scope(), 5);

        assert_eq!(s.scrum_item_done("b", now()).unwrap(), Phase::Complete);
    }

    #[test]
    fn test_pause_and_advance_while_paused() {
        let mut s = state(&["a", "b"], &[]);
        s.begin(now()).unwrap();
        s.pause(now());
        assert!(s.is_paused());
        s.kanban_done(0, now()).unwrap();
        assert_eq!(
            s.phase,
            Phase::Paused {
                resume_to: Box::new(Phase::Kanban { stage: 1 })
            }
        );
        s.unpause(now());
        assert_eq!(s.phase, Phase::Kanban { stage: 1 });
    }

    #[test]
    fn test_history_monotonic_ignoring_pauses() {
        let mut s = state(&["a", "b"], &[]);
        s.begin(now()).unwrap();
        s.pause(now());
        s.unpause(now());
        s.kanban_done(0, now()).unwrap();
        s.kanban_done(1, now()).unwrap();
        let ranks: Vec<_> = s.unpaused_history().iter().map(|e| e.phase.rank()).collect();
        assert!(ranks.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_cancel_idempotent() {
        let mut s = state(&["a"], &[]);
        s.begin(now()).unwrap();
        assert!(s.cancel(now()).unwrap());
        assert!(!s.cancel(now()).unwrap());
    }

    #[test]
    fn test_cannot_advance_terminal() {
        let mut s = state(&["a"], &[]);
        s.begin(now()).unwrap();
        s.halt(now());
        assert!(s.advance_to(Phase::Complete, now()).is_err());
        assert!(s.cancel(now()).is_err());
    }

    #[test]
    fn test_build_work_items_from_array() {
        let gate = GateSection::default();
        let artifact = seal(
            ArtifactDraft::new(
                "plan",
                json!({"work_items": [
                    {"id": "login", "title": "Login form", "estimate": 3, "acceptance_criteria": ["renders", "submits"]},
                    {"title": "Logout"},
                    {"id": "login", "estimate": 2}
                ]}),
            ),
            "wf",
            "plan",
            None,
            1,
            now(),
        )
        .unwrap();
        let items = build_work_items(std::slice::from_ref(&artifact), &gate, 1);
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["login", "item-2", "login-2"]);
        assert_eq!(items[0].estimate, 3);
        assert_eq!(items[0].acceptance_criteria, vec!["renders", "submits"]);
        assert_eq!(items[1].estimate, 1);
        assert_eq!(items[1].source_artifact, artifact.id);
    }

    #[test]
    fn test_build_work_items_falls_back_to_artifact() {
        let gate = GateSection::default();
        let artifact = seal(
            ArtifactDraft::new("spec", json!({"title": "Whole thing", "estimate": 8})),
            "wf",
            "design",
            None,
            1,
            now(),
        )
        .unwrap();
        let items = build_work_items(&[artifact], &gate, 1);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Whole thing");
        assert_eq!(items[0].estimate, 8);
    }

    #[test]
    fn test_next_stage_follows_handoffs() {
        let s = state(&["spike", "plan"], &["build", "review"]);
        assert_eq!(s.next_stage("spike"), Some("plan"));
        assert_eq!(s.next_stage("plan"), Some("build"));
        assert_eq!(s.next_stage("build"), Some("review"));
        assert_eq!(s.next_stage("review"), None);
        assert_eq!(s.next_stage("deploy"), None);
        assert_eq!(state(&["spike"], &[]).next_stage("spike"), None);
    }

    #[test]
    fn test_input_artifacts_for_scrum_chain() {
        let mut s = state(&["plan"], &["build", "review"]);
        let done = |stage: &str, item: Option<&str>, artifact: &str| CompletedAssignment {
            assignment_id: format!("as-{}", artifact),
            stage: stage.into(),
            work_item: item.map(str::to_string),
            artifact_id: artifact.into(),
            executor: "t".into(),
            retries: 0,
            started_at: None,
            finished_at: now(),
        };
        s.record_completion(done("plan", None, "p1"));
        s.record_completion(done("build", Some("a"), "b1"));
        let a = WorkItem {
            source_artifact: "p1".into(),
            ..item("a", 1)
        };
        assert_eq!(s.input_artifacts("plan", None), vec!["p1"]);
        assert_eq!(s.input_artifacts("build", Some(&a)), vec!["p1"]);
        assert_eq!(s.input_artifacts("review", Some(&a)), vec!["b1"]);
        assert_eq!(s.prior_artifacts(Some("a")), vec!["p1", "b1"]);
        assert_eq!(s.prior_artifacts(Some("z")), vec!["p1"]);
    }

    #[test]
    fn test_phase_serde_shape() {
        let phase = Phase::Paused {
            resume_to: Box::new(Phase::Scrum { sprint: 1, stage: 0 }),
        };
        let json = serde_json::to_value(&phase).unwrap();
        assert_eq!(json["phase"], "paused");
        assert_eq!(json["resume_to"]["phase"], "scrum");
        let back: Phase = serde_json::from_value(json).unwrap();
        assert_eq!(back, phase);
    }
}
