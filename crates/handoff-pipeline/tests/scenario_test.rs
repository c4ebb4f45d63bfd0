//! End-to-end scenarios through the engine's public API.
//!
//! A: structural failure returns the assignment to its backlog.
//! B: a WIP limit of 1 serializes two workflows on the same stage.
//! C: three transient failures back off, the fourth escalates.
//! D: a blocking consistency failure pauses the workflow for one decision.

use std::sync::Arc;
use std::time::Duration;

use handoff_config::HandoffConfig;
use handoff_pipeline::{
    AssignmentStatus, AuditEntry, Engine, ManualClock, Outcome, Phase, RecoveryAction, Verdict,
};
use handoff_types::{
    ArtifactDraft, Decision, DecisionOption, EventKind, FailureClass, StageFailure,
};
use serde_json::json;

const CONFIG: &str = r#"
[[stages]]
name = "spike"
output_schema = "spike_report"

[[stages]]
name = "spec"
output_schema = "requirements"

[schemas.spike_report]
artifact_type = "spike_report"
[[schemas.spike_report.fields]]
name = "summary"
type = "string"
[[schemas.spike_report.fields]]
name = "keywords"
type = "array"

[schemas.requirements]
artifact_type = "requirements"
[[schemas.requirements.fields]]
name = "requirements"
type = "array"

[[rules]]
id = "spec-covers-spike"
stage = "spec"
upstream = "spike"
severity = "blocking"
[rules.check]
kind = "keyword_coverage"
upstream_field = "keywords"
downstream_fields = ["requirements"]
case_insensitive = true
"#;

fn setup() -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let config = HandoffConfig::from_toml(CONFIG).unwrap();
    let engine = Engine::builder(config).clock(clock.clone()).build().unwrap();
    (engine, clock)
}

fn spike_report() -> ArtifactDraft {
    ArtifactDraft::new(
        "spike_report",
        json!({"summary": "use a read-through cache", "keywords": ["cache", "ttl"]}),
    )
}

fn complete_spike(engine: &Engine) {
    let admission = engine.admit_next("spike", "spiker").unwrap().unwrap();
    let outcome = engine.complete(&admission.assignment.id, spike_report()).unwrap();
    assert!(matches!(outcome, Outcome::Accepted { .. }));
}

#[test]
fn scenario_a_missing_field_returns_to_backlog() {
    let (engine, _) = setup();
    let wf = engine.submit(None, 0).unwrap();

    let admission = engine.admit_next("spike", "spiker").unwrap().unwrap();
    let draft = ArtifactDraft::new("spike_report", json!({"keywords": ["cache"]}));
    let outcome = engine.complete(&admission.assignment.id, draft).unwrap();

    let Outcome::ReturnedToBacklog { violations } = outcome else {
        panic!("expected backlog, got {:?}", outcome);
    };
    assert_eq!(violations.len(), 1);
    assert!(violations[0].contains("summary"));

    let assignment = engine.assignment(&admission.assignment.id).unwrap();
    assert_eq!(assignment.status, AssignmentStatus::Backlog);

    let validations: Vec<_> = engine
        .audit()
        .for_workflow(&wf)
        .into_iter()
        .filter_map(|e| match e {
            AuditEntry::Validation { result, .. } => Some(result),
            _ => None,
        })
        .collect();
    assert_eq!(validations.len(), 1);
    assert_eq!(validations[0].verdict, Verdict::Fail);
    assert_eq!(validations[0].violations.len(), 1);
    assert_eq!(validations[0].violations[0].field, "summary");

    // the re-attempt carries the violations and succeeds
    let again = engine.admit_next("spike", "spiker").unwrap().unwrap();
    assert_eq!(again.assignment.id, admission.assignment.id);
    assert_eq!(again.input.attempt, 2);
    assert_eq!(again.input.violations, violations);
    let outcome = engine.complete(&again.assignment.id, spike_report()).unwrap();
    assert!(matches!(outcome, Outcome::Accepted { phase: Phase::Kanban { stage: 1 }, .. }));
}

#[test]
fn scenario_a_second_format_error_escalates() {
    let (engine, _) = setup();
    let wf = engine.submit(None, 0).unwrap();
    let bad = || ArtifactDraft::new("spike_report", json!({"keywords": []}));

    let first = engine.admit_next("spike", "spiker").unwrap().unwrap();
    engine.complete(&first.assignment.id, bad()).unwrap();
    let second = engine.admit_next("spike", "spiker").unwrap().unwrap();
    let outcome = engine.complete(&second.assignment.id, bad()).unwrap();

    let Outcome::AwaitingDecision { request } = outcome else {
        panic!("expected escalation, got {:?}", outcome);
    };
    assert_eq!(request.failure_class, FailureClass::FormatError);
    assert!(engine.phase(&wf).unwrap().is_paused());
}

#[test]
fn scenario_b_wip_limit_serializes_workflows() {
    let (engine, _) = setup();
    let first_wf = engine.submit(None, 0).unwrap();
    let second_wf = engine.submit(None, 0).unwrap();

    let first = engine.admit_next("spike", "a").unwrap().unwrap();
    assert_eq!(first.assignment.workflow_id, first_wf);
    assert!(engine.admit_next("spike", "b").unwrap().is_none());

    let snapshot = engine.snapshot("spike").unwrap();
    assert_eq!(snapshot.in_progress.len(), 1);
    assert_eq!(snapshot.backlog.len(), 1);

    engine.complete(&first.assignment.id, spike_report()).unwrap();
    assert_eq!(
        engine.assignment(&first.assignment.id).unwrap().status,
        AssignmentStatus::Done
    );

    let second = engine.admit_next("spike", "b").unwrap().unwrap();
    assert_eq!(second.assignment.workflow_id, second_wf);
    assert_eq!(engine.snapshot("spike").unwrap().in_progress.len(), 1);
}

#[test]
fn scenario_b_higher_priority_admitted_first() {
    let (engine, _) = setup();
    engine.submit(None, 0).unwrap();
    let urgent = engine.submit(None, 10).unwrap();

    let admitted = engine.admit_next("spike", "a").unwrap().unwrap();
    assert_eq!(admitted.assignment.workflow_id, urgent);
}

#[test]
fn scenario_c_transient_failures_back_off_then_escalate() {
    let (engine, clock) = setup();
    let wf = engine.submit(None, 0).unwrap();
    let delays = [1_000u64, 5_000, 15_000];

    let mut admission = engine.admit_next("spike", "spiker").unwrap().unwrap();
    for (i, delay) in delays.iter().enumerate() {
        let outcome = engine
            .fail(&admission.assignment.id, StageFailure::transient("rate limited"))
            .unwrap();
        assert!(matches!(outcome, Outcome::Retrying { retry, .. } if retry as usize == i + 1));

        clock.advance(Duration::from_millis(delay - 1));
        assert!(engine.admit_next("spike", "spiker").unwrap().is_none());
        clock.advance(Duration::from_millis(1));
        admission = engine.admit_next("spike", "spiker").unwrap().unwrap();
        assert_eq!(admission.input.attempt as usize, i + 2);
    }

    let outcome = engine
        .fail(&admission.assignment.id, StageFailure::transient("rate limited"))
        .unwrap();
    let Outcome::AwaitingDecision { request } = outcome else {
        panic!("expected escalation, got {:?}", outcome);
    };
    assert_eq!(request.failure_class, FailureClass::AgentError);
    assert_eq!(admission.input.attempt, 4);

    let failures = engine.failures(&wf);
    assert_eq!(failures.len(), 4);
    assert!(matches!(
        failures[3].action,
        RecoveryAction::Escalate { class: FailureClass::AgentError }
    ));
    assert_eq!(
        engine.assignment(&admission.assignment.id).unwrap().status,
        AssignmentStatus::Failed
    );

    let kinds: Vec<EventKind> = engine.recent_events().iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Delayed,
            EventKind::Delayed,
            EventKind::Delayed,
            EventKind::Failed
        ]
    );
}

#[test]
fn scenario_d_blocking_rule_pauses_for_one_decision() {
    let (engine, _) = setup();
    let wf = engine.submit(None, 0).unwrap();
    complete_spike(&engine);

    let admission = engine.admit_next("spec", "writer").unwrap().unwrap();
    let draft = ArtifactDraft::new("requirements", json!({"requirements": ["Add a CACHE layer"]}));
    let outcome = engine.complete(&admission.assignment.id, draft).unwrap();

    let Outcome::AwaitingDecision { request } = outcome else {
        panic!("expected decision, got {:?}", outcome);
    };
    assert_eq!(request.failure_class, FailureClass::ConsistencyError);
    assert!(request.options.contains(&DecisionOption::AcceptDeviation));
    assert!(request.last_checkpoint.is_some());
    assert!(engine.phase(&wf).unwrap().is_paused());
    assert_eq!(engine.pending_decisions().len(), 1);

    let inconsistent = engine
        .recent_events()
        .iter()
        .filter(|e| e.kind == EventKind::Inconsistent)
        .count();
    assert_eq!(inconsistent, 1);

    // nothing for this workflow is admitted while paused
    assert!(engine.admit_next("spec", "writer").unwrap().is_none());
    assert!(engine.admit_next("spike", "spiker").unwrap().is_none());
    assert!(engine.is_idle());

    let phase = engine.decide(&request.id, Decision::AcceptDeviation).unwrap();
    assert_eq!(phase, Phase::Complete);
    assert!(engine.pending_decisions().is_empty());
    let view = engine.workflow(&wf).unwrap();
    assert_eq!(view.state.artifacts.len(), 2);
}

#[test]
fn scenario_d_other_workflows_keep_flowing() {
    let (engine, _) = setup();
    let paused = engine.submit(None, 0).unwrap();
    complete_spike(&engine);
    let admission = engine.admit_next("spec", "writer").unwrap().unwrap();
    let draft = ArtifactDraft::new("requirements", json!({"requirements": []}));
    engine.complete(&admission.assignment.id, draft).unwrap();
    assert!(engine.phase(&paused).unwrap().is_paused());

    let other = engine.submit(None, 0).unwrap();
    let next = engine.admit_next("spike", "spiker").unwrap().unwrap();
    assert_eq!(next.assignment.workflow_id, other);
}

#[test]
fn scenario_d_retry_decision_reruns_the_stage() {
    let (engine, _) = setup();
    let wf = engine.submit(None, 0).unwrap();
    complete_spike(&engine);
    let admission = engine.admit_next("spec", "writer").unwrap().unwrap();
    let draft = ArtifactDraft::new("requirements", json!({"requirements": ["nothing"]}));
    let Outcome::AwaitingDecision { request } =
        engine.complete(&admission.assignment.id, draft).unwrap()
    else {
        panic!("expected decision");
    };

    engine.decide(&request.id, Decision::Retry).unwrap();
    let again = engine.admit_next("spec", "writer").unwrap().unwrap();
    let draft = ArtifactDraft::new(
        "requirements",
        json!({"requirements": ["cache reads", "expire by ttl"]}),
    );
    let outcome = engine.complete(&again.assignment.id, draft).unwrap();
    assert!(matches!(outcome, Outcome::Accepted { phase: Phase::Complete, .. }));
    assert_eq!(engine.phase(&wf).unwrap(), Phase::Complete);

    let recovered = engine
        .recent_events()
        .iter()
        .filter(|e| e.kind == EventKind::Recovered)
        .count();
    assert_eq!(recovered, 1);
}
