//! Workflow orchestration engine for Handoff.
//!
//! Stages hand artifacts to each other through a validation gate. Kanban
//! stages run one after another under WIP limits; at the transition gate
//! their artifacts become work items packed into sprints, which then flow
//! through the Scrum stages item by item.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Engine                                                      │
//! │  - StageScheduler: backlogs, WIP slots, review slot, backoff │
//! │  - SchemaValidator: structure + consistency rules            │
//! │  - RecoveryController: retry / backlog / escalate / halt     │
//! │  - ArtifactStore + CheckpointManager: content-addressed state│
//! │  - AuditLog + EventBus                                       │
//! └──────────────────────────────────────────────────────────────┘
//!          ▲ admit_next / complete / fail        ▲ decide / resume
//!          │                                     │
//!   Driver + StageExecutors                 coordinator
//! ```
//!
//! The engine never runs stage work. [`Driver`] pulls admitted assignments
//! and hands them to [`StageExecutor`](handoff_types::StageExecutor)s such
//! as [`CommandExecutor`].

pub mod audit;
pub mod checkpoint;
pub mod clock;
pub mod command;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod recovery;
pub mod scheduler;
pub mod store;
pub mod validator;
pub mod workflow;

pub use audit::{AuditEntry, AuditLog};
pub use checkpoint::{
    Checkpoint, CheckpointBody, CheckpointId, CheckpointManager, CheckpointStore,
    FsCheckpointStore, MemoryCheckpointStore,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{CommandExecutor, EXIT_TEMPFAIL};
pub use driver::{DriveReport, Driver, ExecutorRegistry};
pub use engine::{Admission, Engine, EngineBuilder, Outcome, RecoverableWorkflow, WorkflowView};
pub use error::{PipelineError, Result};
pub use events::EventBus;
pub use recovery::{FailureRecord, RecoveryAction, RecoveryController};
pub use scheduler::{AssignmentStatus, StageScheduler, StageSnapshot, TaskAssignment};
pub use store::{ArtifactStore, FsArtifactStore, MemoryArtifactStore, ProvenanceRecord, seal};
pub use validator::{
    FieldViolation, ReasonCode, RuleViolation, SchemaValidator, ValidationResult, Verdict,
};
pub use workflow::{Phase, PhaseEntry, Sprint, SprintPlan, WorkflowState};
