//! Immutable, hash-addressed workflow checkpoints.
//!
//! A checkpoint is a full [`WorkflowState`] snapshot taken at a stage
//! boundary. Checkpoints chain through their parent id; the latest one is
//! enough to rebuild a workflow after a restart.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use handoff_types::{Id, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::store::{ArtifactStore, json_files, sha256_hex, write_new};
use crate::workflow::{Phase, WorkflowState};

/// Hex SHA-256 of a checkpoint body.
pub type CheckpointId = String;

/// The hashed part of a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointBody {
    pub workflow_id: Id,
    /// 1-based position in the workflow's chain.
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<CheckpointId>,
    pub state: WorkflowState,
    pub created_at: Timestamp,
}

impl CheckpointBody {
    fn digest(&self) -> Result<CheckpointId> {
        Ok(sha256_hex(&serde_json::to_vec(self)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub body: CheckpointBody,
}

impl Checkpoint {
    pub fn workflow_id(&self) -> &str {
        &self.body.workflow_id
    }

    pub fn sequence(&self) -> u64 {
        self.body.sequence
    }

    pub fn phase(&self) -> &Phase {
        &self.body.state.phase
    }

    /// Check the id against the body.
    pub fn verify(&self) -> Result<()> {
        let digest = self.body.digest()?;
        if digest != self.id {
            return Err(PipelineError::CorruptCheckpoint {
                id: self.id.clone(),
                detail: format!("body hashes to {}", digest),
            });
        }
        Ok(())
    }
}

/// Persistence for checkpoints. Implementations never overwrite.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Load a checkpoint without verifying it.
    fn load(&self, id: &str) -> Result<Checkpoint>;

    /// Checkpoint ids of a workflow, oldest first.
    fn ids_for_workflow(&self, workflow_id: &str) -> Result<Vec<CheckpointId>>;

    /// Workflows that have at least one checkpoint.
    fn workflows(&self) -> Result<Vec<Id>>;
}

#[derive(Default)]
struct ChainIndex {
    chains: HashMap<Id, Vec<(u64, CheckpointId)>>,
}

impl ChainIndex {
    fn insert(&mut self, workflow_id: &str, sequence: u64, id: &str) {
        let chain = self.chains.entry(workflow_id.to_string()).or_default();
        if chain.iter().any(|(_, existing)| existing == id) {
            return;
        }
        chain.push((sequence, id.to_string()));
        chain.sort_by_key(|(seq, _)| *seq);
    }

    fn ids(&self, workflow_id: &str) -> Vec<CheckpointId> {
        self.chains
            .get(workflow_id)
            .map(|c| c.iter().map(|(_, id)| id.clone()).collect())
            .unwrap_or_default()
    }

    fn workflows(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self.chains.keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory backend
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<(HashMap<CheckpointId, Checkpoint>, ChainIndex)>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut inner = self.inner.lock();
        let (records, index) = &mut *inner;
        if records.contains_key(&checkpoint.id) {
            return Ok(());
        }
        records.insert(checkpoint.id.clone(), checkpoint.clone());
        index.insert(checkpoint.workflow_id(), checkpoint.sequence(), &checkpoint.id);
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Checkpoint> {
        self.inner
            .lock()
            .0
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::CheckpointNotFound(id.to_string()))
    }

    fn ids_for_workflow(&self, workflow_id: &str) -> Result<Vec<CheckpointId>> {
        Ok(self.inner.lock().1.ids(workflow_id))
    }

    fn workflows(&self) -> Result<Vec<Id>> {
        Ok(self.inner.lock().1.workflows())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Filesystem backend
// ─────────────────────────────────────────────────────────────────────────────

const CHECKPOINTS_DIR: &str = "checkpoints";

/// Checkpoints stored as `checkpoints/<id>.json`.
///
/// The chain index is rebuilt on open; loads always read the file so a
/// record damaged on disk is caught at restore time.
pub struct FsCheckpointStore {
    dir: PathBuf,
    index: Mutex<ChainIndex>,
}

impl FsCheckpointStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let dir = root.as_ref().join(CHECKPOINTS_DIR);
        fs::create_dir_all(&dir).map_err(|e| PipelineError::storage(dir.display(), e))?;

        let mut index = ChainIndex::default();
        for path in json_files(&dir)? {
            let parsed = fs::read_to_string(&path)
                .map_err(|e| PipelineError::storage(path.display(), e))
                .and_then(|text| Ok(serde_json::from_str::<Checkpoint>(&text)?));
            match parsed {
                Ok(cp) => index.insert(cp.workflow_id(), cp.sequence(), &cp.id),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Unreadable checkpoint left out of chain index");
                }
            }
        }

        Ok(Self {
            dir,
            index: Mutex::new(index),
        })
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

impl CheckpointStore for FsCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let mut index = self.index.lock();
        if !write_new(&self.path(&checkpoint.id), &bytes)? {
            tracing::debug!(checkpoint_id = %checkpoint.id, "Checkpoint already on disk");
        }
        index.insert(checkpoint.workflow_id(), checkpoint.sequence(), &checkpoint.id);
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Checkpoint> {
        let path = self.path(id);
        if !path.is_file() {
            return Err(PipelineError::CheckpointNotFound(id.to_string()));
        }
        let text = fs::read_to_string(&path).map_err(|e| PipelineError::storage(path.display(), e))?;
        serde_json::from_str(&text).map_err(|e| PipelineError::CorruptCheckpoint {
            id: id.to_string(),
            detail: e.to_string(),
        })
    }

    fn ids_for_workflow(&self, workflow_id: &str) -> Result<Vec<CheckpointId>> {
        Ok(self.index.lock().ids(workflow_id))
    }

    fn workflows(&self) -> Result<Vec<Id>> {
        Ok(self.index.lock().workflows())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Captures and restores checkpoints.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    artifacts: Arc<dyn ArtifactStore>,
    capture_lock: Mutex<()>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            artifacts,
            capture_lock: Mutex::new(()),
        }
    }

    /// Snapshot a workflow state.
    ///
    /// A paused workflow is captured at the phase it will resume to. Every
    /// referenced artifact must already be stored.
    pub fn capture(&self, state: &WorkflowState, at: Timestamp) -> Result<Checkpoint> {
        if matches!(state.phase, Phase::Halted { .. }) {
            return Err(PipelineError::InvalidTransition(format!(
                "workflow {} is halted; nothing to checkpoint",
                state.workflow_id
            )));
        }

        let mut snapshot = state.clone();
        snapshot.phase = state.active_phase().clone();

        let referenced = snapshot
            .artifacts
            .iter()
            .chain(snapshot.completed.iter().map(|c| &c.artifact_id));
        for id in referenced {
            if !self.artifacts.contains(id)? {
                return Err(PipelineError::ArtifactNotFound(id.clone()));
            }
        }

        let _guard = self.capture_lock.lock();
        let parent = self.latest(&state.workflow_id)?;
        let sequence = match &parent {
            Some(id) => self.store.load(id)?.sequence() + 1,
            None => 1,
        };
        let body = CheckpointBody {
            workflow_id: state.workflow_id.clone(),
            sequence,
            parent,
            state: snapshot,
            created_at: at,
        };
        let checkpoint = Checkpoint {
            id: body.digest()?,
            body,
        };
        self.store.save(&checkpoint)?;

        tracing::debug!(
            workflow_id = %state.workflow_id,
            checkpoint_id = %checkpoint.id,
            sequence,
            phase = %checkpoint.phase(),
            "Captured checkpoint"
        );
        Ok(checkpoint)
    }

    /// Load and verify a checkpoint.
    pub fn load(&self, id: &str) -> Result<Checkpoint> {
        let checkpoint = self.store.load(id)?;
        checkpoint.verify()?;
        Ok(checkpoint)
    }

    /// The workflow state recorded by a checkpoint.
    pub fn restore(&self, id: &str) -> Result<WorkflowState> {
        Ok(self.load(id)?.body.state)
    }

    pub fn latest(&self, workflow_id: &str) -> Result<Option<CheckpointId>> {
        Ok(self.store.ids_for_workflow(workflow_id)?.pop())
    }

    /// Every checkpoint of a workflow, oldest first.
    pub fn chain(&self, workflow_id: &str) -> Result<Vec<Checkpoint>> {
        self.store
            .ids_for_workflow(workflow_id)?
            .iter()
            .map(|id| self.load(id))
            .collect()
    }

    pub fn workflows(&self) -> Result<Vec<Id>> {
        self.store.workflows()
    }
}
