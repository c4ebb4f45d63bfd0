//! Append-only audit log of validations, failures, decisions and restores.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use handoff_types::{ArtifactId, Decision, Id, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointId;
use crate::error::{PipelineError, Result};
use crate::recovery::FailureRecord;
use crate::store::append_line;
use crate::validator::ValidationResult;

const AUDIT_FILE: &str = "audit.jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum AuditEntry {
    Validation {
        workflow_id: Id,
        stage: String,
        assignment_id: Id,
        artifact_id: ArtifactId,
        result: ValidationResult,
        at: Timestamp,
    },
    Failure {
        record: FailureRecord,
    },
    Decision {
        request_id: Id,
        workflow_id: Id,
        decision: Decision,
        at: Timestamp,
    },
    Restore {
        workflow_id: Id,
        checkpoint_id: CheckpointId,
        at: Timestamp,
    },
}

impl AuditEntry {
    pub fn workflow_id(&self) -> &str {
        match self {
            AuditEntry::Validation { workflow_id, .. }
            | AuditEntry::Decision { workflow_id, .. }
            | AuditEntry::Restore { workflow_id, .. } => workflow_id,
            AuditEntry::Failure { record } => &record.workflow_id,
        }
    }
}

/// Audit log kept in memory and, when opened on a state directory,
/// mirrored to `audit.jsonl`.
#[derive(Default)]
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
    path: Option<PathBuf>,
}

impl AuditLog {
    pub fn memory() -> Self {
        Self::default()
    }

    /// Open the log under `root`, loading earlier entries.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let path = root.as_ref().join(AUDIT_FILE);
        let mut entries = Vec::new();
        if path.is_file() {
            let file = File::open(&path).map_err(|e| PipelineError::storage(path.display(), e))?;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|e| PipelineError::storage(path.display(), e))?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str(&line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => tracing::warn!(error = %e, "Skipping malformed audit line"),
                }
            }
        }
        Ok(Self {
            entries: Mutex::new(entries),
            path: Some(path),
        })
    }

    pub fn record(&self, entry: AuditEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(ref path) = self.path {
            append_line(path, &serde_json::to_string(&entry)?)?;
        }
        entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn for_workflow(&self, workflow_id: &str) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.workflow_id() == workflow_id)
            .cloned()
            .collect()
    }

    /// Failure records of a workflow, oldest first.
    pub fn failures(&self, workflow_id: &str) -> Vec<FailureRecord> {
        self.entries
            .lock()
            .iter()
            .filter_map(|e| match e {
                AuditEntry::Failure { record } if record.workflow_id == workflow_id => {
                    Some(record.clone())
                }
                _ => None,
            })
            .collect()
    }
}
