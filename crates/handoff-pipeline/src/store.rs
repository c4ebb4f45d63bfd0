//! Content-addressed artifact storage with provenance.
//!
//! ```text
//! ArtifactStore (trait)        - put / get / lookup, no deletion
//!     └── MemoryArtifactStore  - in-process index
//!     └── FsArtifactStore      - artifacts/<id>.json + provenance.jsonl
//! ```
//!
//! An artifact's id is the hex SHA-256 of its canonical content, so storing
//! the same content twice is a no-op and a record can never be overwritten
//! with different content under the same id.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use handoff_types::{Artifact, ArtifactDraft, ArtifactId, Id, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Serialize)]
struct CanonicalContent<'a> {
    artifact_type: &'a str,
    workflow_id: &'a str,
    stage: &'a str,
    work_item: Option<&'a str>,
    payload: &'a Value,
    depends_on: &'a [ArtifactId],
    schema_version: u32,
}

/// Hash of everything that identifies an artifact except its creation time.
pub fn content_hash(artifact: &Artifact) -> Result<String> {
    let canonical = CanonicalContent {
        artifact_type: &artifact.artifact_type,
        workflow_id: &artifact.workflow_id,
        stage: &artifact.stage,
        work_item: artifact.work_item.as_deref(),
        payload: &artifact.payload,
        depends_on: &artifact.depends_on,
        schema_version: artifact.schema_version,
    };
    Ok(sha256_hex(&serde_json::to_vec(&canonical)?))
}

/// Turn an executor's draft into an addressed artifact.
///
/// The draft's own schema version wins over `default_version` so that a
/// mismatching declaration is caught by validation rather than hidden.
pub fn seal(
    draft: ArtifactDraft,
    workflow_id: &str,
    stage: &str,
    work_item: Option<&str>,
    default_version: u32,
    created_at: Timestamp,
) -> Result<Artifact> {
    let mut artifact = Artifact {
        id: String::new(),
        artifact_type: draft.artifact_type,
        workflow_id: workflow_id.to_string(),
        stage: stage.to_string(),
        work_item: work_item.map(str::to_string),
        payload: draft.payload,
        content_hash: String::new(),
        depends_on: draft.depends_on,
        schema_version: draft.schema_version.unwrap_or(default_version),
        created_at,
    };
    let hash = content_hash(&artifact)?;
    artifact.id = hash.clone();
    artifact.content_hash = hash;
    Ok(artifact)
}

/// Where an artifact came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub artifact_id: ArtifactId,
    pub workflow_id: Id,
    pub stage: String,
    pub depends_on: Vec<ArtifactId>,
    pub recorded_at: Timestamp,
}

/// Immutable artifact storage.
pub trait ArtifactStore: Send + Sync {
    /// Store a sealed artifact and return its id.
    ///
    /// Idempotent for identical content. Fails with
    /// [`PipelineError::Integrity`] if the id does not match the content or
    /// is already bound to different content, and with
    /// [`PipelineError::MissingDependency`] if a dependency is unknown.
    fn put(&self, artifact: Artifact) -> Result<ArtifactId>;

    fn get(&self, id: &str) -> Result<Artifact>;

    fn contains(&self, id: &str) -> Result<bool>;

    /// Artifacts of a workflow in storage order.
    fn list_for_workflow(&self, workflow_id: &str) -> Result<Vec<Artifact>>;

    /// Most recently stored artifact of a type within a workflow.
    fn latest_by_type(&self, workflow_id: &str, artifact_type: &str) -> Result<Option<Artifact>>;

    fn provenance(&self, id: &str) -> Result<ProvenanceRecord>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory index (shared by both backends)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Index {
    artifacts: HashMap<ArtifactId, Artifact>,
    order: Vec<ArtifactId>,
    provenance: HashMap<ArtifactId, ProvenanceRecord>,
}

/// What `Index::admit` decided about an incoming artifact.
enum Admission {
    /// Identical content already stored.
    Existing,
    New,
}

impl Index {
    fn admit(&self, artifact: &Artifact) -> Result<Admission> {
        let hash = content_hash(artifact)?;
        if artifact.id != hash || artifact.content_hash != hash {
            return Err(PipelineError::Integrity {
                id: artifact.id.clone(),
                detail: format!("content hashes to {}", hash),
            });
        }

        if let Some(existing) = self.artifacts.get(&artifact.id) {
            if content_hash(existing)? != hash {
                return Err(PipelineError::Integrity {
                    id: artifact.id.clone(),
                    detail: "id already bound to different content".to_string(),
                });
            }
            return Ok(Admission::Existing);
        }

        for dep in &artifact.depends_on {
            if !self.artifacts.contains_key(dep) {
                return Err(PipelineError::MissingDependency {
                    artifact: artifact.id.clone(),
                    missing: dep.clone(),
                });
            }
        }

        Ok(Admission::New)
    }

    fn insert(&mut self, artifact: Artifact, record: ProvenanceRecord) {
        self.order.push(artifact.id.clone());
        self.provenance.insert(artifact.id.clone(), record);
        self.artifacts.insert(artifact.id.clone(), artifact);
    }

    fn get(&self, id: &str) -> Result<Artifact> {
        self.artifacts
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::ArtifactNotFound(id.to_string()))
    }

    fn list_for_workflow(&self, workflow_id: &str) -> Vec<Artifact> {
        self.order
            .iter()
            .filter_map(|id| self.artifacts.get(id))
            .filter(|a| a.workflow_id == workflow_id)
            .cloned()
            .collect()
    }

    fn latest_by_type(&self, workflow_id: &str, artifact_type: &str) -> Option<Artifact> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.artifacts.get(id))
            .find(|a| a.workflow_id == workflow_id && a.artifact_type == artifact_type)
            .cloned()
    }

    fn provenance(&self, id: &str) -> Result<ProvenanceRecord> {
        self.provenance
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::ArtifactNotFound(id.to_string()))
    }
}

fn provenance_for(artifact: &Artifact) -> ProvenanceRecord {
    ProvenanceRecord {
        artifact_id: artifact.id.clone(),
        workflow_id: artifact.workflow_id.clone(),
        stage: artifact.stage.clone(),
        depends_on: artifact.depends_on.clone(),
        recorded_at: artifact.created_at,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory backend
// ─────────────────────────────────────────────────────────────────────────────

/// Artifact store held entirely in memory.
#[derive(Default)]
pub struct MemoryArtifactStore {
    index: Mutex<Index>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, artifact: Artifact) -> Result<ArtifactId> {
        let mut index = self.index.lock();
        match index.admit(&artifact)? {
            Admission::Existing => Ok(artifact.id),
            Admission::New => {
                let id = artifact.id.clone();
                let record = provenance_for(&artifact);
                index.insert(artifact, record);
                Ok(id)
            }
        }
    }

    fn get(&self, id: &str) -> Result<Artifact> {
        self.index.lock().get(id)
    }

    fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.index.lock().artifacts.contains_key(id))
    }

    fn list_for_workflow(&self, workflow_id: &str) -> Result<Vec<Artifact>> {
        Ok(self.index.lock().list_for_workflow(workflow_id))
    }

    fn latest_by_type(&self, workflow_id: &str, artifact_type: &str) -> Result<Option<Artifact>> {
        Ok(self.index.lock().latest_by_type(workflow_id, artifact_type))
    }

    fn provenance(&self, id: &str) -> Result<ProvenanceRecord> {
        self.index.lock().provenance(id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Filesystem backend
// ─────────────────────────────────────────────────────────────────────────────

const ARTIFACTS_DIR: &str = "artifacts";
const PROVENANCE_FILE: &str = "provenance.jsonl";

/// Artifact store persisted under a state directory.
///
/// Records are loaded into memory on open; every `put` writes the record
/// before it becomes visible.
pub struct FsArtifactStore {
    root: PathBuf,
    index: Mutex<Index>,
}

impl FsArtifactStore {
    /// Open (or create) the store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let dir = root.join(ARTIFACTS_DIR);
        fs::create_dir_all(&dir).map_err(|e| PipelineError::storage(dir.display(), e))?;

        let mut index = Index::default();
        let mut loaded = Vec::new();
        for path in json_files(&dir)? {
            let text =
                fs::read_to_string(&path).map_err(|e| PipelineError::storage(path.display(), e))?;
            match serde_json::from_str::<Artifact>(&text) {
                Ok(artifact) if content_hash(&artifact)? == artifact.id => loaded.push(artifact),
                Ok(artifact) => {
                    tracing::warn!(artifact_id = %artifact.id, "Skipping artifact whose content does not match its id");
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable artifact");
                }
            }
        }

        let mut records = read_provenance(&root.join(PROVENANCE_FILE))?;
        loaded.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        for artifact in loaded {
            let record = records
                .remove(&artifact.id)
                .unwrap_or_else(|| provenance_for(&artifact));
            index.insert(artifact, record);
        }

        tracing::debug!(root = %root.display(), artifacts = index.order.len(), "Opened artifact store");
        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, id: &str) -> PathBuf {
        self.root.join(ARTIFACTS_DIR).join(format!("{}.json", id))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, artifact: Artifact) -> Result<ArtifactId> {
        let mut index = self.index.lock();
        if let Admission::Existing = index.admit(&artifact)? {
            return Ok(artifact.id);
        }

        let path = self.artifact_path(&artifact.id);
        let bytes = serde_json::to_vec_pretty(&artifact)?;
        if !write_new(&path, &bytes)? {
            // Another writer got there first; accept only identical content.
            let text =
                fs::read_to_string(&path).map_err(|e| PipelineError::storage(path.display(), e))?;
            let existing: Artifact = serde_json::from_str(&text)?;
            if content_hash(&existing)? != artifact.content_hash {
                return Err(PipelineError::Integrity {
                    id: artifact.id.clone(),
                    detail: "file on disk holds different content".to_string(),
                });
            }
        }

        let record = provenance_for(&artifact);
        append_line(&self.root.join(PROVENANCE_FILE), &serde_json::to_string(&record)?)?;

        let id = artifact.id.clone();
        tracing::debug!(artifact_id = %id, stage = %artifact.stage, "Stored artifact");
        index.insert(artifact, record);
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<Artifact> {
        self.index.lock().get(id)
    }

    fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.index.lock().artifacts.contains_key(id))
    }

    fn list_for_workflow(&self, workflow_id: &str) -> Result<Vec<Artifact>> {
        Ok(self.index.lock().list_for_workflow(workflow_id))
    }

    fn latest_by_type(&self, workflow_id: &str, artifact_type: &str) -> Result<Option<Artifact>> {
        Ok(self.index.lock().latest_by_type(workflow_id, artifact_type))
    }

    fn provenance(&self, id: &str) -> Result<ProvenanceRecord> {
        self.index.lock().provenance(id)
    }
}

fn read_provenance(path: &Path) -> Result<HashMap<ArtifactId, ProvenanceRecord>> {
    let mut records = HashMap::new();
    if !path.is_file() {
        return Ok(records);
    }
    let file = File::open(path).map_err(|e| PipelineError::storage(path.display(), e))?;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| PipelineError::storage(path.display(), e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ProvenanceRecord>(&line) {
            Ok(record) => {
                records.entry(record.artifact_id.clone()).or_insert(record);
            }
            Err(e) => tracing::warn!(error = %e, "Skipping malformed provenance line"),
        }
    }
    Ok(records)
}

// ─────────────────────────────────────────────────────────────────────────────
// File helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Every `*.json` file directly under `dir`, sorted by name. Leftover
/// `.tmp` files from interrupted writes are ignored.
pub(crate) fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| PipelineError::storage(dir.display(), e))?;
    for entry in entries {
        let path = entry
            .map_err(|e| PipelineError::storage(dir.display(), e))?
            .path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Write `bytes` to `path` only if `path` does not exist yet.
///
/// The content goes to a synced temp file first and is then hard-linked to
/// its final name; linking fails if the name is taken, so the final file is
/// either absent or complete. Returns `false` if the file already existed.
pub(crate) fn write_new(path: &Path, bytes: &[u8]) -> Result<bool> {
    let tmp = path.with_extension(format!("{}.tmp", handoff_types::new_id()));
    {
        let mut file = File::create(&tmp).map_err(|e| PipelineError::storage(tmp.display(), e))?;
        file.write_all(bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| PipelineError::storage(tmp.display(), e))?;
    }

    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(PipelineError::storage(path.display(), e)),
    }
}

/// Append one line to a JSONL file, creating it if needed.
pub(crate) fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PipelineError::storage(path.display(), e))?;
    writeln!(file, "{}", line).map_err(|e| PipelineError::storage(path.display(), e))?;
    file.sync_data()
        .map_err(|e| PipelineError::storage(path.display(), e))
}
