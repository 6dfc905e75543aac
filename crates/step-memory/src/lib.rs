//! Per-step provenance recording.
//!
//! Every node execution (or sub-action within one, via the action
//! index) produces exactly one artifact: what went in, what happened
//! along the way, and what came out. Artifacts are append-only; the
//! only mutation after a step finishes is the status transition from
//! running to a terminal state.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flowmill_core_types::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Recorder errors. Status conflicts are programming errors surfaced
/// to the caller rather than silently absorbed.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("artifact for node {node} action {action_index} already exists")]
    DuplicateArtifact { node: String, action_index: u32 },

    #[error("no artifact begun for node {node} action {action_index}")]
    UnknownHandle { node: String, action_index: u32 },

    #[error(
        "artifact for node {node} action {action_index} is already {current} but {requested} was requested"
    )]
    StatusConflict {
        node: String,
        action_index: u32,
        current: ArtifactStatus,
        requested: ArtifactStatus,
    },

    #[error("persistence failed: {0}")]
    Persist(#[from] io::Error),
}

/// Status of one recorded step.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactStatus {
    Running,
    Completed,
    Failed,
}

impl ArtifactStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ArtifactStatus::Running)
    }
}

impl std::fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArtifactStatus::Running => "running",
            ArtifactStatus::Completed => "completed",
            ArtifactStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Kind of a processing event observed during a step.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    ReasonerCall,
    BrowserEvent,
    Error,
}

/// One ordered entry in a step's processing log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingEvent {
    pub kind: EventKind,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Everything that went into a step: the resolved configuration, a
/// snapshot of the variable store, and environment descriptors.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InputsSnapshot {
    pub resolved_config: Value,
    pub variables: Value,
    pub environment: Value,
}

/// Everything that came out of a step.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StepOutputs {
    /// Primary result value of the step.
    pub result: Value,
    /// Variable-store keys the step wrote, with their new values.
    pub state_delta: Value,
    pub duration_ms: u64,
    pub retry_count: u32,
}

/// Which output keys propagate where once the step's scope closes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ForwardingRules {
    /// Copied into the parent scope on pop.
    pub forward: Vec<String>,
    /// Stay confined to the iteration scope.
    pub loop_local: Vec<String>,
    /// Appended to a parent-scope array on pop.
    pub aggregate: Vec<String>,
}

/// The provenance record of one node execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepArtifact {
    pub node_id: NodeId,
    pub action_index: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub inputs: InputsSnapshot,
    pub processing: Vec<ProcessingEvent>,
    pub outputs: Option<StepOutputs>,
    pub forwarding: ForwardingRules,
    pub status: ArtifactStatus,
    /// Monotonic sequence number within the recorder, for ordering.
    pub seq: u64,
}

/// Handle returned by [`MemoryRecorder::begin`], identifying the
/// (node, action index) pair being recorded.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct StepHandle {
    node_id: NodeId,
    action_index: u32,
}

impl StepHandle {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn action_index(&self) -> u32 {
        self.action_index
    }

    fn key(&self) -> (String, u32) {
        (self.node_id.0.clone(), self.action_index)
    }
}

#[derive(Default)]
struct MemoryMetrics {
    begun: AtomicU64,
    events: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Counters snapshot for observability.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryStatsSnapshot {
    pub artifacts: u64,
    pub begun: u64,
    pub events: u64,
    pub completed: u64,
    pub failed: u64,
    pub running: u64,
}

/// Append-only store of step artifacts for one workflow run.
#[derive(Default)]
pub struct MemoryRecorder {
    inner: DashMap<(String, u32), StepArtifact>,
    storage_path: Option<PathBuf>,
    next_seq: AtomicU64,
    metrics: MemoryMetrics,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorder that mirrors its artifacts to a JSON file after every
    /// terminal transition.
    pub fn with_persistence(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let recorder = Self {
            storage_path: Some(path.clone()),
            ..Self::default()
        };

        if path.exists() {
            let bytes = fs::read(&path)?;
            if !bytes.is_empty() {
                let artifacts: Vec<StepArtifact> = serde_json::from_slice(&bytes)
                    .map_err(|err| io::Error::new(ErrorKind::InvalidData, format!("{err}")))?;
                let mut max_seq = 0;
                for artifact in artifacts {
                    max_seq = max_seq.max(artifact.seq + 1);
                    recorder.inner.insert(
                        (artifact.node_id.0.clone(), artifact.action_index),
                        artifact,
                    );
                }
                recorder.next_seq.store(max_seq, Ordering::SeqCst);
            }
        }

        Ok(recorder)
    }

    /// Open an artifact for a (node, action index) pair. Exactly one
    /// artifact may exist per pair.
    pub fn begin(
        &self,
        node_id: &NodeId,
        action_index: u32,
        inputs: InputsSnapshot,
        forwarding: ForwardingRules,
    ) -> Result<StepHandle, MemoryError> {
        let key = (node_id.0.clone(), action_index);
        if self.inner.contains_key(&key) {
            return Err(MemoryError::DuplicateArtifact {
                node: node_id.0.clone(),
                action_index,
            });
        }

        let artifact = StepArtifact {
            node_id: node_id.clone(),
            action_index,
            started_at: Utc::now(),
            finished_at: None,
            inputs,
            processing: Vec::new(),
            outputs: None,
            forwarding,
            status: ArtifactStatus::Running,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        self.inner.insert(key, artifact);
        self.metrics.begun.fetch_add(1, Ordering::Relaxed);

        Ok(StepHandle {
            node_id: node_id.clone(),
            action_index,
        })
    }

    /// Append a processing event (reasoner call, browser event, or
    /// error) to an open artifact. Order of appends is preserved.
    pub fn record_event(
        &self,
        handle: &StepHandle,
        kind: EventKind,
        payload: Value,
    ) -> Result<(), MemoryError> {
        let mut entry = self
            .inner
            .get_mut(&handle.key())
            .ok_or_else(|| MemoryError::UnknownHandle {
                node: handle.node_id.0.clone(),
                action_index: handle.action_index,
            })?;
        entry.processing.push(ProcessingEvent {
            kind,
            payload,
            recorded_at: Utc::now(),
        });
        self.metrics.events.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Close an artifact with its outputs and terminal status.
    ///
    /// Calling `complete` twice with the same terminal status is a
    /// no-op; a different terminal status is a [`MemoryError::StatusConflict`].
    pub fn complete(
        &self,
        handle: &StepHandle,
        outputs: StepOutputs,
        status: ArtifactStatus,
    ) -> Result<(), MemoryError> {
        let mut entry = self
            .inner
            .get_mut(&handle.key())
            .ok_or_else(|| MemoryError::UnknownHandle {
                node: handle.node_id.0.clone(),
                action_index: handle.action_index,
            })?;

        if entry.status.is_terminal() {
            if entry.status == status {
                return Ok(());
            }
            return Err(MemoryError::StatusConflict {
                node: handle.node_id.0.clone(),
                action_index: handle.action_index,
                current: entry.status,
                requested: status,
            });
        }

        entry.outputs = Some(outputs);
        entry.status = status;
        entry.finished_at = Some(Utc::now());
        match status {
            ArtifactStatus::Failed => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.metrics.completed.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(entry);

        if let Err(err) = self.persist_to_disk() {
            warn!(error = %err, "step-memory persist failed after complete");
        }
        Ok(())
    }

    pub fn get(&self, node_id: &NodeId, action_index: u32) -> Option<StepArtifact> {
        self.inner
            .get(&(node_id.0.clone(), action_index))
            .map(|entry| entry.clone())
    }

    /// All artifacts in recording order.
    pub fn list(&self) -> Vec<StepArtifact> {
        let mut artifacts: Vec<StepArtifact> =
            self.inner.iter().map(|entry| entry.clone()).collect();
        artifacts.sort_by_key(|artifact| artifact.seq);
        artifacts
    }

    /// All artifacts for one node, ordered by action index.
    pub fn artifacts_for(&self, node_id: &NodeId) -> Vec<StepArtifact> {
        let mut artifacts: Vec<StepArtifact> = self
            .inner
            .iter()
            .filter(|entry| entry.node_id == *node_id)
            .map(|entry| entry.clone())
            .collect();
        artifacts.sort_by_key(|artifact| artifact.action_index);
        artifacts
    }

    /// The most recently begun artifact, if any.
    pub fn last(&self) -> Option<StepArtifact> {
        self.inner
            .iter()
            .max_by_key(|entry| entry.seq)
            .map(|entry| entry.clone())
    }

    pub fn stats_snapshot(&self) -> MemoryStatsSnapshot {
        let running = self
            .inner
            .iter()
            .filter(|entry| entry.status == ArtifactStatus::Running)
            .count() as u64;
        MemoryStatsSnapshot {
            artifacts: self.inner.len() as u64,
            begun: self.metrics.begun.load(Ordering::Relaxed),
            events: self.metrics.events.load(Ordering::Relaxed),
            completed: self.metrics.completed.load(Ordering::Relaxed),
            failed: self.metrics.failed.load(Ordering::Relaxed),
            running,
        }
    }

    pub fn persist_now(&self) -> io::Result<()> {
        self.persist_to_disk()
    }

    fn persist_to_disk(&self) -> io::Result<()> {
        let Some(path) = self.storage_path.as_ref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let artifacts = self.list();
        let json = serde_json::to_vec_pretty(&artifacts)
            .map_err(|err| io::Error::new(ErrorKind::Other, format!("{err}")))?;
        fs::write(path, json)
    }
}

pub type SharedMemoryRecorder = Arc<MemoryRecorder>;

/// Replace every occurrence of a raw secret value inside `value` with
/// `***`. Applied to all fields before they enter an artifact, so
/// credentials never persist in provenance records.
pub fn mask_secrets(value: &mut Value, secrets: &[String]) {
    if secrets.is_empty() {
        return;
    }
    match value {
        Value::String(s) => {
            for secret in secrets {
                if !secret.is_empty() && s.contains(secret.as_str()) {
                    *s = s.replace(secret.as_str(), "***");
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                mask_secrets(item, secrets);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                mask_secrets(item, secrets);
            }
        }
        _ => {}
    }
}
