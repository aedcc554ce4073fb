//! Durable execution snapshots.
//!
//! One checkpoint captures everything needed to resume an execution:
//! the shared-state map, the in-flight node conversations, the current
//! node, and the per-node visit counts. Checkpoints are immutable once
//! written and are stored one-JSON-blob-per-checkpoint, keyed by
//! `(session_id, checkpoint_id)`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::conversation::Turn;
use crate::state::StateSnapshot;

/// Immutable snapshot of one execution's state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub session_id: String,
    pub execution_id: String,
    pub created_at: DateTime<Utc>,
    pub shared_state: StateSnapshot,
    /// In-flight node conversations, keyed by node id.
    #[serde(default)]
    pub conversations: FxHashMap<String, Vec<Turn>>,
    #[serde(default)]
    pub current_node: Option<String>,
    #[serde(default)]
    pub visit_counts: FxHashMap<String, u32>,
}

impl Checkpoint {
    pub fn new(session_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            checkpoint_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            execution_id: execution_id.into(),
            created_at: Utc::now(),
            shared_state: StateSnapshot::default(),
            conversations: FxHashMap::default(),
            current_node: None,
            visit_counts: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_shared_state(mut self, shared_state: StateSnapshot) -> Self {
        self.shared_state = shared_state;
        self
    }

    #[must_use]
    pub fn with_current_node(mut self, node_id: impl Into<String>) -> Self {
        self.current_node = Some(node_id.into());
        self
    }

    #[must_use]
    pub fn with_visit_counts(mut self, visit_counts: FxHashMap<String, u32>) -> Self {
        self.visit_counts = visit_counts;
        self
    }

    #[must_use]
    pub fn with_conversation(mut self, node_id: impl Into<String>, turns: Vec<Turn>) -> Self {
        self.conversations.insert(node_id.into(), turns);
        self
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    #[error("checkpoint not found: {session_id}/{checkpoint_id}")]
    #[diagnostic(code(hive::checkpoint::not_found))]
    NotFound {
        session_id: String,
        checkpoint_id: String,
    },

    #[error("invalid id for persistence path: {0:?}")]
    #[diagnostic(
        code(hive::checkpoint::invalid_id),
        help("Ids used in filesystem paths may not contain separators, '..', or control characters.")
    )]
    InvalidId(String),

    #[error("checkpoint I/O failed: {0}")]
    #[diagnostic(code(hive::checkpoint::io))]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization failed: {0}")]
    #[diagnostic(code(hive::checkpoint::serde))]
    Serde(#[from] serde_json::Error),
}

/// Append-only checkpoint storage. Implementations serialize operations
/// per session; `list` returns checkpoints in creation order.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError>;

    async fn load(
        &self,
        session_id: &str,
        checkpoint_id: &str,
    ) -> Result<Checkpoint, CheckpointError>;

    /// Most recent checkpoint for a session, `None` when the session has
    /// none.
    async fn load_latest(&self, session_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    async fn list(&self, session_id: &str) -> Result<Vec<Checkpoint>, CheckpointError>;

    async fn delete(&self, session_id: &str, checkpoint_id: &str) -> Result<(), CheckpointError>;
}

/// Ids become path components; reject anything that could escape the
/// session directory.
fn validate_path_id(id: &str) -> Result<(), CheckpointError> {
    if id.is_empty()
        || id.contains('/')
        || id.contains('\\')
        || id.contains("..")
        || id.chars().any(|c| c.is_control())
    {
        return Err(CheckpointError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Disk-backed store: `{root}/{session_id}/{checkpoint_id}.json`.
///
/// Writes are atomic (temp file in the same directory, then rename). When
/// a TTL is configured, expired blobs are swept opportunistically on save.
pub struct FsCheckpointStore {
    root: PathBuf,
    ttl: Option<Duration>,
    io_lock: tokio::sync::Mutex<()>,
}

impl FsCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ttl: None,
            io_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_path_id(session_id)?;
        Ok(self.root.join(session_id))
    }

    fn blob_path(&self, session_id: &str, checkpoint_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_path_id(checkpoint_id)?;
        Ok(self
            .session_dir(session_id)?
            .join(format!("{checkpoint_id}.json")))
    }

    async fn read_all(&self, dir: &Path) -> Result<Vec<Checkpoint>, CheckpointError> {
        let mut checkpoints = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(checkpoints),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<Checkpoint>(&raw) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(error) => {
                    tracing::warn!(target: "hive::checkpoint", path = %path.display(), %error,
                        "skipping unreadable checkpoint blob");
                }
            }
        }
        checkpoints.sort_by_key(|cp| cp.created_at);
        Ok(checkpoints)
    }

    async fn sweep_expired(&self, dir: &Path) {
        let Some(ttl) = self.ttl else { return };
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or_default();
        let Ok(checkpoints) = self.read_all(dir).await else {
            return;
        };
        for checkpoint in checkpoints {
            if checkpoint.created_at < cutoff {
                let path = dir.join(format!("{}.json", checkpoint.checkpoint_id));
                if let Err(error) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(target: "hive::checkpoint", path = %path.display(), %error,
                        "failed to evict expired checkpoint");
                }
            }
        }
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        let _guard = self.io_lock.lock().await;
        let dir = self.session_dir(&checkpoint.session_id)?;
        let path = self.blob_path(&checkpoint.session_id, &checkpoint.checkpoint_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!("{}.json.tmp", checkpoint.checkpoint_id));
        let body = serde_json::to_vec_pretty(&checkpoint)?;
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        self.sweep_expired(&dir).await;
        Ok(())
    }

    async fn load(
        &self,
        session_id: &str,
        checkpoint_id: &str,
    ) -> Result<Checkpoint, CheckpointError> {
        let _guard = self.io_lock.lock().await;
        let path = self.blob_path(session_id, checkpoint_id)?;
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CheckpointError::NotFound {
                    session_id: session_id.to_string(),
                    checkpoint_id: checkpoint_id.to_string(),
                }
            } else {
                e.into()
            }
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn load_latest(&self, session_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let _guard = self.io_lock.lock().await;
        let dir = self.session_dir(session_id)?;
        Ok(self.read_all(&dir).await?.pop())
    }

    async fn list(&self, session_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let _guard = self.io_lock.lock().await;
        let dir = self.session_dir(session_id)?;
        self.read_all(&dir).await
    }

    async fn delete(&self, session_id: &str, checkpoint_id: &str) -> Result<(), CheckpointError> {
        let _guard = self.io_lock.lock().await;
        let path = self.blob_path(session_id, checkpoint_id)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    blobs: Mutex<Vec<Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        self.blobs.lock().push(checkpoint);
        Ok(())
    }

    async fn load(
        &self,
        session_id: &str,
        checkpoint_id: &str,
    ) -> Result<Checkpoint, CheckpointError> {
        self.blobs
            .lock()
            .iter()
            .find(|cp| cp.session_id == session_id && cp.checkpoint_id == checkpoint_id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound {
                session_id: session_id.to_string(),
                checkpoint_id: checkpoint_id.to_string(),
            })
    }

    async fn load_latest(&self, session_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .blobs
            .lock()
            .iter()
            .filter(|cp| cp.session_id == session_id)
            .max_by_key(|cp| cp.created_at)
            .cloned())
    }

    async fn list(&self, session_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let mut checkpoints: Vec<Checkpoint> = self
            .blobs
            .lock()
            .iter()
            .filter(|cp| cp.session_id == session_id)
            .cloned()
            .collect();
        checkpoints.sort_by_key(|cp| cp.created_at);
        Ok(checkpoints)
    }

    async fn delete(&self, session_id: &str, checkpoint_id: &str) -> Result<(), CheckpointError> {
        self.blobs
            .lock()
            .retain(|cp| !(cp.session_id == session_id && cp.checkpoint_id == checkpoint_id));
        Ok(())
    }
}
