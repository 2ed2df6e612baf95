//! Durable client-side storage: the offline queue file and the
//! handled-invite markers.
//!
//! Both stores write the whole state as one JSON document through a
//! temp-file rename, so a crash mid-write leaves the previous version
//! intact rather than a torn file.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use tether_core::error::InviteError;
use tether_core::invite::InviteId;
use tether_core::queue::{OfflineQueue, QueueError};
use tether_proto::{OutgoingEnvelope, QueuedMessage};

/// Marker store recording which completed invites this client already
/// consumed, making welcome processing idempotent across polls and
/// restarts.
#[async_trait]
pub trait HandledInvites: Send + Sync {
    /// Whether this invite's welcome was already processed.
    async fn is_handled(&self, id: &InviteId) -> Result<bool, InviteError>;

    /// Record this invite's welcome as processed.
    async fn mark_handled(&self, id: &InviteId) -> Result<(), InviteError>;
}

/// In-memory marker store for tests and ephemeral clients.
#[derive(Debug, Default)]
pub struct MemoryHandled {
    seen: Mutex<HashSet<InviteId>>,
}

impl MemoryHandled {
    /// Create an empty marker store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HandledInvites for MemoryHandled {
    async fn is_handled(&self, id: &InviteId) -> Result<bool, InviteError> {
        Ok(self.seen.lock().await.contains(id))
    }

    async fn mark_handled(&self, id: &InviteId) -> Result<(), InviteError> {
        self.seen.lock().await.insert(id.clone());
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    next_id: u64,
    entries: Vec<QueuedMessage>,
}

/// File-backed [`OfflineQueue`].
///
/// Ids keep increasing across restarts; `next_id` is persisted with the
/// entries so a reopened queue never reuses an id still visible to a
/// concurrent drain.
pub struct FileQueue {
    path: PathBuf,
    inner: Mutex<QueueFile>,
}

impl FileQueue {
    /// Open the queue file at `path`, creating an empty queue if the
    /// file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| QueueError(e.to_string()))?
            },
            Err(e) if e.kind() == ErrorKind::NotFound => QueueFile::default(),
            Err(e) => return Err(QueueError(e.to_string())),
        };
        Ok(Self { path, inner: Mutex::new(state) })
    }

    async fn persist(&self, state: &QueueFile) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec(state).map_err(|e| QueueError(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| QueueError(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| QueueError(e.to_string()))
    }
}

#[async_trait]
impl OfflineQueue for FileQueue {
    async fn append(&self, envelope: OutgoingEnvelope) -> Result<QueuedMessage, QueueError> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let entry = QueuedMessage { id: inner.next_id, envelope };
        inner.entries.push(entry.clone());
        self.persist(&inner).await?;
        Ok(entry)
    }

    async fn entries(&self) -> Result<Vec<QueuedMessage>, QueueError> {
        Ok(self.inner.lock().await.entries.clone())
    }

    async fn remove(&self, id: u64) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|e| e.id != id);
        if inner.entries.len() != before {
            self.persist(&inner).await?;
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.inner.lock().await.entries.len())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HandledFile {
    handled: HashSet<InviteId>,
}

/// File-backed [`HandledInvites`].
pub struct FileHandled {
    path: PathBuf,
    inner: Mutex<HandledFile>,
}

impl FileHandled {
    /// Open the marker file at `path`, creating an empty set if the
    /// file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, InviteError> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| InviteError::Store(e.to_string()))?
            },
            Err(e) if e.kind() == ErrorKind::NotFound => HandledFile::default(),
            Err(e) => return Err(InviteError::Store(e.to_string())),
        };
        Ok(Self { path, inner: Mutex::new(state) })
    }
}

#[async_trait]
impl HandledInvites for FileHandled {
    async fn is_handled(&self, id: &InviteId) -> Result<bool, InviteError> {
        Ok(self.inner.lock().await.handled.contains(id))
    }

    async fn mark_handled(&self, id: &InviteId) -> Result<(), InviteError> {
        let mut inner = self.inner.lock().await;
        if !inner.handled.insert(id.clone()) {
            return Ok(());
        }
        let bytes =
            serde_json::to_vec(&*inner).map_err(|e| InviteError::Store(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| InviteError::Store(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| InviteError::Store(e.to_string()))
    }
}
