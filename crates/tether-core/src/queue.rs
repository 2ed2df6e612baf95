//! Durable FIFO queue of outgoing envelopes awaiting acknowledgment.
//!
//! Envelopes land here when a send is attempted while disconnected, or
//! when an ack times out. An entry is removed only after a confirmed
//! acknowledgment from the relay. Insertion order is preserved and
//! draining stops at the first failure, so a failed message is never
//! silently reordered behind later ones.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use tether_proto::{OutgoingEnvelope, QueuedMessage};

/// Failure of the durable queue backing store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("queue storage: {0}")]
pub struct QueueError(pub String);

/// Durable FIFO of outgoing envelopes.
///
/// Implementations must assign strictly increasing ids in enqueue order
/// and return entries in that order. The runtime guards against
/// concurrent drains; implementations only need interior consistency.
#[async_trait]
pub trait OfflineQueue: Send + Sync {
    /// Append an envelope, assigning its durable id.
    async fn append(&self, envelope: OutgoingEnvelope) -> Result<QueuedMessage, QueueError>;

    /// All entries, oldest first.
    async fn entries(&self) -> Result<Vec<QueuedMessage>, QueueError>;

    /// Remove one entry after its envelope was acknowledged.
    async fn remove(&self, id: u64) -> Result<(), QueueError>;

    /// Number of queued entries.
    async fn len(&self) -> Result<usize, QueueError>;

    /// Whether the queue is empty.
    async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }
}

/// Non-durable in-memory queue for tests and ephemeral clients.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: Mutex<MemoryQueueInner>,
}

#[derive(Debug, Default)]
struct MemoryQueueInner {
    next_id: u64,
    entries: Vec<QueuedMessage>,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OfflineQueue for MemoryQueue {
    async fn append(&self, envelope: OutgoingEnvelope) -> Result<QueuedMessage, QueueError> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let entry = QueuedMessage { id: inner.next_id, envelope };
        inner.entries.push(entry.clone());
        Ok(entry)
    }

    async fn entries(&self) -> Result<Vec<QueuedMessage>, QueueError> {
        Ok(self.inner.lock().await.entries.clone())
    }

    async fn remove(&self, id: u64) -> Result<(), QueueError> {
        self.inner.lock().await.entries.retain(|e| e.id != id);
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.inner.lock().await.entries.len())
    }
}
