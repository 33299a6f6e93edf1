//! Durable coordination structures for distributed copy workers
//!
//! The copy engine coordinates its workers through two kinds of shared structures:
//!
//! 1. **Queues** - durable, at-least-once message queues with a visibility timeout. A dequeued
//!    message stays invisible to other consumers until it is deleted or its timeout expires, after
//!    which it is delivered again.
//! 2. **Sets** - durable string sets used as the "folder done" ledger.
//!
//! This crate defines the contracts the engine relies on ([`Queue`], [`Set`], [`Backend`]) and two
//! implementations:
//!
//! - [`memory::MemoryBackend`] keeps everything inside the current process. It is used when all
//!   workers run as tasks of a single `dcp` process, and by tests.
//! - [`redis_store::RedisBackend`] keeps queues and sets in Redis so that workers can run as separate
//!   processes or on separate hosts.
//!
//! # Error classification
//!
//! Every operation returns [`StoreError`]. Only [`StoreError::Transport`] is transient
//! ([`StoreError::is_transient`]); callers wrap operations in a bounded retry policy that retries
//! transient failures and surfaces everything else immediately.

use std::sync::Arc;

pub mod memory;
pub mod redis_store;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Failure of an operation on a durable structure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The backing service is temporarily unreachable or timed out
    #[error("transport failure on '{target}': {reason}")]
    Transport { target: String, reason: String },
    /// A message body could not be decoded
    #[error("malformed message '{id}' on '{queue}': {reason}")]
    Codec {
        queue: String,
        id: String,
        reason: String,
    },
    /// A delete was attempted with a pop token that no longer owns the message
    #[error("pop receipt for message '{id}' on '{queue}' is no longer valid")]
    StaleReceipt { queue: String, id: String },
    /// Connection settings are invalid or the service cannot be reached at startup
    #[error("invalid store configuration: {0}")]
    Config(String),
    /// The service rejected the operation
    #[error("operation on '{target}' failed: {reason}")]
    Backend { target: String, reason: String },
}

impl StoreError {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transport { .. })
    }
}

/// Category of a queue, selecting its visibility timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Folder and regular file queues
    Standard,
    /// The shared large-file queue, whose messages take much longer to process
    Large,
}

/// Settings applied to every queue opened through a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Visibility timeout of [`QueueKind::Standard`] queues
    pub standard_visibility: std::time::Duration,
    /// Visibility timeout of [`QueueKind::Large`] queues
    pub large_visibility: std::time::Duration,
    /// Maximum number of messages returned by one [`Queue::dequeue_batch`] call
    pub batch_size: usize,
}

impl QueueOptions {
    pub fn visibility_timeout(&self, kind: QueueKind) -> std::time::Duration {
        match kind {
            QueueKind::Standard => self.standard_visibility,
            QueueKind::Large => self.large_visibility,
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            standard_visibility: std::time::Duration::from_secs(300),
            large_visibility: std::time::Duration::from_secs(2 * 3600),
            batch_size: 32,
        }
    }
}

/// A dequeued message
///
/// `id` and `pop_token` together identify this particular delivery: deleting requires both, so a
/// consumer whose visibility timeout expired cannot delete a message that was redelivered to
/// somebody else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub pop_token: String,
    pub body: String,
}

/// Durable at-least-once queue with visibility timeout semantics
#[async_trait::async_trait]
pub trait Queue: Send + Sync + std::fmt::Debug {
    /// Logical name of the queue
    fn name(&self) -> &str;
    fn kind(&self) -> QueueKind;
    async fn enqueue(&self, body: &str) -> Result<()>;
    /// Returns zero or more messages and hides them from other consumers for the visibility timeout
    async fn dequeue_batch(&self) -> Result<Vec<Message>>;
    async fn delete(&self, id: &str, pop_token: &str) -> Result<()>;
    /// Approximate: whether no message is currently visible
    async fn is_empty(&self) -> Result<bool>;
    /// Approximate number of messages not yet deleted, visible or not
    async fn approx_size(&self) -> Result<usize>;
    /// Purges all messages
    async fn reset(&self) -> Result<()>;
}

/// Durable set of strings
#[async_trait::async_trait]
pub trait Set: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    /// Adds a member, returns true if it was not present before
    async fn add(&self, value: &str) -> Result<bool>;
    async fn is_member(&self, value: &str) -> Result<bool>;
    /// Removes all members
    async fn reset(&self) -> Result<()>;
}

/// Opens queues and sets by logical name, creating them if missing
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn open_queue(&self, name: &str, kind: QueueKind) -> Result<Arc<dyn Queue>>;
    async fn open_set(&self, name: &str) -> Result<Arc<dyn Set>>;
}
