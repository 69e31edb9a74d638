//! Job context storage and per-scanner message streams.
//!
//! Both concerns are served by the same broker in production ([`RedisBroker`]); tests use
//! [`MemoryBroker`], which implements the same consumer-group semantics in process.

mod broker;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use scanrelay_core::models::{JobContext, JobId, QueueMessage};

pub use crate::{broker::RedisBroker, memory::MemoryBroker};

/// Name of the single field carrying the message in a stream entry.
pub const MESSAGE_FIELD: &str = "data";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("broker unreachable: {0}")]
    Connection(String),
    #[error("broker command failed: {0}")]
    Command(String),
    #[error("job context {0} already exists")]
    Collision(JobId),
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
}

impl StoreError {
    /// Whether the error is worth retrying after a backoff.
    pub fn is_connection(&self) -> bool { matches!(self, Self::Connection(_)) }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Transient key-value store for job contexts. Entries are written once and never mutated.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Writes a new context under `job:<id>`, failing with [`StoreError::Collision`] if an
    /// entry already exists.
    async fn put(&self, context: &JobContext, ttl: Duration) -> StoreResult<()>;

    async fn get(&self, id: &JobId) -> StoreResult<Option<JobContext>>;

    async fn ping(&self) -> StoreResult<()>;
}

/// Raw entry delivered from a stream. The payload is decoded by the consumer so that a
/// corrupt entry can still be acknowledged and removed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub data: Option<String>,
    /// How many times the entry has been delivered, this delivery included.
    pub deliveries: u64,
}

impl StreamEntry {
    pub fn decode(&self) -> StoreResult<QueueMessage> {
        let data = self.data.as_deref().ok_or_else(|| StoreError::Malformed {
            what: "stream entry",
            reason: format!("entry {} has no `{}` field", self.id, MESSAGE_FIELD),
        })?;
        serde_json::from_str(data).map_err(|e| StoreError::Malformed {
            what: "queue message",
            reason: format!("entry {}: {}", self.id, e),
        })
    }
}

/// Append-only log per scanner class with consumer-group delivery.
#[async_trait]
pub trait StreamQueue: Send + Sync {
    /// Appends a message and returns the entry id.
    async fn publish(&self, stream: &str, message: &QueueMessage) -> StoreResult<String>;

    /// Creates the consumer group (and the stream) if missing. Idempotent.
    async fn ensure_group(&self, stream: &str, group: &str) -> StoreResult<()>;

    /// Delivers up to `count` entries never delivered to the group before, waiting up to
    /// `block` for new entries. An empty result means the wait timed out.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>>;

    /// Transfers to `consumer` up to `count` entries that have been pending under any consumer
    /// of the group for at least `min_idle`, and delivers them again. Pending entries whose
    /// payload was already deleted are dropped from the group.
    async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>>;

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> StoreResult<()>;

    async fn delete(&self, stream: &str, entry_id: &str) -> StoreResult<()>;
}

pub(crate) fn encode_context(context: &JobContext) -> StoreResult<String> {
    serde_json::to_string(context)
        .map_err(|e| StoreError::Malformed { what: "job context", reason: e.to_string() })
}

pub(crate) fn decode_context(id: &JobId, data: &str) -> StoreResult<JobContext> {
    serde_json::from_str(data).map_err(|e| StoreError::Malformed {
        what: "job context",
        reason: format!("{}: {}", id.context_key(), e),
    })
}

pub(crate) fn encode_message(message: &QueueMessage) -> StoreResult<String> {
    serde_json::to_string(message)
        .map_err(|e| StoreError::Malformed { what: "queue message", reason: e.to_string() })
}
