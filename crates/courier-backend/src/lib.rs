//! The backend seam.
//!
//! Handlers and the sender pool never talk to storage directly; everything
//! goes through the [`Backend`] trait so tests can substitute an in-memory
//! fake. The production implementation is [`PostgresBackend`], which wires
//! the bulk committers, the Redis deduper and the on-disk spool together.

mod postgres;
mod writers;

pub use postgres::{PostgresBackend, PostgresBackendConfig};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use courier_common::{Channel, ChannelEvent, ChannelLog, MsgId, MsgIn, StatusUpdate};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] courier_queue::QueueError),

    #[error("spool error: {0}")]
    Spool(#[from] courier_spool::SpoolError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BackendError>;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Loads a channel by UUID. `Ok(None)` means the channel is deleted or
    /// unknown; callers cache that as a tombstone.
    async fn channel(&self, uuid: Uuid) -> Result<Option<Channel>>;

    /// Persists an inbound message, deduplicating by fingerprint. On return
    /// `msg.id` holds the row id — the existing one when a duplicate was
    /// suppressed.
    async fn write_msg(&self, msg: &mut MsgIn) -> Result<()>;

    /// Queues a status update for bulk commit.
    async fn write_status(&self, update: StatusUpdate) -> Result<()>;

    /// Persists a channel event. Write-once.
    async fn write_event(&self, event: &mut ChannelEvent) -> Result<()>;

    /// Queues a channel log for bulk commit.
    async fn write_channel_log(&self, clog: ChannelLog) -> Result<()>;

    /// Whether this message was already sent (crash-and-requeue guard).
    async fn msg_was_sent(&self, id: MsgId) -> Result<bool>;

    /// Records a successful send so redelivery of the same queued payload
    /// does not produce a duplicate outbound message.
    async fn mark_msg_sent(&self, id: MsgId, external_id: Option<&str>) -> Result<()>;

    /// Connectivity check for the status endpoint.
    async fn health(&self) -> Result<()>;
}
