//! Batching and bulk committing.
//!
//! The write path from handler tasks to the backend is an N:1 fan-in; bulk
//! SQL cuts round-trips by orders of magnitude but a naive bulk statement
//! fails on duplicate row updates. The generic [`Batcher`] owns the single
//! background consumer; the [`Committer`] layers row-id deduplication,
//! degraded-to-singleton retry and producer backpressure on top of it.

mod batcher;
mod committer;

pub use batcher::{BatchProcessor, Batcher};
pub use committer::{BulkWriter, Committable, Committer, ErrorCallback};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("bulk write failed: {0}")]
    Write(String),

    #[error("write timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, BatchError>;

use courier_common::{ChannelLog, StatusUpdate};

impl Committable for StatusUpdate {
    /// Status updates target existing rows, so they carry a row id: the
    /// message id when we have one, the channel-scoped external id otherwise.
    fn row_id(&self) -> Option<String> {
        if let Some(id) = self.msg_id {
            return Some(id.to_string());
        }
        self.external_id
            .as_ref()
            .map(|external_id| format!("{}|{}", self.channel_uuid, external_id))
    }
}

impl Committable for ChannelLog {
    /// Channel logs are pure inserts and are never deduplicated.
    fn row_id(&self) -> Option<String> {
        None
    }
}
