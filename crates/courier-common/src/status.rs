//! Message status updates.
//!
//! Statuses advance monotonically along the success axis
//! (`pending → queued → wired → sent → delivered`); `wired` may be skipped
//! when a provider reports `sent` first. `errored` and `failed` live on the
//! failure axis: `errored` is retryable and may repeat up to the channel's
//! retry budget before the sender turns it into a terminal `failed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::msg::MsgId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgStatus {
    #[serde(rename = "P")]
    Pending,
    #[serde(rename = "Q")]
    Queued,
    #[serde(rename = "W")]
    Wired,
    #[serde(rename = "S")]
    Sent,
    #[serde(rename = "D")]
    Delivered,
    #[serde(rename = "E")]
    Errored,
    #[serde(rename = "F")]
    Failed,
}

impl MsgStatus {
    /// The single-letter code stored in the database.
    pub fn code(&self) -> char {
        match self {
            MsgStatus::Pending => 'P',
            MsgStatus::Queued => 'Q',
            MsgStatus::Wired => 'W',
            MsgStatus::Sent => 'S',
            MsgStatus::Delivered => 'D',
            MsgStatus::Errored => 'E',
            MsgStatus::Failed => 'F',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'P' => Some(MsgStatus::Pending),
            'Q' => Some(MsgStatus::Queued),
            'W' => Some(MsgStatus::Wired),
            'S' => Some(MsgStatus::Sent),
            'D' => Some(MsgStatus::Delivered),
            'E' => Some(MsgStatus::Errored),
            'F' => Some(MsgStatus::Failed),
            _ => None,
        }
    }

    /// Position on the success axis; `None` for the failure statuses.
    pub fn success_rank(&self) -> Option<i32> {
        match self {
            MsgStatus::Pending => Some(0),
            MsgStatus::Queued => Some(1),
            MsgStatus::Wired => Some(2),
            MsgStatus::Sent => Some(3),
            MsgStatus::Delivered => Some(4),
            MsgStatus::Errored | MsgStatus::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MsgStatus::Delivered | MsgStatus::Failed)
    }
}

/// A status transition for one message, keyed either by our own message id
/// or by the provider's external id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub uuid: Uuid,
    pub channel_uuid: Uuid,
    #[serde(default)]
    pub msg_id: Option<MsgId>,
    #[serde(default)]
    pub external_id: Option<String>,
    pub status: MsgStatus,
    pub modified_on: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn by_id(channel_uuid: Uuid, msg_id: MsgId, status: MsgStatus) -> Self {
        StatusUpdate {
            uuid: Uuid::new_v4(),
            channel_uuid,
            msg_id: Some(msg_id),
            external_id: None,
            status,
            modified_on: Utc::now(),
        }
    }

    pub fn by_external_id(channel_uuid: Uuid, external_id: impl Into<String>, status: MsgStatus) -> Self {
        StatusUpdate {
            uuid: Uuid::new_v4(),
            channel_uuid,
            msg_id: None,
            external_id: Some(external_id.into()),
            status,
            modified_on: Utc::now(),
        }
    }
}
