//! Inbound and outbound messages.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::channel::Channel;
use crate::urns::Urn;

/// Database id of a message. Zero until the backend has written the row.
pub const NIL_MSG_ID: MsgId = MsgId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(pub i64);

impl MsgId {
    pub fn is_nil(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Splits an attachment reference of the form `mime:url` into its parts.
/// The URL's own scheme colon is left intact.
pub fn split_attachment(attachment: &str) -> (&str, &str) {
    match attachment.split_once(':') {
        Some((mime, url)) if !url.starts_with("//") => (mime, url),
        _ => ("", attachment),
    }
}

/// A message received from a provider webhook, created by a handler and
/// written once through the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgIn {
    pub uuid: Uuid,
    pub channel_uuid: Uuid,
    pub urn: Urn,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    pub received_on: DateTime<Utc>,
    #[serde(default)]
    pub contact_name: Option<String>,
    /// Set by the backend once the row exists.
    #[serde(default = "nil_msg_id")]
    pub id: MsgId,
    /// The channel log covering the webhook that produced this message.
    #[serde(default)]
    pub channel_log_uuid: Option<Uuid>,
}

fn nil_msg_id() -> MsgId {
    NIL_MSG_ID
}

impl MsgIn {
    pub fn new(channel: &Channel, urn: Urn, text: impl Into<String>, received_on: DateTime<Utc>) -> Self {
        MsgIn {
            uuid: Uuid::new_v4(),
            channel_uuid: channel.uuid,
            urn,
            text: text.into(),
            attachments: Vec::new(),
            external_id: None,
            received_on,
            contact_name: None,
            id: NIL_MSG_ID,
            channel_log_uuid: None,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_attachment(mut self, attachment: impl Into<String>) -> Self {
        self.attachments.push(attachment.into());
        self
    }

    pub fn with_contact_name(mut self, name: impl Into<String>) -> Self {
        self.contact_name = Some(name.into());
        self
    }

    /// The dedupe fingerprint for this message: keyed on the provider's
    /// external id when present, on the content hash otherwise.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.channel_uuid.to_string());
        hasher.update("|");
        hasher.update(self.urn.identity());
        hasher.update("|");
        match &self.external_id {
            Some(external_id) => hasher.update(external_id),
            None => {
                hasher.update(&self.text);
                for attachment in &self.attachments {
                    hasher.update("|");
                    hasher.update(attachment);
                }
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// A message queued for sending. Created by the backend, read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgOut {
    pub id: MsgId,
    pub uuid: Uuid,
    pub channel_uuid: Uuid,
    pub urn: Urn,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub quick_replies: Vec<String>,
    #[serde(default)]
    pub high_priority: bool,
    /// External id of the inbound message this is a reply to, when the
    /// provider needs it to thread the response.
    #[serde(default)]
    pub response_to_external_id: Option<String>,
    /// How many times sending has already errored.
    #[serde(default)]
    pub error_count: i32,
    /// Session lifecycle hint for providers with conversation windows.
    #[serde(default)]
    pub session_status: Option<String>,
}
