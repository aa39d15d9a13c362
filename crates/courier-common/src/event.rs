//! Channel events — non-message happenings about a contact, written once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::Channel;
use crate::urns::Urn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelEventType {
    WelcomeMessage,
    NewConversation,
    Referral,
    StopContact,
    OptIn,
    OptOut,
}

impl ChannelEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelEventType::WelcomeMessage => "welcome_message",
            ChannelEventType::NewConversation => "new_conversation",
            ChannelEventType::Referral => "referral",
            ChannelEventType::StopContact => "stop_contact",
            ChannelEventType::OptIn => "opt_in",
            ChannelEventType::OptOut => "opt_out",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub uuid: Uuid,
    pub channel_uuid: Uuid,
    pub event_type: ChannelEventType,
    pub urn: Urn,
    /// Provider-specific extras (referrer ids, ad ids, payloads).
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub contact_name: Option<String>,
    pub occurred_on: DateTime<Utc>,
    pub created_on: DateTime<Utc>,
    #[serde(default)]
    pub channel_log_uuid: Option<Uuid>,
    /// Set by the backend once the row exists.
    #[serde(default)]
    pub id: i64,
}

impl ChannelEvent {
    pub fn new(channel: &Channel, event_type: ChannelEventType, urn: Urn, occurred_on: DateTime<Utc>) -> Self {
        ChannelEvent {
            uuid: Uuid::new_v4(),
            channel_uuid: channel.uuid,
            event_type,
            urn,
            extra: serde_json::Map::new(),
            contact_name: None,
            occurred_on,
            created_on: Utc::now(),
            channel_log_uuid: None,
            id: 0,
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn with_contact_name(mut self, name: impl Into<String>) -> Self {
        self.contact_name = Some(name.into());
        self
    }
}
