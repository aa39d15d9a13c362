//! Channel descriptors
//!
//! A channel is one configured provider endpoint, identified by UUID and a
//! channel-type tag. Channels are immutable after load; the per-channel
//! `config` map is intentionally untyped at the edge and read through the
//! typed accessors, with unknown keys ignored.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Configuration keys the core itself reads. Adapters define their own
/// recognized keys the same way.
pub mod config_keys {
    pub const AUTH_TOKEN: &str = "auth_token";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const SECRET: &str = "secret";
    pub const SEND_URL: &str = "send_url";
    pub const SEND_TIMEOUT: &str = "send_timeout";
    pub const MAX_RETRIES: &str = "max_retries";
    pub const RATE_LIMIT: &str = "rate_limit";
}

/// The tag a handler registers under and a channel routes through,
/// e.g. `TG` for Telegram or `EX` for a generic aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelType(String);

impl ChannelType {
    pub fn new(tag: impl Into<String>) -> Self {
        ChannelType(tag.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelType {
    fn from(tag: &str) -> Self {
        ChannelType::new(tag)
    }
}

/// One provider endpoint, loaded on demand from the backend and cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub uuid: Uuid,
    pub channel_type: ChannelType,
    /// The address this channel sends from (phone number, shortcode, page id).
    pub address: String,
    /// ISO-3166-1 alpha-2 country code, when the channel is country-bound.
    pub country: Option<String>,
    /// URN schemes this channel accepts.
    pub schemes: Vec<String>,
    /// Opaque provider configuration, read through the typed accessors.
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    pub org_id: i64,
    /// Domain used when building callback URLs for this channel's org.
    pub callback_domain: Option<String>,
}

impl Channel {
    pub fn config_string(&self, key: &str) -> Option<String> {
        match self.config.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn config_int(&self, key: &str) -> Option<i64> {
        match self.config.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        match self.config.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn supports_scheme(&self, scheme: &str) -> bool {
        self.schemes.iter().any(|s| s == scheme)
    }
}
