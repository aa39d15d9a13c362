//! Channel logs
//!
//! A channel log is the audit envelope around one webhook invocation or one
//! send attempt: every HTTP call made while handling it, every structured
//! error, and the elapsed wall time. Values a handler declares secret are
//! string-replaced in the recorded traces before anything is persisted.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::Channel;
use crate::error::SendError;
use crate::msg::MsgId;

const REDACTION_MASK: &str = "**********";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLogType {
    MsgSend,
    MsgReceive,
    MsgStatus,
    EventReceive,
    Unknown,
}

impl ChannelLogType {
    /// Derives the log type from the webhook verb in the route.
    pub fn from_verb(verb: &str) -> Self {
        match verb {
            "receive" | "received" | "receives" => ChannelLogType::MsgReceive,
            "status" | "delivered" | "sent" | "failed" | "report" => ChannelLogType::MsgStatus,
            "stop" | "stopped" | "event" | "referral" => ChannelLogType::EventReceive,
            _ => ChannelLogType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelLogType::MsgSend => "msg_send",
            ChannelLogType::MsgReceive => "msg_receive",
            ChannelLogType::MsgStatus => "msg_status",
            ChannelLogType::EventReceive => "event_receive",
            ChannelLogType::Unknown => "unknown",
        }
    }
}

/// One HTTP request/response pair recorded into a channel log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpLog {
    pub url: String,
    /// Zero when no response was received (connection failure, timeout).
    pub status_code: u16,
    pub request: String,
    pub response: String,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub retries: u32,
    pub created_on: DateTime<Utc>,
}

/// A structured error attached to a channel log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelLog {
    pub uuid: Uuid,
    pub log_type: ChannelLogType,
    pub channel_uuid: Uuid,
    #[serde(default)]
    pub msg_id: Option<MsgId>,
    #[serde(default)]
    pub event_uuid: Option<Uuid>,
    pub http_logs: Vec<HttpLog>,
    pub errors: Vec<LogError>,
    pub elapsed_ms: u64,
    pub created_on: DateTime<Utc>,

    #[serde(skip)]
    redact_values: Vec<String>,
    #[serde(skip, default = "Instant::now")]
    started: Instant,
}

impl ChannelLog {
    pub fn new(log_type: ChannelLogType, channel: &Channel, redact_values: Vec<String>) -> Self {
        ChannelLog {
            uuid: Uuid::new_v4(),
            log_type,
            channel_uuid: channel.uuid,
            msg_id: None,
            event_uuid: None,
            http_logs: Vec::new(),
            errors: Vec::new(),
            elapsed_ms: 0,
            created_on: Utc::now(),
            redact_values,
            started: Instant::now(),
        }
    }

    /// Records an HTTP trace, redacting configured secrets first.
    pub fn http(&mut self, mut log: HttpLog) {
        log.url = redact(&log.url, &self.redact_values);
        log.request = redact(&log.request, &self.redact_values);
        log.response = redact(&log.response, &self.redact_values);
        self.http_logs.push(log);
    }

    pub fn error(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.errors.push(LogError {
            code: code.into(),
            message: redact(&message.into(), &self.redact_values),
        });
    }

    /// Attaches a send error with its taxonomy code.
    pub fn send_error(&mut self, err: &SendError) {
        self.error(err.code(), err.to_string());
    }

    pub fn attach_msg(&mut self, id: MsgId) {
        self.msg_id = Some(id);
    }

    pub fn attach_event(&mut self, uuid: Uuid) {
        self.event_uuid = Some(uuid);
    }

    pub fn is_error(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Finalizes the elapsed time; call once at the end of the operation.
    pub fn end(&mut self) {
        self.elapsed_ms = self.started.elapsed().as_millis() as u64;
    }
}

fn redact(s: &str, values: &[String]) -> String {
    let mut out = s.to_string();
    for value in values {
        if !value.is_empty() {
            out = out.replace(value, REDACTION_MASK);
        }
    }
    out
}
