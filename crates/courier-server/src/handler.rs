//! The handler contract.
//!
//! Every provider adapter implements [`ChannelHandler`]: parse inbound
//! webhooks into messages, events and status updates, render outbound
//! messages into the provider's wire format, and declare which configured
//! values must be redacted from persisted HTTP traces. The dispatch layer
//! and the sender pool are the only callers.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;

use courier_common::{
    Channel, ChannelEvent, ChannelLog, ChannelType, MsgIn, MsgOut, MsgStatus, SendError,
    StatusUpdate, Urn,
};

#[derive(Debug, Error)]
pub enum HandlerError {
    /// The webhook could not be understood; becomes a 400 with the reason.
    #[error("{0}")]
    Request(String),

    /// The handler does not serve this verb; becomes a 404.
    #[error("unknown verb: {0}")]
    UnknownVerb(String),
}

impl HandlerError {
    pub fn request(reason: impl Into<String>) -> Self {
        HandlerError::Request(reason.into())
    }
}

/// The inbound webhook as the dispatch layer hands it to a handler.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl WebhookRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Query string parameters.
    pub fn query(&self) -> HashMap<String, String> {
        let query = self.url.split_once('?').map(|(_, q)| q).unwrap_or("");
        serde_urlencoded::from_str::<Vec<(String, String)>>(query)
            .map(|pairs| pairs.into_iter().collect())
            .unwrap_or_default()
    }

    /// Form-encoded body fields merged over query parameters, the common
    /// shape for SMS aggregator callbacks.
    pub fn form(&self) -> HashMap<String, String> {
        let mut fields = self.query();
        if let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(&self.body) {
            fields.extend(pairs);
        }
        fields
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_str(&self.body)
            .map_err(|e| HandlerError::Request(format!("unable to parse request JSON: {e}")))
    }
}

/// What a receive produced.
#[derive(Debug)]
pub enum ReceivedEvent {
    Msg(MsgIn),
    Status(StatusUpdate),
    Event(ChannelEvent),
}

#[derive(Debug)]
pub enum ReceiveOutcome {
    /// Zero or more events to persist.
    Events(Vec<ReceivedEvent>),
    /// The webhook is valid but carries nothing for us (echoes, read
    /// receipts the channel ignores); answered with 200 Ignored.
    Ignored(String),
}

impl ReceiveOutcome {
    pub fn ignored(reason: impl Into<String>) -> Self {
        ReceiveOutcome::Ignored(reason.into())
    }
}

/// Outcome of a successful send.
#[derive(Debug)]
pub struct SendResult {
    /// Status to record; `Wired` unless the provider already confirmed
    /// delivery to the handset side.
    pub status: MsgStatus,
    /// The provider's id for the sent message, used to match later
    /// delivery receipts.
    pub external_id: Option<String>,
    /// A normalized URN discovered during the send (e.g. WhatsApp returning
    /// the canonical form of the number).
    pub new_urn: Option<Urn>,
}

impl Default for SendResult {
    fn default() -> Self {
        SendResult {
            status: MsgStatus::Wired,
            external_id: None,
            new_urn: None,
        }
    }
}

impl SendResult {
    pub fn wired(external_id: impl Into<String>) -> Self {
        SendResult {
            status: MsgStatus::Wired,
            external_id: Some(external_id.into()),
            new_urn: None,
        }
    }

    pub fn sent(external_id: impl Into<String>) -> Self {
        SendResult {
            status: MsgStatus::Sent,
            external_id: Some(external_id.into()),
            new_urn: None,
        }
    }
}

#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// The tag this handler registers under.
    fn channel_type(&self) -> ChannelType;

    /// Human-readable provider name, shown on the index page.
    fn name(&self) -> &'static str;

    /// Handles one webhook for the given verb (`receive`, `status`, ...).
    async fn receive(
        &self,
        channel: &Channel,
        verb: &str,
        request: &WebhookRequest,
        clog: &mut ChannelLog,
    ) -> Result<ReceiveOutcome, HandlerError>;

    /// Performs one outbound send, recording HTTP traces into the log.
    async fn send(
        &self,
        channel: &Channel,
        msg: &MsgOut,
        clog: &mut ChannelLog,
    ) -> Result<SendResult, SendError>;

    /// Values that must be string-replaced in persisted HTTP traces
    /// (auth tokens, shared secrets, basic-auth strings).
    fn redact_values(&self, _channel: &Channel) -> Vec<String> {
        Vec::new()
    }

    /// Providers that require a specific success body (fixed XML, empty
    /// 200) override this; `None` gets the default JSON envelope.
    fn write_success_response(&self, _events: &[ReceivedEvent]) -> Option<(StatusCode, String)> {
        None
    }

    /// Fetches the contact name when it is not inline in the webhook.
    async fn describe_urn(&self, _channel: &Channel, _urn: &Urn) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_merges_query_and_body() {
        let request = WebhookRequest {
            method: "POST".to_string(),
            url: "https://gw.example.com/c/ex/uuid/receive?from=%2B250788383383&text=query".to_string(),
            headers: vec![("Content-Type".to_string(), "application/x-www-form-urlencoded".to_string())],
            body: "text=body+wins&id=ext-9".to_string(),
        };

        let form = request.form();
        assert_eq!(form.get("from").map(String::as_str), Some("+250788383383"));
        assert_eq!(form.get("text").map(String::as_str), Some("body wins"));
        assert_eq!(form.get("id").map(String::as_str), Some("ext-9"));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = WebhookRequest {
            method: "POST".to_string(),
            url: "https://gw.example.com/x".to_string(),
            headers: vec![("X-Api-Key".to_string(), "sesame".to_string())],
            body: String::new(),
        };
        assert_eq!(request.header("x-api-key"), Some("sesame"));
        assert_eq!(request.header("missing"), None);
    }

    #[test]
    fn test_json_parse_error_is_request_error() {
        let request = WebhookRequest {
            method: "POST".to_string(),
            url: "https://gw.example.com/x".to_string(),
            headers: vec![],
            body: "{not json".to_string(),
        };
        let result: Result<serde_json::Value, _> = request.json();
        assert!(matches!(result, Err(HandlerError::Request(_))));
    }
}
