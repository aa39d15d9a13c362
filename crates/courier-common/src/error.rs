//! The send error taxonomy.
//!
//! Every failure a handler can hit while sending maps onto one of these
//! variants; the sender pool turns them into status updates (`errored` for
//! retryable failures, `failed` for terminal ones) and the machine code is
//! attached to the channel log.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SendError {
    /// Required adapter configuration is missing or invalid. Terminal.
    #[error("missing channel config: {0}")]
    ChannelConfig(String),

    /// Transport-level or DNS failure. Retryable.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Non-2xx response status. Retryable until the retry budget runs out.
    #[error("unexpected response status: {0}")]
    ResponseStatus(u16),

    /// A 2xx response whose body did not parse. Retryable.
    #[error("unparseable response: {0}")]
    ResponseUnparseable(String),

    /// Parsed body did not match the provider's success pattern. Retryable.
    #[error("unexpected response content: {0}")]
    ResponseContent(String),

    /// A named response field held an unexpected value. Retryable.
    #[error("unexpected value for {field}: {value}")]
    ResponseValueUnexpected { field: String, value: String },

    /// Provider-reported error with its own code; the adapter decides
    /// whether it is retryable from the provider's documentation.
    #[error("external error {code}: {description}")]
    External {
        code: String,
        description: String,
        retryable: bool,
    },

    /// Adapter-determined terminal failure.
    #[error("{code}: {description}")]
    FailedWithReason { code: String, description: String },

    /// The provider cannot carry one of the message's attachments. Terminal.
    #[error("unsupported media: {0}")]
    MediaUnsupported(String),

    /// The provider told us to slow down. Retryable.
    #[error("rate limited by provider")]
    RateLimited,

    /// The message URN is not valid for this provider. Terminal.
    #[error("invalid URN: {0}")]
    BadUrn(String),
}

impl SendError {
    /// The short machine code recorded in channel logs.
    pub fn code(&self) -> &'static str {
        match self {
            SendError::ChannelConfig(_) => "channel_config",
            SendError::ConnectionFailed(_) => "connection_failed",
            SendError::ResponseStatus(_) => "response_status",
            SendError::ResponseUnparseable(_) => "response_unparseable",
            SendError::ResponseContent(_) => "response_content",
            SendError::ResponseValueUnexpected { .. } => "response_value_unexpected",
            SendError::External { .. } => "external",
            SendError::FailedWithReason { .. } => "failed",
            SendError::MediaUnsupported(_) => "media_unsupported",
            SendError::RateLimited => "rate_limited",
            SendError::BadUrn(_) => "bad_urn",
        }
    }

    /// Whether the send should be retried (via an `errored` status) or
    /// marked terminally `failed`.
    pub fn is_retryable(&self) -> bool {
        match self {
            SendError::ConnectionFailed(_)
            | SendError::ResponseStatus(_)
            | SendError::ResponseUnparseable(_)
            | SendError::ResponseContent(_)
            | SendError::ResponseValueUnexpected { .. }
            | SendError::RateLimited => true,
            SendError::External { retryable, .. } => *retryable,
            SendError::ChannelConfig(_)
            | SendError::FailedWithReason { .. }
            | SendError::MediaUnsupported(_)
            | SendError::BadUrn(_) => false,
        }
    }
}
