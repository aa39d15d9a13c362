//! Shared adapter plumbing.
//!
//! Helpers most handlers need: splitting long texts into provider-sized
//! parts, building the callback URLs handed to providers for delivery
//! receipts, and validating the basic-auth credentials aggregators present
//! on their webhooks.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use courier_common::channel::config_keys;
use courier_common::Channel;

use crate::handler::{HandlerError, WebhookRequest};

/// Default maximum part length when the channel does not configure one.
pub const DEFAULT_MAX_MSG_LENGTH: usize = 160;

/// Splits message text into parts no longer than `max_length` characters,
/// breaking on the last space inside the window when one exists so words
/// survive intact. Always returns at least one part.
pub fn split_msg_text(text: &str, max_length: usize) -> Vec<String> {
    let max_length = max_length.max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_length {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let remaining = chars.len() - start;
        if remaining <= max_length {
            parts.push(chars[start..].iter().collect());
            break;
        }

        let window = &chars[start..start + max_length];
        let split_at = window
            .iter()
            .rposition(|c| *c == ' ')
            .filter(|pos| *pos > 0)
            .unwrap_or(max_length);

        parts.push(chars[start..start + split_at].iter().collect::<String>().trim_end().to_string());
        start += split_at;
        // swallow the space we broke on
        while start < chars.len() && chars[start] == ' ' {
            start += 1;
        }
    }
    parts
}

/// The maximum part length for a channel, from its config.
pub fn max_msg_length(channel: &Channel) -> usize {
    channel
        .config_int("max_length")
        .map(|len| len.max(1) as usize)
        .unwrap_or(DEFAULT_MAX_MSG_LENGTH)
}

/// Builds the URL a provider should call back on for this channel,
/// preferring the channel's own callback domain over the instance default.
pub fn callback_url(channel: &Channel, default_domain: &str, verb: &str) -> String {
    let domain = channel
        .callback_domain
        .as_deref()
        .unwrap_or(default_domain);
    format!(
        "https://{}/c/{}/{}/{}",
        domain,
        channel.channel_type.as_str().to_lowercase(),
        channel.uuid,
        verb
    )
}

/// Validates the HTTP basic-auth credentials on a webhook against the
/// channel's configured username/password pair. Channels without
/// credentials configured accept everything.
pub fn validate_basic_auth(channel: &Channel, request: &WebhookRequest) -> Result<(), HandlerError> {
    let (Some(username), Some(password)) = (
        channel.config_string(config_keys::USERNAME),
        channel.config_string(config_keys::PASSWORD),
    ) else {
        return Ok(());
    };

    let expected = format!(
        "Basic {}",
        STANDARD.encode(format!("{username}:{password}"))
    );

    match request.header("authorization") {
        Some(presented) if presented == expected => Ok(()),
        _ => Err(HandlerError::request("invalid authorization")),
    }
}

/// The basic-auth string for a channel, for inclusion in redaction lists.
pub fn basic_auth_redaction(channel: &Channel) -> Option<String> {
    let username = channel.config_string(config_keys::USERNAME)?;
    let password = channel.config_string(config_keys::PASSWORD)?;
    Some(STANDARD.encode(format!("{username}:{password}")))
}
