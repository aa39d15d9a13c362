//! Webhook dispatch.
//!
//! One generic entry point serves `/c/{tag}/{uuid}/{verb}` for every
//! registered handler: resolve the tag, load the channel, wrap the call in
//! a channel log with the handler's redactions, invoke the handler, persist
//! whatever it produced and flush the log — even when the handler fails or
//! panics.

use std::time::Instant;

use axum::extract::{OriginalUri, Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use tracing::{debug, error, warn};
use uuid::Uuid;

use courier_common::{ChannelLog, ChannelLogType, ChannelType, HttpLog};

use crate::api::AppState;
use crate::handler::{HandlerError, ReceiveOutcome, ReceivedEvent, WebhookRequest};

/// How a dispatch response is rendered.
enum ResponseKind {
    Json,
    Text,
}

pub async fn handle_webhook(
    State(state): State<AppState>,
    Path((tag, uuid, verb)): Path<(String, String, String)>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let channel_type = ChannelType::new(tag.as_str());
    let Some(handler) = state.registry.resolve(&channel_type) else {
        debug!(tag = %tag, "no handler for channel type");
        return (StatusCode::NOT_FOUND, "unknown channel type").into_response();
    };

    let Ok(channel_uuid) = Uuid::parse_str(&uuid) else {
        return (StatusCode::NOT_FOUND, "invalid channel uuid").into_response();
    };

    let channel = match state.cache.get(state.backend.as_ref(), channel_uuid).await {
        Ok(Some(channel)) => channel,
        Ok(None) => {
            debug!(channel = %channel_uuid, "channel not found or deleted");
            return (StatusCode::NOT_FOUND, "channel not found").into_response();
        }
        Err(e) => {
            error!(channel = %channel_uuid, error = %e, "channel lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "unable to look up channel").into_response();
        }
    };

    if channel.channel_type != channel_type {
        return (StatusCode::NOT_FOUND, "channel type mismatch").into_response();
    }

    let mut clog = ChannelLog::new(
        ChannelLogType::from_verb(&verb),
        &channel,
        handler.redact_values(&channel),
    );

    let request = WebhookRequest {
        method: method.to_string(),
        url: format!("https://{}{}", state.domain, uri),
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("<binary>").to_string()))
            .collect(),
        body,
    };

    let started = Instant::now();
    let outcome = std::panic::AssertUnwindSafe(handler.receive(&channel, &verb, &request, &mut clog))
        .catch_unwind()
        .await;

    let (status, response_body, kind) = match outcome {
        Ok(Ok(ReceiveOutcome::Events(mut events))) => {
            // resolve contact names the webhook did not carry inline
            for event in &mut events {
                if let ReceivedEvent::Msg(msg) = event {
                    if msg.contact_name.is_none() {
                        msg.contact_name = handler.describe_urn(&channel, &msg.urn).await;
                    }
                }
            }

            match write_events(&state, &mut events, &mut clog).await {
                Ok(data) => match handler.write_success_response(&events) {
                    Some((status, body)) => (status, body, ResponseKind::Text),
                    None => (
                        StatusCode::OK,
                        json!({"message": "Events Handled", "data": data}).to_string(),
                        ResponseKind::Json,
                    ),
                },
                Err(reason) => {
                    clog.error("storage", &reason);
                    (StatusCode::INTERNAL_SERVER_ERROR, reason, ResponseKind::Text)
                }
            }
        }
        Ok(Ok(ReceiveOutcome::Ignored(reason))) => (
            StatusCode::OK,
            format!("Ignored: {reason}"),
            ResponseKind::Text,
        ),
        Ok(Err(HandlerError::UnknownVerb(verb))) => (
            StatusCode::NOT_FOUND,
            format!("unknown verb: {verb}"),
            ResponseKind::Text,
        ),
        Ok(Err(HandlerError::Request(reason))) => {
            clog.error("request", &reason);
            (StatusCode::BAD_REQUEST, reason, ResponseKind::Text)
        }
        Err(_) => {
            error!(channel = %channel.uuid, verb = %verb, "handler panicked");
            clog.error("internal_error", "handler panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
                ResponseKind::Text,
            )
        }
    };

    // the webhook itself is the first trace in the log
    clog.http(HttpLog {
        url: request.url.clone(),
        status_code: status.as_u16(),
        request: format!(
            "{} {}\n{}\n\n{}",
            request.method,
            request.url,
            request
                .headers
                .iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect::<Vec<_>>()
                .join("\n"),
            request.body
        ),
        response: response_body.clone(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        retries: 0,
        created_on: Utc::now(),
    });
    clog.end();

    if let Err(e) = state.backend.write_channel_log(clog).await {
        warn!(channel = %channel.uuid, error = %e, "failed to queue channel log");
    }

    match kind {
        ResponseKind::Json => (
            status,
            [("content-type", "application/json")],
            response_body,
        )
            .into_response(),
        ResponseKind::Text => (status, response_body).into_response(),
    }
}

/// Persists handler events, returning the response data entries.
async fn write_events(
    state: &AppState,
    events: &mut [ReceivedEvent],
    clog: &mut ChannelLog,
) -> Result<Vec<serde_json::Value>, String> {
    let mut data = Vec::with_capacity(events.len());

    for event in events.iter_mut() {
        match event {
            ReceivedEvent::Msg(msg) => {
                msg.channel_log_uuid = Some(clog.uuid);
                state
                    .backend
                    .write_msg(msg)
                    .await
                    .map_err(|e| format!("error writing message: {e}"))?;
                clog.attach_msg(msg.id);
                data.push(json!({
                    "type": "msg",
                    "msg_uuid": msg.uuid,
                    "msg_id": msg.id.0,
                    "urn": msg.urn.as_str(),
                }));
            }
            ReceivedEvent::Status(update) => {
                state
                    .backend
                    .write_status(update.clone())
                    .await
                    .map_err(|e| format!("error writing status: {e}"))?;
                data.push(json!({
                    "type": "status",
                    "status": update.status,
                    "msg_id": update.msg_id.map(|id| id.0),
                    "external_id": update.external_id,
                }));
            }
            ReceivedEvent::Event(channel_event) => {
                channel_event.channel_log_uuid = Some(clog.uuid);
                state
                    .backend
                    .write_event(channel_event)
                    .await
                    .map_err(|e| format!("error writing event: {e}"))?;
                clog.attach_event(channel_event.uuid);
                data.push(json!({
                    "type": "event",
                    "event_uuid": channel_event.uuid,
                    "event_type": channel_event.event_type,
                    "urn": channel_event.urn.as_str(),
                }));
            }
        }
    }

    Ok(data)
}
