//! Traced HTTP for handlers.
//!
//! Adapters make their provider calls through [`request_with_log`] so every
//! request/response pair lands in the channel log (redacted) and transport
//! failures map uniformly onto the send error taxonomy. Response statuses
//! are returned as data; classifying them is the handler's job.

use std::time::Instant;

use chrono::Utc;
use courier_common::{ChannelLog, HttpLog, SendError};

/// A completed, fully-read HTTP exchange.
#[derive(Debug)]
pub struct Traced {
    pub status: u16,
    pub body: String,
}

impl Traced {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, SendError> {
        serde_json::from_str(&self.body).map_err(|e| SendError::ResponseUnparseable(e.to_string()))
    }
}

/// Executes a request, recording the exchange into the channel log. Returns
/// `ConnectionFailed` for transport-level failures; any HTTP response, 5xx
/// included, comes back as a [`Traced`] for the caller to classify.
pub async fn request_with_log(
    client: &reqwest::Client,
    request: reqwest::RequestBuilder,
    clog: &mut ChannelLog,
) -> Result<Traced, SendError> {
    let request = request
        .build()
        .map_err(|e| SendError::ConnectionFailed(format!("invalid request: {e}")))?;

    let url = request.url().to_string();
    let request_dump = dump_request(&request);
    let started = Instant::now();

    match client.execute(request).await {
        Ok(response) => {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            clog.http(HttpLog {
                url,
                status_code: status,
                request: request_dump,
                response: body.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
                retries: 0,
                created_on: Utc::now(),
            });
            Ok(Traced { status, body })
        }
        Err(e) => {
            clog.http(HttpLog {
                url,
                status_code: 0,
                request: request_dump,
                response: String::new(),
                elapsed_ms: started.elapsed().as_millis() as u64,
                retries: 0,
                created_on: Utc::now(),
            });
            let reason = if e.is_timeout() {
                "request timed out".to_string()
            } else if e.is_connect() {
                format!("connection error: {e}")
            } else {
                format!("request failed: {e}")
            };
            Err(SendError::ConnectionFailed(reason))
        }
    }
}

fn dump_request(request: &reqwest::Request) -> String {
    let mut dump = format!("{} {}\n", request.method(), request.url());
    for (name, value) in request.headers() {
        dump.push_str(name.as_str());
        dump.push_str(": ");
        dump.push_str(value.to_str().unwrap_or("<binary>"));
        dump.push('\n');
    }
    dump.push('\n');
    if let Some(body) = request.body().and_then(|b| b.as_bytes()) {
        dump.push_str(&String::from_utf8_lossy(body));
    }
    dump
}
