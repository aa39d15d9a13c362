//! The HTTP surface.
//!
//! Three routes: the generic webhook entry every handler is dispatched
//! through, a readiness endpoint reporting queue depth and dependency
//! connectivity, and a human-readable index of registered handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use courier_backend::Backend;
use courier_queue::PriorityQueue;

use crate::cache::ChannelCache;
use crate::dispatch::handle_webhook;
use crate::registry::HandlerRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<HandlerRegistry>,
    pub cache: Arc<ChannelCache>,
    pub backend: Arc<dyn Backend>,
    /// The outbound queue, for depth reporting; absent in tests.
    pub queue: Option<Arc<PriorityQueue>>,
    /// Domain this instance serves webhooks on.
    pub domain: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/status", get(status_handler))
        .route("/c/:tag/:uuid/:verb", get(handle_webhook).post(handle_webhook))
        .with_state(state)
}

async fn status_handler(State(state): State<AppState>) -> Response {
    let backend_ok = state.backend.health().await.is_ok();

    let queue_depth = match &state.queue {
        Some(queue) => queue.size().await.ok(),
        None => None,
    };
    let queue_ok = state.queue.is_none() || queue_depth.is_some();

    let healthy = backend_ok && queue_ok;
    let body = json!({
        "status": if healthy { "ok" } else { "unavailable" },
        "backend": backend_ok,
        "queue_depth": queue_depth,
        "handlers": state.registry.len(),
    });

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

async fn index_handler(State(state): State<AppState>) -> Html<String> {
    let mut page = String::from("<html><head><title>courier</title></head><body><h1>courier</h1><ul>");
    for handler in state.registry.handlers() {
        page.push_str(&format!(
            "<li>{} ({})</li>",
            handler.name(),
            handler.channel_type()
        ));
    }
    page.push_str("</ul></body></html>");
    Html(page)
}
