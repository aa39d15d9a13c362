//! Webhook Dispatch Tests
//!
//! Tests for:
//! - Tag and channel resolution (404 paths)
//! - Event persistence and the default JSON envelope
//! - Inbound dedupe by external id
//! - Handler error / ignored / panic semantics
//! - Channel log capture with redaction
//! - Status and index endpoints

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use parking_lot::Mutex;
use tower::ServiceExt;
use uuid::Uuid;

use courier_backend::{Backend, Result as BackendResult};
use courier_common::{
    Channel, ChannelEvent, ChannelEventType, ChannelLog, ChannelType, MsgId, MsgIn, MsgStatus,
    SendError, StatusUpdate, Urn,
};
use courier_server::{
    create_router, AppState, ChannelCache, ChannelHandler, HandlerError, HandlerRegistry,
    ReceiveOutcome, ReceivedEvent, SendResult, WebhookRequest,
};

const CHANNEL_UUID: &str = "dbc126ed-66bc-4e28-b67b-81dc3327c95d";

#[derive(Default)]
struct MockBackend {
    channels: HashMap<Uuid, Channel>,
    msgs: Mutex<Vec<MsgIn>>,
    statuses: Mutex<Vec<StatusUpdate>>,
    events: Mutex<Vec<ChannelEvent>>,
    clogs: Mutex<Vec<ChannelLog>>,
    dedupe: Mutex<HashMap<String, i64>>,
    sent: Mutex<HashSet<i64>>,
    next_id: AtomicI64,
}

impl MockBackend {
    fn with_channel(channel: Channel) -> Self {
        let mut backend = MockBackend {
            next_id: AtomicI64::new(10000),
            ..Default::default()
        };
        backend.channels.insert(channel.uuid, channel);
        backend
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn channel(&self, uuid: Uuid) -> BackendResult<Option<Channel>> {
        Ok(self.channels.get(&uuid).cloned())
    }

    async fn write_msg(&self, msg: &mut MsgIn) -> BackendResult<()> {
        let fingerprint = msg.fingerprint();
        let mut dedupe = self.dedupe.lock();
        if let Some(prior) = dedupe.get(&fingerprint) {
            msg.id = MsgId(*prior);
            return Ok(());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        msg.id = MsgId(id);
        dedupe.insert(fingerprint, id);
        self.msgs.lock().push(msg.clone());
        Ok(())
    }

    async fn write_status(&self, update: StatusUpdate) -> BackendResult<()> {
        self.statuses.lock().push(update);
        Ok(())
    }

    async fn write_event(&self, event: &mut ChannelEvent) -> BackendResult<()> {
        event.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn write_channel_log(&self, clog: ChannelLog) -> BackendResult<()> {
        self.clogs.lock().push(clog);
        Ok(())
    }

    async fn msg_was_sent(&self, id: MsgId) -> BackendResult<bool> {
        Ok(self.sent.lock().contains(&id.0))
    }

    async fn mark_msg_sent(&self, id: MsgId, _external_id: Option<&str>) -> BackendResult<()> {
        self.sent.lock().insert(id.0);
        Ok(())
    }

    async fn health(&self) -> BackendResult<()> {
        Ok(())
    }
}

struct MockHandler;

#[async_trait]
impl ChannelHandler for MockHandler {
    fn channel_type(&self) -> ChannelType {
        ChannelType::new("MK")
    }

    fn name(&self) -> &'static str {
        "Mock"
    }

    async fn receive(
        &self,
        channel: &Channel,
        verb: &str,
        request: &WebhookRequest,
        _clog: &mut ChannelLog,
    ) -> Result<ReceiveOutcome, HandlerError> {
        match verb {
            "receive" => {
                let form = request.form();
                let from = form
                    .get("from")
                    .ok_or_else(|| HandlerError::request("missing 'from' parameter"))?;
                let text = form
                    .get("text")
                    .ok_or_else(|| HandlerError::request("missing 'text' parameter"))?;
                let urn = Urn::from_tel(from, channel.country.as_deref())
                    .map_err(|e| HandlerError::request(e.to_string()))?;

                let mut msg = MsgIn::new(channel, urn, text.clone(), Utc::now());
                if let Some(id) = form.get("id") {
                    msg = msg.with_external_id(id.clone());
                }
                Ok(ReceiveOutcome::Events(vec![ReceivedEvent::Msg(msg)]))
            }
            "status" => {
                let form = request.form();
                let id = form
                    .get("id")
                    .ok_or_else(|| HandlerError::request("missing 'id' parameter"))?;
                Ok(ReceiveOutcome::Events(vec![ReceivedEvent::Status(
                    StatusUpdate::by_external_id(channel.uuid, id.clone(), MsgStatus::Delivered),
                )]))
            }
            "stopped" => {
                let form = request.form();
                let from = form
                    .get("from")
                    .ok_or_else(|| HandlerError::request("missing 'from' parameter"))?;
                let urn = Urn::from_tel(from, None)
                    .map_err(|e| HandlerError::request(e.to_string()))?;
                Ok(ReceiveOutcome::Events(vec![ReceivedEvent::Event(
                    ChannelEvent::new(channel, ChannelEventType::StopContact, urn, Utc::now()),
                )]))
            }
            "noop" => Ok(ReceiveOutcome::ignored("no interesting content")),
            "boom" => panic!("handler exploded"),
            other => Err(HandlerError::UnknownVerb(other.to_string())),
        }
    }

    async fn send(
        &self,
        _channel: &Channel,
        _msg: &courier_common::MsgOut,
        _clog: &mut ChannelLog,
    ) -> Result<SendResult, SendError> {
        Ok(SendResult::default())
    }

    fn redact_values(&self, _channel: &Channel) -> Vec<String> {
        vec!["sekrit".to_string()]
    }
}

fn test_channel() -> Channel {
    Channel {
        uuid: Uuid::parse_str(CHANNEL_UUID).unwrap(),
        channel_type: ChannelType::new("MK"),
        address: "2020".to_string(),
        country: Some("RW".to_string()),
        schemes: vec!["tel".to_string()],
        config: serde_json::Map::new(),
        org_id: 1,
        callback_domain: None,
    }
}

fn test_state() -> (AppState, Arc<MockBackend>) {
    let backend = Arc::new(MockBackend::with_channel(test_channel()));
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(MockHandler));

    let state = AppState {
        registry: Arc::new(registry),
        cache: Arc::new(ChannelCache::new(Duration::from_secs(60))),
        backend: backend.clone(),
        queue: None,
        domain: "courier.example.com".to_string(),
    };
    (state, backend)
}

async fn request(
    state: &AppState,
    method: &str,
    path: &str,
    body: &str,
) -> (StatusCode, String) {
    let app = create_router(state.clone());
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(path)
                .header("content-type", "application/x-www-form-urlencoded")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

#[tokio::test]
async fn test_unknown_channel_type_is_404() {
    let (state, _) = test_state();
    let (status, _) = request(&state, "POST", &format!("/c/zz/{CHANNEL_UUID}/receive"), "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_channel_is_404() {
    let (state, backend) = test_state();
    let other = Uuid::new_v4();
    let (status, body) = request(&state, "POST", &format!("/c/mk/{other}/receive"), "from=%2B250788383383&text=hi").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "channel not found");
    assert!(backend.msgs.lock().is_empty());
}

#[tokio::test]
async fn test_receive_persists_msg() {
    let (state, backend) = test_state();
    let (status, body) = request(
        &state,
        "POST",
        &format!("/c/mk/{CHANNEL_UUID}/receive"),
        "from=%2B250788383383&text=hello+world&id=ext-1",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("Events Handled"));

    let msgs = backend.msgs.lock();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].text, "hello world");
    assert_eq!(msgs[0].urn.as_str(), "tel:+250788383383");
    assert_eq!(msgs[0].external_id.as_deref(), Some("ext-1"));
    assert!(!msgs[0].id.is_nil());
    assert!(msgs[0].channel_log_uuid.is_some());

    // the channel log was flushed and carries the webhook trace
    let clogs = backend.clogs.lock();
    assert_eq!(clogs.len(), 1);
    assert_eq!(clogs[0].msg_id, Some(msgs[0].id));
    assert_eq!(clogs[0].http_logs.len(), 1);
    assert_eq!(clogs[0].http_logs[0].status_code, 200);
}

#[tokio::test]
async fn test_duplicate_receive_returns_same_id() {
    let (state, backend) = test_state();
    let path = format!("/c/mk/{CHANNEL_UUID}/receive");
    let body = "from=%2B250788383383&text=hello&id=dup-1";

    let (status_1, body_1) = request(&state, "POST", &path, body).await;
    let (status_2, body_2) = request(&state, "POST", &path, body).await;

    assert_eq!(status_1, StatusCode::OK);
    assert_eq!(status_2, StatusCode::OK);

    // both responses carry the same msg id, only one row was written
    let extract_id = |s: &str| {
        let value: serde_json::Value = serde_json::from_str(s).unwrap();
        value["data"][0]["msg_id"].as_i64().unwrap()
    };
    assert_eq!(extract_id(&body_1), extract_id(&body_2));
    assert_eq!(backend.msgs.lock().len(), 1);
}

#[tokio::test]
async fn test_status_verb_writes_update() {
    let (state, backend) = test_state();
    let (status, _) = request(
        &state,
        "POST",
        &format!("/c/mk/{CHANNEL_UUID}/status"),
        "id=prov-77",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let statuses = backend.statuses.lock();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].external_id.as_deref(), Some("prov-77"));
    assert_eq!(statuses[0].status, MsgStatus::Delivered);
}

#[tokio::test]
async fn test_stop_verb_writes_event() {
    let (state, backend) = test_state();
    let (status, _) = request(
        &state,
        "POST",
        &format!("/c/mk/{CHANNEL_UUID}/stopped"),
        "from=%2B250788383383",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let events = backend.events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, ChannelEventType::StopContact);
}

#[tokio::test]
async fn test_bad_request_is_400_with_reason() {
    let (state, backend) = test_state();
    let (status, body) = request(
        &state,
        "POST",
        &format!("/c/mk/{CHANNEL_UUID}/receive"),
        "text=no-sender",
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "missing 'from' parameter");

    // the channel log is still flushed, marked as an error
    let clogs = backend.clogs.lock();
    assert_eq!(clogs.len(), 1);
    assert!(clogs[0].is_error());
}

#[tokio::test]
async fn test_ignored_is_200() {
    let (state, _) = test_state();
    let (status, body) = request(&state, "POST", &format!("/c/mk/{CHANNEL_UUID}/noop"), "").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with("Ignored"));
}

#[tokio::test]
async fn test_unknown_verb_is_404() {
    let (state, _) = test_state();
    let (status, _) = request(&state, "POST", &format!("/c/mk/{CHANNEL_UUID}/frobnicate"), "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_handler_panic_is_500_and_logged() {
    let (state, backend) = test_state();
    let (status, _) = request(&state, "POST", &format!("/c/mk/{CHANNEL_UUID}/boom"), "").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let clogs = backend.clogs.lock();
    assert_eq!(clogs.len(), 1);
    assert!(clogs[0].errors.iter().any(|e| e.code == "internal_error"));
}

#[tokio::test]
async fn test_webhook_trace_is_redacted() {
    let (state, backend) = test_state();
    let (status, _) = request(
        &state,
        "POST",
        &format!("/c/mk/{CHANNEL_UUID}/receive"),
        "from=%2B250788383383&text=the+password+is+sekrit",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let clogs = backend.clogs.lock();
    let trace = &clogs[0].http_logs[0];
    assert!(!trace.request.contains("sekrit"));
    assert!(trace.request.contains("**********"));
}

#[tokio::test]
async fn test_status_endpoint() {
    let (state, _) = test_state();
    let (status, body) = request(&state, "GET", "/status", "").await;
    assert_eq!(status, StatusCode::OK);
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["status"], "ok");
    assert_eq!(value["handlers"], 1);
}

#[tokio::test]
async fn test_index_lists_handlers() {
    let (state, _) = test_state();
    let (status, body) = request(&state, "GET", "/", "").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("Mock"));
    assert!(body.contains("MK"));
}
