//! Sender pool and foreman.
//!
//! A fixed pool of workers drains the prioritized channel queue: pop, look
//! up the channel, check the sent-marker dedupe, invoke the handler's send
//! under the channel's timeout, record the resulting status through the
//! committer, and always complete the queue token — a panicking handler
//! must never stall a channel's in-flight counter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use courier_backend::Backend;
use courier_common::channel::config_keys;
use courier_common::{Channel, ChannelLog, ChannelLogType, MsgOut, MsgStatus, StatusUpdate};
use courier_queue::{ChannelToken, PopResult, PriorityQueue};

use crate::cache::ChannelCache;
use crate::registry::HandlerRegistry;

const EMPTY_SLEEP: Duration = Duration::from_millis(100);
const DEFAULT_RETRY_BUDGET: i64 = 3;

/// The slice of the queue the sender pool needs; concrete in production,
/// mockable in tests.
#[async_trait]
pub trait MsgQueue: Send + Sync {
    async fn pop(&self) -> courier_queue::Result<PopResult>;
    async fn complete(&self, token: &ChannelToken) -> courier_queue::Result<()>;
}

#[async_trait]
impl MsgQueue for PriorityQueue {
    async fn pop(&self) -> courier_queue::Result<PopResult> {
        PriorityQueue::pop(self).await
    }

    async fn complete(&self, token: &ChannelToken) -> courier_queue::Result<()> {
        PriorityQueue::complete(self, token).await
    }
}

#[derive(Debug, Clone)]
pub struct SenderPoolConfig {
    pub workers: usize,
    pub default_send_timeout: Duration,
}

impl Default for SenderPoolConfig {
    fn default() -> Self {
        Self {
            workers: 32,
            default_send_timeout: Duration::from_secs(30),
        }
    }
}

/// Owns the worker pool for one queue type.
pub struct Foreman {
    queue: Arc<dyn MsgQueue>,
    backend: Arc<dyn Backend>,
    registry: Arc<HandlerRegistry>,
    cache: Arc<ChannelCache>,
    config: SenderPoolConfig,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Foreman {
    pub fn new(
        queue: Arc<dyn MsgQueue>,
        backend: Arc<dyn Backend>,
        registry: Arc<HandlerRegistry>,
        cache: Arc<ChannelCache>,
        config: SenderPoolConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Foreman {
            queue,
            backend,
            registry,
            cache,
            config,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock();
        for worker_id in 0..self.config.workers {
            let foreman = self.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(worker_loop(worker_id, foreman, shutdown_rx)));
        }
        info!(workers = self.config.workers, "sender pool started");
    }

    /// Signals every worker and waits for in-flight sends to finish.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("sender pool drained");
    }

    async fn process_payload(&self, token: &ChannelToken, payload: &str) {
        let msgs: Vec<MsgOut> = match serde_json::from_str(payload) {
            Ok(msgs) => msgs,
            Err(e) => {
                error!(token = %token, error = %e, "discarding unparseable queue payload");
                return;
            }
        };

        for msg in msgs {
            self.send_msg(msg).await;
        }
    }

    async fn send_msg(&self, msg: MsgOut) {
        let channel = match self.cache.get(self.backend.as_ref(), msg.channel_uuid).await {
            Ok(Some(channel)) => channel,
            Ok(None) => {
                warn!(msg_id = %msg.id, channel = %msg.channel_uuid, "channel gone, failing msg");
                self.write_status(msg.channel_uuid, StatusUpdate::by_id(msg.channel_uuid, msg.id, MsgStatus::Failed))
                    .await;
                return;
            }
            Err(e) => {
                error!(msg_id = %msg.id, error = %e, "channel lookup failed, will retry");
                self.write_status(msg.channel_uuid, StatusUpdate::by_id(msg.channel_uuid, msg.id, MsgStatus::Errored))
                    .await;
                return;
            }
        };

        let Some(handler) = self.registry.resolve(&channel.channel_type) else {
            warn!(msg_id = %msg.id, channel_type = %channel.channel_type, "no handler registered, failing msg");
            self.write_status(channel.uuid, StatusUpdate::by_id(channel.uuid, msg.id, MsgStatus::Failed))
                .await;
            return;
        };

        // crash-and-requeue guard: a payload redelivered after a send must
        // not produce a duplicate outbound message
        match self.backend.msg_was_sent(msg.id).await {
            Ok(true) => {
                debug!(msg_id = %msg.id, "already sent, skipping");
                self.write_status(channel.uuid, StatusUpdate::by_id(channel.uuid, msg.id, MsgStatus::Wired))
                    .await;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(msg_id = %msg.id, error = %e, "sent-marker check failed, sending anyway");
            }
        }

        let mut clog = ChannelLog::new(
            ChannelLogType::MsgSend,
            &channel,
            handler.redact_values(&channel),
        );
        clog.attach_msg(msg.id);

        let send_timeout = channel
            .config_int(config_keys::SEND_TIMEOUT)
            .map(|secs| Duration::from_secs(secs.max(1) as u64))
            .unwrap_or(self.config.default_send_timeout);

        let outcome = tokio::time::timeout(
            send_timeout,
            std::panic::AssertUnwindSafe(handler.send(&channel, &msg, &mut clog)).catch_unwind(),
        )
        .await;

        let update = match outcome {
            Err(_) => {
                clog.error("connection_failed", format!("send timed out after {send_timeout:?}"));
                StatusUpdate::by_id(channel.uuid, msg.id, self.retry_status(&msg, &channel))
            }
            Ok(Err(_)) => {
                error!(msg_id = %msg.id, channel = %channel.uuid, "handler panicked during send");
                clog.error("internal_error", "handler panicked during send");
                StatusUpdate::by_id(channel.uuid, msg.id, self.retry_status(&msg, &channel))
            }
            Ok(Ok(Ok(result))) => {
                if let Err(e) = self
                    .backend
                    .mark_msg_sent(msg.id, result.external_id.as_deref())
                    .await
                {
                    warn!(msg_id = %msg.id, error = %e, "failed recording sent marker");
                }
                if let Some(new_urn) = &result.new_urn {
                    debug!(msg_id = %msg.id, urn = %new_urn, "provider returned normalized urn");
                }
                let mut update = StatusUpdate::by_id(channel.uuid, msg.id, result.status);
                update.external_id = result.external_id;
                update
            }
            Ok(Ok(Err(send_err))) => {
                clog.send_error(&send_err);
                let status = if send_err.is_retryable() {
                    self.retry_status(&msg, &channel)
                } else {
                    MsgStatus::Failed
                };
                StatusUpdate::by_id(channel.uuid, msg.id, status)
            }
        };

        self.write_status(channel.uuid, update).await;

        clog.end();
        if let Err(e) = self.backend.write_channel_log(clog).await {
            warn!(msg_id = %msg.id, error = %e, "failed to queue channel log");
        }
    }

    /// Errored until the channel's retry budget is spent, then failed.
    fn retry_status(&self, msg: &MsgOut, channel: &Channel) -> MsgStatus {
        let budget = channel
            .config_int(config_keys::MAX_RETRIES)
            .unwrap_or(DEFAULT_RETRY_BUDGET);
        if i64::from(msg.error_count) + 1 >= budget {
            MsgStatus::Failed
        } else {
            MsgStatus::Errored
        }
    }

    async fn write_status(&self, channel_uuid: Uuid, update: StatusUpdate) {
        if let Err(e) = self.backend.write_status(update).await {
            error!(channel = %channel_uuid, error = %e, "failed to queue status update");
        }
    }
}

async fn worker_loop(worker_id: usize, foreman: Arc<Foreman>, mut shutdown_rx: broadcast::Receiver<()>) {
    debug!(worker_id, "sender worker started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!(worker_id, "sender worker stopping");
                break;
            }
            popped = foreman.queue.pop() => {
                match popped {
                    Ok(PopResult::Empty) => {
                        tokio::time::sleep(EMPTY_SLEEP).await;
                    }
                    Ok(PopResult::Retry) => {
                        // another channel may be eligible right now
                        tokio::task::yield_now().await;
                    }
                    Ok(PopResult::Payload { token, payload }) => {
                        foreman.process_payload(&token, &payload).await;
                        if let Err(e) = foreman.queue.complete(&token).await {
                            error!(worker_id, token = %token, error = %e, "failed to complete queue token");
                        }
                    }
                    Err(e) => {
                        error!(worker_id, error = %e, "queue pop failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}
