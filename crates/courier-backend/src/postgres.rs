//! Postgres-backed implementation of the backend seam.
//!
//! Inbound messages and channel events are written directly (one row each,
//! behind the Redis deduper); status updates and channel logs fan in through
//! the bulk committers. Rows that a committer cannot land even one at a time
//! are parked in the spool, and this backend is also the spool replayer that
//! feeds them back in once the database recovers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use courier_batch::{BulkWriter, Committer};
use courier_common::{Channel, ChannelEvent, ChannelLog, ChannelType, MsgId, MsgIn, StatusUpdate};
use courier_queue::Deduper;
use courier_spool::{Spool, SpoolError, SpoolKind, SpoolReplayer};

use crate::writers::{ClogWriter, StatusWriter};
use crate::{Backend, Result};

/// How long a losing duplicate writer waits for the winner's insert to
/// become visible.
const DUPLICATE_LOOKUP_ATTEMPTS: u32 = 3;
const DUPLICATE_LOOKUP_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PostgresBackendConfig {
    /// Flush interval for the status and channel-log committers.
    pub batch_timeout: Duration,
    /// Committer buffer capacity; also the backpressure budget.
    pub batch_capacity: usize,
    /// Inbound receive dedupe window.
    pub dedupe_window: Duration,
}

impl Default for PostgresBackendConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_millis(500),
            batch_capacity: 10_000,
            dedupe_window: Duration::from_secs(300),
        }
    }
}

pub struct PostgresBackend {
    pool: PgPool,
    redis: ConnectionManager,
    deduper: Deduper,
    sent_tracker: Deduper,
    spool: Spool,
    status_writer: Arc<StatusWriter>,
    clog_writer: Arc<ClogWriter>,
    status_committer: Committer<StatusUpdate>,
    clog_committer: Committer<ChannelLog>,
}

impl PostgresBackend {
    pub fn start(
        pool: PgPool,
        redis: ConnectionManager,
        spool: Spool,
        config: PostgresBackendConfig,
    ) -> Self {
        let deduper = Deduper::new(redis.clone(), "dedupe", config.dedupe_window);
        // sent markers guard against double-sends for a day
        let sent_tracker = Deduper::new(redis.clone(), "sent", Duration::from_secs(24 * 60 * 60));

        let status_writer = Arc::new(StatusWriter::new(pool.clone()));
        let clog_writer = Arc::new(ClogWriter::new(pool.clone()));

        let status_spool = spool.clone();
        let status_committer = Committer::start(
            "statuses",
            status_writer.clone(),
            config.batch_timeout,
            config.batch_capacity,
            Some(Arc::new(move |e, update: StatusUpdate| {
                warn!(error = %e, msg_id = ?update.msg_id, "status write failed, spooling");
                let spool = status_spool.clone();
                tokio::spawn(async move {
                    if let Err(e) = spool.write(SpoolKind::Status, update.uuid, &update).await {
                        warn!(error = %e, "spooling status update failed, update lost");
                    }
                });
            })),
        );

        let clog_spool = spool.clone();
        let clog_committer = Committer::start(
            "channel_logs",
            clog_writer.clone(),
            config.batch_timeout,
            config.batch_capacity,
            Some(Arc::new(move |e, clog: ChannelLog| {
                warn!(error = %e, clog_uuid = %clog.uuid, "channel log write failed, spooling");
                let spool = clog_spool.clone();
                tokio::spawn(async move {
                    if let Err(e) = spool.write(SpoolKind::Log, clog.uuid, &clog).await {
                        warn!(error = %e, "spooling channel log failed, log lost");
                    }
                });
            })),
        );

        PostgresBackend {
            pool,
            redis,
            deduper,
            sent_tracker,
            spool,
            status_writer,
            clog_writer,
            status_committer,
            clog_committer,
        }
    }

    /// Flushes and stops the committers. Call during shutdown, after the
    /// HTTP listener and sender pool have drained.
    pub async fn stop(&self) {
        self.status_committer.stop().await;
        self.clog_committer.stop().await;
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    async fn insert_msg(&self, msg: &mut MsgIn) -> std::result::Result<(), sqlx::Error> {
        let clog_uuids: Vec<Uuid> = msg.channel_log_uuid.into_iter().collect();
        let row = sqlx::query(
            r#"
            INSERT INTO msgs (uuid, channel_uuid, urn, text, attachments, external_id,
                              status, visibility, received_on, created_on, modified_on,
                              channel_log_uuids)
            VALUES ($1, $2, $3, $4, $5, $6, 'P', 'V', $7, now(), now(), $8)
            RETURNING id
            "#,
        )
        .bind(msg.uuid)
        .bind(msg.channel_uuid)
        .bind(msg.urn.as_str())
        .bind(&msg.text)
        .bind(&msg.attachments)
        .bind(&msg.external_id)
        .bind(msg.received_on)
        .bind(&clog_uuids)
        .fetch_one(&self.pool)
        .await?;

        msg.id = MsgId(row.try_get::<i64, _>("id")?);
        Ok(())
    }

    /// Resolves a suppressed duplicate to the winning writer's row. The
    /// claim lands before the winner's insert commits, so the lookup is
    /// retried briefly.
    async fn resolve_duplicate(&self, msg: &mut MsgIn, prior: &str) -> Result<()> {
        let Ok(prior_uuid) = Uuid::parse_str(prior) else {
            warn!(msg_uuid = %msg.uuid, prior = %prior, "malformed dedupe marker, dropping duplicate");
            return Ok(());
        };

        for attempt in 0..DUPLICATE_LOOKUP_ATTEMPTS {
            let row = sqlx::query("SELECT id FROM msgs WHERE uuid = $1")
                .bind(prior_uuid)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                msg.id = MsgId(row.try_get::<i64, _>("id")?);
                msg.uuid = prior_uuid;
                debug!(msg_uuid = %prior_uuid, msg_id = %msg.id, "duplicate msg suppressed");
                return Ok(());
            }
            if attempt + 1 < DUPLICATE_LOOKUP_ATTEMPTS {
                tokio::time::sleep(DUPLICATE_LOOKUP_DELAY).await;
            }
        }

        // the winner may have spooled its insert; the duplicate stays
        // suppressed either way
        warn!(msg_uuid = %msg.uuid, prior_uuid = %prior_uuid, "duplicate claimed but original row not yet visible");
        Ok(())
    }

    async fn insert_event(&self, event: &mut ChannelEvent) -> std::result::Result<(), sqlx::Error> {
        let clog_uuids: Vec<Uuid> = event.channel_log_uuid.into_iter().collect();
        let row = sqlx::query(
            r#"
            INSERT INTO channel_events (uuid, channel_uuid, event_type, urn, extra,
                                        contact_name, occurred_on, created_on,
                                        channel_log_uuids)
            VALUES ($1, $2, $3, $4, $5, $6, $7, now(), $8)
            RETURNING id
            "#,
        )
        .bind(event.uuid)
        .bind(event.channel_uuid)
        .bind(event.event_type.as_str())
        .bind(event.urn.as_str())
        .bind(serde_json::Value::Object(event.extra.clone()))
        .bind(&event.contact_name)
        .bind(event.occurred_on)
        .bind(&clog_uuids)
        .fetch_one(&self.pool)
        .await?;

        event.id = row.try_get::<i64, _>("id")?;
        Ok(())
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    async fn channel(&self, uuid: Uuid) -> Result<Option<Channel>> {
        let row = sqlx::query(
            r#"
            SELECT uuid, channel_type, address, country, schemes, config, org_id,
                   callback_domain, is_active
              FROM channels
             WHERE uuid = $1
            "#,
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        if !row.try_get::<bool, _>("is_active")? {
            debug!(channel = %uuid, "channel is deleted");
            return Ok(None);
        }

        let config = match row.try_get::<serde_json::Value, _>("config")? {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };

        Ok(Some(Channel {
            uuid: row.try_get("uuid")?,
            channel_type: ChannelType::new(row.try_get::<String, _>("channel_type")?),
            address: row.try_get("address")?,
            country: row.try_get("country")?,
            schemes: row.try_get("schemes")?,
            config,
            org_id: row.try_get("org_id")?,
            callback_domain: row.try_get("callback_domain")?,
        }))
    }

    async fn write_msg(&self, msg: &mut MsgIn) -> Result<()> {
        let fingerprint = msg.fingerprint();

        // single-round-trip claim: of any concurrent writers with the same
        // fingerprint, exactly one records its uuid and inserts; the rest
        // observe that uuid here and resolve the winner's row instead
        let prior = self
            .deduper
            .record_if_absent(&fingerprint, &msg.uuid.to_string())
            .await?;
        if let Some(prior) = prior {
            return self.resolve_duplicate(msg, &prior).await;
        }

        if let Err(e) = self.insert_msg(msg).await {
            warn!(msg_uuid = %msg.uuid, error = %e, "msg insert failed, spooling");
            self.spool.write(SpoolKind::Msg, msg.uuid, msg).await?;
        }
        Ok(())
    }

    async fn write_status(&self, update: StatusUpdate) -> Result<()> {
        self.status_committer.queue(update).await;
        Ok(())
    }

    async fn write_event(&self, event: &mut ChannelEvent) -> Result<()> {
        if let Err(e) = self.insert_event(event).await {
            warn!(event_uuid = %event.uuid, error = %e, "event insert failed, spooling");
            self.spool.write(SpoolKind::Event, event.uuid, event).await?;
        }
        Ok(())
    }

    async fn write_channel_log(&self, clog: ChannelLog) -> Result<()> {
        self.clog_committer.queue(clog).await;
        Ok(())
    }

    async fn msg_was_sent(&self, id: MsgId) -> Result<bool> {
        Ok(self.sent_tracker.seen(&id.to_string()).await?.is_some())
    }

    async fn mark_msg_sent(&self, id: MsgId, external_id: Option<&str>) -> Result<()> {
        self.sent_tracker
            .record(&id.to_string(), external_id.unwrap_or("1"))
            .await?;
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;

        let mut conn = self.redis.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(courier_queue::QueueError::Redis)?;
        Ok(())
    }
}

#[async_trait]
impl SpoolReplayer for PostgresBackend {
    async fn replay(&self, kind: SpoolKind, contents: &str) -> courier_spool::Result<()> {
        let rejected = |e: String| SpoolError::Replay(e);

        match kind {
            SpoolKind::Msg => {
                let mut msg: MsgIn = serde_json::from_str(contents)?;
                self.insert_msg(&mut msg).await.map_err(|e| rejected(e.to_string()))?;
            }
            SpoolKind::Status => {
                let update: StatusUpdate = serde_json::from_str(contents)?;
                self.status_writer
                    .write_one(&update)
                    .await
                    .map_err(|e| rejected(e.to_string()))?;
            }
            SpoolKind::Event => {
                let mut event: ChannelEvent = serde_json::from_str(contents)?;
                self.insert_event(&mut event).await.map_err(|e| rejected(e.to_string()))?;
            }
            SpoolKind::Log => {
                let clog: ChannelLog = serde_json::from_str(contents)?;
                self.clog_writer
                    .write_one(&clog)
                    .await
                    .map_err(|e| rejected(e.to_string()))?;
            }
        }
        Ok(())
    }
}
