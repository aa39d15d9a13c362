//! Bulk SQL writers behind the committers.
//!
//! Status updates are applied through UNNEST'd arrays so one statement
//! covers the whole flush; the WHERE clause encodes the monotonic success
//! axis so a late `sent` callback can never drag a `delivered` message
//! backwards. Channel logs are plain bulk inserts.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use courier_batch::{BatchError, BulkWriter};
use courier_common::{ChannelLog, StatusUpdate};

/// Guard clause shared by every status statement: the new status must
/// advance the success axis, repeat `errored` while not yet terminal, or
/// fail anything short of `delivered`.
const STATUS_GUARD: &str = r#"(
    CASE d.status WHEN 'P' THEN 0 WHEN 'Q' THEN 1 WHEN 'W' THEN 2 WHEN 'S' THEN 3 WHEN 'D' THEN 4 ELSE -1 END
      > CASE msgs.status WHEN 'P' THEN 0 WHEN 'Q' THEN 1 WHEN 'W' THEN 2 WHEN 'S' THEN 3 WHEN 'D' THEN 4 ELSE -1 END
    OR (d.status = 'E' AND msgs.status NOT IN ('D', 'F'))
    OR (d.status = 'F' AND msgs.status <> 'D')
)"#;

pub(crate) struct StatusWriter {
    pool: PgPool,
}

impl StatusWriter {
    pub(crate) fn new(pool: PgPool) -> Self {
        StatusWriter { pool }
    }

    async fn write_by_id(&self, updates: &[&StatusUpdate]) -> Result<(), sqlx::Error> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut ids: Vec<i64> = Vec::with_capacity(updates.len());
        let mut statuses: Vec<String> = Vec::with_capacity(updates.len());
        let mut external_ids: Vec<String> = Vec::with_capacity(updates.len());
        let mut modified: Vec<chrono::DateTime<chrono::Utc>> = Vec::with_capacity(updates.len());
        for update in updates {
            ids.push(update.msg_id.map(|id| id.0).unwrap_or_default());
            statuses.push(update.status.code().to_string());
            external_ids.push(update.external_id.clone().unwrap_or_default());
            modified.push(update.modified_on);
        }

        let query = format!(
            r#"
            UPDATE msgs
               SET status = d.status,
                   external_id = COALESCE(NULLIF(d.external_id, ''), msgs.external_id),
                   modified_on = d.modified_on
              FROM (
                SELECT UNNEST($1::bigint[]) AS id,
                       UNNEST($2::text[]) AS status,
                       UNNEST($3::text[]) AS external_id,
                       UNNEST($4::timestamptz[]) AS modified_on
              ) AS d
             WHERE msgs.id = d.id AND {STATUS_GUARD}
            "#
        );

        sqlx::query(&query)
            .bind(&ids)
            .bind(&statuses)
            .bind(&external_ids)
            .bind(&modified)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn write_by_external_id(&self, updates: &[&StatusUpdate]) -> Result<(), sqlx::Error> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut channels: Vec<Uuid> = Vec::with_capacity(updates.len());
        let mut external_ids: Vec<String> = Vec::with_capacity(updates.len());
        let mut statuses: Vec<String> = Vec::with_capacity(updates.len());
        let mut modified: Vec<chrono::DateTime<chrono::Utc>> = Vec::with_capacity(updates.len());
        for update in updates {
            channels.push(update.channel_uuid);
            external_ids.push(update.external_id.clone().unwrap_or_default());
            statuses.push(update.status.code().to_string());
            modified.push(update.modified_on);
        }

        let query = format!(
            r#"
            UPDATE msgs
               SET status = d.status, modified_on = d.modified_on
              FROM (
                SELECT UNNEST($1::uuid[]) AS channel_uuid,
                       UNNEST($2::text[]) AS external_id,
                       UNNEST($3::text[]) AS status,
                       UNNEST($4::timestamptz[]) AS modified_on
              ) AS d
             WHERE msgs.channel_uuid = d.channel_uuid
               AND msgs.external_id = d.external_id
               AND {STATUS_GUARD}
            "#
        );

        sqlx::query(&query)
            .bind(&channels)
            .bind(&external_ids)
            .bind(&statuses)
            .bind(&modified)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BulkWriter<StatusUpdate> for StatusWriter {
    async fn write_batch(&self, batch: &[StatusUpdate]) -> Result<(), BatchError> {
        let by_id: Vec<&StatusUpdate> = batch.iter().filter(|u| u.msg_id.is_some()).collect();
        let by_external: Vec<&StatusUpdate> = batch
            .iter()
            .filter(|u| u.msg_id.is_none() && u.external_id.is_some())
            .collect();

        self.write_by_id(&by_id)
            .await
            .map_err(|e| BatchError::Write(e.to_string()))?;
        self.write_by_external_id(&by_external)
            .await
            .map_err(|e| BatchError::Write(e.to_string()))?;
        Ok(())
    }

    async fn write_one(&self, item: &StatusUpdate) -> Result<(), BatchError> {
        self.write_batch(std::slice::from_ref(item)).await
    }
}

pub(crate) struct ClogWriter {
    pool: PgPool,
}

impl ClogWriter {
    pub(crate) fn new(pool: PgPool) -> Self {
        ClogWriter { pool }
    }

    pub(crate) async fn insert(&self, clogs: &[ChannelLog]) -> Result<(), sqlx::Error> {
        if clogs.is_empty() {
            return Ok(());
        }

        let mut uuids: Vec<Uuid> = Vec::with_capacity(clogs.len());
        let mut log_types: Vec<String> = Vec::with_capacity(clogs.len());
        let mut channels: Vec<Uuid> = Vec::with_capacity(clogs.len());
        let mut msg_ids: Vec<i64> = Vec::with_capacity(clogs.len());
        let mut event_uuids: Vec<Uuid> = Vec::with_capacity(clogs.len());
        let mut http_logs: Vec<serde_json::Value> = Vec::with_capacity(clogs.len());
        let mut errors: Vec<serde_json::Value> = Vec::with_capacity(clogs.len());
        let mut is_errors: Vec<bool> = Vec::with_capacity(clogs.len());
        let mut elapsed: Vec<i64> = Vec::with_capacity(clogs.len());
        let mut created: Vec<chrono::DateTime<chrono::Utc>> = Vec::with_capacity(clogs.len());

        for clog in clogs {
            uuids.push(clog.uuid);
            log_types.push(clog.log_type.as_str().to_string());
            channels.push(clog.channel_uuid);
            msg_ids.push(clog.msg_id.map(|id| id.0).unwrap_or_default());
            event_uuids.push(clog.event_uuid.unwrap_or(Uuid::nil()));
            http_logs.push(serde_json::to_value(&clog.http_logs).unwrap_or_default());
            errors.push(serde_json::to_value(&clog.errors).unwrap_or_default());
            is_errors.push(clog.is_error());
            elapsed.push(clog.elapsed_ms as i64);
            created.push(clog.created_on);
        }

        sqlx::query(
            r#"
            INSERT INTO channel_logs (uuid, log_type, channel_uuid, msg_id, event_uuid,
                                      http_logs, errors, is_error, elapsed_ms, created_on)
            SELECT d.uuid, d.log_type, d.channel_uuid,
                   NULLIF(d.msg_id, 0),
                   NULLIF(d.event_uuid, '00000000-0000-0000-0000-000000000000'::uuid),
                   d.http_logs, d.errors, d.is_error, d.elapsed_ms, d.created_on
              FROM (
                SELECT UNNEST($1::uuid[]) AS uuid,
                       UNNEST($2::text[]) AS log_type,
                       UNNEST($3::uuid[]) AS channel_uuid,
                       UNNEST($4::bigint[]) AS msg_id,
                       UNNEST($5::uuid[]) AS event_uuid,
                       UNNEST($6::jsonb[]) AS http_logs,
                       UNNEST($7::jsonb[]) AS errors,
                       UNNEST($8::bool[]) AS is_error,
                       UNNEST($9::bigint[]) AS elapsed_ms,
                       UNNEST($10::timestamptz[]) AS created_on
              ) AS d
            "#,
        )
        .bind(&uuids)
        .bind(&log_types)
        .bind(&channels)
        .bind(&msg_ids)
        .bind(&event_uuids)
        .bind(&http_logs)
        .bind(&errors)
        .bind(&is_errors)
        .bind(&elapsed)
        .bind(&created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BulkWriter<ChannelLog> for ClogWriter {
    async fn write_batch(&self, batch: &[ChannelLog]) -> Result<(), BatchError> {
        self.insert(batch)
            .await
            .map_err(|e| BatchError::Write(e.to_string()))
    }

    async fn write_one(&self, item: &ChannelLog) -> Result<(), BatchError> {
        self.insert(std::slice::from_ref(item))
            .await
            .map_err(|e| BatchError::Write(e.to_string()))
    }
}
