//! Recording repository for database operations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::error::DatabaseResult;
use sqlx::{PgPool, Row, postgres::PgRow, types::Json};
use uuid::Uuid;

use super::{RecordingStore, RecordingUpdate, decode_text, status_texts, to_json};
use crate::models::{AccessLogEntry, Actor, Recording, RecordingFilter, RecordingStatus};

const RECORDING_COLUMNS: &str = r#"
    id, session_id, recording_sid, room_sid, status, recording_started_at,
    recording_ended_at, duration_seconds, size_bytes, format, audio_only,
    client_consent_given, consent_timestamp, consent_ip_address, storage_bucket,
    storage_key, storage_region, encryption_type, retention_policy,
    scheduled_deletion_at, media_url, uploaded_at, processing_error, deleted_at,
    deleted_by, deletion_reason, view_count, download_count, last_accessed_at,
    access_log, created_by, last_modified_by, created_at, updated_at
"#;

/// Shared WHERE clause for listings; `$1..$4` are the optional filters
const LIST_PREDICATE: &str = r#"
    ($1::uuid IS NULL OR session_id = $1)
    AND (($2::text IS NULL AND status <> 'DELETED') OR status = $2)
    AND ($3::timestamptz IS NULL OR recording_started_at >= $3)
    AND ($4::timestamptz IS NULL OR recording_started_at <= $4)
"#;

/// Postgres-backed recording store
#[derive(Clone)]
pub struct PgRecordingStore {
    pool: PgPool,
}

impl PgRecordingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn recording_from_row(row: &PgRow) -> DatabaseResult<Recording> {
    let access_log: Json<Vec<AccessLogEntry>> = row.try_get("access_log")?;
    let size_bytes: i64 = row.try_get("size_bytes")?;
    let deleted_by: Option<String> = row.try_get("deleted_by")?;

    Ok(Recording {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        recording_sid: row.try_get("recording_sid")?,
        room_sid: row.try_get("room_sid")?,
        status: decode_text("status", row.try_get("status")?)?,
        recording_started_at: row.try_get("recording_started_at")?,
        recording_ended_at: row.try_get("recording_ended_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        size_bytes: u64::try_from(size_bytes).unwrap_or(0),
        format: decode_text("format", row.try_get("format")?)?,
        audio_only: row.try_get("audio_only")?,
        client_consent_given: row.try_get("client_consent_given")?,
        consent_timestamp: row.try_get("consent_timestamp")?,
        consent_ip_address: row.try_get("consent_ip_address")?,
        storage_bucket: row.try_get("storage_bucket")?,
        storage_key: row.try_get("storage_key")?,
        storage_region: row.try_get("storage_region")?,
        encryption_type: row.try_get("encryption_type")?,
        retention_policy: row.try_get("retention_policy")?,
        scheduled_deletion_at: row.try_get("scheduled_deletion_at")?,
        media_url: row.try_get("media_url")?,
        uploaded_at: row.try_get("uploaded_at")?,
        processing_error: row.try_get("processing_error")?,
        deleted_at: row.try_get("deleted_at")?,
        deleted_by: deleted_by
            .map(|value| decode_text::<Actor>("deleted_by", value))
            .transpose()?,
        deletion_reason: row.try_get("deletion_reason")?,
        view_count: row.try_get("view_count")?,
        download_count: row.try_get("download_count")?,
        last_accessed_at: row.try_get("last_accessed_at")?,
        access_log: access_log.0,
        created_by: decode_text("created_by", row.try_get("created_by")?)?,
        last_modified_by: decode_text("last_modified_by", row.try_get("last_modified_by")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl RecordingStore for PgRecordingStore {
    async fn insert(&self, recording: Recording) -> DatabaseResult<Recording> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO session_recordings (
                id, session_id, recording_sid, room_sid, status, recording_started_at,
                duration_seconds, size_bytes, format, audio_only, client_consent_given,
                consent_timestamp, consent_ip_address, storage_bucket, storage_key,
                storage_region, encryption_type, retention_policy, scheduled_deletion_at,
                view_count, download_count, last_accessed_at, access_log,
                created_by, last_modified_by, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27
            )
            RETURNING {}
            "#,
            RECORDING_COLUMNS
        ))
        .bind(recording.id)
        .bind(recording.session_id)
        .bind(&recording.recording_sid)
        .bind(&recording.room_sid)
        .bind(recording.status.as_str())
        .bind(recording.recording_started_at)
        .bind(recording.duration_seconds)
        .bind(to_i64(recording.size_bytes))
        .bind(recording.format.as_str())
        .bind(recording.audio_only)
        .bind(recording.client_consent_given)
        .bind(recording.consent_timestamp)
        .bind(&recording.consent_ip_address)
        .bind(&recording.storage_bucket)
        .bind(&recording.storage_key)
        .bind(&recording.storage_region)
        .bind(&recording.encryption_type)
        .bind(&recording.retention_policy)
        .bind(recording.scheduled_deletion_at)
        .bind(recording.view_count)
        .bind(recording.download_count)
        .bind(recording.last_accessed_at)
        .bind(to_json(&recording.access_log)?)
        .bind(recording.created_by.to_string())
        .bind(recording.last_modified_by.to_string())
        .bind(recording.created_at)
        .bind(recording.updated_at)
        .fetch_one(&self.pool)
        .await?;

        recording_from_row(&row)
    }

    async fn get(&self, id: Uuid) -> DatabaseResult<Option<Recording>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM session_recordings WHERE id = $1",
            RECORDING_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(recording_from_row).transpose()
    }

    async fn find_by_sid(&self, recording_sid: &str) -> DatabaseResult<Option<Recording>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM session_recordings WHERE recording_sid = $1",
            RECORDING_COLUMNS
        ))
        .bind(recording_sid)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(recording_from_row).transpose()
    }

    async fn find_active_for_session(
        &self,
        session_id: Uuid,
    ) -> DatabaseResult<Option<Recording>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM session_recordings
            WHERE session_id = $1 AND status = $2
            ORDER BY recording_started_at DESC
            LIMIT 1
            "#,
            RECORDING_COLUMNS
        ))
        .bind(session_id)
        .bind(RecordingStatus::Recording.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(recording_from_row).transpose()
    }

    async fn list(&self, filter: &RecordingFilter) -> DatabaseResult<(Vec<Recording>, i64)> {
        let status = filter.status.map(|s| s.as_str());

        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM session_recordings
            WHERE {}
            ORDER BY recording_started_at DESC
            LIMIT $5 OFFSET $6
            "#,
            RECORDING_COLUMNS, LIST_PREDICATE
        ))
        .bind(filter.session_id)
        .bind(status)
        .bind(filter.started_after)
        .bind(filter.started_before)
        .bind(i64::from(filter.page_size()))
        .bind(i64::from(filter.page_offset()))
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM session_recordings WHERE {}",
            LIST_PREDICATE
        ))
        .bind(filter.session_id)
        .bind(status)
        .bind(filter.started_after)
        .bind(filter.started_before)
        .fetch_one(&self.pool)
        .await?;

        let recordings = rows
            .iter()
            .map(recording_from_row)
            .collect::<DatabaseResult<Vec<_>>>()?;

        Ok((recordings, total))
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[RecordingStatus],
        update: RecordingUpdate,
    ) -> DatabaseResult<Option<Recording>> {
        let (views, downloads) = update
            .access_entry
            .as_ref()
            .map(|entry| entry.action.counter_deltas())
            .unwrap_or((0, 0));
        let accessed_at = update.access_entry.as_ref().map(|entry| entry.timestamp);
        let entries: Vec<&AccessLogEntry> = update.access_entry.iter().collect();

        let row = sqlx::query(&format!(
            r#"
            UPDATE session_recordings SET
                status = COALESCE($3, status),
                recording_ended_at = COALESCE($4, recording_ended_at),
                duration_seconds = COALESCE($5, duration_seconds),
                size_bytes = COALESCE($6, size_bytes),
                media_url = COALESCE($7, media_url),
                storage_bucket = COALESCE($8, storage_bucket),
                storage_key = COALESCE($9, storage_key),
                storage_region = COALESCE($10, storage_region),
                encryption_type = COALESCE($11, encryption_type),
                uploaded_at = COALESCE($12, uploaded_at),
                processing_error = COALESCE(
                    $13, CASE WHEN $14 THEN NULL ELSE processing_error END
                ),
                deleted_at = COALESCE($15, deleted_at),
                deleted_by = COALESCE($16, deleted_by),
                deletion_reason = COALESCE($17, deletion_reason),
                access_log = access_log || $18::jsonb,
                view_count = view_count + $19,
                download_count = download_count + $20,
                last_accessed_at = COALESCE($21, last_accessed_at),
                last_modified_by = $22,
                updated_at = $23
            WHERE id = $1 AND status = ANY($2)
            RETURNING {}
            "#,
            RECORDING_COLUMNS
        ))
        .bind(id)
        .bind(status_texts(from))
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.recording_ended_at)
        .bind(update.duration_seconds)
        .bind(update.size_bytes.map(to_i64))
        .bind(&update.media_url)
        .bind(&update.storage_bucket)
        .bind(&update.storage_key)
        .bind(&update.storage_region)
        .bind(&update.encryption_type)
        .bind(update.uploaded_at)
        .bind(&update.processing_error)
        .bind(update.clear_processing_error)
        .bind(update.deleted_at)
        .bind(update.deleted_by.map(|actor| actor.to_string()))
        .bind(&update.deletion_reason)
        .bind(to_json(&entries)?)
        .bind(views)
        .bind(downloads)
        .bind(accessed_at)
        .bind(update.modified_by.to_string())
        .bind(update.modified_at)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(recording_from_row).transpose()
    }

    async fn append_access(&self, id: Uuid, entry: AccessLogEntry) -> DatabaseResult<bool> {
        let (views, downloads) = entry.action.counter_deltas();

        let result = sqlx::query(
            r#"
            UPDATE session_recordings SET
                access_log = access_log || jsonb_build_array($2::jsonb),
                view_count = view_count + $3,
                download_count = download_count + $4,
                last_accessed_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(to_json(&entry)?)
        .bind(views)
        .bind(downloads)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn scheduled_for_deletion(
        &self,
        statuses: &[RecordingStatus],
        after: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> DatabaseResult<Vec<Recording>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM session_recordings
            WHERE status = ANY($1)
              AND ($2::timestamptz IS NULL OR scheduled_deletion_at > $2)
              AND scheduled_deletion_at <= $3
            ORDER BY scheduled_deletion_at
            "#,
            RECORDING_COLUMNS
        ))
        .bind(status_texts(statuses))
        .bind(after)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(recording_from_row).collect()
    }

    async fn stale(
        &self,
        statuses: &[RecordingStatus],
        updated_before: DateTime<Utc>,
    ) -> DatabaseResult<Vec<Recording>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM session_recordings
            WHERE status = ANY($1) AND updated_at < $2
            ORDER BY updated_at
            "#,
            RECORDING_COLUMNS
        ))
        .bind(status_texts(statuses))
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(recording_from_row).collect()
    }
}
