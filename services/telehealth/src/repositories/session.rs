//! Session repository for database operations

use async_trait::async_trait;
use common::error::{DatabaseError, DatabaseResult};
use sqlx::{PgPool, Row, postgres::PgRow, types::Json};
use uuid::Uuid;

use super::{SessionInsert, SessionStore, SessionUpdate, decode_text, status_texts, to_json};
use crate::models::{Session, SessionAuditEvent, SessionStatus};

const SESSION_COLUMNS: &str = r#"
    id, appointment_id, room_sid, room_name, status, clinician_id, client_id,
    waiting_room_entered_at, session_started_at, session_ended_at,
    actual_duration_minutes, end_reason, recording_enabled, recording_consent,
    recording_started_at, recording_stopped_at, recording_error,
    emergency_activated, emergency_activated_at, emergency_notes,
    emergency_resolution, emergency_contact_notified, audit_log,
    created_by, last_modified_by, created_at, updated_at
"#;

/// Postgres-backed session store
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn session_from_row(row: &PgRow) -> DatabaseResult<Session> {
    let audit_log: Json<Vec<SessionAuditEvent>> = row.try_get("audit_log")?;
    let emergency_resolution: Option<String> = row.try_get("emergency_resolution")?;

    Ok(Session {
        id: row.try_get("id")?,
        appointment_id: row.try_get("appointment_id")?,
        room_sid: row.try_get("room_sid")?,
        room_name: row.try_get("room_name")?,
        status: decode_text("status", row.try_get("status")?)?,
        clinician_id: row.try_get("clinician_id")?,
        client_id: row.try_get("client_id")?,
        waiting_room_entered_at: row.try_get("waiting_room_entered_at")?,
        session_started_at: row.try_get("session_started_at")?,
        session_ended_at: row.try_get("session_ended_at")?,
        actual_duration_minutes: row.try_get("actual_duration_minutes")?,
        end_reason: row.try_get("end_reason")?,
        recording_enabled: row.try_get("recording_enabled")?,
        recording_consent: row.try_get("recording_consent")?,
        recording_started_at: row.try_get("recording_started_at")?,
        recording_stopped_at: row.try_get("recording_stopped_at")?,
        recording_error: row.try_get("recording_error")?,
        emergency_activated: row.try_get("emergency_activated")?,
        emergency_activated_at: row.try_get("emergency_activated_at")?,
        emergency_notes: row.try_get("emergency_notes")?,
        emergency_resolution: emergency_resolution
            .map(|value| decode_text("emergency_resolution", value))
            .transpose()?,
        emergency_contact_notified: row.try_get("emergency_contact_notified")?,
        audit_log: audit_log.0,
        created_by: decode_text("created_by", row.try_get("created_by")?)?,
        last_modified_by: decode_text("last_modified_by", row.try_get("last_modified_by")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn get(&self, id: Uuid) -> DatabaseResult<Option<Session>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM telehealth_sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn find_by_appointment(&self, appointment_id: Uuid) -> DatabaseResult<Option<Session>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM telehealth_sessions WHERE appointment_id = $1",
            SESSION_COLUMNS
        ))
        .bind(appointment_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn insert_if_absent(&self, session: Session) -> DatabaseResult<SessionInsert> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO telehealth_sessions (
                id, appointment_id, room_sid, room_name, status, clinician_id, client_id,
                recording_enabled, recording_consent, emergency_activated,
                emergency_contact_notified, audit_log, created_by, last_modified_by,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (appointment_id) DO NOTHING
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(session.id)
        .bind(session.appointment_id)
        .bind(&session.room_sid)
        .bind(&session.room_name)
        .bind(session.status.as_str())
        .bind(session.clinician_id)
        .bind(session.client_id)
        .bind(session.recording_enabled)
        .bind(session.recording_consent)
        .bind(session.emergency_activated)
        .bind(session.emergency_contact_notified)
        .bind(to_json(&session.audit_log)?)
        .bind(session.created_by.to_string())
        .bind(session.last_modified_by.to_string())
        .bind(session.created_at)
        .bind(session.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(SessionInsert::Inserted(session_from_row(&row)?));
        }

        self.find_by_appointment(session.appointment_id)
            .await?
            .map(SessionInsert::Existing)
            .ok_or_else(|| {
                DatabaseError::Configuration(format!(
                    "session insert for appointment {} conflicted but no row was found",
                    session.appointment_id
                ))
            })
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[SessionStatus],
        update: SessionUpdate,
    ) -> DatabaseResult<Option<Session>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE telehealth_sessions SET
                status = COALESCE($3, status),
                waiting_room_entered_at = COALESCE($4, waiting_room_entered_at),
                session_started_at = COALESCE($5, session_started_at),
                session_ended_at = COALESCE($6, session_ended_at),
                actual_duration_minutes = COALESCE($7, actual_duration_minutes),
                end_reason = COALESCE($8, end_reason),
                recording_enabled = COALESCE($9, recording_enabled),
                recording_consent = COALESCE($10, recording_consent),
                recording_started_at = COALESCE($11, recording_started_at),
                recording_stopped_at = COALESCE($12, recording_stopped_at),
                recording_error = COALESCE($13, recording_error),
                emergency_activated = COALESCE($14, emergency_activated),
                emergency_activated_at = COALESCE($15, emergency_activated_at),
                emergency_notes = COALESCE($16, emergency_notes),
                emergency_resolution = COALESCE($17, emergency_resolution),
                emergency_contact_notified = COALESCE($18, emergency_contact_notified),
                audit_log = audit_log || $19::jsonb,
                last_modified_by = $20,
                updated_at = $21
            WHERE id = $1 AND status = ANY($2)
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(id)
        .bind(status_texts(from))
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.waiting_room_entered_at)
        .bind(update.session_started_at)
        .bind(update.session_ended_at)
        .bind(update.actual_duration_minutes)
        .bind(&update.end_reason)
        .bind(update.recording_enabled)
        .bind(update.recording_consent)
        .bind(update.recording_started_at)
        .bind(update.recording_stopped_at)
        .bind(&update.recording_error)
        .bind(update.emergency_activated)
        .bind(update.emergency_activated_at)
        .bind(&update.emergency_notes)
        .bind(update.emergency_resolution.map(|r| r.as_str()))
        .bind(update.emergency_contact_notified)
        .bind(to_json(&update.audit_events)?)
        .bind(update.modified_by.to_string())
        .bind(update.modified_at)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn append_audit(&self, id: Uuid, event: SessionAuditEvent) -> DatabaseResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE telehealth_sessions
            SET audit_log = audit_log || jsonb_build_array($2::jsonb)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(to_json(&event)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
