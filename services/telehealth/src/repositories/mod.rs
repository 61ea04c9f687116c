//! Repositories for database operations
//!
//! Each store is a trait with a Postgres implementation and an in-memory one.
//! Status changes are conditional on the current status; a `None` result means
//! the row was missing or another caller moved it first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::error::{DatabaseError, DatabaseResult};
use uuid::Uuid;

use crate::models::{
    AccessLogEntry, Actor, Appointment, ConsentRecord, EmergencyResolution, Recording,
    RecordingFilter, RecordingStatus, Session, SessionAuditEvent, SessionStatus,
};

pub mod consent;
pub mod memory;
pub mod recording;
pub mod session;

pub use consent::{PgAppointmentStore, PgConsentStore};
pub use memory::{
    MemoryAppointmentStore, MemoryConsentStore, MemoryRecordingStore, MemorySessionStore,
};
pub use recording::PgRecordingStore;
pub use session::PgSessionStore;

/// Result of inserting a session keyed by appointment
#[derive(Debug, Clone)]
pub enum SessionInsert {
    Inserted(Session),
    /// Another session already exists for the appointment
    Existing(Session),
}

/// Field changes applied together with a conditional status check.
///
/// `None` leaves the column untouched.
#[derive(Debug, Clone)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub waiting_room_entered_at: Option<DateTime<Utc>>,
    pub session_started_at: Option<DateTime<Utc>>,
    pub session_ended_at: Option<DateTime<Utc>>,
    pub actual_duration_minutes: Option<i32>,
    pub end_reason: Option<String>,
    pub recording_enabled: Option<bool>,
    pub recording_consent: Option<bool>,
    pub recording_started_at: Option<DateTime<Utc>>,
    pub recording_stopped_at: Option<DateTime<Utc>>,
    pub recording_error: Option<String>,
    pub emergency_activated: Option<bool>,
    pub emergency_activated_at: Option<DateTime<Utc>>,
    pub emergency_notes: Option<String>,
    pub emergency_resolution: Option<EmergencyResolution>,
    pub emergency_contact_notified: Option<bool>,
    /// Appended to the audit log in the same statement
    pub audit_events: Vec<SessionAuditEvent>,
    pub modified_by: Actor,
    pub modified_at: DateTime<Utc>,
}

impl SessionUpdate {
    pub fn new(modified_by: Actor, modified_at: DateTime<Utc>) -> Self {
        Self {
            status: None,
            waiting_room_entered_at: None,
            session_started_at: None,
            session_ended_at: None,
            actual_duration_minutes: None,
            end_reason: None,
            recording_enabled: None,
            recording_consent: None,
            recording_started_at: None,
            recording_stopped_at: None,
            recording_error: None,
            emergency_activated: None,
            emergency_activated_at: None,
            emergency_notes: None,
            emergency_resolution: None,
            emergency_contact_notified: None,
            audit_events: Vec::new(),
            modified_by,
            modified_at,
        }
    }

    pub fn status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn audit(mut self, event: SessionAuditEvent) -> Self {
        self.audit_events.push(event);
        self
    }

    /// Apply to an in-memory copy; mirrors the SQL update
    pub(crate) fn apply(&self, session: &mut Session) {
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(at) = self.waiting_room_entered_at {
            session.waiting_room_entered_at = Some(at);
        }
        if let Some(at) = self.session_started_at {
            session.session_started_at = Some(at);
        }
        if let Some(at) = self.session_ended_at {
            session.session_ended_at = Some(at);
        }
        if let Some(minutes) = self.actual_duration_minutes {
            session.actual_duration_minutes = Some(minutes);
        }
        if let Some(reason) = &self.end_reason {
            session.end_reason = Some(reason.clone());
        }
        if let Some(enabled) = self.recording_enabled {
            session.recording_enabled = enabled;
        }
        if let Some(consent) = self.recording_consent {
            session.recording_consent = consent;
        }
        if let Some(at) = self.recording_started_at {
            session.recording_started_at = Some(at);
        }
        if let Some(at) = self.recording_stopped_at {
            session.recording_stopped_at = Some(at);
        }
        if let Some(error) = &self.recording_error {
            session.recording_error = Some(error.clone());
        }
        if let Some(activated) = self.emergency_activated {
            session.emergency_activated = activated;
        }
        if let Some(at) = self.emergency_activated_at {
            session.emergency_activated_at = Some(at);
        }
        if let Some(notes) = &self.emergency_notes {
            session.emergency_notes = Some(notes.clone());
        }
        if let Some(resolution) = self.emergency_resolution {
            session.emergency_resolution = Some(resolution);
        }
        if let Some(notified) = self.emergency_contact_notified {
            session.emergency_contact_notified = notified;
        }
        session.audit_log.extend(self.audit_events.iter().cloned());
        session.last_modified_by = self.modified_by;
        session.updated_at = self.modified_at;
    }
}

/// Field changes for a recording; see [`SessionUpdate`]
#[derive(Debug, Clone)]
pub struct RecordingUpdate {
    pub status: Option<RecordingStatus>,
    pub recording_ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub size_bytes: Option<u64>,
    pub media_url: Option<String>,
    pub storage_bucket: Option<String>,
    pub storage_key: Option<String>,
    pub storage_region: Option<String>,
    pub encryption_type: Option<String>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub processing_error: Option<String>,
    pub clear_processing_error: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<Actor>,
    pub deletion_reason: Option<String>,
    /// Appended to the access log, counters moved, in the same statement
    pub access_entry: Option<AccessLogEntry>,
    pub modified_by: Actor,
    pub modified_at: DateTime<Utc>,
}

impl RecordingUpdate {
    pub fn new(modified_by: Actor, modified_at: DateTime<Utc>) -> Self {
        Self {
            status: None,
            recording_ended_at: None,
            duration_seconds: None,
            size_bytes: None,
            media_url: None,
            storage_bucket: None,
            storage_key: None,
            storage_region: None,
            encryption_type: None,
            uploaded_at: None,
            processing_error: None,
            clear_processing_error: false,
            deleted_at: None,
            deleted_by: None,
            deletion_reason: None,
            access_entry: None,
            modified_by,
            modified_at,
        }
    }

    pub fn status(mut self, status: RecordingStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn access(mut self, entry: AccessLogEntry) -> Self {
        self.access_entry = Some(entry);
        self
    }

    pub(crate) fn apply(&self, recording: &mut Recording) {
        if let Some(status) = self.status {
            recording.status = status;
        }
        if let Some(at) = self.recording_ended_at {
            recording.recording_ended_at = Some(at);
        }
        if let Some(seconds) = self.duration_seconds {
            recording.duration_seconds = seconds;
        }
        if let Some(size) = self.size_bytes {
            recording.size_bytes = size;
        }
        if let Some(url) = &self.media_url {
            recording.media_url = Some(url.clone());
        }
        if let Some(bucket) = &self.storage_bucket {
            recording.storage_bucket = bucket.clone();
        }
        if let Some(key) = &self.storage_key {
            recording.storage_key = key.clone();
        }
        if let Some(region) = &self.storage_region {
            recording.storage_region = region.clone();
        }
        if let Some(encryption) = &self.encryption_type {
            recording.encryption_type = encryption.clone();
        }
        if let Some(at) = self.uploaded_at {
            recording.uploaded_at = Some(at);
        }
        if self.clear_processing_error {
            recording.processing_error = None;
        }
        if let Some(error) = &self.processing_error {
            recording.processing_error = Some(error.clone());
        }
        if let Some(at) = self.deleted_at {
            recording.deleted_at = Some(at);
        }
        if let Some(actor) = self.deleted_by {
            recording.deleted_by = Some(actor);
        }
        if let Some(reason) = &self.deletion_reason {
            recording.deletion_reason = Some(reason.clone());
        }
        if let Some(entry) = &self.access_entry {
            apply_access(recording, entry);
        }
        recording.last_modified_by = self.modified_by;
        recording.updated_at = self.modified_at;
    }
}

/// Append an access entry and move counters; never touches `updated_at`
pub(crate) fn apply_access(recording: &mut Recording, entry: &AccessLogEntry) {
    let (views, downloads) = entry.action.counter_deltas();
    recording.view_count += views;
    recording.download_count += downloads;
    recording.last_accessed_at = Some(entry.timestamp);
    recording.access_log.push(entry.clone());
}

/// Decode a text column into one of the model enums
pub(crate) fn decode_text<T>(column: &str, value: String) -> DatabaseResult<T>
where
    T: std::str::FromStr<Err = crate::models::ParseEnumError>,
{
    value
        .parse()
        .map_err(|e: crate::models::ParseEnumError| {
            DatabaseError::Serialization(format!("{}: {}", column, e))
        })
}

/// Statuses bound as a `text[]` parameter
pub(crate) fn status_texts<T: std::fmt::Display>(statuses: &[T]) -> Vec<String> {
    statuses.iter().map(ToString::to_string).collect()
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> DatabaseResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: Uuid) -> DatabaseResult<Option<Session>>;

    async fn find_by_appointment(&self, appointment_id: Uuid) -> DatabaseResult<Option<Session>>;

    /// Insert unless a session already exists for the same appointment
    async fn insert_if_absent(&self, session: Session) -> DatabaseResult<SessionInsert>;

    /// Apply `update` only while the session is in one of `from`
    async fn transition(
        &self,
        id: Uuid,
        from: &[SessionStatus],
        update: SessionUpdate,
    ) -> DatabaseResult<Option<Session>>;

    /// Append a compliance audit entry without touching any other column
    async fn append_audit(&self, id: Uuid, event: SessionAuditEvent) -> DatabaseResult<bool>;
}

#[async_trait]
pub trait RecordingStore: Send + Sync {
    async fn insert(&self, recording: Recording) -> DatabaseResult<Recording>;

    async fn get(&self, id: Uuid) -> DatabaseResult<Option<Recording>>;

    async fn find_by_sid(&self, recording_sid: &str) -> DatabaseResult<Option<Recording>>;

    /// The recording currently capturing for a session, if any
    async fn find_active_for_session(&self, session_id: Uuid)
    -> DatabaseResult<Option<Recording>>;

    /// Matching page, newest first, with the unpaged total
    async fn list(&self, filter: &RecordingFilter) -> DatabaseResult<(Vec<Recording>, i64)>;

    async fn transition(
        &self,
        id: Uuid,
        from: &[RecordingStatus],
        update: RecordingUpdate,
    ) -> DatabaseResult<Option<Recording>>;

    /// Atomic access-log append plus counter increments
    async fn append_access(&self, id: Uuid, entry: AccessLogEntry) -> DatabaseResult<bool>;

    /// Recordings in `statuses` with `after < scheduled_deletion_at <= until`
    async fn scheduled_for_deletion(
        &self,
        statuses: &[RecordingStatus],
        after: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> DatabaseResult<Vec<Recording>>;

    /// Recordings in `statuses` not updated since `updated_before`
    async fn stale(
        &self,
        statuses: &[RecordingStatus],
        updated_before: DateTime<Utc>,
    ) -> DatabaseResult<Vec<Recording>>;
}

#[async_trait]
pub trait ConsentStore: Send + Sync {
    /// Most recent active, non-withdrawn record for the client and consent type
    async fn latest_active(
        &self,
        client_id: Uuid,
        consent_type: &str,
    ) -> DatabaseResult<Option<ConsentRecord>>;
}

#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn get(&self, id: Uuid) -> DatabaseResult<Option<Appointment>>;
}
