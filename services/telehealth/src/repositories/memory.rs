//! In-memory stores for development runs and tests
//!
//! Conditional updates hold the map shard lock for the whole
//! check-and-apply, matching the single-statement SQL versions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::error::{DatabaseError, DatabaseResult};
use dashmap::{DashMap, mapref::entry::Entry};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::{
    AppointmentStore, ConsentStore, RecordingStore, RecordingUpdate, SessionInsert, SessionStore,
    SessionUpdate, apply_access,
};
use crate::models::{
    AccessLogEntry, Appointment, ConsentRecord, Recording, RecordingFilter, RecordingStatus,
    Session, SessionAuditEvent, SessionStatus,
};

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<Uuid, Session>,
    by_appointment: DashMap<Uuid, Uuid>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: Uuid) -> DatabaseResult<Option<Session>> {
        Ok(self.sessions.get(&id).map(|s| s.clone()))
    }

    async fn find_by_appointment(&self, appointment_id: Uuid) -> DatabaseResult<Option<Session>> {
        let Some(id) = self.by_appointment.get(&appointment_id).map(|id| *id) else {
            return Ok(None);
        };
        self.get(id).await
    }

    async fn insert_if_absent(&self, session: Session) -> DatabaseResult<SessionInsert> {
        match self.by_appointment.entry(session.appointment_id) {
            Entry::Occupied(existing) => {
                let existing = self
                    .sessions
                    .get(existing.get())
                    .map(|s| s.clone())
                    .ok_or_else(|| {
                        DatabaseError::Configuration(format!(
                            "appointment {} indexed without a session",
                            session.appointment_id
                        ))
                    })?;
                Ok(SessionInsert::Existing(existing))
            }
            Entry::Vacant(slot) => {
                self.sessions.insert(session.id, session.clone());
                slot.insert(session.id);
                Ok(SessionInsert::Inserted(session))
            }
        }
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[SessionStatus],
        update: SessionUpdate,
    ) -> DatabaseResult<Option<Session>> {
        let Some(mut session) = self.sessions.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&session.status) {
            return Ok(None);
        }
        update.apply(&mut session);
        Ok(Some(session.clone()))
    }

    async fn append_audit(&self, id: Uuid, event: SessionAuditEvent) -> DatabaseResult<bool> {
        match self.sessions.get_mut(&id) {
            Some(mut session) => {
                session.audit_log.push(event);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecordingStore {
    recordings: DashMap<Uuid, Recording>,
}

impl MemoryRecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a row as-is
    pub fn put(&self, recording: Recording) {
        self.recordings.insert(recording.id, recording);
    }

    pub fn len(&self) -> usize {
        self.recordings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recordings.is_empty()
    }

    fn collect(&self, keep: impl Fn(&Recording) -> bool) -> Vec<Recording> {
        self.recordings
            .iter()
            .filter(|r| keep(r.value()))
            .map(|r| r.value().clone())
            .collect()
    }
}

#[async_trait]
impl RecordingStore for MemoryRecordingStore {
    async fn insert(&self, recording: Recording) -> DatabaseResult<Recording> {
        match self.recordings.entry(recording.id) {
            Entry::Occupied(_) => Err(DatabaseError::Serialization(format!(
                "duplicate recording id {}",
                recording.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(recording.clone());
                Ok(recording)
            }
        }
    }

    async fn get(&self, id: Uuid) -> DatabaseResult<Option<Recording>> {
        Ok(self.recordings.get(&id).map(|r| r.clone()))
    }

    async fn find_by_sid(&self, recording_sid: &str) -> DatabaseResult<Option<Recording>> {
        Ok(self
            .collect(|r| r.recording_sid == recording_sid)
            .into_iter()
            .next())
    }

    async fn find_active_for_session(
        &self,
        session_id: Uuid,
    ) -> DatabaseResult<Option<Recording>> {
        Ok(self
            .collect(|r| r.session_id == session_id && r.status == RecordingStatus::Recording)
            .into_iter()
            .max_by_key(|r| r.recording_started_at))
    }

    async fn list(&self, filter: &RecordingFilter) -> DatabaseResult<(Vec<Recording>, i64)> {
        let mut matching = self.collect(|r| filter.matches(r));
        matching.sort_by(|a, b| b.recording_started_at.cmp(&a.recording_started_at));

        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(filter.page_offset() as usize)
            .take(filter.page_size() as usize)
            .collect();

        Ok((page, total))
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[RecordingStatus],
        update: RecordingUpdate,
    ) -> DatabaseResult<Option<Recording>> {
        let Some(mut recording) = self.recordings.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&recording.status) {
            return Ok(None);
        }
        update.apply(&mut recording);
        Ok(Some(recording.clone()))
    }

    async fn append_access(&self, id: Uuid, entry: AccessLogEntry) -> DatabaseResult<bool> {
        match self.recordings.get_mut(&id) {
            Some(mut recording) => {
                apply_access(&mut recording, &entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scheduled_for_deletion(
        &self,
        statuses: &[RecordingStatus],
        after: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> DatabaseResult<Vec<Recording>> {
        let mut due = self.collect(|r| {
            statuses.contains(&r.status)
                && after.is_none_or(|after| r.scheduled_deletion_at > after)
                && r.scheduled_deletion_at <= until
        });
        due.sort_by_key(|r| r.scheduled_deletion_at);
        Ok(due)
    }

    async fn stale(
        &self,
        statuses: &[RecordingStatus],
        updated_before: DateTime<Utc>,
    ) -> DatabaseResult<Vec<Recording>> {
        let mut stale =
            self.collect(|r| statuses.contains(&r.status) && r.updated_at < updated_before);
        stale.sort_by_key(|r| r.updated_at);
        Ok(stale)
    }
}

#[derive(Debug, Default)]
pub struct MemoryConsentStore {
    records: DashMap<Uuid, ConsentRecord>,
    unavailable: AtomicBool,
}

impl MemoryConsentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ConsentRecord) {
        self.records.insert(record.id, record);
    }

    /// Make every read fail, as an unreachable database would
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConsentStore for MemoryConsentStore {
    async fn latest_active(
        &self,
        client_id: Uuid,
        consent_type: &str,
    ) -> DatabaseResult<Option<ConsentRecord>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DatabaseError::Configuration(
                "consent store unavailable".to_string(),
            ));
        }

        Ok(self
            .records
            .iter()
            .filter(|r| {
                r.client_id == client_id
                    && r.consent_type == consent_type
                    && r.is_active
                    && !r.withdrawn
            })
            .max_by_key(|r| r.created_at)
            .map(|r| r.value().clone()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryAppointmentStore {
    appointments: DashMap<Uuid, Appointment>,
}

impl MemoryAppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, appointment: Appointment) {
        self.appointments.insert(appointment.id, appointment);
    }
}

#[async_trait]
impl AppointmentStore for MemoryAppointmentStore {
    async fn get(&self, id: Uuid) -> DatabaseResult<Option<Appointment>> {
        Ok(self.appointments.get(&id).map(|a| a.clone()))
    }
}
