//! Telehealth session model and its state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Actor;

/// Room identifiers starting with this prefix were synthesized offline
pub const MOCK_ROOM_PREFIX: &str = "MOCK-";

/// Lifecycle of a session: `SCHEDULED → WAITING_ROOM → IN_PROGRESS → COMPLETED`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Scheduled,
    WaitingRoom,
    InProgress,
    Completed,
}

text_enum!(SessionStatus, "session status", {
    Scheduled => "SCHEDULED",
    WaitingRoom => "WAITING_ROOM",
    InProgress => "IN_PROGRESS",
    Completed => "COMPLETED",
});

impl SessionStatus {
    /// Every status a session can still leave
    pub const OPEN: [SessionStatus; 3] = [
        SessionStatus::Scheduled,
        SessionStatus::WaitingRoom,
        SessionStatus::InProgress,
    ];

    pub const ALL: [SessionStatus; 4] = [
        SessionStatus::Scheduled,
        SessionStatus::WaitingRoom,
        SessionStatus::InProgress,
        SessionStatus::Completed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed)
    }
}

/// Which side of the encounter is joining
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Clinician,
    Client,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Clinician => "clinician",
            ParticipantRole::Client => "client",
        }
    }
}

/// How an emergency raised during a session was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyResolution {
    Continued,
    EndedImmediately,
    FalseAlarm,
}

text_enum!(EmergencyResolution, "emergency resolution", {
    Continued => "CONTINUED",
    EndedImmediately => "ENDED_IMMEDIATELY",
    FalseAlarm => "FALSE_ALARM",
});

/// Kinds of entries in a session's compliance audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEventKind {
    SessionCreated,
    WaitingRoomEntered,
    ParticipantJoined,
    SessionStarted,
    SessionEnded,
    EmergencyActivated,
    RecordingStarted,
    RecordingStopped,
    RecordingFailed,
}

/// One append-only compliance audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event: SessionEventKind,
    pub actor: Actor,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl SessionAuditEvent {
    pub fn new(
        timestamp: DateTime<Utc>,
        event: SessionEventKind,
        actor: Actor,
        details: serde_json::Value,
    ) -> Self {
        Self {
            timestamp,
            event,
            actor,
            details,
        }
    }
}

/// One telehealth encounter, tied 1:1 to an appointment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub appointment_id: Uuid,
    pub room_sid: String,
    pub room_name: String,
    pub status: SessionStatus,
    pub clinician_id: Uuid,
    pub client_id: Uuid,
    pub waiting_room_entered_at: Option<DateTime<Utc>>,
    pub session_started_at: Option<DateTime<Utc>>,
    pub session_ended_at: Option<DateTime<Utc>>,
    /// Whole minutes between start and end; `None` until the session ends
    pub actual_duration_minutes: Option<i32>,
    pub end_reason: Option<String>,
    pub recording_enabled: bool,
    pub recording_consent: bool,
    pub recording_started_at: Option<DateTime<Utc>>,
    pub recording_stopped_at: Option<DateTime<Utc>>,
    pub recording_error: Option<String>,
    pub emergency_activated: bool,
    pub emergency_activated_at: Option<DateTime<Utc>>,
    pub emergency_notes: Option<String>,
    pub emergency_resolution: Option<EmergencyResolution>,
    pub emergency_contact_notified: bool,
    pub audit_log: Vec<SessionAuditEvent>,
    pub created_by: Actor,
    pub last_modified_by: Actor,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A fresh `SCHEDULED` session for an appointment
    pub fn scheduled(
        appointment_id: Uuid,
        clinician_id: Uuid,
        client_id: Uuid,
        room_sid: String,
        room_name: String,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            appointment_id,
            room_sid,
            room_name,
            status: SessionStatus::Scheduled,
            clinician_id,
            client_id,
            waiting_room_entered_at: None,
            session_started_at: None,
            session_ended_at: None,
            actual_duration_minutes: None,
            end_reason: None,
            recording_enabled: false,
            recording_consent: false,
            recording_started_at: None,
            recording_stopped_at: None,
            recording_error: None,
            emergency_activated: false,
            emergency_activated_at: None,
            emergency_notes: None,
            emergency_resolution: None,
            emergency_contact_notified: false,
            audit_log: Vec::new(),
            created_by: actor,
            last_modified_by: actor,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the room was synthesized because the provider was unreachable
    pub fn is_mock_room(&self) -> bool {
        self.room_sid.starts_with(MOCK_ROOM_PREFIX)
    }
}

/// Whole minutes between `started` and `ended`, clamped at zero.
///
/// `None` when the session never started.
pub fn duration_minutes(started: Option<DateTime<Utc>>, ended: DateTime<Utc>) -> Option<i32> {
    started.map(|start| {
        let minutes = (ended - start).num_minutes().max(0);
        i32::try_from(minutes).unwrap_or(i32::MAX)
    })
}
