//! Session state machine
//!
//! `SCHEDULED → WAITING_ROOM → IN_PROGRESS → COMPLETED`, plus the emergency
//! "end immediately" path. Every status change goes through a conditional
//! store update, so concurrent callers cannot double-transition a session.

use common::clock::Clock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::consent::ConsentGate;
use crate::error::{TelehealthError, TelehealthResult};
use crate::models::session::duration_minutes;
use crate::models::{
    Actor, EmergencyResolution, ParticipantRole, Session, SessionAuditEvent, SessionEventKind,
    SessionStatus,
};
use crate::notifications::Notifier;
use crate::repositories::{AppointmentStore, SessionInsert, SessionStore, SessionUpdate};
use crate::video::{AccessGrant, VideoProvider, mock_access_grant, mock_room};

/// Minimum length of the notes accompanying an emergency activation
pub const MIN_EMERGENCY_NOTES_LEN: usize = 10;

const EMERGENCY_END_REASON: &str = "Emergency";
const DEFAULT_END_REASON: &str = "Session ended";

/// What a participant receives when joining
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedSession {
    pub session: Session,
    pub access: AccessGrant,
    /// Set when the client's consent is valid but due for renewal
    pub consent_warning: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyRequest {
    pub notes: String,
    pub resolution: EmergencyResolution,
    #[serde(default)]
    pub contact_notified: bool,
}

pub struct SessionService {
    sessions: Arc<dyn SessionStore>,
    appointments: Arc<dyn AppointmentStore>,
    consent: ConsentGate,
    video: Arc<dyn VideoProvider>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    token_ttl: Duration,
}

impl SessionService {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        appointments: Arc<dyn AppointmentStore>,
        consent: ConsentGate,
        video: Arc<dyn VideoProvider>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        token_ttl: Duration,
    ) -> Self {
        Self {
            sessions,
            appointments,
            consent,
            video,
            notifier,
            clock,
            token_ttl,
        }
    }

    pub async fn get(&self, session_id: Uuid) -> TelehealthResult<Session> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or_else(|| TelehealthError::not_found("Session", session_id))
    }

    /// Create the session for an appointment, or return the one that exists
    pub async fn create(&self, appointment_id: Uuid, actor: Actor) -> TelehealthResult<Session> {
        self.create_for_appointment(appointment_id, actor, false)
            .await
    }

    async fn create_for_appointment(
        &self,
        appointment_id: Uuid,
        actor: Actor,
        bypass_consent: bool,
    ) -> TelehealthResult<Session> {
        let appointment = self
            .appointments
            .get(appointment_id)
            .await?
            .ok_or_else(|| TelehealthError::not_found("Appointment", appointment_id))?;

        if let Some(existing) = self.sessions.find_by_appointment(appointment_id).await? {
            info!(session_id = %existing.id, %appointment_id, "Session already exists for appointment");
            return Ok(existing);
        }

        if !appointment.is_telehealth {
            return Err(TelehealthError::InvalidState(format!(
                "appointment {} is not a telehealth appointment",
                appointment_id
            )));
        }

        if !bypass_consent {
            let verdict = self.consent.verify_client(appointment.client_id).await;
            if !verdict.is_valid {
                return Err(TelehealthError::ConsentRequired(verdict.message));
            }
        }

        let room_name = format!("telehealth-{}", appointment_id);
        let room = match self.video.create_room(&room_name).await {
            Ok(room) => room,
            Err(e) if e.is_network() => {
                warn!(%appointment_id, error = %e, "Video provider unreachable; using mock room");
                mock_room(&room_name)
            }
            Err(e) => return Err(e.into()),
        };

        let now = self.clock.now();
        let mut session = Session::scheduled(
            appointment_id,
            appointment.clinician_id,
            appointment.client_id,
            room.sid.clone(),
            room.unique_name.clone(),
            actor,
            now,
        );
        session.audit_log.push(SessionAuditEvent::new(
            now,
            SessionEventKind::SessionCreated,
            actor,
            json!({
                "roomSid": room.sid,
                "mockRoom": room.is_mock,
                "consentBypassed": bypass_consent,
            }),
        ));

        match self.sessions.insert_if_absent(session).await? {
            SessionInsert::Inserted(session) => {
                info!(
                    session_id = %session.id,
                    %appointment_id,
                    room_sid = %session.room_sid,
                    mock = room.is_mock,
                    "Telehealth session created"
                );
                Ok(session)
            }
            SessionInsert::Existing(existing) => {
                info!(session_id = %existing.id, %appointment_id, "Lost session creation race; returning existing session");
                if !room.is_mock {
                    self.teardown_room(&room.sid).await;
                }
                Ok(existing)
            }
        }
    }

    /// Join the session for an appointment.
    ///
    /// A clinician joining an appointment without a session creates it
    /// without a consent check; consent is then clinician-attested.
    pub async fn join(
        &self,
        appointment_id: Uuid,
        actor: Actor,
        role: ParticipantRole,
    ) -> TelehealthResult<JoinedSession> {
        let session = match self.sessions.find_by_appointment(appointment_id).await? {
            Some(session) => session,
            None => match role {
                ParticipantRole::Client => {
                    return Err(TelehealthError::not_found(
                        "Session for appointment",
                        appointment_id,
                    ));
                }
                ParticipantRole::Clinician => {
                    warn!(
                        %appointment_id,
                        %actor,
                        "Clinician join creating session without consent verification"
                    );
                    self.create_for_appointment(appointment_id, actor, true)
                        .await?
                }
            },
        };

        if session.status.is_terminal() {
            return Err(TelehealthError::InvalidState(format!(
                "session {} has already ended",
                session.id
            )));
        }

        let mut consent_warning = None;
        if role == ParticipantRole::Client {
            let verdict = self.consent.verify_client(session.client_id).await;
            if !verdict.is_valid {
                return Err(TelehealthError::ConsentInvalid(verdict.message));
            }
            if verdict.requires_renewal {
                warn!(
                    session_id = %session.id,
                    client_id = %session.client_id,
                    days_till_expiration = ?verdict.days_till_expiration,
                    "Client consent requires renewal"
                );
                consent_warning = Some(verdict.message);
            }
        }

        let session = self.record_join(session, actor, role).await?;

        let now = self.clock.now();
        let identity = format!("{}-{}", role.as_str(), actor);
        let access = if session.is_mock_room() {
            mock_access_grant(&identity, &session.room_name, self.token_ttl, now)
        } else {
            self.video
                .issue_access_token(&identity, &session.room_name, self.token_ttl, now)?
        };

        info!(session_id = %session.id, role = role.as_str(), %actor, status = %session.status, "Participant joined session");

        Ok(JoinedSession {
            session,
            access,
            consent_warning,
        })
    }

    async fn record_join(
        &self,
        mut session: Session,
        actor: Actor,
        role: ParticipantRole,
    ) -> TelehealthResult<Session> {
        loop {
            let now = self.clock.now();
            let joined = SessionAuditEvent::new(
                now,
                SessionEventKind::ParticipantJoined,
                actor,
                json!({ "role": role.as_str() }),
            );

            let (from, update): (&[SessionStatus], SessionUpdate) = match (role, session.status) {
                (
                    ParticipantRole::Clinician,
                    SessionStatus::Scheduled | SessionStatus::WaitingRoom,
                ) => {
                    let mut update = SessionUpdate::new(actor, now)
                        .status(SessionStatus::InProgress)
                        .audit(joined)
                        .audit(SessionAuditEvent::new(
                            now,
                            SessionEventKind::SessionStarted,
                            actor,
                            json!({}),
                        ));
                    update.session_started_at = Some(now);
                    (&[SessionStatus::Scheduled, SessionStatus::WaitingRoom], update)
                }
                (ParticipantRole::Client, SessionStatus::Scheduled) => {
                    let mut update = SessionUpdate::new(actor, now)
                        .status(SessionStatus::WaitingRoom)
                        .audit(joined)
                        .audit(SessionAuditEvent::new(
                            now,
                            SessionEventKind::WaitingRoomEntered,
                            actor,
                            json!({}),
                        ));
                    update.waiting_room_entered_at = Some(now);
                    (&[SessionStatus::Scheduled], update)
                }
                _ => {
                    // no state change; the join is still audited
                    self.sessions.append_audit(session.id, joined).await?;
                    return self.get(session.id).await;
                }
            };

            if let Some(updated) = self.sessions.transition(session.id, from, update).await? {
                return Ok(updated);
            }

            // another participant moved the session first
            session = self.get(session.id).await?;
            if session.status.is_terminal() {
                return Err(TelehealthError::InvalidState(format!(
                    "session {} has already ended",
                    session.id
                )));
            }
        }
    }

    /// End a session; room teardown failures are logged, not returned
    pub async fn end(
        &self,
        session_id: Uuid,
        actor: Actor,
        reason: Option<String>,
    ) -> TelehealthResult<Session> {
        let session = self.get(session_id).await?;
        if session.status.is_terminal() {
            return Err(TelehealthError::InvalidState(format!(
                "session {} has already ended",
                session_id
            )));
        }

        let now = self.clock.now();
        let reason = reason.unwrap_or_else(|| DEFAULT_END_REASON.to_string());
        let duration = duration_minutes(session.session_started_at, now);

        let mut update = SessionUpdate::new(actor, now)
            .status(SessionStatus::Completed)
            .audit(SessionAuditEvent::new(
                now,
                SessionEventKind::SessionEnded,
                actor,
                json!({ "reason": reason, "durationMinutes": duration }),
            ));
        update.session_ended_at = Some(now);
        update.actual_duration_minutes = duration;
        update.end_reason = Some(reason);

        let ended = self
            .sessions
            .transition(session_id, &SessionStatus::OPEN, update)
            .await?
            .ok_or_else(|| {
                TelehealthError::InvalidState(format!("session {} has already ended", session_id))
            })?;

        if !ended.is_mock_room() {
            self.teardown_room(&ended.room_sid).await;
        }

        info!(%session_id, %actor, duration_minutes = ?ended.actual_duration_minutes, "Session ended");
        Ok(ended)
    }

    /// Record an emergency; `EndedImmediately` also completes the session
    pub async fn activate_emergency(
        &self,
        session_id: Uuid,
        actor: Actor,
        request: EmergencyRequest,
    ) -> TelehealthResult<Session> {
        let notes = request.notes.trim();
        if notes.chars().count() < MIN_EMERGENCY_NOTES_LEN {
            return Err(TelehealthError::InvalidInput(format!(
                "emergency notes must be at least {} characters",
                MIN_EMERGENCY_NOTES_LEN
            )));
        }

        let session = self.get(session_id).await?;
        const ACTIVE: [SessionStatus; 2] = [SessionStatus::InProgress, SessionStatus::WaitingRoom];
        if !ACTIVE.contains(&session.status) {
            return Err(TelehealthError::InvalidState(format!(
                "emergency cannot be activated while session is {}",
                session.status
            )));
        }

        let now = self.clock.now();
        let ends_session = request.resolution == EmergencyResolution::EndedImmediately;

        let mut update = SessionUpdate::new(actor, now).audit(SessionAuditEvent::new(
            now,
            SessionEventKind::EmergencyActivated,
            actor,
            json!({
                "resolution": request.resolution,
                "contactNotified": request.contact_notified,
            }),
        ));
        update.emergency_activated = Some(true);
        update.emergency_activated_at = Some(now);
        update.emergency_notes = Some(notes.to_string());
        update.emergency_resolution = Some(request.resolution);
        update.emergency_contact_notified = Some(request.contact_notified);

        if ends_session {
            update.status = Some(SessionStatus::Completed);
            update.session_ended_at = Some(now);
            update.actual_duration_minutes = duration_minutes(session.session_started_at, now);
            update.end_reason = Some(EMERGENCY_END_REASON.to_string());
        }

        let updated = self
            .sessions
            .transition(session_id, &ACTIVE, update)
            .await?
            .ok_or_else(|| {
                TelehealthError::InvalidState(format!(
                    "session {} changed state during emergency activation",
                    session_id
                ))
            })?;

        warn!(%session_id, %actor, resolution = %request.resolution, "Emergency activated");

        if ends_session && !updated.is_mock_room() {
            self.teardown_room(&updated.room_sid).await;
        }
        self.notifier
            .emergency_activated(session_id, request.resolution, now)
            .await;

        Ok(updated)
    }

    async fn teardown_room(&self, room_sid: &str) {
        if let Err(e) = self.video.complete_room(room_sid).await {
            warn!(room_sid, error = %e, "Failed to complete video room");
        }
    }
}
