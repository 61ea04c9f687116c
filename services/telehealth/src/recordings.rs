//! Recording lifecycle manager
//!
//! `RECORDING → PROCESSING → UPLOADING → AVAILABLE → ARCHIVED → DELETED`, with
//! `FAILED` reachable from the in-flight states. Media moves from the video
//! provider into encrypted object storage after the provider reports the
//! recording complete.

use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use common::clock::Clock;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::AccessAuditLog;
use crate::error::{TelehealthError, TelehealthResult};
use crate::models::recording::{RETENTION_POLICY_7_YEARS, storage_key};
use crate::models::{
    AccessAction, Actor, Recording, RecordingConsent, RecordingFilter, RecordingOptions,
    RecordingStatus, Session, SessionAuditEvent, SessionEventKind, SessionStatus,
};
use crate::notifications::Notifier;
use crate::repositories::{RecordingStore, RecordingUpdate, SessionStore, SessionUpdate};
use crate::storage::{MAX_PRESIGN_TTL, ObjectStore, UploadObject, clamp_presign_ttl};
use crate::video::{CallbackOutcome, RecordingStatusCallback, VideoProvider};

/// Storage placement recorded on every new recording row
#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub retention_years: u32,
    pub storage_region: String,
    pub encryption: String,
}

/// A time-limited playback link
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackUrl {
    pub recording_id: Uuid,
    pub url: String,
    pub expires_in_secs: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingPage {
    pub recordings: Vec<Recording>,
    pub total: i64,
    pub limit: u32,
    pub offset: u32,
}

pub struct RecordingService {
    recordings: Arc<dyn RecordingStore>,
    sessions: Arc<dyn SessionStore>,
    video: Arc<dyn VideoProvider>,
    storage: Arc<dyn ObjectStore>,
    audit: AccessAuditLog,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: RecordingSettings,
}

impl RecordingService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        recordings: Arc<dyn RecordingStore>,
        sessions: Arc<dyn SessionStore>,
        video: Arc<dyn VideoProvider>,
        storage: Arc<dyn ObjectStore>,
        audit: AccessAuditLog,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: RecordingSettings,
    ) -> Self {
        Self {
            recordings,
            sessions,
            video,
            storage,
            audit,
            notifier,
            clock,
            settings,
        }
    }

    async fn load(&self, recording_id: Uuid) -> TelehealthResult<Recording> {
        self.recordings
            .get(recording_id)
            .await?
            .ok_or_else(|| TelehealthError::not_found("Recording", recording_id))
    }

    fn retention_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_months(Months::new(self.settings.retention_years * 12))
            .unwrap_or_else(|| now + ChronoDuration::days(365 * i64::from(self.settings.retention_years)))
    }

    /// Begin capturing a session.
    ///
    /// Consent is checked before anything else, including the session lookup.
    pub async fn start(
        &self,
        session_id: Uuid,
        actor: Actor,
        consent: RecordingConsent,
        options: RecordingOptions,
    ) -> TelehealthResult<Recording> {
        if !consent.given {
            return Err(TelehealthError::ConsentRequired(
                "Client consent is required before a session can be recorded".to_string(),
            ));
        }

        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| TelehealthError::not_found("Session", session_id))?;

        if session.status.is_terminal() {
            return Err(TelehealthError::InvalidState(format!(
                "session {} has already ended",
                session_id
            )));
        }
        if session.is_mock_room() {
            return Err(TelehealthError::UnsupportedSource(
                "cannot record a session running in an offline mock room".to_string(),
            ));
        }
        if let Some(active) = self.recordings.find_active_for_session(session_id).await? {
            return Err(TelehealthError::AlreadyInProgress(format!(
                "recording {} is already capturing session {}",
                active.id, session_id
            )));
        }

        let capture = self
            .video
            .start_recording(&session.room_sid, options.audio_only)
            .await?;

        let now = self.clock.now();
        let recording = Recording {
            id: Uuid::new_v4(),
            session_id,
            recording_sid: capture.sid.clone(),
            room_sid: session.room_sid.clone(),
            status: RecordingStatus::Recording,
            recording_started_at: now,
            recording_ended_at: None,
            duration_seconds: 0,
            size_bytes: 0,
            format: options.format,
            audio_only: options.audio_only,
            client_consent_given: consent.given,
            consent_timestamp: now,
            consent_ip_address: consent.ip_address.clone(),
            storage_bucket: self.storage.bucket().to_string(),
            storage_key: storage_key(session_id, &capture.sid, options.format),
            storage_region: self.settings.storage_region.clone(),
            encryption_type: self.settings.encryption.clone(),
            retention_policy: RETENTION_POLICY_7_YEARS.to_string(),
            scheduled_deletion_at: self.retention_deadline(now),
            media_url: None,
            uploaded_at: None,
            processing_error: None,
            deleted_at: None,
            deleted_by: None,
            deletion_reason: None,
            view_count: 0,
            download_count: 0,
            last_accessed_at: Some(now),
            access_log: vec![self.audit.entry(
                actor,
                AccessAction::StartRecording,
                consent.ip_address,
                json!({
                    "recordingSid": capture.sid,
                    "audioOnly": options.audio_only,
                    "format": options.format,
                }),
            )],
            created_by: actor,
            last_modified_by: actor,
            created_at: now,
            updated_at: now,
        };

        let recording = match self.recordings.insert(recording).await {
            Ok(recording) => recording,
            Err(e) => {
                error!(%session_id, recording_sid = %capture.sid, error = %e, "Failed to persist recording; stopping capture");
                if let Err(stop) = self
                    .video
                    .stop_recording(&session.room_sid, &capture.sid)
                    .await
                {
                    warn!(recording_sid = %capture.sid, error = %stop, "Failed to stop orphaned capture");
                }
                return Err(e.into());
            }
        };

        let mut update = SessionUpdate::new(actor, now).audit(SessionAuditEvent::new(
            now,
            SessionEventKind::RecordingStarted,
            actor,
            json!({ "recordingId": recording.id, "recordingSid": recording.recording_sid }),
        ));
        update.recording_enabled = Some(true);
        update.recording_consent = Some(true);
        update.recording_started_at = Some(now);
        self.update_session_flags(session_id, update).await;

        info!(
            recording_id = %recording.id,
            %session_id,
            recording_sid = %recording.recording_sid,
            scheduled_deletion_at = %recording.scheduled_deletion_at,
            "Recording started"
        );
        Ok(recording)
    }

    /// Stop capture; of concurrent callers only one succeeds
    pub async fn stop(&self, recording_id: Uuid, actor: Actor) -> TelehealthResult<Recording> {
        let recording = self.load(recording_id).await?;
        if recording.status != RecordingStatus::Recording {
            return Err(TelehealthError::InvalidState(format!(
                "recording {} is {}, not RECORDING",
                recording_id, recording.status
            )));
        }

        if let Err(e) = self
            .video
            .stop_recording(&recording.room_sid, &recording.recording_sid)
            .await
        {
            let current = self.load(recording_id).await?;
            if current.status != RecordingStatus::Recording {
                return Err(TelehealthError::InvalidState(format!(
                    "recording {} was stopped concurrently",
                    recording_id
                )));
            }
            return Err(e.into());
        }

        let now = self.clock.now();
        let duration = (now - recording.recording_started_at).num_seconds().max(0);
        let duration = i32::try_from(duration).unwrap_or(i32::MAX);

        let mut update = RecordingUpdate::new(actor, now)
            .status(RecordingStatus::Processing)
            .access(self.audit.entry(
                actor,
                AccessAction::StopRecording,
                None,
                json!({ "durationSeconds": duration }),
            ));
        update.recording_ended_at = Some(now);
        update.duration_seconds = Some(duration);

        let stopped = self
            .recordings
            .transition(recording_id, &[RecordingStatus::Recording], update)
            .await?
            .ok_or_else(|| {
                TelehealthError::InvalidState(format!(
                    "recording {} was stopped concurrently",
                    recording_id
                ))
            })?;

        let mut session_update =
            SessionUpdate::new(actor, now).audit(SessionAuditEvent::new(
                now,
                SessionEventKind::RecordingStopped,
                actor,
                json!({ "recordingId": recording_id, "durationSeconds": duration }),
            ));
        session_update.recording_stopped_at = Some(now);
        self.update_session_flags(stopped.session_id, session_update)
            .await;

        info!(%recording_id, duration_seconds = duration, "Recording stopped");
        Ok(stopped)
    }

    /// Handle a provider status callback. Never fails; problems are logged.
    ///
    /// Returns the handle of the background upload when one was started.
    pub async fn on_provider_callback(
        self: &Arc<Self>,
        callback: RecordingStatusCallback,
    ) -> Option<JoinHandle<()>> {
        let recording = match self.recordings.find_by_sid(&callback.recording_sid).await {
            Ok(Some(recording)) => recording,
            Ok(None) => {
                warn!(recording_sid = %callback.recording_sid, "Callback for unknown recording");
                return None;
            }
            Err(e) => {
                error!(recording_sid = %callback.recording_sid, error = %e, "Failed to load recording for callback");
                return None;
            }
        };

        match callback.outcome() {
            CallbackOutcome::Completed => self.on_completed(recording, callback).await,
            CallbackOutcome::Failed => {
                self.on_failed(recording, callback).await;
                None
            }
            CallbackOutcome::Other => {
                debug!(recording_id = %recording.id, status = %callback.status, "Ignoring recording status callback");
                None
            }
        }
    }

    async fn on_completed(
        self: &Arc<Self>,
        recording: Recording,
        callback: RecordingStatusCallback,
    ) -> Option<JoinHandle<()>> {
        let now = self.clock.now();
        let mut update = RecordingUpdate::new(Actor::System, now).status(RecordingStatus::Processing);
        if recording.recording_ended_at.is_none() {
            update.recording_ended_at = Some(now);
        }
        update.duration_seconds = callback
            .duration
            .map(|d| i32::try_from(d.max(0)).unwrap_or(i32::MAX));
        update.size_bytes = callback.size;

        let result = self
            .recordings
            .transition(
                recording.id,
                &[RecordingStatus::Recording, RecordingStatus::Processing],
                update,
            )
            .await;

        match result {
            Ok(Some(_)) => {}
            Ok(None) => {
                info!(recording_id = %recording.id, status = %recording.status, "Duplicate completion callback ignored");
                return None;
            }
            Err(e) => {
                error!(recording_id = %recording.id, error = %e, "Failed to record completion callback");
                return None;
            }
        }

        let service = Arc::clone(self);
        let recording_id = recording.id;
        Some(tokio::spawn(async move {
            if let Err(e) = service
                .download_and_upload_recording(recording_id, Actor::System)
                .await
            {
                // a redelivered callback loses the claim to the upload already running
                if service.has_failed(recording_id).await {
                    service
                        .notifier
                        .recording_failed(recording_id, &e.to_string())
                        .await;
                } else {
                    info!(%recording_id, error = %e, "Upload handled by another callback");
                }
            }
        }))
    }

    async fn has_failed(&self, recording_id: Uuid) -> bool {
        matches!(
            self.recordings.get(recording_id).await,
            Ok(Some(recording)) if recording.status == RecordingStatus::Failed
        )
    }

    async fn on_failed(&self, recording: Recording, callback: RecordingStatusCallback) {
        let reason = callback
            .failure_reason
            .unwrap_or_else(|| "Video provider reported the recording as failed".to_string());
        warn!(recording_id = %recording.id, reason = %reason, "Provider reported recording failure");

        if let Err(e) = self
            .mark_failed(recording.id, recording.session_id, &reason)
            .await
        {
            error!(recording_id = %recording.id, error = %e, "Failed to mark recording as failed");
        }
    }

    /// Move finished media from the provider into storage.
    ///
    /// Also used to retry a `FAILED` recording. On error the recording is
    /// marked `FAILED` and the error is returned.
    pub async fn download_and_upload_recording(
        &self,
        recording_id: Uuid,
        actor: Actor,
    ) -> TelehealthResult<Recording> {
        let recording = self.load(recording_id).await?;

        let mut update =
            RecordingUpdate::new(actor, self.clock.now()).status(RecordingStatus::Uploading);
        update.clear_processing_error = true;
        let uploading = self
            .recordings
            .transition(
                recording_id,
                &[RecordingStatus::Processing, RecordingStatus::Failed],
                update,
            )
            .await?
            .ok_or_else(|| {
                TelehealthError::InvalidState(format!(
                    "recording {} is {}, not ready for upload",
                    recording_id, recording.status
                ))
            })?;

        match self.transfer(&uploading, actor).await {
            Ok(available) => Ok(available),
            Err(e) => {
                error!(%recording_id, error = %e, "Recording upload failed");
                if let Err(mark) = self
                    .mark_failed(recording_id, uploading.session_id, &e.to_string())
                    .await
                {
                    error!(%recording_id, error = %mark, "Failed to mark recording as failed");
                }
                Err(e)
            }
        }
    }

    async fn transfer(&self, recording: &Recording, actor: Actor) -> TelehealthResult<Recording> {
        // media is always located through the provider API, never from callback input
        let media_url = self
            .video
            .fetch_recording(&recording.room_sid, &recording.recording_sid)
            .await?
            .media_url
            .ok_or_else(|| {
                TelehealthError::Provider(format!(
                    "provider has no media for recording {}",
                    recording.recording_sid
                ))
            })?;

        let body = self.video.download_media(&media_url).await?;
        let session = self.sessions.get(recording.session_id).await?;

        let stored = self
            .storage
            .upload(upload_object(recording, session.as_ref(), body, self.clock.now()))
            .await?;

        let now = self.clock.now();
        let mut update = RecordingUpdate::new(actor, now)
            .status(RecordingStatus::Available)
            .access(self.audit.entry(
                actor,
                AccessAction::UploadCompleted,
                None,
                json!({ "bucket": stored.bucket, "key": stored.key, "sizeBytes": stored.size_bytes }),
            ));
        update.size_bytes = Some(stored.size_bytes);
        update.storage_bucket = Some(stored.bucket.clone());
        update.storage_key = Some(stored.key.clone());
        update.storage_region = Some(stored.region.clone());
        update.encryption_type = Some(stored.encryption.clone());
        update.uploaded_at = Some(now);
        update.media_url = Some(media_url);

        let available = self
            .recordings
            .transition(recording.id, &[RecordingStatus::Uploading], update)
            .await?
            .ok_or_else(|| {
                TelehealthError::InvalidState(format!(
                    "recording {} changed state during upload",
                    recording.id
                ))
            })?;

        info!(recording_id = %recording.id, key = %stored.key, size_bytes = stored.size_bytes, "Recording available");
        Ok(available)
    }

    async fn mark_failed(
        &self,
        recording_id: Uuid,
        session_id: Uuid,
        reason: &str,
    ) -> TelehealthResult<()> {
        let now = self.clock.now();
        let mut update = RecordingUpdate::new(Actor::System, now).status(RecordingStatus::Failed);
        update.processing_error = Some(reason.to_string());
        if self
            .recordings
            .transition(recording_id, &RecordingStatus::IN_FLIGHT, update)
            .await?
            .is_none()
        {
            debug!(%recording_id, reason, "Recording no longer in flight; failure not recorded");
            return Ok(());
        }

        let mut session_update =
            SessionUpdate::new(Actor::System, now).audit(SessionAuditEvent::new(
                now,
                SessionEventKind::RecordingFailed,
                Actor::System,
                json!({ "recordingId": recording_id, "error": reason }),
            ));
        session_update.recording_error = Some(reason.to_string());
        self.update_session_flags(session_id, session_update).await;
        Ok(())
    }

    /// Soft-delete a recording after removing its stored media
    pub async fn delete(
        &self,
        recording_id: Uuid,
        actor: Actor,
        reason: &str,
    ) -> TelehealthResult<Recording> {
        let recording = self.load(recording_id).await?;
        if recording.status == RecordingStatus::Deleted {
            return Err(TelehealthError::AlreadyDeleted(recording_id));
        }
        if recording.status == RecordingStatus::Recording {
            return Err(TelehealthError::InvalidState(format!(
                "recording {} is still capturing; stop it before deleting",
                recording_id
            )));
        }

        // the row may only claim deletion once the object is gone
        self.storage.delete(&recording.storage_key).await?;

        let now = self.clock.now();
        let mut update = RecordingUpdate::new(actor, now)
            .status(RecordingStatus::Deleted)
            .access(self.audit.entry(
                actor,
                AccessAction::DeleteRecording,
                None,
                json!({ "reason": reason }),
            ));
        update.deleted_at = Some(now);
        update.deleted_by = Some(actor);
        update.deletion_reason = Some(reason.to_string());

        match self
            .recordings
            .transition(recording_id, &RecordingStatus::DELETABLE, update)
            .await?
        {
            Some(deleted) => {
                info!(%recording_id, %actor, reason, "Recording deleted");
                Ok(deleted)
            }
            None => Err(TelehealthError::AlreadyDeleted(recording_id)),
        }
    }

    /// Presigned read URL for a stored recording, capped at one hour
    pub async fn get_playback_url(
        &self,
        recording_id: Uuid,
        actor: Actor,
        expires_in: Option<Duration>,
        origin: Option<String>,
    ) -> TelehealthResult<PlaybackUrl> {
        let recording = self.load(recording_id).await?;
        if recording.status == RecordingStatus::Deleted {
            return Err(TelehealthError::AlreadyDeleted(recording_id));
        }
        if !recording.status.is_playable() {
            return Err(TelehealthError::InvalidState(format!(
                "recording {} is {}, not available for playback",
                recording_id, recording.status
            )));
        }

        let ttl = clamp_presign_ttl(expires_in.unwrap_or(MAX_PRESIGN_TTL));
        let url = self
            .storage
            .presigned_url(&recording.storage_key, ttl)
            .await?;

        self.audit
            .log_access(
                recording_id,
                actor,
                AccessAction::GeneratePlaybackUrl,
                origin,
                json!({ "expiresInSecs": ttl.as_secs() }),
            )
            .await;

        let expires_in_secs = ttl.as_secs();
        Ok(PlaybackUrl {
            recording_id,
            url,
            expires_in_secs,
            expires_at: self.clock.now()
                + ChronoDuration::seconds(i64::try_from(expires_in_secs).unwrap_or(0)),
        })
    }

    /// Fetch one recording, logging the view
    pub async fn get_recording(
        &self,
        recording_id: Uuid,
        actor: Actor,
        origin: Option<String>,
    ) -> TelehealthResult<Recording> {
        self.load(recording_id).await?;
        self.audit
            .log_access(
                recording_id,
                actor,
                AccessAction::ViewRecording,
                origin,
                serde_json::Value::Null,
            )
            .await;
        self.load(recording_id).await
    }

    pub async fn list_recordings(
        &self,
        filter: &RecordingFilter,
        actor: Actor,
        origin: Option<String>,
    ) -> TelehealthResult<RecordingPage> {
        let (recordings, total) = self.recordings.list(filter).await?;

        if filter.session_id.is_some() {
            for recording in &recordings {
                self.audit
                    .log_access(
                        recording.id,
                        actor,
                        AccessAction::ViewRecordingList,
                        origin.clone(),
                        serde_json::Value::Null,
                    )
                    .await;
            }
        }

        Ok(RecordingPage {
            recordings,
            total,
            limit: filter.page_size(),
            offset: filter.page_offset(),
        })
    }

    /// Record an access from outside the service (e.g. a download proxy)
    pub async fn log_access(
        &self,
        recording_id: Uuid,
        actor: Actor,
        action: AccessAction,
        metadata: serde_json::Value,
    ) {
        self.audit
            .log_access(recording_id, actor, action, None, metadata)
            .await;
    }

    async fn update_session_flags(&self, session_id: Uuid, update: SessionUpdate) {
        match self
            .sessions
            .transition(session_id, &SessionStatus::ALL, update)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => warn!(%session_id, "Session missing while updating recording flags"),
            Err(e) => error!(%session_id, error = %e, "Failed to update session recording flags"),
        }
    }
}

fn upload_object(
    recording: &Recording,
    session: Option<&Session>,
    body: Vec<u8>,
    now: DateTime<Utc>,
) -> UploadObject {
    let mut metadata = HashMap::from([
        ("recording-sid".to_string(), recording.recording_sid.clone()),
        ("session-id".to_string(), recording.session_id.to_string()),
        (
            "consent-given".to_string(),
            recording.client_consent_given.to_string(),
        ),
        ("uploaded-at".to_string(), now.to_rfc3339()),
    ]);
    if let Some(session) = session {
        metadata.insert(
            "appointment-id".to_string(),
            session.appointment_id.to_string(),
        );
        metadata.insert("client-id".to_string(), session.client_id.to_string());
        metadata.insert("clinician-id".to_string(), session.clinician_id.to_string());
    }

    UploadObject {
        key: recording.storage_key.clone(),
        body,
        content_type: recording.format.content_type(recording.audio_only).to_string(),
        metadata,
        tagging: Some(format!(
            "Type=TelehealthRecording&SessionId={}&ConsentGiven={}",
            recording.session_id, recording.client_consent_given
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ParticipantRole;
    use crate::test_support::Harness;
    use crate::video::ProviderError;

    async fn recording_harness() -> (Harness, Session) {
        let h = Harness::new();
        let appointment = h.telehealth_appointment_with_consent();
        let clinician = Actor::User(appointment.clinician_id);
        h.sessions.create(appointment.id, clinician).await.unwrap();
        let joined = h
            .sessions
            .join(appointment.id, clinician, ParticipantRole::Clinician)
            .await
            .unwrap();
        (h, joined.session)
    }

    fn consent() -> RecordingConsent {
        RecordingConsent {
            given: true,
            ip_address: Some("203.0.113.9".into()),
        }
    }

    #[tokio::test]
    async fn test_start_without_consent_persists_nothing() {
        let (h, session) = recording_harness().await;

        let err = h
            .recordings
            .start(
                session.id,
                Actor::System,
                RecordingConsent::default(),
                RecordingOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TelehealthError::ConsentRequired(_)));
        assert!(h.recording_store.is_empty());
        assert_eq!(h.video.recordings_started(), 0);
    }

    #[tokio::test]
    async fn test_start_sets_retention_and_session_flags() {
        let (h, session) = recording_harness().await;
        let actor = Actor::User(session.clinician_id);

        let recording = h
            .recordings
            .start(session.id, actor, consent(), RecordingOptions::default())
            .await
            .unwrap();

        assert_eq!(recording.status, RecordingStatus::Recording);
        assert_eq!(
            recording.scheduled_deletion_at,
            h.clock.now().checked_add_months(Months::new(84)).unwrap()
        );
        assert_eq!(recording.retention_policy, "7_YEARS");
        assert_eq!(recording.access_log[0].action, AccessAction::StartRecording);
        assert!(recording.storage_key.ends_with(".mp4"));

        let session = h.session_store.get(session.id).await.unwrap().unwrap();
        assert!(session.recording_enabled);
        assert!(session.recording_consent);
        assert!(session.recording_started_at.is_some());

        let err = h
            .recordings
            .start(session.id, actor, consent(), RecordingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TelehealthError::AlreadyInProgress(_)));
    }

    #[tokio::test]
    async fn test_mock_room_cannot_be_recorded() {
        let h = Harness::new();
        h.video
            .fail_rooms_with(ProviderError::Unreachable("dns".into()));
        let appointment = h.telehealth_appointment_with_consent();
        let session = h
            .sessions
            .create(appointment.id, Actor::System)
            .await
            .unwrap();

        let err = h
            .recordings
            .start(session.id, Actor::System, consent(), RecordingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TelehealthError::UnsupportedSource(_)));
    }

    #[tokio::test]
    async fn test_stop_computes_duration_and_second_stop_fails() {
        let (h, session) = recording_harness().await;
        let recording = h
            .recordings
            .start(session.id, Actor::System, consent(), RecordingOptions::default())
            .await
            .unwrap();

        h.clock.advance(ChronoDuration::seconds(95));
        let stopped = h.recordings.stop(recording.id, Actor::System).await.unwrap();
        assert_eq!(stopped.status, RecordingStatus::Processing);
        assert_eq!(stopped.duration_seconds, 95);
        assert_eq!(
            stopped.access_log.last().map(|e| e.action),
            Some(AccessAction::StopRecording)
        );

        let err = h
            .recordings
            .stop(recording.id, Actor::System)
            .await
            .unwrap_err();
        assert!(matches!(err, TelehealthError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_concurrent_stops_have_one_winner() {
        let (h, session) = recording_harness().await;
        let recording = h
            .recordings
            .start(session.id, Actor::System, consent(), RecordingOptions::default())
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            h.recordings.stop(recording.id, Actor::System),
            h.recordings.stop(recording.id, Actor::System)
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    }

    #[tokio::test]
    async fn test_completion_callback_uploads_media() {
        let (h, session) = recording_harness().await;
        let recording = h
            .recordings
            .start(session.id, Actor::System, consent(), RecordingOptions::default())
            .await
            .unwrap();

        let handle = h
            .recordings
            .on_provider_callback(RecordingStatusCallback {
                recording_sid: recording.recording_sid.clone(),
                status: "completed".into(),
                duration: Some(1800),
                size: Some(2048),
                media_url: Some("/v1/Recordings/RT/Media".into()),
                ..Default::default()
            })
            .await
            .expect("upload task spawned");
        handle.await.unwrap();

        let stored = h.recording_store.get(recording.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordingStatus::Available);
        assert_eq!(stored.duration_seconds, 1800);
        assert!(stored.uploaded_at.is_some());
        assert!(h.storage.contains(&stored.storage_key));
        assert_eq!(
            h.storage.tagging(&stored.storage_key).as_deref(),
            Some(
                format!(
                    "Type=TelehealthRecording&SessionId={}&ConsentGiven=true",
                    session.id
                )
                .as_str()
            )
        );
        assert!(stored
            .access_log
            .iter()
            .any(|e| e.action == AccessAction::UploadCompleted));
    }

    #[tokio::test]
    async fn test_callback_media_url_is_resolved_through_the_provider() {
        let (h, session) = recording_harness().await;
        let recording = h
            .recordings
            .start(session.id, Actor::System, consent(), RecordingOptions::default())
            .await
            .unwrap();

        let handle = h
            .recordings
            .on_provider_callback(RecordingStatusCallback {
                recording_sid: recording.recording_sid.clone(),
                status: "completed".into(),
                media_url: Some("https://evil.example/steal".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        handle.await.unwrap();

        let provider_media = format!("/v1/Recordings/{}/Media", recording.recording_sid);
        assert_eq!(h.video.downloaded_urls(), vec![provider_media.clone()]);

        let stored = h.recording_store.get(recording.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordingStatus::Available);
        assert_eq!(stored.media_url.as_deref(), Some(provider_media.as_str()));
    }

    #[tokio::test]
    async fn test_duplicate_completion_callback_is_not_reported_as_failure() {
        let (h, session) = recording_harness().await;
        let recording = h
            .recordings
            .start(session.id, Actor::System, consent(), RecordingOptions::default())
            .await
            .unwrap();

        let callback = RecordingStatusCallback {
            recording_sid: recording.recording_sid.clone(),
            status: "completed".into(),
            ..Default::default()
        };
        let first = h.recordings.on_provider_callback(callback.clone()).await;
        let second = h.recordings.on_provider_callback(callback).await;
        for handle in [first, second].into_iter().flatten() {
            handle.await.unwrap();
        }

        let stored = h.recording_store.get(recording.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordingStatus::Available);
        assert!(h.notifier.failures().is_empty());
        assert_eq!(
            stored
                .access_log
                .iter()
                .filter(|e| e.action == AccessAction::UploadCompleted)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_late_failed_callback_leaves_available_recording_alone() {
        let (h, session) = recording_harness().await;
        let recording = h.available_recording(session.id).await;

        let handle = h
            .recordings
            .on_provider_callback(RecordingStatusCallback {
                recording_sid: recording.recording_sid.clone(),
                status: "failed".into(),
                failure_reason: Some("late provider error".into()),
                ..Default::default()
            })
            .await;
        assert!(handle.is_none());

        let stored = h.recording_store.get(recording.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordingStatus::Available);
        assert!(stored.processing_error.is_none());

        let session = h.session_store.get(session.id).await.unwrap().unwrap();
        assert!(session.recording_error.is_none());
        assert!(!session
            .audit_log
            .iter()
            .any(|e| e.event == SessionEventKind::RecordingFailed));
    }

    #[tokio::test]
    async fn test_failed_upload_marks_recording_and_notifies() {
        let (h, session) = recording_harness().await;
        let recording = h
            .recordings
            .start(session.id, Actor::System, consent(), RecordingOptions::default())
            .await
            .unwrap();
        h.storage.fail_uploads(true);

        let handle = h
            .recordings
            .on_provider_callback(RecordingStatusCallback {
                recording_sid: recording.recording_sid.clone(),
                status: "completed".into(),
                media_url: Some("/media".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        handle.await.unwrap();

        let stored = h.recording_store.get(recording.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordingStatus::Failed);
        assert!(stored.processing_error.is_some());
        assert_eq!(h.notifier.failures(), vec![recording.id]);

        // manual retry once storage recovers
        h.storage.fail_uploads(false);
        let retried = h
            .recordings
            .download_and_upload_recording(recording.id, Actor::System)
            .await
            .unwrap();
        assert_eq!(retried.status, RecordingStatus::Available);
        assert!(retried.processing_error.is_none());
    }

    #[tokio::test]
    async fn test_failed_callback_marks_recording_and_session() {
        let (h, session) = recording_harness().await;
        let recording = h
            .recordings
            .start(session.id, Actor::System, consent(), RecordingOptions::default())
            .await
            .unwrap();

        let handle = h
            .recordings
            .on_provider_callback(RecordingStatusCallback {
                recording_sid: recording.recording_sid.clone(),
                status: "failed".into(),
                failure_reason: Some("media server crashed".into()),
                ..Default::default()
            })
            .await;
        assert!(handle.is_none());

        let stored = h.recording_store.get(recording.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordingStatus::Failed);
        assert_eq!(stored.processing_error.as_deref(), Some("media server crashed"));

        let session = h.session_store.get(session.id).await.unwrap().unwrap();
        assert_eq!(session.recording_error.as_deref(), Some("media server crashed"));
    }

    #[tokio::test]
    async fn test_provider_refusal_persists_nothing() {
        let (h, session) = recording_harness().await;
        h.video.fail_recordings_with(ProviderError::Rejected {
            status: 400,
            message: "Recording not enabled for room".into(),
        });

        let err = h
            .recordings
            .start(session.id, Actor::System, consent(), RecordingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TelehealthError::Provider(_)));
        assert!(h.recording_store.is_empty());
    }

    #[tokio::test]
    async fn test_download_failure_marks_recording_failed() {
        let (h, session) = recording_harness().await;
        let recording = h
            .recordings
            .start(session.id, Actor::System, consent(), RecordingOptions::default())
            .await
            .unwrap();
        h.recordings.stop(recording.id, Actor::System).await.unwrap();
        assert_eq!(h.video.stopped_recordings(), vec![recording.recording_sid.clone()]);

        h.video
            .fail_downloads_with(ProviderError::Unreachable("timed out".into()));
        let err = h
            .recordings
            .download_and_upload_recording(recording.id, Actor::System)
            .await
            .unwrap_err();
        assert!(matches!(err, TelehealthError::ProviderUnavailable(_)));

        let stored = h.recording_store.get(recording.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordingStatus::Failed);
        assert!(h.storage.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_callback_is_ignored() {
        let h = Harness::new();
        let handle = h
            .recordings
            .on_provider_callback(RecordingStatusCallback {
                recording_sid: "RT-unknown".into(),
                status: "completed".into(),
                ..Default::default()
            })
            .await;
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn test_active_capture_cannot_be_deleted() {
        let (h, session) = recording_harness().await;
        let recording = h
            .recordings
            .start(session.id, Actor::System, consent(), RecordingOptions::default())
            .await
            .unwrap();

        let err = h
            .recordings
            .delete(recording.id, Actor::System, "client request")
            .await
            .unwrap_err();
        assert!(matches!(err, TelehealthError::InvalidState(_)));

        let stored = h.recording_store.get(recording.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordingStatus::Recording);
        assert!(h.video.stopped_recordings().is_empty());

        h.recordings.stop(recording.id, Actor::System).await.unwrap();
        let deleted = h
            .recordings
            .delete(recording.id, Actor::System, "client request")
            .await
            .unwrap();
        assert_eq!(deleted.status, RecordingStatus::Deleted);
    }

    #[tokio::test]
    async fn test_delete_is_not_idempotent_and_removes_object_first() {
        let (h, session) = recording_harness().await;
        let recording = h.available_recording(session.id).await;

        h.storage.fail_deletes(true);
        let err = h
            .recordings
            .delete(recording.id, Actor::System, "client request")
            .await
            .unwrap_err();
        assert!(matches!(err, TelehealthError::StorageFailure(_)));
        let stored = h.recording_store.get(recording.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordingStatus::Available);

        h.storage.fail_deletes(false);
        let deleted = h
            .recordings
            .delete(recording.id, Actor::System, "client request")
            .await
            .unwrap();
        assert_eq!(deleted.status, RecordingStatus::Deleted);
        assert_eq!(deleted.deletion_reason.as_deref(), Some("client request"));
        assert!(!h.storage.contains(&recording.storage_key));

        let err = h
            .recordings
            .delete(recording.id, Actor::System, "client request")
            .await
            .unwrap_err();
        assert!(matches!(err, TelehealthError::AlreadyDeleted(_)));
    }

    #[tokio::test]
    async fn test_playback_url_is_capped_and_logged() {
        let (h, session) = recording_harness().await;
        let recording = h.available_recording(session.id).await;
        let viewer = Actor::User(session.clinician_id);

        let playback = h
            .recordings
            .get_playback_url(
                recording.id,
                viewer,
                Some(Duration::from_secs(6 * 3600)),
                Some("198.51.100.4".into()),
            )
            .await
            .unwrap();
        assert_eq!(playback.expires_in_secs, 3600);

        let stored = h.recording_store.get(recording.id).await.unwrap().unwrap();
        assert_eq!(stored.view_count, 1);
        let entry = stored.access_log.last().unwrap();
        assert_eq!(entry.action, AccessAction::GeneratePlaybackUrl);
        assert_eq!(entry.origin.as_deref(), Some("198.51.100.4"));
    }

    #[tokio::test]
    async fn test_playback_requires_stored_media() {
        let (h, session) = recording_harness().await;
        let recording = h
            .recordings
            .start(session.id, Actor::System, consent(), RecordingOptions::default())
            .await
            .unwrap();

        let err = h
            .recordings
            .get_playback_url(recording.id, Actor::System, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TelehealthError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_session_listing_logs_each_recording() {
        let (h, session) = recording_harness().await;
        let recording = h.available_recording(session.id).await;

        let page = h
            .recordings
            .list_recordings(
                &RecordingFilter::for_session(session.id),
                Actor::User(session.clinician_id),
                None,
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.limit, 50);

        let stored = h.recording_store.get(recording.id).await.unwrap().unwrap();
        assert_eq!(
            stored.access_log.last().map(|e| e.action),
            Some(AccessAction::ViewRecordingList)
        );
    }
}
