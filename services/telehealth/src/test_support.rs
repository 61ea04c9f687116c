//! Shared fixtures for unit tests

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Months, TimeZone, Utc};
use common::clock::{Clock, ManualClock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::audit::AccessAuditLog;
use crate::config::{
    AuthConfig, ConsentConfig, RetentionConfig, ServerConfig, StorageConfig, TelehealthConfig,
    VideoConfig,
};
use crate::consent::ConsentGate;
use crate::models::recording::{RETENTION_POLICY_7_YEARS, storage_key};
use crate::models::{
    Actor, Appointment, ConsentRecord, EmergencyResolution, Recording, RecordingFormat,
    RecordingStatus,
};
use crate::notifications::Notifier;
use crate::recordings::{RecordingService, RecordingSettings};
use crate::repositories::{
    MemoryAppointmentStore, MemoryConsentStore, MemoryRecordingStore, MemorySessionStore,
};
use crate::retention::{RetentionSweep, RetentionWindows};
use crate::sessions::SessionService;
use crate::storage::{MemoryObjectStore, ObjectStore, UploadObject};
use crate::video::{AccessGrant, ProviderError, ProviderRecording, VideoProvider, VideoRoom};

pub const TEST_BUCKET: &str = "test-recordings";

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Configuration matching the defaults, without touching the environment
pub fn test_config() -> TelehealthConfig {
    TelehealthConfig {
        server: ServerConfig {
            bind_address: "127.0.0.1:0".into(),
        },
        auth: AuthConfig {
            jwt_public_key: None,
            jwt_secret: Some("test-secret".into()),
        },
        video: VideoConfig {
            account_sid: None,
            auth_token: None,
            api_key_sid: None,
            api_key_secret: None,
            base_url: "http://127.0.0.1:9".into(),
            callback_base_url: None,
            token_ttl_secs: 4 * 60 * 60,
            request_timeout_secs: 5,
            media_download_timeout_secs: 300,
        },
        storage: StorageConfig {
            bucket: Some(TEST_BUCKET.into()),
            region: "us-east-1".into(),
            encryption: "AES256".into(),
        },
        consent: ConsentConfig {
            consent_type: "Georgia_Telehealth".into(),
            renewal_window_days: 30,
        },
        retention: RetentionConfig {
            enabled: false,
            schedule: "0 0 2 * * *".into(),
            retention_years: 7,
            warning_days: 30,
            grace_days: 90,
            stuck_after_days: 7,
            lease_ttl_secs: 3600,
        },
        redis_url: None,
    }
}

/// Video provider double that records calls and fails on demand
#[derive(Debug, Default)]
pub struct StubVideoProvider {
    rooms_created: AtomicUsize,
    recordings_started: AtomicUsize,
    room_failure: Mutex<Option<ProviderError>>,
    teardown_failure: Mutex<Option<ProviderError>>,
    recording_failure: Mutex<Option<ProviderError>>,
    download_failure: Mutex<Option<ProviderError>>,
    completed_rooms: Mutex<Vec<String>>,
    stopped_recordings: Mutex<Vec<String>>,
    downloaded_urls: Mutex<Vec<String>>,
}

impl StubVideoProvider {
    pub fn fail_rooms_with(&self, error: ProviderError) {
        *lock(&self.room_failure) = Some(error);
    }

    pub fn fail_teardown_with(&self, error: ProviderError) {
        *lock(&self.teardown_failure) = Some(error);
    }

    pub fn fail_recordings_with(&self, error: ProviderError) {
        *lock(&self.recording_failure) = Some(error);
    }

    pub fn fail_downloads_with(&self, error: ProviderError) {
        *lock(&self.download_failure) = Some(error);
    }

    pub fn rooms_created(&self) -> usize {
        self.rooms_created.load(Ordering::SeqCst)
    }

    pub fn recordings_started(&self) -> usize {
        self.recordings_started.load(Ordering::SeqCst)
    }

    pub fn completed_rooms(&self) -> Vec<String> {
        lock(&self.completed_rooms).clone()
    }

    pub fn stopped_recordings(&self) -> Vec<String> {
        lock(&self.stopped_recordings).clone()
    }

    pub fn downloaded_urls(&self) -> Vec<String> {
        lock(&self.downloaded_urls).clone()
    }

    fn check(slot: &Mutex<Option<ProviderError>>) -> Result<(), ProviderError> {
        match lock(slot).as_ref() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl VideoProvider for StubVideoProvider {
    fn is_configured(&self) -> bool {
        true
    }

    async fn create_room(&self, unique_name: &str) -> Result<VideoRoom, ProviderError> {
        Self::check(&self.room_failure)?;
        self.rooms_created.fetch_add(1, Ordering::SeqCst);
        Ok(VideoRoom {
            sid: format!("RM{}", Uuid::new_v4().simple()),
            unique_name: unique_name.to_string(),
            is_mock: false,
        })
    }

    async fn complete_room(&self, room_sid: &str) -> Result<(), ProviderError> {
        Self::check(&self.teardown_failure)?;
        lock(&self.completed_rooms).push(room_sid.to_string());
        Ok(())
    }

    fn issue_access_token(
        &self,
        identity: &str,
        room_name: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<AccessGrant, ProviderError> {
        let ttl = crate::video::cap_token_ttl(ttl);
        Ok(AccessGrant {
            token: format!("stub-token-{}", identity),
            identity: identity.to_string(),
            room_name: room_name.to_string(),
            expires_at: now + ChronoDuration::seconds(ttl.as_secs() as i64),
            is_mock: false,
        })
    }

    async fn start_recording(
        &self,
        _room_sid: &str,
        _audio_only: bool,
    ) -> Result<ProviderRecording, ProviderError> {
        Self::check(&self.recording_failure)?;
        self.recordings_started.fetch_add(1, Ordering::SeqCst);
        Ok(ProviderRecording {
            sid: format!("RT{}", Uuid::new_v4().simple()),
            status: "processing".to_string(),
            ..ProviderRecording::default()
        })
    }

    async fn stop_recording(
        &self,
        _room_sid: &str,
        recording_sid: &str,
    ) -> Result<(), ProviderError> {
        Self::check(&self.recording_failure)?;
        lock(&self.stopped_recordings).push(recording_sid.to_string());
        Ok(())
    }

    async fn fetch_recording(
        &self,
        _room_sid: &str,
        recording_sid: &str,
    ) -> Result<ProviderRecording, ProviderError> {
        Ok(ProviderRecording {
            sid: recording_sid.to_string(),
            status: "completed".to_string(),
            duration_seconds: Some(60),
            size_bytes: Some(1024),
            media_url: Some(format!("/v1/Recordings/{}/Media", recording_sid)),
        })
    }

    async fn download_media(&self, media_url: &str) -> Result<Vec<u8>, ProviderError> {
        Self::check(&self.download_failure)?;
        lock(&self.downloaded_urls).push(media_url.to_string());
        Ok(vec![0u8; 1024])
    }
}

/// Notifier that remembers what it was asked to send
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    warnings: Mutex<Vec<(Uuid, i64)>>,
    failures: Mutex<Vec<Uuid>>,
    emergencies: Mutex<Vec<(Uuid, EmergencyResolution)>>,
}

impl CollectingNotifier {
    pub fn warnings(&self) -> Vec<(Uuid, i64)> {
        lock(&self.warnings).clone()
    }

    pub fn failures(&self) -> Vec<Uuid> {
        lock(&self.failures).clone()
    }

    pub fn emergencies(&self) -> Vec<(Uuid, EmergencyResolution)> {
        lock(&self.emergencies).clone()
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn retention_warning(&self, recording: &Recording, days_remaining: i64) {
        lock(&self.warnings).push((recording.id, days_remaining));
    }

    async fn recording_failed(&self, recording_id: Uuid, _error: &str) {
        lock(&self.failures).push(recording_id);
    }

    async fn emergency_activated(
        &self,
        session_id: Uuid,
        resolution: EmergencyResolution,
        _at: DateTime<Utc>,
    ) {
        lock(&self.emergencies).push((session_id, resolution));
    }
}

/// A stored recording row with no access history
pub fn sample_recording(
    session_id: Uuid,
    status: RecordingStatus,
    started_at: DateTime<Utc>,
) -> Recording {
    let recording_sid = format!("RT{}", Uuid::new_v4().simple());
    let stored = matches!(
        status,
        RecordingStatus::Available | RecordingStatus::Archived | RecordingStatus::Deleted
    );

    Recording {
        id: Uuid::new_v4(),
        session_id,
        storage_key: storage_key(session_id, &recording_sid, RecordingFormat::Mp4),
        recording_sid,
        room_sid: format!("RM{}", Uuid::new_v4().simple()),
        status,
        recording_started_at: started_at,
        recording_ended_at: (status != RecordingStatus::Recording)
            .then(|| started_at + ChronoDuration::minutes(50)),
        duration_seconds: 3000,
        size_bytes: 0,
        format: RecordingFormat::Mp4,
        audio_only: false,
        client_consent_given: true,
        consent_timestamp: started_at,
        consent_ip_address: None,
        storage_bucket: TEST_BUCKET.to_string(),
        storage_region: "us-east-1".to_string(),
        encryption_type: "AES256".to_string(),
        retention_policy: RETENTION_POLICY_7_YEARS.to_string(),
        scheduled_deletion_at: started_at
            .checked_add_months(Months::new(84))
            .unwrap_or(started_at),
        media_url: None,
        uploaded_at: stored.then_some(started_at + ChronoDuration::hours(1)),
        processing_error: None,
        deleted_at: None,
        deleted_by: None,
        deletion_reason: None,
        view_count: 0,
        download_count: 0,
        last_accessed_at: None,
        access_log: Vec::new(),
        created_by: Actor::System,
        last_modified_by: Actor::System,
        created_at: started_at,
        updated_at: started_at,
    }
}

/// Fully wired services over in-memory collaborators and a manual clock
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub session_store: Arc<MemorySessionStore>,
    pub recording_store: Arc<MemoryRecordingStore>,
    pub consent_store: Arc<MemoryConsentStore>,
    pub appointment_store: Arc<MemoryAppointmentStore>,
    pub video: Arc<StubVideoProvider>,
    pub storage: Arc<MemoryObjectStore>,
    pub notifier: Arc<CollectingNotifier>,
    pub sessions: SessionService,
    pub recordings: Arc<RecordingService>,
    pub retention: RetentionSweep,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap(),
        ));
        let session_store = Arc::new(MemorySessionStore::new());
        let recording_store = Arc::new(MemoryRecordingStore::new());
        let consent_store = Arc::new(MemoryConsentStore::new());
        let appointment_store = Arc::new(MemoryAppointmentStore::new());
        let video = Arc::new(StubVideoProvider::default());
        let storage = Arc::new(MemoryObjectStore::new(TEST_BUCKET));
        let notifier = Arc::new(CollectingNotifier::default());

        let consent = ConsentGate::new(
            consent_store.clone(),
            clock.clone(),
            &ConsentConfig {
                consent_type: "Georgia_Telehealth".into(),
                renewal_window_days: 30,
            },
        );

        let sessions = SessionService::new(
            session_store.clone(),
            appointment_store.clone(),
            consent,
            video.clone(),
            notifier.clone(),
            clock.clone(),
            Duration::from_secs(4 * 60 * 60),
        );

        let audit = AccessAuditLog::new(recording_store.clone(), clock.clone());
        let recordings = Arc::new(RecordingService::new(
            recording_store.clone(),
            session_store.clone(),
            video.clone(),
            storage.clone(),
            audit.clone(),
            notifier.clone(),
            clock.clone(),
            RecordingSettings {
                retention_years: 7,
                storage_region: "us-east-1".into(),
                encryption: "AES256".into(),
            },
        ));

        let retention = RetentionSweep::new(
            recording_store.clone(),
            recordings.clone(),
            audit,
            notifier.clone(),
            clock.clone(),
            RetentionWindows::default(),
        );

        Self {
            clock,
            session_store,
            recording_store,
            consent_store,
            appointment_store,
            video,
            storage,
            notifier,
            sessions,
            recordings,
            retention,
        }
    }

    /// A telehealth appointment whose client has no consent on file
    pub fn telehealth_appointment(&self) -> Appointment {
        let appointment = Appointment {
            id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            clinician_id: Uuid::new_v4(),
            appointment_date: self.clock.now() + ChronoDuration::hours(1),
            is_telehealth: true,
        };
        self.appointment_store.insert(appointment.clone());
        appointment
    }

    pub fn telehealth_appointment_with_consent(&self) -> Appointment {
        self.telehealth_appointment_with_consent_expiring(ChronoDuration::days(365))
    }

    pub fn telehealth_appointment_with_consent_expiring(
        &self,
        valid_for: ChronoDuration,
    ) -> Appointment {
        let appointment = self.telehealth_appointment();
        let now = self.clock.now();
        self.consent_store.insert(ConsentRecord {
            id: Uuid::new_v4(),
            client_id: appointment.client_id,
            consent_type: "Georgia_Telehealth".into(),
            consent_given: true,
            expiration_date: Some(now + valid_for),
            is_active: true,
            withdrawn: false,
            created_at: now - ChronoDuration::days(1),
        });
        appointment
    }

    /// An `AVAILABLE` recording whose media is already in storage
    pub async fn available_recording(&self, session_id: Uuid) -> Recording {
        let mut recording =
            sample_recording(session_id, RecordingStatus::Available, self.clock.now());
        let stored = self
            .storage
            .upload(UploadObject {
                key: recording.storage_key.clone(),
                body: vec![0u8; 2048],
                content_type: "video/mp4".into(),
                metadata: HashMap::new(),
                tagging: None,
            })
            .await
            .unwrap();
        recording.size_bytes = stored.size_bytes;
        self.recording_store.put(recording.clone());
        recording
    }
}
