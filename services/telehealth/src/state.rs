//! Application state shared across handlers

use common::clock::Clock;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::AccessAuditLog;
use crate::config::TelehealthConfig;
use crate::consent::ConsentGate;
use crate::middleware::AuthKeys;
use crate::notifications::Notifier;
use crate::recordings::{RecordingService, RecordingSettings};
use crate::repositories::{AppointmentStore, ConsentStore, RecordingStore, SessionStore};
use crate::retention::{RetentionSweep, RetentionWindows};
use crate::sessions::SessionService;
use crate::storage::ObjectStore;
use crate::video::VideoProvider;

/// External collaborators the core is wired from
pub struct Collaborators {
    pub sessions: Arc<dyn SessionStore>,
    pub recordings: Arc<dyn RecordingStore>,
    pub consents: Arc<dyn ConsentStore>,
    pub appointments: Arc<dyn AppointmentStore>,
    pub video: Arc<dyn VideoProvider>,
    pub storage: Arc<dyn ObjectStore>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionService>,
    pub recordings: Arc<RecordingService>,
    pub retention: Arc<RetentionSweep>,
    pub consent: ConsentGate,
    pub video: Arc<dyn VideoProvider>,
    pub storage: Arc<dyn ObjectStore>,
    pub auth: Arc<AuthKeys>,
}

impl AppState {
    pub fn new(collaborators: Collaborators, config: &TelehealthConfig, auth: AuthKeys) -> Self {
        let Collaborators {
            sessions,
            recordings,
            consents,
            appointments,
            video,
            storage,
            notifier,
            clock,
        } = collaborators;

        let consent = ConsentGate::new(consents, clock.clone(), &config.consent);

        let session_service = Arc::new(SessionService::new(
            sessions.clone(),
            appointments,
            consent.clone(),
            video.clone(),
            notifier.clone(),
            clock.clone(),
            Duration::from_secs(config.video.token_ttl_secs),
        ));

        let audit = AccessAuditLog::new(recordings.clone(), clock.clone());
        let recording_service = Arc::new(RecordingService::new(
            recordings.clone(),
            sessions,
            video.clone(),
            storage.clone(),
            audit.clone(),
            notifier.clone(),
            clock.clone(),
            RecordingSettings {
                retention_years: config.retention.retention_years,
                storage_region: config.storage.region.clone(),
                encryption: config.storage.encryption.clone(),
            },
        ));

        let retention = Arc::new(RetentionSweep::new(
            recordings,
            recording_service.clone(),
            audit,
            notifier,
            clock,
            RetentionWindows::from(&config.retention),
        ));

        Self {
            sessions: session_service,
            recordings: recording_service,
            retention,
            consent,
            video,
            storage,
            auth: Arc::new(auth),
        }
    }
}
