//! Outbound notifications (fire-and-forget)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, warn};
use uuid::Uuid;

use crate::models::{EmergencyResolution, Recording};

/// Delivery is out of scope for the core; implementations must not fail the caller
#[async_trait]
pub trait Notifier: Send + Sync {
    /// A recording will be permanently removed soon
    async fn retention_warning(&self, recording: &Recording, days_remaining: i64);

    /// The background download/upload of a recording failed
    async fn recording_failed(&self, recording_id: Uuid, error: &str);

    async fn emergency_activated(
        &self,
        session_id: Uuid,
        resolution: EmergencyResolution,
        at: DateTime<Utc>,
    );
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn retention_warning(&self, recording: &Recording, days_remaining: i64) {
        warn!(
            recording_id = %recording.id,
            session_id = %recording.session_id,
            scheduled_deletion_at = %recording.scheduled_deletion_at,
            days_remaining,
            "Recording approaching end of retention period"
        );
    }

    async fn recording_failed(&self, recording_id: Uuid, error: &str) {
        error!(%recording_id, error, "Recording processing failed");
    }

    async fn emergency_activated(
        &self,
        session_id: Uuid,
        resolution: EmergencyResolution,
        at: DateTime<Utc>,
    ) {
        warn!(%session_id, %resolution, %at, "Emergency activated during telehealth session");
    }
}
