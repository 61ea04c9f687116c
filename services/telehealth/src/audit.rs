//! Access audit log for recordings

use common::clock::Clock;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::models::{AccessAction, AccessLogEntry, Actor};
use crate::repositories::RecordingStore;

/// Append-only record of who did what to a recording.
///
/// Logging never fails the operation it is attached to: store errors are
/// logged and swallowed.
#[derive(Clone)]
pub struct AccessAuditLog {
    store: Arc<dyn RecordingStore>,
    clock: Arc<dyn Clock>,
}

impl AccessAuditLog {
    pub fn new(store: Arc<dyn RecordingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Build an entry stamped with the current time
    pub fn entry(
        &self,
        actor: Actor,
        action: AccessAction,
        origin: Option<String>,
        metadata: serde_json::Value,
    ) -> AccessLogEntry {
        AccessLogEntry {
            timestamp: self.clock.now(),
            actor,
            action,
            origin,
            metadata,
        }
    }

    pub async fn log_access(
        &self,
        recording_id: Uuid,
        actor: Actor,
        action: AccessAction,
        origin: Option<String>,
        metadata: serde_json::Value,
    ) {
        let entry = self.entry(actor, action, origin, metadata);

        match self.store.append_access(recording_id, entry).await {
            Ok(true) => debug!(%recording_id, ?action, %actor, "Recording access logged"),
            Ok(false) => warn!(%recording_id, ?action, "Access logged for unknown recording"),
            Err(e) => error!(%recording_id, ?action, error = %e, "Failed to log recording access"),
        }
    }
}
