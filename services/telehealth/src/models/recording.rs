//! Session recording model and its lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Actor;

/// Retention policy label written on every recording row
pub const RETENTION_POLICY_7_YEARS: &str = "7_YEARS";

/// Recording pipeline states.
///
/// `RECORDING → PROCESSING → UPLOADING → AVAILABLE → ARCHIVED → DELETED`, with
/// `FAILED` reachable from the three in-flight states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordingStatus {
    Recording,
    Processing,
    Uploading,
    Available,
    Archived,
    Deleted,
    Failed,
}

text_enum!(RecordingStatus, "recording status", {
    Recording => "RECORDING",
    Processing => "PROCESSING",
    Uploading => "UPLOADING",
    Available => "AVAILABLE",
    Archived => "ARCHIVED",
    Deleted => "DELETED",
    Failed => "FAILED",
});

impl RecordingStatus {
    /// Statuses from which a recording may still be deleted; capture must be stopped first
    pub const DELETABLE: [RecordingStatus; 5] = [
        RecordingStatus::Processing,
        RecordingStatus::Uploading,
        RecordingStatus::Available,
        RecordingStatus::Archived,
        RecordingStatus::Failed,
    ];

    /// Statuses in which the media is in flight between provider and storage
    pub const IN_FLIGHT: [RecordingStatus; 3] = [
        RecordingStatus::Recording,
        RecordingStatus::Processing,
        RecordingStatus::Uploading,
    ];

    pub fn can_transition_to(&self, next: RecordingStatus) -> bool {
        use RecordingStatus as S;

        match (self, next) {
            (S::Deleted, _) => false,
            (S::Recording, S::Deleted) => false,
            (_, S::Deleted) => true,
            (S::Recording, S::Processing) => true,
            (S::Processing, S::Uploading) => true,
            // manual retry of a failed upload
            (S::Failed, S::Uploading) => true,
            (S::Uploading, S::Available) => true,
            (S::Available, S::Archived) => true,
            (S::Recording | S::Processing | S::Uploading, S::Failed) => true,
            _ => false,
        }
    }

    /// Whether stored bytes can be handed out through a playback URL
    pub fn is_playable(&self) -> bool {
        matches!(self, RecordingStatus::Available | RecordingStatus::Archived)
    }
}

/// Container format requested from the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingFormat {
    #[default]
    Mp4,
    Webm,
}

text_enum!(RecordingFormat, "recording format", {
    Mp4 => "mp4",
    Webm => "webm",
});

impl RecordingFormat {
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn content_type(&self, audio_only: bool) -> &'static str {
        match (self, audio_only) {
            (RecordingFormat::Mp4, false) => "video/mp4",
            (RecordingFormat::Mp4, true) => "audio/mp4",
            (RecordingFormat::Webm, false) => "video/webm",
            (RecordingFormat::Webm, true) => "audio/webm",
        }
    }
}

/// Caller-selected capture options
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingOptions {
    pub audio_only: bool,
    pub format: RecordingFormat,
}

/// Consent snapshot supplied when capture starts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordingConsent {
    pub given: bool,
    pub ip_address: Option<String>,
}

/// Actions recorded in a recording's access log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessAction {
    StartRecording,
    StopRecording,
    UploadCompleted,
    GeneratePlaybackUrl,
    ViewRecording,
    ViewRecordingList,
    DownloadRecording,
    DeleteRecording,
    AutoArchive,
}

impl AccessAction {
    /// `(view_count, download_count)` increments caused by this action
    pub fn counter_deltas(&self) -> (i64, i64) {
        match self {
            AccessAction::ViewRecording | AccessAction::GeneratePlaybackUrl => (1, 0),
            AccessAction::DownloadRecording => (0, 1),
            _ => (0, 0),
        }
    }
}

/// One entry of the append-only access audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    pub action: AccessAction,
    /// Caller network origin, if known
    pub origin: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// One captured-media artifact of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    pub id: Uuid,
    pub session_id: Uuid,
    pub recording_sid: String,
    pub room_sid: String,
    pub status: RecordingStatus,
    pub recording_started_at: DateTime<Utc>,
    pub recording_ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: i32,
    pub size_bytes: u64,
    pub format: RecordingFormat,
    pub audio_only: bool,
    pub client_consent_given: bool,
    pub consent_timestamp: DateTime<Utc>,
    pub consent_ip_address: Option<String>,
    pub storage_bucket: String,
    pub storage_key: String,
    pub storage_region: String,
    pub encryption_type: String,
    pub retention_policy: String,
    pub scheduled_deletion_at: DateTime<Utc>,
    pub media_url: Option<String>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub processing_error: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<Actor>,
    pub deletion_reason: Option<String>,
    pub view_count: i64,
    pub download_count: i64,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub access_log: Vec<AccessLogEntry>,
    pub created_by: Actor,
    pub last_modified_by: Actor,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Object key under which a recording's media is stored
pub fn storage_key(session_id: Uuid, recording_sid: &str, format: RecordingFormat) -> String {
    format!(
        "recordings/{}/{}.{}",
        session_id,
        recording_sid,
        format.extension()
    )
}

/// Filters for recording listings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordingFilter {
    pub session_id: Option<Uuid>,
    pub status: Option<RecordingStatus>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl RecordingFilter {
    pub fn for_session(session_id: Uuid) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::default()
        }
    }

    /// Page size, defaulting to 50 and capped at 100
    pub fn page_size(&self) -> u32 {
        self.limit.unwrap_or(50).clamp(1, 100)
    }

    pub fn page_offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }

    /// Deleted recordings are hidden unless asked for explicitly
    pub fn matches(&self, recording: &Recording) -> bool {
        let status_ok = match self.status {
            Some(status) => recording.status == status,
            None => recording.status != RecordingStatus::Deleted,
        };

        status_ok
            && self.session_id.is_none_or(|id| recording.session_id == id)
            && self
                .started_after
                .is_none_or(|after| recording.recording_started_at >= after)
            && self
                .started_before
                .is_none_or(|before| recording.recording_started_at <= before)
    }
}
