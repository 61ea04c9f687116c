//! Video room adapter
//!
//! Thin wrapper around the video-conferencing provider: room creation and
//! teardown, participant access tokens, and recording capture control. Errors
//! are classified at this boundary so callers can decide on the offline/mock
//! fallback from the error type alone.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::VideoConfig;
use crate::models::session::MOCK_ROOM_PREFIX;

/// Longest lifetime the provider accepts for an access token
pub const MAX_ACCESS_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Path the provider calls when a recording changes state
pub const RECORDING_STATUS_CALLBACK_PATH: &str = "/webhook/recording-status";

/// Typed provider failures
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// No credentials configured; the process runs offline
    #[error("video provider is not configured")]
    Offline,

    /// Connection refused, DNS failure or timeout
    #[error("video provider unreachable: {0}")]
    Unreachable(String),

    #[error("video provider rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected response from video provider: {0}")]
    InvalidResponse(String),

    #[error("video provider request failed: {0}")]
    Request(String),

    #[error("failed to sign access token: {0}")]
    Token(String),

    /// Media location outside the provider API; credentials are never sent there
    #[error("refusing media URL outside the video provider: {0}")]
    UntrustedMediaUrl(String),
}

impl ProviderError {
    /// Network-classified failures; the only ones that allow mock fallback
    pub fn is_network(&self) -> bool {
        matches!(self, ProviderError::Offline | ProviderError::Unreachable(_))
    }
}

fn classify(err: reqwest::Error) -> ProviderError {
    if err.is_connect() || err.is_timeout() {
        ProviderError::Unreachable(err.to_string())
    } else {
        ProviderError::Request(err.to_string())
    }
}

/// A provisioned (or synthesized) video room
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRoom {
    pub sid: String,
    pub unique_name: String,
    pub is_mock: bool,
}

/// Room credential handed to a joining participant
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    pub token: String,
    pub identity: String,
    pub room_name: String,
    pub expires_at: DateTime<Utc>,
    pub is_mock: bool,
}

/// Provider-side view of a recording
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderRecording {
    pub sid: String,
    pub status: String,
    pub duration_seconds: Option<i64>,
    pub size_bytes: Option<u64>,
    pub media_url: Option<String>,
}

/// Operations the session and recording state machines need from the provider
#[async_trait]
pub trait VideoProvider: Send + Sync {
    /// Whether credentials are present; unconfigured providers fail with `Offline`
    fn is_configured(&self) -> bool;

    async fn create_room(&self, unique_name: &str) -> Result<VideoRoom, ProviderError>;

    async fn complete_room(&self, room_sid: &str) -> Result<(), ProviderError>;

    fn issue_access_token(
        &self,
        identity: &str,
        room_name: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<AccessGrant, ProviderError>;

    async fn start_recording(
        &self,
        room_sid: &str,
        audio_only: bool,
    ) -> Result<ProviderRecording, ProviderError>;

    async fn stop_recording(&self, room_sid: &str, recording_sid: &str)
    -> Result<(), ProviderError>;

    async fn fetch_recording(
        &self,
        room_sid: &str,
        recording_sid: &str,
    ) -> Result<ProviderRecording, ProviderError>;

    /// Download finished media using provider-native authentication
    async fn download_media(&self, media_url: &str) -> Result<Vec<u8>, ProviderError>;
}

/// Synthetic room used when the provider cannot be reached
pub fn mock_room(unique_name: &str) -> VideoRoom {
    VideoRoom {
        sid: format!("{}{}", MOCK_ROOM_PREFIX, Uuid::new_v4()),
        unique_name: unique_name.to_string(),
        is_mock: true,
    }
}

/// Placeholder credential for a mock room
pub fn mock_access_grant(
    identity: &str,
    room_name: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> AccessGrant {
    AccessGrant {
        token: format!("{}TOKEN-{}", MOCK_ROOM_PREFIX, Uuid::new_v4()),
        identity: identity.to_string(),
        room_name: room_name.to_string(),
        expires_at: expiry(now, cap_token_ttl(ttl)),
        is_mock: true,
    }
}

/// Clamp a requested token lifetime to the provider maximum
pub fn cap_token_ttl(requested: Duration) -> Duration {
    requested.min(MAX_ACCESS_TOKEN_TTL)
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::seconds(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 1000))
}

#[derive(Debug, Clone)]
struct TwilioCredentials {
    account_sid: String,
    auth_token: String,
    api_key_sid: String,
    api_key_secret: String,
}

/// REST client for the Twilio Video API
#[derive(Debug, Clone)]
pub struct TwilioVideoClient {
    http: reqwest::Client,
    media_http: reqwest::Client,
    credentials: Option<TwilioCredentials>,
    base_url: String,
    status_callback: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RoomResource {
    sid: String,
    unique_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordingResource {
    sid: String,
    status: String,
    duration: Option<i64>,
    size: Option<u64>,
    links: Option<RecordingLinks>,
}

#[derive(Debug, Deserialize)]
struct RecordingLinks {
    media: Option<String>,
}

impl From<RecordingResource> for ProviderRecording {
    fn from(resource: RecordingResource) -> Self {
        Self {
            sid: resource.sid,
            status: resource.status,
            duration_seconds: resource.duration,
            size_bytes: resource.size,
            media_url: resource.links.and_then(|links| links.media),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Serialize)]
struct AccessTokenClaims<'a> {
    jti: String,
    iss: &'a str,
    sub: &'a str,
    iat: i64,
    nbf: i64,
    exp: i64,
    grants: Grants<'a>,
}

#[derive(Serialize)]
struct Grants<'a> {
    identity: &'a str,
    video: VideoGrant<'a>,
}

#[derive(Serialize)]
struct VideoGrant<'a> {
    room: &'a str,
}

impl TwilioVideoClient {
    /// Creates a client. Missing credentials leave it unconfigured rather than failing.
    pub fn new(config: &VideoConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ProviderError::Request(format!("failed to build HTTP client: {e}")))?;

        let media_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.media_download_timeout_secs))
            .build()
            .map_err(|e| ProviderError::Request(format!("failed to build HTTP client: {e}")))?;

        let credentials = match (
            &config.account_sid,
            &config.auth_token,
            &config.api_key_sid,
            &config.api_key_secret,
        ) {
            (Some(account_sid), Some(auth_token), Some(api_key_sid), Some(api_key_secret)) => {
                Some(TwilioCredentials {
                    account_sid: account_sid.clone(),
                    auth_token: auth_token.clone(),
                    api_key_sid: api_key_sid.clone(),
                    api_key_secret: api_key_secret.clone(),
                })
            }
            _ => {
                warn!("Video provider credentials incomplete; sessions will use mock rooms");
                None
            }
        };

        let status_callback = config.callback_base_url.as_ref().map(|base| {
            format!(
                "{}{}",
                base.trim_end_matches('/'),
                RECORDING_STATUS_CALLBACK_PATH
            )
        });

        Ok(Self {
            http,
            media_http,
            credentials,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            status_callback,
        })
    }

    fn credentials(&self) -> Result<&TwilioCredentials, ProviderError> {
        self.credentials.as_ref().ok_or(ProviderError::Offline)
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let credentials = self.credentials()?;
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .basic_auth(&credentials.account_sid, Some(&credentials.auth_token))
            .form(form)
            .send()
            .await
            .map_err(classify)?;

        Self::parse(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let credentials = self.credentials()?;
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .basic_auth(&credentials.account_sid, Some(&credentials.auth_token))
            .send()
            .await
            .map_err(classify)?;

        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ProviderError> {
        let status = response.status();
        debug!(status = %status, "video provider response received");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|e| e.message)
                .unwrap_or(body);
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }

    /// Resolve a media link against the API base; other hosts are refused
    fn media_location(&self, url: &str) -> Result<String, ProviderError> {
        if url.starts_with('/') && !url.starts_with("//") {
            return Ok(format!("{}{}", self.base_url, url));
        }
        if url.starts_with(&format!("{}/", self.base_url)) {
            return Ok(url.to_string());
        }
        Err(ProviderError::UntrustedMediaUrl(url.to_string()))
    }
}

#[async_trait]
impl VideoProvider for TwilioVideoClient {
    fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }

    async fn create_room(&self, unique_name: &str) -> Result<VideoRoom, ProviderError> {
        let mut form = vec![("UniqueName", unique_name), ("Type", "group")];
        if let Some(callback) = &self.status_callback {
            form.push(("StatusCallback", callback.as_str()));
        }

        let room: RoomResource = self.post_form("/v1/Rooms", &form).await?;
        info!(room_sid = %room.sid, unique_name, "Video room created");

        Ok(VideoRoom {
            sid: room.sid,
            unique_name: room.unique_name.unwrap_or_else(|| unique_name.to_string()),
            is_mock: false,
        })
    }

    async fn complete_room(&self, room_sid: &str) -> Result<(), ProviderError> {
        let _: RoomResource = self
            .post_form(&format!("/v1/Rooms/{}", room_sid), &[("Status", "completed")])
            .await?;
        info!(room_sid, "Video room completed");
        Ok(())
    }

    fn issue_access_token(
        &self,
        identity: &str,
        room_name: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<AccessGrant, ProviderError> {
        let credentials = self.credentials()?;
        let ttl = cap_token_ttl(ttl);
        let expires_at = expiry(now, ttl);

        let claims = AccessTokenClaims {
            jti: format!("{}-{}", credentials.api_key_sid, now.timestamp()),
            iss: &credentials.api_key_sid,
            sub: &credentials.account_sid,
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires_at.timestamp(),
            grants: Grants {
                identity,
                video: VideoGrant { room: room_name },
            },
        };

        let mut header = Header::new(Algorithm::HS256);
        header.cty = Some("twilio-fpa;v=1".to_string());

        let token = jsonwebtoken::encode(
            &header,
            &claims,
            &EncodingKey::from_secret(credentials.api_key_secret.as_bytes()),
        )
        .map_err(|e| ProviderError::Token(e.to_string()))?;

        Ok(AccessGrant {
            token,
            identity: identity.to_string(),
            room_name: room_name.to_string(),
            expires_at,
            is_mock: false,
        })
    }

    async fn start_recording(
        &self,
        room_sid: &str,
        audio_only: bool,
    ) -> Result<ProviderRecording, ProviderError> {
        let capture_type = if audio_only { "audio" } else { "video" };
        let mut form = vec![("Type", capture_type)];
        if let Some(callback) = &self.status_callback {
            form.push(("StatusCallback", callback.as_str()));
            form.push(("StatusCallbackMethod", "POST"));
        }

        let recording: RecordingResource = self
            .post_form(&format!("/v1/Rooms/{}/Recordings", room_sid), &form)
            .await?;
        info!(room_sid, recording_sid = %recording.sid, "Provider recording started");
        Ok(recording.into())
    }

    async fn stop_recording(
        &self,
        room_sid: &str,
        recording_sid: &str,
    ) -> Result<(), ProviderError> {
        let _: RecordingResource = self
            .post_form(
                &format!("/v1/Rooms/{}/Recordings/{}", room_sid, recording_sid),
                &[("Status", "stopped")],
            )
            .await?;
        info!(room_sid, recording_sid, "Provider recording stopped");
        Ok(())
    }

    async fn fetch_recording(
        &self,
        room_sid: &str,
        recording_sid: &str,
    ) -> Result<ProviderRecording, ProviderError> {
        let recording: RecordingResource = self
            .get_json(&format!(
                "/v1/Rooms/{}/Recordings/{}",
                room_sid, recording_sid
            ))
            .await?;
        Ok(recording.into())
    }

    async fn download_media(&self, media_url: &str) -> Result<Vec<u8>, ProviderError> {
        let credentials = self.credentials()?;
        let url = self.media_location(media_url)?;

        let response = self
            .media_http
            .get(&url)
            .basic_auth(&credentials.account_sid, Some(&credentials.auth_token))
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response.bytes().await.map_err(classify)?;
        info!(size = bytes.len(), "Downloaded recording media from provider");
        Ok(bytes.to_vec())
    }
}

/// Recording status callback posted by the provider (form encoded)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecordingStatusCallback {
    pub recording_sid: String,
    pub room_sid: Option<String>,
    pub status: String,
    pub duration: Option<i64>,
    pub size: Option<u64>,
    #[serde(alias = "MediaUri")]
    pub media_url: Option<String>,
    pub composition_sid: Option<String>,
    #[serde(alias = "ErrorMessage")]
    pub failure_reason: Option<String>,
}

/// What a status callback asks the recording pipeline to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Completed,
    Failed,
    Other,
}

impl RecordingStatusCallback {
    pub fn outcome(&self) -> CallbackOutcome {
        match self.status.to_ascii_lowercase().as_str() {
            "completed" | "recording-completed" => CallbackOutcome::Completed,
            "failed" | "recording-failed" => CallbackOutcome::Failed,
            _ => CallbackOutcome::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};
    use wiremock::matchers::{basic_auth, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn video_config(base_url: &str) -> VideoConfig {
        VideoConfig {
            account_sid: Some("ACtest".into()),
            auth_token: Some("auth-token".into()),
            api_key_sid: Some("SKtest".into()),
            api_key_secret: Some("key-secret".into()),
            base_url: base_url.to_string(),
            callback_base_url: Some("https://clinic.example.com/".into()),
            token_ttl_secs: 3600,
            request_timeout_secs: 5,
            media_download_timeout_secs: 300,
        }
    }

    #[tokio::test]
    async fn test_create_room_posts_unique_name() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/Rooms"))
            .and(basic_auth("ACtest", "auth-token"))
            .and(body_string_contains("UniqueName=telehealth-a1"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "sid": "RM123",
                "unique_name": "telehealth-a1",
                "status": "in-progress"
            })))
            .mount(&server)
            .await;

        let client = TwilioVideoClient::new(&video_config(&server.uri())).unwrap();
        let room = client.create_room("telehealth-a1").await.unwrap();

        assert_eq!(room.sid, "RM123");
        assert_eq!(room.unique_name, "telehealth-a1");
        assert!(!room.is_mock);
    }

    #[tokio::test]
    async fn test_rejection_is_not_a_network_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/Rooms"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": 53113,
                "message": "Room exists"
            })))
            .mount(&server)
            .await;

        let client = TwilioVideoClient::new(&video_config(&server.uri())).unwrap();
        let err = client.create_room("telehealth-a1").await.unwrap_err();

        match &err {
            ProviderError::Rejected { status, message } => {
                assert_eq!(*status, 400);
                assert_eq!(message, "Room exists");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_network());
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        // nothing listens on the discard port
        let client = TwilioVideoClient::new(&video_config("http://127.0.0.1:9")).unwrap();
        let err = client.create_room("telehealth-a1").await.unwrap_err();

        assert!(matches!(err, ProviderError::Unreachable(_)), "{err:?}");
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn test_missing_credentials_run_offline() {
        let mut config = video_config("http://127.0.0.1:9");
        config.api_key_secret = None;

        let client = TwilioVideoClient::new(&config).unwrap();
        assert!(!client.is_configured());

        let err = client.create_room("telehealth-a1").await.unwrap_err();
        assert!(matches!(err, ProviderError::Offline));
    }

    #[tokio::test]
    async fn test_start_recording_sends_status_callback() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/Rooms/RM123/Recordings"))
            .and(body_string_contains("Type=audio"))
            .and(body_string_contains("StatusCallback=https%3A%2F%2Fclinic.example.com%2Fwebhook%2Frecording-status"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "sid": "RT456",
                "status": "processing"
            })))
            .mount(&server)
            .await;

        let client = TwilioVideoClient::new(&video_config(&server.uri())).unwrap();
        let recording = client.start_recording("RM123", true).await.unwrap();

        assert_eq!(recording.sid, "RT456");
        assert_eq!(recording.media_url, None);
    }

    #[tokio::test]
    async fn test_fetch_recording_and_download_media() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/Rooms/RM123/Recordings/RT456"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sid": "RT456",
                "status": "completed",
                "duration": 1800,
                "size": 5_000_000_000u64,
                "links": { "media": "/v1/Recordings/RT456/Media" }
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1/Recordings/RT456/Media"))
            .and(basic_auth("ACtest", "auth-token"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 64]))
            .mount(&server)
            .await;

        let client = TwilioVideoClient::new(&video_config(&server.uri())).unwrap();
        let recording = client.fetch_recording("RM123", "RT456").await.unwrap();
        assert_eq!(recording.size_bytes, Some(5_000_000_000));
        assert_eq!(recording.duration_seconds, Some(1800));

        let media_url = recording.media_url.unwrap();
        let bytes = client.download_media(&media_url).await.unwrap();
        assert_eq!(bytes.len(), 64);
    }

    #[tokio::test]
    async fn test_foreign_media_host_never_receives_credentials() {
        let provider = MockServer::start().await;
        let foreign = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 8]))
            .mount(&foreign)
            .await;

        let client = TwilioVideoClient::new(&video_config(&provider.uri())).unwrap();

        for url in [
            format!("{}/steal", foreign.uri()),
            format!("{}.evil.example/x", provider.uri()),
            "//evil.example/x".to_string(),
        ] {
            let err = client.download_media(&url).await.unwrap_err();
            assert!(matches!(err, ProviderError::UntrustedMediaUrl(_)), "{err:?}");
            assert!(!err.is_network());
        }

        assert!(foreign.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_absolute_media_url_on_provider_host_is_allowed() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/Recordings/RT9/Media"))
            .and(basic_auth("ACtest", "auth-token"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![3u8; 16]))
            .mount(&server)
            .await;

        let client = TwilioVideoClient::new(&video_config(&server.uri())).unwrap();
        let bytes = client
            .download_media(&format!("{}/v1/Recordings/RT9/Media", server.uri()))
            .await
            .unwrap();
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn test_access_token_is_capped_at_provider_maximum() {
        let client = TwilioVideoClient::new(&video_config("http://127.0.0.1:9")).unwrap();
        let now = Utc::now();

        let grant = client
            .issue_access_token(
                "clinician-1",
                "telehealth-a1",
                Duration::from_secs(7 * 24 * 3600),
                now,
            )
            .unwrap();

        assert_eq!(
            grant.expires_at.timestamp() - now.timestamp(),
            MAX_ACCESS_TOKEN_TTL.as_secs() as i64
        );

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        let decoded = jsonwebtoken::decode::<serde_json::Value>(
            &grant.token,
            &DecodingKey::from_secret(b"key-secret"),
            &validation,
        )
        .unwrap();

        assert_eq!(decoded.claims["iss"], "SKtest");
        assert_eq!(decoded.claims["sub"], "ACtest");
        assert_eq!(decoded.claims["grants"]["video"]["room"], "telehealth-a1");
        assert_eq!(decoded.header.cty.as_deref(), Some("twilio-fpa;v=1"));
    }

    #[test]
    fn test_callback_outcome_classification() {
        let mut callback = RecordingStatusCallback {
            recording_sid: "RT1".into(),
            status: "completed".into(),
            ..Default::default()
        };
        assert_eq!(callback.outcome(), CallbackOutcome::Completed);

        callback.status = "Failed".into();
        assert_eq!(callback.outcome(), CallbackOutcome::Failed);

        callback.status = "in-progress".into();
        assert_eq!(callback.outcome(), CallbackOutcome::Other);
    }

    #[test]
    fn test_mock_rooms_carry_the_prefix() {
        let room = mock_room("telehealth-a1");
        assert!(room.sid.starts_with(MOCK_ROOM_PREFIX));
        assert!(room.is_mock);
    }
}
