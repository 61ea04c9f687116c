//! Service configuration
//!
//! Values are layered: built-in defaults, then an optional
//! `config/telehealth.toml`, then `TELEHEALTH__*` environment variables
//! (e.g. `TELEHEALTH__VIDEO__ACCOUNT_SID`, `TELEHEALTH__RETENTION__SCHEDULE`).

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Default bucket used when none is configured
pub const DEFAULT_RECORDING_BUCKET: &str = "telehealth-recordings";

/// Top-level configuration for the telehealth service
#[derive(Debug, Clone, Deserialize)]
pub struct TelehealthConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub video: VideoConfig,
    pub storage: StorageConfig,
    pub consent: ConsentConfig,
    pub retention: RetentionConfig,
    /// Redis used for the retention sweep lease; the lease is skipped when unset
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
}

/// JWT verification settings. One of the two keys must be present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// RS256 public key in PEM form, or a path to a PEM file
    pub jwt_public_key: Option<String>,
    /// HS256 shared secret
    pub jwt_secret: Option<String>,
}

/// Video provider credentials and timeouts
#[derive(Debug, Clone, Deserialize)]
pub struct VideoConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub api_key_sid: Option<String>,
    pub api_key_secret: Option<String>,
    pub base_url: String,
    /// Public base URL the provider calls back into (`{base}/webhook/recording-status`)
    pub callback_base_url: Option<String>,
    /// Requested access token lifetime, capped at the provider maximum
    pub token_ttl_secs: u64,
    pub request_timeout_secs: u64,
    pub media_download_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub bucket: Option<String>,
    pub region: String,
    pub encryption: String,
}

impl StorageConfig {
    pub fn bucket_name(&self) -> &str {
        self.bucket.as_deref().unwrap_or(DEFAULT_RECORDING_BUCKET)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsentConfig {
    /// Jurisdiction/purpose scoped consent type checked by the gate
    pub consent_type: String,
    pub renewal_window_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    pub enabled: bool,
    /// Six-field cron expression (seconds first)
    pub schedule: String,
    pub retention_years: u32,
    pub warning_days: i64,
    pub grace_days: i64,
    pub stuck_after_days: i64,
    pub lease_ttl_secs: u64,
}

impl TelehealthConfig {
    /// Load configuration from defaults, optional file and environment
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("server.bind_address", "0.0.0.0:3002")?
            .set_default("video.base_url", "https://video.twilio.com")?
            .set_default("video.token_ttl_secs", 4 * 60 * 60)?
            .set_default("video.request_timeout_secs", 30)?
            .set_default("video.media_download_timeout_secs", 300)?
            .set_default("storage.region", "us-east-1")?
            .set_default("storage.encryption", "AES256")?
            .set_default("consent.consent_type", "Georgia_Telehealth")?
            .set_default("consent.renewal_window_days", 30)?
            .set_default("retention.enabled", true)?
            .set_default("retention.schedule", "0 0 2 * * *")?
            .set_default("retention.retention_years", 7)?
            .set_default("retention.warning_days", 30)?
            .set_default("retention.grace_days", 90)?
            .set_default("retention.stuck_after_days", 7)?
            .set_default("retention.lease_ttl_secs", 60 * 60)?
            .add_source(File::with_name("config/telehealth").required(false))
            .add_source(
                Environment::with_prefix("TELEHEALTH")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
