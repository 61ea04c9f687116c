//! Consent records and gate verdicts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One signed (or unsigned) consent form for a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub id: Uuid,
    pub client_id: Uuid,
    pub consent_type: String,
    pub consent_given: bool,
    pub expiration_date: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub withdrawn: bool,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a consent gate check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentVerification {
    pub is_valid: bool,
    pub expiration_date: Option<DateTime<Utc>>,
    pub days_till_expiration: Option<i64>,
    pub requires_renewal: bool,
    pub message: String,
}

impl ConsentVerification {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            expiration_date: None,
            days_till_expiration: None,
            requires_renewal: false,
            message: message.into(),
        }
    }
}
