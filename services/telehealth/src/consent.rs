//! Consent gate
//!
//! Decides whether a client's telehealth consent is usable right now. The
//! gate never returns an error: any failure to read consent is reported as an
//! invalid verdict.

use chrono::{DateTime, Utc};
use common::clock::Clock;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::ConsentConfig;
use crate::models::{ConsentRecord, ConsentVerification};
use crate::repositories::ConsentStore;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

#[derive(Clone)]
pub struct ConsentGate {
    store: Arc<dyn ConsentStore>,
    clock: Arc<dyn Clock>,
    consent_type: String,
    renewal_window_days: i64,
}

impl ConsentGate {
    pub fn new(store: Arc<dyn ConsentStore>, clock: Arc<dyn Clock>, config: &ConsentConfig) -> Self {
        Self {
            store,
            clock,
            consent_type: config.consent_type.clone(),
            renewal_window_days: config.renewal_window_days,
        }
    }

    /// Consent type checked for sessions in this deployment
    pub fn consent_type(&self) -> &str {
        &self.consent_type
    }

    pub async fn verify(&self, client_id: Uuid, consent_type: &str) -> ConsentVerification {
        match self.store.latest_active(client_id, consent_type).await {
            Ok(Some(record)) => self.evaluate(&record, self.clock.now()),
            Ok(None) => {
                warn!(%client_id, consent_type, "No active consent record found");
                ConsentVerification::invalid("No telehealth consent on file for this client")
            }
            Err(e) => {
                error!(%client_id, consent_type, error = %e, "Consent lookup failed; denying");
                ConsentVerification::invalid("Unable to verify telehealth consent")
            }
        }
    }

    /// Verify against the deployment's configured consent type
    pub async fn verify_client(&self, client_id: Uuid) -> ConsentVerification {
        self.verify(client_id, &self.consent_type).await
    }

    fn evaluate(&self, record: &ConsentRecord, now: DateTime<Utc>) -> ConsentVerification {
        if !record.consent_given {
            return ConsentVerification::invalid("Telehealth consent form has not been signed");
        }
        if record.withdrawn {
            return ConsentVerification::invalid("Telehealth consent has been withdrawn");
        }

        let Some(expiration) = record.expiration_date else {
            return ConsentVerification {
                is_valid: true,
                expiration_date: None,
                days_till_expiration: None,
                requires_renewal: false,
                message: "Telehealth consent is valid".to_string(),
            };
        };

        if expiration <= now {
            let days_ago = ceil_days((now - expiration).num_seconds());
            return ConsentVerification {
                is_valid: false,
                expiration_date: Some(expiration),
                days_till_expiration: Some(-days_ago),
                requires_renewal: true,
                message: format!("Telehealth consent expired {} day(s) ago", days_ago),
            };
        }

        let days_left = ceil_days((expiration - now).num_seconds());
        if days_left <= self.renewal_window_days {
            return ConsentVerification {
                is_valid: true,
                expiration_date: Some(expiration),
                days_till_expiration: Some(days_left),
                requires_renewal: true,
                message: format!(
                    "Telehealth consent expires in {} day(s); renewal required",
                    days_left
                ),
            };
        }

        ConsentVerification {
            is_valid: true,
            expiration_date: Some(expiration),
            days_till_expiration: Some(days_left),
            requires_renewal: false,
            message: "Telehealth consent is valid".to_string(),
        }
    }
}

/// Whole days, partial days counted as a full day
fn ceil_days(seconds: i64) -> i64 {
    let days = seconds.div_euclid(SECONDS_PER_DAY);
    if seconds.rem_euclid(SECONDS_PER_DAY) > 0 {
        days + 1
    } else {
        days
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::MemoryConsentStore;
    use chrono::{Duration, TimeZone};
    use common::clock::ManualClock;

    fn gate_at(now: DateTime<Utc>) -> (ConsentGate, Arc<MemoryConsentStore>) {
        let store = Arc::new(MemoryConsentStore::new());
        let config = ConsentConfig {
            consent_type: "Georgia_Telehealth".into(),
            renewal_window_days: 30,
        };
        let gate = ConsentGate::new(store.clone(), Arc::new(ManualClock::new(now)), &config);
        (gate, store)
    }

    fn record(client_id: Uuid, expiration: Option<DateTime<Utc>>) -> ConsentRecord {
        ConsentRecord {
            id: Uuid::new_v4(),
            client_id,
            consent_type: "Georgia_Telehealth".into(),
            consent_given: true,
            expiration_date: expiration,
            is_active: true,
            withdrawn: false,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_missing_consent_is_invalid() {
        let (gate, _) = gate_at(now());
        let verdict = gate.verify_client(Uuid::new_v4()).await;
        assert!(!verdict.is_valid);
        assert!(!verdict.requires_renewal);
    }

    #[tokio::test]
    async fn test_consent_expiring_in_fifteen_days_is_valid_but_needs_renewal() {
        let (gate, store) = gate_at(now());
        let client_id = Uuid::new_v4();
        store.insert(record(client_id, Some(now() + Duration::days(15))));

        let verdict = gate.verify_client(client_id).await;
        assert!(verdict.is_valid);
        assert!(verdict.requires_renewal);
        assert_eq!(verdict.days_till_expiration, Some(15));
    }

    #[tokio::test]
    async fn test_consent_expired_yesterday_is_invalid() {
        let (gate, store) = gate_at(now());
        let client_id = Uuid::new_v4();
        store.insert(record(client_id, Some(now() - Duration::days(1))));

        let verdict = gate.verify_client(client_id).await;
        assert!(!verdict.is_valid);
        assert!(verdict.requires_renewal);
        assert!(verdict.message.contains("expired 1 day"));
    }

    #[tokio::test]
    async fn test_newer_withdrawn_record_does_not_hide_valid_consent() {
        let (gate, store) = gate_at(now());
        let client_id = Uuid::new_v4();
        store.insert(record(client_id, Some(now() + Duration::days(200))));

        let mut withdrawn = record(client_id, Some(now() + Duration::days(200)));
        withdrawn.withdrawn = true;
        withdrawn.created_at = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        store.insert(withdrawn);

        let verdict = gate.verify_client(client_id).await;
        assert!(verdict.is_valid, "{}", verdict.message);
        assert!(!verdict.requires_renewal);
    }

    #[tokio::test]
    async fn test_unsigned_and_withdrawn_consent_are_invalid() {
        let (gate, store) = gate_at(now());

        let unsigned = Uuid::new_v4();
        let mut r = record(unsigned, None);
        r.consent_given = false;
        store.insert(r);
        let verdict = gate.verify_client(unsigned).await;
        assert!(!verdict.is_valid);
        assert!(verdict.message.contains("not been signed"));

        let withdrawn = Uuid::new_v4();
        let mut r = record(withdrawn, None);
        r.withdrawn = true;
        store.insert(r);
        assert!(!gate.verify_client(withdrawn).await.is_valid);
    }

    #[tokio::test]
    async fn test_long_lived_consent_needs_no_renewal() {
        let (gate, store) = gate_at(now());
        let client_id = Uuid::new_v4();
        store.insert(record(client_id, Some(now() + Duration::days(200))));

        let verdict = gate.verify_client(client_id).await;
        assert!(verdict.is_valid);
        assert!(!verdict.requires_renewal);
        assert_eq!(verdict.days_till_expiration, Some(200));
    }

    #[tokio::test]
    async fn test_newest_active_record_wins() {
        let (gate, store) = gate_at(now());
        let client_id = Uuid::new_v4();

        let mut old = record(client_id, Some(now() + Duration::days(300)));
        old.created_at = now() - Duration::days(400);
        store.insert(old);

        let mut newer = record(client_id, Some(now() - Duration::days(2)));
        newer.created_at = now() - Duration::days(10);
        store.insert(newer);

        assert!(!gate.verify_client(client_id).await.is_valid);
    }

    #[tokio::test]
    async fn test_lookup_failure_fails_closed() {
        let (gate, store) = gate_at(now());
        let client_id = Uuid::new_v4();
        store.insert(record(client_id, None));
        store.set_unavailable(true);

        let verdict = gate.verify_client(client_id).await;
        assert!(!verdict.is_valid);
    }

    #[test]
    fn test_partial_days_round_up() {
        assert_eq!(ceil_days(SECONDS_PER_DAY), 1);
        assert_eq!(ceil_days(SECONDS_PER_DAY + 1), 2);
        assert_eq!(ceil_days(1), 1);
        assert_eq!(ceil_days(0), 0);
    }
}
