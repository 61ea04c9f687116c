//! Read-only views over tables owned by the scheduling and intake modules

use async_trait::async_trait;
use common::error::DatabaseResult;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{AppointmentStore, ConsentStore};
use crate::models::{Appointment, ConsentRecord};

/// Consent records from `client_consents`
#[derive(Clone)]
pub struct PgConsentStore {
    pool: PgPool,
}

impl PgConsentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConsentStore for PgConsentStore {
    async fn latest_active(
        &self,
        client_id: Uuid,
        consent_type: &str,
    ) -> DatabaseResult<Option<ConsentRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, client_id, consent_type, consent_given, expiration_date,
                   is_active, withdrawn, created_at
            FROM client_consents
            WHERE client_id = $1 AND consent_type = $2
              AND is_active = TRUE AND withdrawn = FALSE
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(client_id)
        .bind(consent_type)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(ConsentRecord {
                id: row.try_get("id")?,
                client_id: row.try_get("client_id")?,
                consent_type: row.try_get("consent_type")?,
                consent_given: row.try_get("consent_given")?,
                expiration_date: row.try_get("expiration_date")?,
                is_active: row.try_get("is_active")?,
                withdrawn: row.try_get("withdrawn")?,
                created_at: row.try_get("created_at")?,
            })),
            None => Ok(None),
        }
    }
}

/// Appointments from `appointments`
#[derive(Clone)]
pub struct PgAppointmentStore {
    pool: PgPool,
}

impl PgAppointmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AppointmentStore for PgAppointmentStore {
    async fn get(&self, id: Uuid) -> DatabaseResult<Option<Appointment>> {
        let row = sqlx::query(
            r#"
            SELECT id, client_id, clinician_id, appointment_date, is_telehealth
            FROM appointments
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Appointment {
                id: row.try_get("id")?,
                client_id: row.try_get("client_id")?,
                clinician_id: row.try_get("clinician_id")?,
                appointment_date: row.try_get("appointment_date")?,
                is_telehealth: row.try_get("is_telehealth")?,
            })),
            None => Ok(None),
        }
    }
}
