//! Appointment view consumed from the scheduling module

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The subset of an appointment the telehealth core needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub client_id: Uuid,
    pub clinician_id: Uuid,
    pub appointment_date: DateTime<Utc>,
    pub is_telehealth: bool,
}
