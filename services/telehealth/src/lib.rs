//! Telehealth session and recording lifecycle
//!
//! Consent-gated video sessions, a recording pipeline that moves media from the
//! video provider into encrypted object storage, and the daily retention sweep
//! that archives and deletes recordings on a legal schedule.

pub mod audit;
pub mod config;
pub mod consent;
pub mod error;
pub mod middleware;
pub mod models;
pub mod notifications;
pub mod recordings;
pub mod repositories;
pub mod retention;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod storage;
pub mod video;

#[cfg(test)]
mod test_support;

pub use error::{TelehealthError, TelehealthResult};
