//! Common library for the telehealth platform
//!
//! This crate provides shared functionality used across the telehealth
//! services, including database connectivity, the Redis-backed sweep lease,
//! the injectable clock, and shared error types.

pub mod cache;
pub mod clock;
pub mod database;
pub mod error;
