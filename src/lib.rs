//! Concurrent risk analysis for authentication attempts.
//!
//! [`engine::service::AuthRiskService`] is the entry point: it fans each
//! attempt out to four analysis stages, aggregates their outputs into a
//! risk score and decision, and learns from outcomes and feedback in the
//! background.

pub mod analysis;
pub mod analytics;
pub mod config;
pub mod engine;
pub mod models;
pub mod storage;
