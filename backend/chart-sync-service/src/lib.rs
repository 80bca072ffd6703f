//! Chart sync service.
//!
//! Relays lab result and patient changes from the system of record into
//! Kafka, and merges lab results into encounter discussion notes.

pub mod clients;
pub mod config;
pub mod consumer;
pub mod error;
pub mod flags;
pub mod metrics;
pub mod models;
pub mod relay;
pub mod runtime;
pub mod state;

pub use config::Config;
pub use error::{AppError, Result};
