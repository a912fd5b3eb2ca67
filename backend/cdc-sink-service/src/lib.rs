//! CDC sink service
//!
//! Consumes Debezium change events from Kafka and mirrors them into a
//! relational sink, committing offsets only after each change is applied,
//! dead-lettered or deliberately skipped.

pub mod config;
pub mod error;
pub mod metrics;
pub mod services;

pub use config::Config;
pub use error::AppError;
