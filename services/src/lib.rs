//! # Outbox Services
//!
//! Process wiring for the two binaries:
//!
//! - `outbox-relay`: Postgres outbox → Kafka topic
//! - `notification-service`: Kafka topic → idempotency ledger → notification
//!
//! Both read their settings from the environment ([`config`]) and log through
//! `tracing` ([`telemetry`]). Each serves `/metrics`, `/healthz` and `/readyz`
//! ([`ops`]).

pub mod config;
pub mod ops;
pub mod telemetry;

pub use config::{ConfigError, KafkaSettings, NotifySettings, RelaySettings};
pub use ops::Readiness;
