//! Kafka-compatible transport for the outbox relay and the notification consumer.
//!
//! This crate implements the [`LogProducer`] and [`LogConsumer`] seams from
//! `outbox-core` on top of rdkafka. It works with Redpanda, Apache Kafka, or any
//! broker speaking the Kafka protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   publish(key = aggregate_id)   ┌─────────────┐
//! │ Outbox Relay │ ──────────────────────────────► │  Redpanda   │
//! └──────────────┘      RedpandaProducer            │   topic     │
//!                                                   └──────┬──────┘
//!                                                          │ fetch / commit
//!                                                          ▼
//!                                              ┌───────────────────────┐
//!                                              │ Notification Consumer │
//!                                              └───────────────────────┘
//!                                                   RedpandaConsumer
//! ```
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: the relay may publish a row twice (crash between
//!   publish and mark); the consumer deduplicates by event id
//! - **Ordered per aggregate**: keys are hash-partitioned
//! - **Manual commits**: the consumer never auto-commits
//!
//! # Self-Healing
//!
//! Client errors are classified by their librdkafka error code
//! ([`classify`]). Connection-level failures (broken connection, refused,
//! timeout, stale leadership) rebuild the client, at most once per
//! [`DEFAULT_MIN_RESET_INTERVAL`].
//!
//! [`LogProducer`]: outbox_core::LogProducer
//! [`LogConsumer`]: outbox_core::LogConsumer

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod consumer;
mod error;
mod producer;

pub use consumer::{RedpandaConsumer, RedpandaConsumerBuilder, StartOffset};
pub use error::{
    DEFAULT_MIN_RESET_INTERVAL, ResetGate, classify, classify_code, transport_error,
};
pub use producer::{DEFAULT_WRITE_TIMEOUT, RedpandaProducer, RedpandaProducerBuilder};
