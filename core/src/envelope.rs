//! Wire format exchanged over the partitioned log.
//!
//! Every outbox row is published as one JSON [`Envelope`]:
//!
//! ```json
//! {
//!   "event_id": "6f1c...",
//!   "event_type": "ticket.created",
//!   "occurred_at": "2025-01-01T00:00:00Z",
//!   "aggregate": "ticket",
//!   "aggregate_id": "T1",
//!   "request_id": "optional",
//!   "payload": { "...": "..." }
//! }
//! ```
//!
//! Events that cannot be delivered are wrapped in a [`DeadLetter`] and written
//! to the dead-letter topic.

use crate::outbox::OutboxRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from encoding or decoding envelopes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Failed to serialize an envelope or dead-letter record.
    #[error("Failed to encode envelope: {0}")]
    Encode(String),

    /// Message bytes are not a valid envelope.
    #[error("Failed to decode envelope: {0}")]
    Decode(String),

    /// Envelope decoded but carries no event identity, so it cannot be deduplicated.
    #[error("Envelope has an empty event_id")]
    MissingEventId,
}

/// One state-change event as it travels over the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Caller-assigned, globally unique event identity. Idempotency key on the consumer side.
    pub event_id: String,
    /// Event type, e.g. `ticket.created`.
    pub event_type: String,
    /// When the domain write happened (outbox row creation time).
    pub occurred_at: DateTime<Utc>,
    /// Aggregate kind, e.g. `ticket`.
    pub aggregate: String,
    /// Aggregate identity. Also the partitioning key.
    pub aggregate_id: String,
    /// Causal request id lifted from the payload, if the writer embedded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Free-form payload, interpreted only by subscribers.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Build the envelope for a claimed outbox row.
    #[must_use]
    pub fn from_record(record: &OutboxRecord) -> Self {
        Self {
            event_id: record.event_id.clone(),
            event_type: record.event_type.clone(),
            occurred_at: record.created_at,
            aggregate: record.aggregate.clone(),
            aggregate_id: record.aggregate_id.clone(),
            request_id: extract_request_id(&record.payload),
            payload: record.payload.clone(),
        }
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    /// Parse JSON bytes into an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Decode`] for malformed JSON or missing fields, and
    /// [`EnvelopeError::MissingEventId`] when `event_id` is blank.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Decode(e.to_string()))?;

        if envelope.event_id.trim().is_empty() {
            return Err(EnvelopeError::MissingEventId);
        }

        Ok(envelope)
    }
}

/// Pull a `request_id` string out of a JSON object payload.
///
/// Non-object payloads and blank ids yield `None`.
#[must_use]
pub fn extract_request_id(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("request_id")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

/// Record written to the dead-letter topic.
///
/// Two shapes exist on the wire:
///
/// - `{"error": "...", "envelope": {...}}` when the event decoded
/// - `{"error": "...", "value": "..."}` when the original bytes could not be parsed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeadLetter {
    /// A decodable event that exhausted its attempts.
    Envelope {
        /// Last error seen.
        error: String,
        /// The event itself.
        envelope: Envelope,
    },
    /// Raw message bytes that never decoded.
    Raw {
        /// Decode error.
        error: String,
        /// Original message value, UTF-8 lossy.
        value: String,
    },
}

impl DeadLetter {
    /// Dead-letter a decoded envelope.
    #[must_use]
    pub fn for_envelope(error: impl Into<String>, envelope: Envelope) -> Self {
        Self::Envelope {
            error: error.into(),
            envelope,
        }
    }

    /// Dead-letter raw bytes that could not be decoded.
    #[must_use]
    pub fn for_raw(error: impl Into<String>, value: &[u8]) -> Self {
        Self::Raw {
            error: error.into(),
            value: String::from_utf8_lossy(value).into_owned(),
        }
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }
}
