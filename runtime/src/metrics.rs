//! Prometheus metrics for the relay and the consumer.
//!
//! Recorders are plain structs handed to the relay / consumer at construction.
//! Each forwards to the global `metrics` facade and also keeps an in-process
//! snapshot, so tests can assert on counts without installing a recorder.
//!
//! # Example
//!
//! ```rust,no_run
//! use outbox_runtime::metrics::PrometheusMetrics;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = PrometheusMetrics::install()?;
//!
//! // Serve this from the /metrics route
//! let body = metrics.render();
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use outbox_core::FailureReason;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Another global recorder is already installed
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
}

/// The process-wide Prometheus recorder.
///
/// Installing it routes every `metrics` macro call in the process into a
/// registry that [`render`](Self::render) formats in the Prometheus text
/// exposition format. Serving the text over HTTP is left to the caller.
#[derive(Clone)]
pub struct PrometheusMetrics {
    handle: PrometheusHandle,
}

impl PrometheusMetrics {
    /// Install the Prometheus recorder as the global `metrics` recorder and
    /// describe every metric.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if a global recorder is already
    /// installed.
    pub fn install() -> Result<Self, MetricsError> {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::set_global_recorder(recorder)
            .map_err(|e| MetricsError::Install(e.to_string()))?;
        register_metrics();

        tracing::info!("Prometheus metrics recorder installed");
        Ok(Self { handle })
    }

    /// Wrap an existing handle without installing anything.
    #[must_use]
    pub const fn from_handle(handle: PrometheusHandle) -> Self {
        Self { handle }
    }

    /// The underlying handle.
    #[must_use]
    pub const fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }

    /// Render current metrics in Prometheus format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Relay
    describe_counter!("outbox_claimed_total", "Outbox rows claimed for publishing");
    describe_counter!("outbox_published_total", "Published outbox events");
    describe_counter!("outbox_failed_total", "Failed outbox publish attempts");
    describe_counter!("outbox_dead_total", "Outbox events moved to dead state");
    describe_counter!(
        "outbox_requeued_total",
        "Outbox rows recovered from an expired processing claim"
    );
    describe_gauge!(
        "outbox_lag_seconds",
        "Age in seconds of the oldest pending outbox event"
    );

    // Consumer
    describe_counter!("notify_fetched_total", "Fetched log messages");
    describe_counter!("notify_committed_total", "Committed log messages");
    describe_counter!("notify_processed_total", "Processed events by outcome");
    describe_counter!("notify_errors_total", "Event handling failures by reason");
    describe_gauge!(
        "notify_last_processed_unix",
        "Unix timestamp of the last committed message"
    );
}

fn load(value: &AtomicU64) -> u64 {
    value.load(Ordering::Relaxed)
}

fn bump(value: &AtomicU64, by: u64) {
    value.fetch_add(by, Ordering::Relaxed);
}

/// Point-in-time copy of [`RelayMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RelaySnapshot {
    /// Rows claimed
    pub claimed: u64,
    /// Rows published
    pub published: u64,
    /// Failed attempts rescheduled
    pub failed: u64,
    /// Rows dead-lettered
    pub dead: u64,
    /// Rows recovered from expired claims
    pub requeued: u64,
    /// Last observed lag
    pub lag_seconds: f64,
}

/// Relay metrics recorder.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    claimed: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
    dead: AtomicU64,
    requeued: AtomicU64,
    lag_bits: AtomicU64,
}

impl RelayMetrics {
    /// Create a recorder with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a claimed row.
    pub fn record_claimed(&self, event_type: &str) {
        bump(&self.claimed, 1);
        counter!("outbox_claimed_total", "event_type" => event_type.to_string()).increment(1);
    }

    /// Record a successful publish.
    pub fn record_published(&self, event_type: &str) {
        bump(&self.published, 1);
        counter!("outbox_published_total", "event_type" => event_type.to_string()).increment(1);
    }

    /// Record a failed attempt that will be retried.
    pub fn record_failed(&self, event_type: &str) {
        bump(&self.failed, 1);
        counter!("outbox_failed_total", "event_type" => event_type.to_string()).increment(1);
    }

    /// Record a row moved to dead.
    pub fn record_dead(&self, event_type: &str) {
        bump(&self.dead, 1);
        counter!("outbox_dead_total", "event_type" => event_type.to_string()).increment(1);
    }

    /// Record rows recovered from expired claims.
    pub fn record_requeued(&self, rows: u64) {
        bump(&self.requeued, rows);
        counter!("outbox_requeued_total").increment(rows);
    }

    /// Set the lag gauge.
    pub fn set_lag(&self, seconds: f64) {
        self.lag_bits.store(seconds.to_bits(), Ordering::Relaxed);
        gauge!("outbox_lag_seconds").set(seconds);
    }

    /// Copy the current counts.
    #[must_use]
    pub fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            claimed: load(&self.claimed),
            published: load(&self.published),
            failed: load(&self.failed),
            dead: load(&self.dead),
            requeued: load(&self.requeued),
            lag_seconds: f64::from_bits(load(&self.lag_bits)),
        }
    }
}

/// Point-in-time copy of [`ConsumerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerSnapshot {
    /// Messages fetched
    pub fetched: u64,
    /// Messages committed
    pub committed: u64,
    /// Events whose effect was applied
    pub ok: u64,
    /// Redeliveries skipped by the ledger
    pub duplicate: u64,
    /// Events dead-lettered
    pub dead: u64,
    /// Failed attempts by reason label
    pub errors: BTreeMap<&'static str, u64>,
}

/// Consumer metrics recorder.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    fetched: AtomicU64,
    committed: AtomicU64,
    ok: AtomicU64,
    duplicate: AtomicU64,
    dead: AtomicU64,
    errors: Mutex<BTreeMap<&'static str, u64>>,
}

impl ConsumerMetrics {
    /// Create a recorder with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fetched message.
    pub fn record_fetched(&self) {
        bump(&self.fetched, 1);
        counter!("notify_fetched_total").increment(1);
    }

    /// Record a committed message and stamp the last-processed gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_committed(&self, unix_seconds: i64) {
        bump(&self.committed, 1);
        counter!("notify_committed_total").increment(1);
        gauge!("notify_last_processed_unix").set(unix_seconds as f64);
    }

    /// Record an applied effect.
    pub fn record_ok(&self, event_type: &str) {
        bump(&self.ok, 1);
        self.processed(event_type, "ok");
    }

    /// Record a redelivery skipped by the ledger.
    pub fn record_duplicate(&self, event_type: &str) {
        bump(&self.duplicate, 1);
        self.processed(event_type, "duplicate");
    }

    /// Record a dead-lettered event.
    pub fn record_dead(&self, event_type: &str) {
        bump(&self.dead, 1);
        self.processed(event_type, "dead");
    }

    /// Record a failed attempt.
    pub fn record_error(&self, event_type: &str, reason: FailureReason) {
        *self
            .errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(reason.as_str())
            .or_default() += 1;
        counter!(
            "notify_errors_total",
            "event_type" => event_type.to_string(),
            "reason" => reason.as_str()
        )
        .increment(1);
    }

    fn processed(&self, event_type: &str, status: &'static str) {
        counter!(
            "notify_processed_total",
            "event_type" => event_type.to_string(),
            "status" => status
        )
        .increment(1);
    }

    /// Copy the current counts.
    #[must_use]
    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            fetched: load(&self.fetched),
            committed: load(&self.committed),
            ok: load(&self.ok),
            duplicate: load(&self.duplicate),
            dead: load(&self.dead),
            errors: self
                .errors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn installed_recorder_renders_recorded_metrics() {
        let metrics = PrometheusMetrics::install().unwrap();

        let relay = RelayMetrics::new();
        relay.record_published("ticket.created");
        relay.set_lag(1.5);

        let rendered = metrics.render();
        assert!(rendered.contains("outbox_published_total"));
        assert!(rendered.contains("outbox_lag_seconds"));

        // Only one recorder per process
        assert!(matches!(
            PrometheusMetrics::install(),
            Err(MetricsError::Install(_))
        ));
    }

    #[test]
    fn relay_snapshot_tracks_counts() {
        let relay = RelayMetrics::new();
        relay.record_claimed("ticket.created");
        relay.record_claimed("ticket.created");
        relay.record_published("ticket.created");
        relay.record_failed("ticket.created");
        relay.record_requeued(3);
        relay.set_lag(12.25);

        let snapshot = relay.snapshot();
        assert_eq!(snapshot.claimed, 2);
        assert_eq!(snapshot.published, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.dead, 0);
        assert_eq!(snapshot.requeued, 3);
        assert!((snapshot.lag_seconds - 12.25).abs() < f64::EPSILON);
    }

    #[test]
    fn consumer_snapshot_groups_errors_by_reason() {
        let consumer = ConsumerMetrics::new();
        consumer.record_error("ticket.created", FailureReason::Forced);
        consumer.record_error("ticket.created", FailureReason::Forced);
        consumer.record_error("unknown", FailureReason::Decode);
        consumer.record_dead("unknown");

        let snapshot = consumer.snapshot();
        assert_eq!(snapshot.errors.get("forced"), Some(&2));
        assert_eq!(snapshot.errors.get("decode"), Some(&1));
        assert_eq!(snapshot.dead, 1);
    }
}
