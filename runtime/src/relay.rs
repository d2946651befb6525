//! Outbox relay: moves committed outbox rows onto the log.
//!
//! Each tick:
//!
//! ```text
//! requeue stuck rows ──► refresh lag gauge ──► claim batch
//!                                                  │
//!                      ┌───────────────────────────┘
//!                      ▼  per row, independently
//!               envelope ──► encode ──► publish(key = aggregate_id)
//!                                           │
//!                   ┌───────────────┬───────┴──────────────┐
//!                   ▼               ▼                      ▼
//!                 sent      pending (backoff)   dead-letter + dead
//! ```
//!
//! Requeue and claim failures abort the tick; the next tick starts over.
//! Nothing is carried between ticks.

use crate::metrics::RelayMetrics;
use crate::retry::BackoffPolicy;
use outbox_core::environment::{Clock, SystemClock};
use outbox_core::outbox::{DEFAULT_BATCH_SIZE, DEFAULT_PROCESSING_TIMEOUT};
use outbox_core::{
    DateTime, DeadLetter, Envelope, LogProducer, OutboxRecord, OutboxStore, StoreError, Utc,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Relay tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Rows claimed per tick
    pub batch_size: usize,
    /// Time between ticks
    pub poll_interval: Duration,
    /// Age after which a `processing` row is presumed orphaned
    pub processing_timeout: Duration,
    /// Attempts before a row is dead-lettered (0 = retry forever)
    pub max_attempts: u32,
    /// Bound on a single publish
    pub publish_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_millis(500),
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
            max_attempts: 10,
            publish_timeout: Duration::from_secs(5),
        }
    }
}

/// What happened to one claimed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    /// Published and marked sent
    Sent,
    /// Publish failed; rescheduled
    Retried,
    /// Attempts exhausted; marked dead
    Dead,
}

/// Summary of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Orphaned rows returned to pending
    pub requeued: u64,
    /// Rows claimed
    pub claimed: usize,
    /// Rows published
    pub sent: usize,
    /// Rows rescheduled
    pub retried: usize,
    /// Rows dead-lettered
    pub dead: usize,
}

impl TickReport {
    fn record(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Sent => self.sent += 1,
            RowOutcome::Retried => self.retried += 1,
            RowOutcome::Dead => self.dead += 1,
        }
    }
}

/// Poll-driven outbox relay.
///
/// Several relays may run against the same table; claims are disjoint.
///
/// # Example
///
/// ```rust,ignore
/// let relay = OutboxRelay::new(store, producer, RelayConfig::default())
///     .with_dead_letter(dlq_producer)
///     .with_metrics(metrics);
///
/// relay.run(shutdown.subscribe()).await;
/// ```
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    producer: Arc<dyn LogProducer>,
    dead_letter: Option<Arc<dyn LogProducer>>,
    metrics: Arc<RelayMetrics>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    config: RelayConfig,
}

impl OutboxRelay {
    /// Create a relay with no dead-letter topic.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        producer: Arc<dyn LogProducer>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            producer,
            dead_letter: None,
            metrics: Arc::new(RelayMetrics::new()),
            clock: Arc::new(SystemClock),
            backoff: BackoffPolicy::relay(),
            config,
        }
    }

    /// Publish dead-lettered events through `producer`.
    #[must_use]
    pub fn with_dead_letter(mut self, producer: Arc<dyn LogProducer>) -> Self {
        self.dead_letter = Some(producer);
        self
    }

    /// Record into `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Compute retry times from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the retry schedule.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// The relay's metrics.
    #[must_use]
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Run one tick.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if requeueing or claiming fails. Per-row store
    /// failures are logged and leave the row to the stuck-row sweep.
    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        let requeued = self
            .store
            .requeue_stuck(self.config.processing_timeout)
            .await?;
        if requeued > 0 {
            warn!(rows = requeued, "Requeued orphaned outbox rows");
            self.metrics.record_requeued(requeued);
        }

        match self.store.lag_seconds().await {
            Ok(lag) => self.metrics.set_lag(lag),
            Err(e) => warn!(error = %e, "Failed to measure outbox lag"),
        }

        let batch = self.store.claim_pending(self.config.batch_size).await?;
        let mut report = TickReport {
            requeued,
            claimed: batch.len(),
            ..TickReport::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }
        debug!(rows = batch.len(), "Claimed outbox batch");

        for record in &batch {
            self.metrics.record_claimed(&record.event_type);
            report.record(self.process(record).await);
        }

        Ok(report)
    }

    /// Tick every poll interval until `shutdown` fires.
    ///
    /// A tick in progress is finished before returning.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let period = if self.config.poll_interval.is_zero() {
            RelayConfig::default().poll_interval
        } else {
            self.config.poll_interval
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            max_attempts = self.config.max_attempts,
            dead_letter = self.dead_letter.is_some(),
            "Outbox relay started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Outbox relay shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Outbox relay tick failed");
                    }
                }
            }
        }
    }

    async fn process(&self, record: &OutboxRecord) -> RowOutcome {
        let envelope = Envelope::from_record(record);

        let published = match envelope.encode() {
            Ok(bytes) => self
                .producer
                .publish(
                    record.aggregate_id.as_bytes(),
                    &bytes,
                    self.config.publish_timeout,
                )
                .await
                .map_err(|e| format!("publish: {e}")),
            Err(e) => Err(format!("encode: {e}")),
        };

        match published {
            Ok(()) => {
                if let Err(e) = self.store.mark_sent(record.id).await {
                    error!(outbox_id = record.id, error = %e, "Failed to mark outbox row sent");
                }
                self.metrics.record_published(&record.event_type);
                debug!(
                    outbox_id = record.id,
                    event_id = %record.event_id,
                    event_type = %record.event_type,
                    "Published outbox event"
                );
                RowOutcome::Sent
            }
            Err(reason) => self.fail(record, envelope, &reason).await,
        }
    }

    async fn fail(&self, record: &OutboxRecord, envelope: Envelope, reason: &str) -> RowOutcome {
        let attempts = u32::try_from(record.attempts).unwrap_or(0);
        let max = self.config.max_attempts;

        if max > 0 && attempts >= max {
            self.dead_letter(record, envelope, reason).await;
            if let Err(e) = self.store.mark_dead(record.id, reason).await {
                error!(outbox_id = record.id, error = %e, "Failed to mark outbox row dead");
            }
            self.metrics.record_dead(&record.event_type);
            error!(
                outbox_id = record.id,
                event_id = %record.event_id,
                event_type = %record.event_type,
                attempt = attempts,
                error = reason,
                "Outbox event dead-lettered"
            );
            return RowOutcome::Dead;
        }

        let delay = self.backoff.delay_for_attempt(attempts);
        let now = self.clock.now();
        let next_retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if let Err(e) = self
            .store
            .mark_failed(record.id, next_retry_at, reason)
            .await
        {
            error!(outbox_id = record.id, error = %e, "Failed to reschedule outbox row");
        }
        self.metrics.record_failed(&record.event_type);
        warn!(
            outbox_id = record.id,
            event_id = %record.event_id,
            event_type = %record.event_type,
            attempt = attempts,
            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = reason,
            "Outbox publish failed"
        );
        RowOutcome::Retried
    }

    async fn dead_letter(&self, record: &OutboxRecord, envelope: Envelope, reason: &str) {
        let Some(producer) = &self.dead_letter else {
            debug!(outbox_id = record.id, "No dead-letter topic configured");
            return;
        };

        let bytes = match DeadLetter::for_envelope(reason, envelope).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(outbox_id = record.id, error = %e, "Failed to encode dead-letter record");
                return;
            }
        };

        if let Err(e) = producer
            .publish(
                record.aggregate_id.as_bytes(),
                &bytes,
                self.config.publish_timeout,
            )
            .await
        {
            warn!(outbox_id = record.id, error = %e, "Dead-letter publish failed");
        }
    }
}
