//! Self-healing producer.

use crate::error::{ResetGate, transport_error};
use outbox_core::transport::TransportFuture;
use outbox_core::{LogProducer, TransportError, TransportErrorKind};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Default bound on a single publish.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka-compatible producer bound to one topic.
///
/// Messages are hash-partitioned on their key, so every event of one
/// aggregate lands on the same partition. A publish that fails with a
/// connection-level error rebuilds the client (at most once per reset
/// interval) and is retried exactly once before the error surfaces.
///
/// # Example
///
/// ```no_run
/// use outbox_redpanda::RedpandaProducer;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let producer = RedpandaProducer::builder()
///     .brokers("localhost:9092")
///     .topic("tickets.events")
///     .client_id("outbox-relay")
///     .write_timeout(Duration::from_secs(5))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaProducer {
    config: ClientConfig,
    topic: String,
    write_timeout: Duration,
    client: RwLock<Option<Arc<FutureProducer>>>,
    reset_gate: ResetGate,
}

impl RedpandaProducer {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> RedpandaProducerBuilder {
        RedpandaProducerBuilder::default()
    }

    /// Topic this producer writes to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn current(&self) -> Result<Arc<FutureProducer>, TransportError> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(TransportError::closed)
    }

    /// Rebuild the client unless a reset happened within the reset interval.
    fn reset(&self) {
        if !self.reset_gate.try_acquire(Instant::now()) {
            tracing::debug!(topic = %self.topic, "Producer reset skipped, rate limited");
            return;
        }

        let fresh: FutureProducer = match self.config.create() {
            Ok(producer) => producer,
            Err(e) => {
                tracing::warn!(topic = %self.topic, error = %e, "Failed to rebuild producer");
                return;
            }
        };

        let previous = {
            let mut slot = self.client.write().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                // Closed concurrently; stay closed
                return;
            }
            slot.replace(Arc::new(fresh))
        };
        drop(previous);

        tracing::info!(topic = %self.topic, "Producer client rebuilt");
    }

    async fn send_once(
        &self,
        key: &[u8],
        value: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let client = self.current()?;
        let record = FutureRecord::to(&self.topic).key(key).payload(value);

        match tokio::time::timeout(timeout, client.send(record, Timeout::After(timeout))).await {
            Ok(Ok((partition, offset))) => {
                tracing::debug!(
                    topic = %self.topic,
                    partition,
                    offset,
                    "Message published"
                );
                Ok(())
            }
            Ok(Err((err, _))) => Err(transport_error(&err)),
            Err(_) => Err(TransportError::new(
                TransportErrorKind::Timeout,
                format!("no acknowledgement within {}ms", timeout.as_millis()),
            )),
        }
    }
}

/// Run `send`; if it fails with a reset-worthy error, call `reset` and run
/// `send` exactly once more. Other errors surface immediately.
async fn retry_after_reset<T, F, Fut, R>(mut send: F, reset: R) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
    R: FnOnce(&TransportError),
{
    match send().await {
        Err(err) if err.kind.warrants_reset() => {
            reset(&err);
            send().await
        }
        result => result,
    }
}

impl LogProducer for RedpandaProducer {
    fn publish<'a>(
        &'a self,
        key: &'a [u8],
        value: &'a [u8],
        timeout: Duration,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let timeout = if timeout.is_zero() {
                self.write_timeout
            } else {
                timeout
            };

            retry_after_reset(
                || self.send_once(key, value, timeout),
                |err| {
                    tracing::warn!(
                        topic = %self.topic,
                        kind = err.kind.as_str(),
                        error = %err.message,
                        "Publish failed, resetting client and retrying once"
                    );
                    self.reset();
                },
            )
            .await
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let client = self
                .client
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take();

            let Some(client) = client else {
                return Ok(());
            };

            let flush_timeout = self.write_timeout;
            tokio::task::spawn_blocking(move || client.flush(Timeout::After(flush_timeout)))
                .await
                .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))?
                .map_err(|e| transport_error(&e))?;

            tracing::info!(topic = %self.topic, "Producer closed");
            Ok(())
        })
    }
}

/// Builder for [`RedpandaProducer`].
#[derive(Default)]
pub struct RedpandaProducerBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    client_id: Option<String>,
    acks: Option<String>,
    compression: Option<String>,
    write_timeout: Option<Duration>,
    min_reset_interval: Option<Duration>,
}

impl RedpandaProducerBuilder {
    /// Comma-separated bootstrap brokers.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Destination topic.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Client id reported to the brokers.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Acknowledgement mode: "0", "1" or "all". Default: "1".
    #[must_use]
    pub fn acks(mut self, acks: impl Into<String>) -> Self {
        self.acks = Some(acks.into());
        self
    }

    /// Compression codec. Default: "none".
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Timeout used when a publish passes a zero timeout. Default: 5 seconds.
    #[must_use]
    pub const fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Minimum interval between client rebuilds. Default: 2 seconds.
    #[must_use]
    pub const fn min_reset_interval(mut self, interval: Duration) -> Self {
        self.min_reset_interval = Some(interval);
        self
    }

    /// Build the producer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if brokers or topic are missing or the
    /// client cannot be created.
    pub fn build(self) -> Result<RedpandaProducer, TransportError> {
        let brokers = self.brokers.filter(|b| !b.trim().is_empty()).ok_or_else(|| {
            TransportError::new(TransportErrorKind::Other, "brokers not configured")
        })?;
        let topic = self.topic.filter(|t| !t.trim().is_empty()).ok_or_else(|| {
            TransportError::new(TransportErrorKind::Other, "topic not configured")
        })?;
        let write_timeout = self
            .write_timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(DEFAULT_WRITE_TIMEOUT);
        let acks = self.acks.unwrap_or_else(|| "1".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());
        let client_id = self.client_id.unwrap_or_else(|| "outbox-relay".to_string());

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &brokers)
            .set("client.id", &client_id)
            .set("message.timeout.ms", write_timeout.as_millis().to_string())
            .set("acks", &acks)
            .set("compression.type", &compression)
            .set("partitioner", "murmur2_random")
            .set("topic.metadata.refresh.interval.ms", "10000");

        let producer: FutureProducer = config.create().map_err(|e| transport_error(&e))?;

        tracing::info!(
            brokers = %brokers,
            topic = %topic,
            client_id = %client_id,
            acks = %acks,
            compression = %compression,
            "RedpandaProducer created"
        );

        Ok(RedpandaProducer {
            config,
            topic,
            write_timeout,
            client: RwLock::new(Some(Arc::new(producer))),
            reset_gate: ResetGate::new(
                self.min_reset_interval
                    .unwrap_or(crate::error::DEFAULT_MIN_RESET_INTERVAL),
            ),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn producer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RedpandaProducer>();
    }

    #[test]
    fn build_requires_brokers_and_topic() {
        let err = RedpandaProducer::builder().topic("t").build().err().unwrap();
        assert!(err.message.contains("brokers"));

        let err = RedpandaProducer::builder()
            .brokers("localhost:9092")
            .build()
            .err()
            .unwrap();
        assert!(err.message.contains("topic"));
    }

    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// A send that fails with each scripted kind in turn, then succeeds.
    async fn scripted_send(
        calls: &AtomicUsize,
        script: &[TransportErrorKind],
    ) -> Result<(), TransportError> {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        match script.get(call) {
            Some(kind) => Err(TransportError::new(*kind, "scripted")),
            None => Ok(()),
        }
    }

    #[tokio::test]
    async fn reset_worthy_failure_is_retried_exactly_once() {
        for kind in [
            TransportErrorKind::BrokenConnection,
            TransportErrorKind::ConnectionRefused,
            TransportErrorKind::StaleMetadata,
            TransportErrorKind::Timeout,
        ] {
            let calls = AtomicUsize::new(0);
            let resets = AtomicU32::new(0);
            let script = [kind];

            let result = retry_after_reset(
                || scripted_send(&calls, &script),
                |_| {
                    resets.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

            assert!(result.is_ok(), "{kind:?}");
            assert_eq!(calls.load(Ordering::SeqCst), 2, "{kind:?}");
            assert_eq!(resets.load(Ordering::SeqCst), 1, "{kind:?}");
        }
    }

    #[tokio::test]
    async fn second_failure_surfaces_without_another_retry() {
        let calls = AtomicUsize::new(0);
        let resets = AtomicU32::new(0);
        let script = [
            TransportErrorKind::BrokenConnection,
            TransportErrorKind::BrokenConnection,
        ];

        let err = retry_after_reset(
            || scripted_send(&calls, &script),
            |_| {
                resets.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, TransportErrorKind::BrokenConnection);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        for kind in [TransportErrorKind::Other, TransportErrorKind::Closed] {
            let calls = AtomicUsize::new(0);
            let resets = AtomicU32::new(0);
            let script = [kind];

            let err = retry_after_reset(
                || scripted_send(&calls, &script),
                |_| {
                    resets.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await
            .unwrap_err();

            assert_eq!(err.kind, kind);
            assert_eq!(calls.load(Ordering::SeqCst), 1, "{kind:?}");
            assert_eq!(resets.load(Ordering::SeqCst), 0, "{kind:?}");
        }
    }

    #[tokio::test]
    async fn closed_producer_refuses_publishes() {
        // Client creation does not contact the brokers
        let producer = RedpandaProducer::builder()
            .brokers("localhost:1")
            .topic("tickets.events")
            .build()
            .expect("client creation is offline");

        producer.close().await.expect("first close");
        producer.close().await.expect("second close is a no-op");

        let err = producer
            .publish(b"T1", b"{}", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Closed);
    }
}
