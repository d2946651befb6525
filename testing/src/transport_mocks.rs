//! Scripted producer and in-memory log consumer.

use outbox_core::transport::TransportFuture;
use outbox_core::{LogConsumer, LogMessage, LogProducer, TransportError, TransportErrorKind};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A message accepted by a [`ScriptedProducer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Partitioning key
    pub key: Vec<u8>,
    /// Message body
    pub value: Vec<u8>,
}

impl PublishedMessage {
    /// Parse the body as JSON.
    #[must_use]
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.value).ok()
    }
}

/// [`LogProducer`] that fails on cue.
///
/// Queued failures are returned first, one per publish; after that every
/// publish succeeds unless [`fail_always`](Self::fail_always) is set.
#[derive(Clone, Default)]
pub struct ScriptedProducer {
    script: Arc<Mutex<VecDeque<TransportError>>>,
    always_fail: Arc<Mutex<Option<TransportError>>>,
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    attempts: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl ScriptedProducer {
    /// Producer that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` publishes with `kind`.
    #[must_use]
    pub fn failing_times(self, times: usize, kind: TransportErrorKind) -> Self {
        {
            let mut script = lock(&self.script);
            for n in 0..times {
                script.push_back(TransportError::new(kind, format!("scripted failure {}", n + 1)));
            }
        }
        self
    }

    /// Fail every publish with `kind` until cleared with [`recover`](Self::recover).
    pub fn fail_always(&self, kind: TransportErrorKind) {
        *lock(&self.always_fail) = Some(TransportError::new(kind, "broker unavailable"));
    }

    /// Stop failing.
    pub fn recover(&self) {
        *lock(&self.always_fail) = None;
        lock(&self.script).clear();
    }

    /// Messages accepted so far.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    /// Publish calls so far, successful or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Whether [`LogProducer::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl LogProducer for ScriptedProducer {
    fn publish<'a>(
        &'a self,
        key: &'a [u8],
        value: &'a [u8],
        _timeout: Duration,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);

            if self.is_closed() {
                return Err(TransportError::closed());
            }
            if let Some(err) = lock(&self.script).pop_front() {
                return Err(err);
            }
            if let Some(err) = lock(&self.always_fail).clone() {
                return Err(err);
            }

            lock(&self.published).push(PublishedMessage {
                key: key.to_vec(),
                value: value.to_vec(),
            });
            Ok(())
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Single-partition in-memory log with manual commits.
///
/// `fetch_message` waits until a message is pushed. Queued fetch errors are
/// returned before any message.
#[derive(Clone, Default)]
pub struct InMemoryLogConsumer {
    queue: Arc<Mutex<VecDeque<LogMessage>>>,
    fetch_errors: Arc<Mutex<VecDeque<TransportError>>>,
    committed: Arc<Mutex<Vec<LogMessage>>>,
    next_offset: Arc<Mutex<i64>>,
    fetched: Arc<AtomicUsize>,
    arrived: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl InMemoryLogConsumer {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message; returns its offset.
    pub fn push(&self, key: &[u8], value: &[u8]) -> i64 {
        let offset = {
            let mut next = lock(&self.next_offset);
            let offset = *next;
            *next += 1;
            offset
        };

        lock(&self.queue).push_back(LogMessage {
            topic: "tickets.events".to_string(),
            partition: 0,
            offset,
            key: Some(key.to_vec()),
            value: value.to_vec(),
        });
        self.arrived.notify_one();
        offset
    }

    /// Make the next fetch fail with `kind`.
    pub fn push_fetch_error(&self, kind: TransportErrorKind) {
        lock(&self.fetch_errors).push_back(TransportError::new(kind, "fetch failed"));
        self.arrived.notify_one();
    }

    /// Messages committed so far, in commit order.
    #[must_use]
    pub fn committed(&self) -> Vec<LogMessage> {
        lock(&self.committed).clone()
    }

    /// Offsets committed so far.
    #[must_use]
    pub fn committed_offsets(&self) -> Vec<i64> {
        lock(&self.committed).iter().map(|m| m.offset).collect()
    }

    /// Successful fetches so far.
    #[must_use]
    pub fn fetched(&self) -> usize {
        self.fetched.load(Ordering::SeqCst)
    }

    /// Messages not yet fetched.
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Whether [`LogConsumer::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl LogConsumer for InMemoryLogConsumer {
    fn fetch_message(&self) -> TransportFuture<'_, LogMessage> {
        Box::pin(async move {
            loop {
                if self.is_closed() {
                    return Err(TransportError::closed());
                }
                if let Some(err) = lock(&self.fetch_errors).pop_front() {
                    return Err(err);
                }
                if let Some(message) = lock(&self.queue).pop_front() {
                    self.fetched.fetch_add(1, Ordering::SeqCst);
                    return Ok(message);
                }
                self.arrived.notified().await;
            }
        })
    }

    fn commit_messages<'a>(&'a self, messages: &'a [LogMessage]) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(TransportError::closed());
            }
            lock(&self.committed).extend_from_slice(messages);
            Ok(())
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            self.arrived.notify_waiters();
            // Leave a permit for a fetch that has not started waiting yet
            self.arrived.notify_one();
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_failures_come_first() {
        let producer = ScriptedProducer::new().failing_times(2, TransportErrorKind::Timeout);

        for _ in 0..2 {
            let err = producer.publish(b"k", b"v", Duration::ZERO).await.unwrap_err();
            assert_eq!(err.kind, TransportErrorKind::Timeout);
        }
        producer.publish(b"k", b"v", Duration::ZERO).await.unwrap();

        assert_eq!(producer.attempts(), 3);
        assert_eq!(producer.published().len(), 1);
    }

    #[tokio::test]
    async fn fetch_waits_for_push() {
        let consumer = InMemoryLogConsumer::new();
        let reader = consumer.clone();
        let handle = tokio::spawn(async move { reader.fetch_message().await });

        tokio::task::yield_now().await;
        consumer.push(b"T1", b"{}");

        let message = handle.await.unwrap().unwrap();
        assert_eq!(message.offset, 0);
        consumer.commit_messages(&[message]).await.unwrap();
        assert_eq!(consumer.committed_offsets(), vec![0]);
    }
}
