//! Relay state-machine scenarios against the in-memory outbox store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use outbox_core::environment::Clock;
use outbox_core::{NewOutboxRecord, OutboxStatus, OutboxStore, TransportErrorKind};
use outbox_runtime::{BackoffPolicy, OutboxRelay, RelayConfig, RelayMetrics};
use outbox_testing::{InMemoryOutboxStore, ManualClock, ScriptedProducer};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn no_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::ZERO, Duration::ZERO, Duration::ZERO)
}

fn ticket_created(aggregate_id: &str) -> NewOutboxRecord {
    NewOutboxRecord::new(
        "ticket",
        aggregate_id,
        "ticket.created",
        json!({"title": "printer on fire", "request_id": "req-1"}),
    )
}

struct Harness {
    clock: Arc<ManualClock>,
    store: InMemoryOutboxStore,
    producer: ScriptedProducer,
}

impl Harness {
    fn new(producer: ScriptedProducer) -> Self {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryOutboxStore::new(clock.clone());
        Self {
            clock,
            store,
            producer,
        }
    }

    fn relay(&self, max_attempts: u32) -> OutboxRelay {
        let config = RelayConfig {
            max_attempts,
            ..RelayConfig::default()
        };
        OutboxRelay::new(
            Arc::new(self.store.clone()),
            Arc::new(self.producer.clone()),
            config,
        )
        .with_clock(self.clock.clone())
    }
}

#[tokio::test]
async fn row_is_sent_after_two_failed_publishes() {
    let harness =
        Harness::new(ScriptedProducer::new().failing_times(2, TransportErrorKind::Timeout));
    let relay = harness.relay(5);
    let id = harness.store.insert(ticket_created("T1"));

    let first = relay.tick().await.unwrap();
    assert_eq!((first.claimed, first.retried), (1, 1));

    // Not due until the 500ms floor has passed
    assert_eq!(relay.tick().await.unwrap().claimed, 0);

    harness.clock.advance(Duration::from_secs(1));
    assert_eq!(relay.tick().await.unwrap().retried, 1);

    harness.clock.advance(Duration::from_secs(2));
    assert_eq!(relay.tick().await.unwrap().sent, 1);

    let row = harness.store.get(id).unwrap();
    assert_eq!(row.status, OutboxStatus::Sent);
    assert_eq!(row.attempts, 3);
    assert!(row.sent_at.is_some());
    assert!(row.processing_started_at.is_none());
    assert_eq!(row.last_error, None);
    assert_eq!(harness.producer.attempts(), 3);
}

#[tokio::test]
async fn failed_publish_schedules_retry_with_backoff() {
    let harness = Harness::new(ScriptedProducer::new().failing_times(1, TransportErrorKind::Other));
    let relay = harness.relay(5);
    let id = harness.store.insert(ticket_created("T1"));
    let start = harness.clock.now();

    relay.tick().await.unwrap();

    let row = harness.store.get(id).unwrap();
    assert_eq!(row.status, OutboxStatus::Pending);
    assert_eq!(row.next_retry_at, start + chrono::Duration::milliseconds(500));
    assert!(row.last_error.unwrap().starts_with("publish: "));
}

#[tokio::test]
async fn exhausted_row_is_dead_lettered_and_marked_dead() {
    let producer = ScriptedProducer::new();
    producer.fail_always(TransportErrorKind::BrokenConnection);
    let harness = Harness::new(producer);

    let dead_letter = ScriptedProducer::new();
    dead_letter.fail_always(TransportErrorKind::ConnectionRefused);
    let metrics = Arc::new(RelayMetrics::new());
    let relay = harness
        .relay(2)
        .with_dead_letter(Arc::new(dead_letter.clone()))
        .with_metrics(metrics.clone());
    let id = harness.store.insert(ticket_created("T1"));

    assert_eq!(relay.tick().await.unwrap().retried, 1);
    harness.clock.advance(Duration::from_secs(1));
    assert_eq!(relay.tick().await.unwrap().dead, 1);

    let row = harness.store.get(id).unwrap();
    assert_eq!(row.status, OutboxStatus::Dead);
    assert_eq!(row.attempts, 2);
    assert!(!row.last_error.unwrap_or_default().is_empty());

    // Dead-letter publish failed, but the row was still buried
    assert_eq!(dead_letter.attempts(), 1);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.claimed, 2);
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.dead, 1);
    assert_eq!(snapshot.published, 0);

    // Terminal: never claimed again
    harness.clock.advance(Duration::from_secs(120));
    assert_eq!(relay.tick().await.unwrap().claimed, 0);
}

#[tokio::test]
async fn dead_letter_record_carries_error_and_envelope() {
    let producer = ScriptedProducer::new();
    producer.fail_always(TransportErrorKind::Other);
    let harness = Harness::new(producer);
    let dead_letter = ScriptedProducer::new();
    let relay = harness
        .relay(1)
        .with_dead_letter(Arc::new(dead_letter.clone()));
    harness.store.insert(ticket_created("T7"));

    relay.tick().await.unwrap();

    let published = dead_letter.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].key, b"T7");

    let record = published[0].json().unwrap();
    assert!(record["error"].as_str().unwrap().starts_with("publish: "));
    assert_eq!(record["envelope"]["aggregate_id"], "T7");
    assert_eq!(record["envelope"]["event_type"], "ticket.created");
}

#[tokio::test]
async fn zero_max_attempts_retries_forever() {
    let producer = ScriptedProducer::new();
    producer.fail_always(TransportErrorKind::Timeout);
    let harness = Harness::new(producer);
    let relay = harness.relay(0).with_backoff(no_backoff());
    let id = harness.store.insert(ticket_created("T1"));

    for _ in 0..20 {
        relay.tick().await.unwrap();
    }

    let row = harness.store.get(id).unwrap();
    assert_eq!(row.status, OutboxStatus::Pending);
    assert_eq!(row.attempts, 20);
}

#[tokio::test]
async fn published_envelope_is_keyed_by_aggregate() {
    let harness = Harness::new(ScriptedProducer::new());
    let relay = harness.relay(5);
    harness.store.insert(ticket_created("T1"));
    harness.store.insert(ticket_created("T2"));

    assert_eq!(relay.tick().await.unwrap().sent, 2);

    let published = harness.producer.published();
    let keys: Vec<&[u8]> = published.iter().map(|m| m.key.as_slice()).collect();
    assert_eq!(keys, vec![b"T1".as_slice(), b"T2".as_slice()]);

    let envelope = published[0].json().unwrap();
    assert_eq!(envelope["aggregate"], "ticket");
    assert_eq!(envelope["request_id"], "req-1");
    assert_eq!(envelope["payload"]["title"], "printer on fire");
    assert!(!envelope["event_id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_relays_never_claim_the_same_row() {
    let harness = Harness::new(ScriptedProducer::new());
    for n in 0..25 {
        harness.store.insert(ticket_created(&format!("T{n}")));
    }
    let config = RelayConfig {
        batch_size: 10,
        ..RelayConfig::default()
    };
    let a = OutboxRelay::new(
        Arc::new(harness.store.clone()),
        Arc::new(harness.producer.clone()),
        config,
    );
    let b = OutboxRelay::new(
        Arc::new(harness.store.clone()),
        Arc::new(harness.producer.clone()),
        config,
    );

    let (ra, rb) = tokio::join!(a.tick(), b.tick());
    assert_eq!(ra.unwrap().claimed + rb.unwrap().claimed, 20);

    let (ra, rb) = tokio::join!(a.tick(), b.tick());
    assert_eq!(ra.unwrap().claimed + rb.unwrap().claimed, 5);

    let published = harness.producer.published();
    let event_ids: HashSet<String> = published
        .iter()
        .map(|m| m.json().unwrap()["event_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(published.len(), 25);
    assert_eq!(event_ids.len(), 25);
    assert_eq!(harness.store.count(OutboxStatus::Sent), 25);
}

#[tokio::test]
async fn rows_orphaned_by_a_crashed_relay_are_recovered() {
    let harness = Harness::new(ScriptedProducer::new());
    let relay = harness.relay(5);
    let id = harness.store.insert(ticket_created("T1"));

    // Another relay claims the row and dies before recording an outcome
    assert_eq!(harness.store.claim_pending(10).await.unwrap().len(), 1);

    let report = relay.tick().await.unwrap();
    assert_eq!((report.requeued, report.claimed), (0, 0));

    harness.clock.advance(Duration::from_secs(31));
    let report = relay.tick().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.sent, 1);

    let row = harness.store.get(id).unwrap();
    assert_eq!(row.status, OutboxStatus::Sent);
    assert_eq!(row.attempts, 2);
    assert_eq!(relay.metrics().snapshot().requeued, 1);
}

#[tokio::test]
async fn store_outage_aborts_the_tick() {
    let harness = Harness::new(ScriptedProducer::new());
    let relay = harness.relay(5);
    harness.store.insert(ticket_created("T1"));

    harness.store.set_unavailable(true);
    assert!(relay.tick().await.is_err());
    assert_eq!(harness.producer.attempts(), 0);

    harness.store.set_unavailable(false);
    assert_eq!(relay.tick().await.unwrap().sent, 1);
}

#[tokio::test]
async fn lag_gauge_is_refreshed_each_tick() {
    let producer = ScriptedProducer::new();
    producer.fail_always(TransportErrorKind::Timeout);
    let harness = Harness::new(producer);
    let relay = harness.relay(0);
    harness.store.insert(ticket_created("T1"));

    relay.tick().await.unwrap();
    harness.clock.advance(Duration::from_secs(10));
    relay.tick().await.unwrap();

    assert!((relay.metrics().snapshot().lag_seconds - 10.0).abs() < 1e-9);
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let harness = Harness::new(ScriptedProducer::new());
    let config = RelayConfig {
        poll_interval: Duration::from_millis(10),
        ..RelayConfig::default()
    };
    let relay = OutboxRelay::new(
        Arc::new(harness.store.clone()),
        Arc::new(harness.producer.clone()),
        config,
    )
    .with_clock(harness.clock.clone());
    harness.store.insert(ticket_created("T1"));

    let (tx, rx) = tokio::sync::broadcast::channel(1);
    let task = tokio::spawn(async move { relay.run(rx).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.store.count(OutboxStatus::Sent) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("row should be published");

    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("relay should stop")
        .unwrap();
}
