//! Integration tests for [`RedpandaProducer`] / [`RedpandaConsumer`] against a real broker.
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//!
//! To run explicitly:
//! ```bash
//! cargo test -p outbox-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use outbox_core::{LogConsumer, LogMessage, LogProducer};
use outbox_redpanda::{RedpandaConsumer, RedpandaProducer, StartOffset};
use std::time::Duration;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");

    (kafka, format!("{host}:{port}"))
}

fn producer(brokers: &str, topic: &str) -> RedpandaProducer {
    RedpandaProducer::builder()
        .brokers(brokers)
        .topic(topic)
        .client_id("integration-test")
        .build()
        .expect("Failed to create producer")
}

fn consumer(brokers: &str, topic: &str, group: &str) -> RedpandaConsumer {
    RedpandaConsumer::builder()
        .brokers(brokers)
        .topic(topic)
        .group_id(group)
        .start_offset(StartOffset::First)
        .build()
        .expect("Failed to create consumer")
}

/// Publish a warmup message until the topic exists and the broker acknowledges.
async fn ensure_topic_exists(producer: &RedpandaProducer) {
    for attempt in 1..=60 {
        if producer
            .publish(b"warmup", b"{}", Duration::from_secs(2))
            .await
            .is_ok()
        {
            tokio::time::sleep(Duration::from_secs(1)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(attempt != 60, "Failed to create topic {}", producer.topic());
    }
}

async fn fetch_non_warmup(consumer: &RedpandaConsumer, count: usize) -> Vec<LogMessage> {
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(30), async {
        while received.len() < count {
            let message = consumer.fetch_message().await.expect("fetch");
            if message.key.as_deref() != Some(b"warmup".as_slice()) {
                received.push(message);
            }
        }
    })
    .await
    .expect("Timed out waiting for messages");
    received
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_publish_and_fetch_preserves_key_order() {
    let (_kafka, brokers) = start_kafka().await;
    let producer = producer(&brokers, "tickets.events");
    ensure_topic_exists(&producer).await;

    for i in 0..3 {
        let value = format!(r#"{{"seq":{i}}}"#);
        producer
            .publish(b"T1", value.as_bytes(), Duration::ZERO)
            .await
            .expect("publish");
    }

    let consumer = consumer(&brokers, "tickets.events", "order-test");
    let received = fetch_non_warmup(&consumer, 3).await;

    let values: Vec<String> = received
        .iter()
        .map(|m| String::from_utf8_lossy(&m.value).into_owned())
        .collect();
    assert_eq!(values, vec![r#"{"seq":0}"#, r#"{"seq":1}"#, r#"{"seq":2}"#]);
    assert!(received.iter().all(|m| m.partition == received[0].partition));

    consumer.commit_messages(&received).await.expect("commit");
    consumer.close().await.expect("close consumer");
    producer.close().await.expect("close producer");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_uncommitted_message_is_redelivered_to_group() {
    let (_kafka, brokers) = start_kafka().await;
    let producer = producer(&brokers, "redelivery.events");
    ensure_topic_exists(&producer).await;

    producer
        .publish(b"T9", br#"{"event_id":"e-9"}"#, Duration::ZERO)
        .await
        .expect("publish");

    let first = consumer(&brokers, "redelivery.events", "redelivery-test");
    let seen = fetch_non_warmup(&first, 1).await;
    first.close().await.expect("close without commit");

    let second = consumer(&brokers, "redelivery.events", "redelivery-test");
    let again = fetch_non_warmup(&second, 1).await;
    assert_eq!(again[0].offset, seen[0].offset);
    assert_eq!(again[0].value, seen[0].value);

    second.commit_messages(&again).await.expect("commit");
    second.close().await.expect("close");
    producer.close().await.expect("close producer");
}
