//! Redis Streams transport against a real Redis.
//!
//! Runs only with the `redis` feature and `REDIS_URL` set.

#![cfg(feature = "redis")]

use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use redis::streams::StreamPendingReply;

use petstore_infra::broker::{RedisStreamsConsumer, RedisStreamsProducer};
use petstore_infra::config::{Acks, ConsumerConfig, ProducerConfig};
use petstore_messaging::{AckPolicy, MessageConsumer, MessageProducer, OffsetReset};

const GROUP: &str = "pet-stream";

fn configs(url: &str, topic: &str) -> (ProducerConfig, ConsumerConfig) {
    let producer = ProducerConfig {
        bootstrap_server: url.to_string(),
        topic: topic.to_string(),
        client_id: "api".into(),
        ack: Acks::All,
        timeout: Duration::from_secs(2),
    };
    let consumer = ConsumerConfig {
        bootstrap_server: url.to_string(),
        topic: topic.to_string(),
        client_id: "stream".into(),
        group_id: GROUP.into(),
        offset_reset: OffsetReset::Earliest,
        timeout: Duration::from_secs(2),
        ack_policy: AckPolicy::OnReceive,
        workers: 1,
    };
    (producer, consumer)
}

#[tokio::test]
async fn malformed_entries_are_acknowledged_and_skipped() {
    let Ok(url) = std::env::var("REDIS_URL") else {
        eprintln!("REDIS_URL not set; skipping malformed_entries_are_acknowledged_and_skipped");
        return;
    };
    let topic = format!(
        "petstore-test-{}-{}",
        std::process::id(),
        Utc::now().timestamp_subsec_nanos()
    );
    let (producer_cfg, consumer_cfg) = configs(&url, &topic);

    let client = redis::Client::open(url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();

    // No payload field.
    let _: String = redis::cmd("XADD")
        .arg(&topic)
        .arg("*")
        .arg("key")
        .arg("broken")
        .query_async(&mut conn)
        .await
        .unwrap();
    RedisStreamsProducer::new(&producer_cfg)
        .unwrap()
        .publish("good", b"payload".to_vec())
        .await
        .unwrap();

    let consumer = RedisStreamsConsumer::new(&consumer_cfg).unwrap();
    let mut stream = consumer.subscribe().await.unwrap();
    let mut delivery = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(delivery.key(), Some("good"));
    assert_eq!(delivery.payload(), b"payload");
    delivery.acknowledge().await.unwrap();

    let pending: StreamPendingReply = redis::cmd("XPENDING")
        .arg(&topic)
        .arg(GROUP)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(pending.count(), 0);

    drop(stream);
    let _: i64 = redis::cmd("DEL").arg(&topic).query_async(&mut conn).await.unwrap();
}
