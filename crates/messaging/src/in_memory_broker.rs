//! In-memory broker for tests/dev.
//!
//! Mimics the parts of a partitioned log the pipeline relies on:
//! - keyed partitioning (same key → same partition → publish order)
//! - consumer groups with committed cursors that survive resubscription
//! - `earliest` / `latest` reset for groups with no cursor yet
//!
//! No IO. A group is expected to have one live subscription at a time.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::sync::Notify;

use crate::broker::{
    Acknowledge, Delivery, DeliveryStream, MessageConsumer, MessageProducer, OffsetReset,
};
use crate::error::BrokerError;

const DEFAULT_PARTITIONS: usize = 3;

/// A message as stored in a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    sequence: u64,
}

#[derive(Debug, Default)]
struct State {
    available: bool,
    closed: bool,
    next_sequence: u64,
    topics: HashMap<String, Vec<Vec<Record>>>,
    /// Committed next-offset per partition, keyed by (topic, group).
    cursors: HashMap<(String, String), Vec<i64>>,
}

#[derive(Debug)]
struct Inner {
    partitions: usize,
    state: Mutex<State>,
    notify: Notify,
}

/// Shared handle to an in-memory broker. Clones see the same topics.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                state: Mutex::new(State {
                    available: true,
                    ..State::default()
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn producer(&self, topic: impl Into<String>) -> InMemoryProducer {
        InMemoryProducer {
            broker: self.clone(),
            topic: topic.into(),
        }
    }

    pub fn consumer(
        &self,
        topic: impl Into<String>,
        group_id: impl Into<String>,
        reset: OffsetReset,
    ) -> InMemoryConsumer {
        InMemoryConsumer {
            broker: self.clone(),
            topic: topic.into(),
            group_id: group_id.into(),
            reset,
        }
    }

    /// Simulate the broker going away (or coming back).
    ///
    /// While unavailable, publishes, probes, subscriptions and acknowledgments
    /// fail; open subscriptions stall.
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
        self.inner.notify.notify_waiters();
    }

    /// Shut the broker down; open subscriptions end.
    pub fn close(&self) {
        self.state().closed = true;
        self.inner.notify.notify_waiters();
    }

    /// Every record in `topic`, in append order.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        let state = self.state();
        let mut all: Vec<Record> = state
            .topics
            .get(topic)
            .map(|parts| parts.iter().flatten().cloned().collect())
            .unwrap_or_default();
        all.sort_by_key(|r| r.sequence);
        all
    }

    /// Number of messages the group has acknowledged in `topic`.
    pub fn committed(&self, topic: &str, group_id: &str) -> u64 {
        let state = self.state();
        state
            .cursors
            .get(&(topic.to_string(), group_id.to_string()))
            .map(|c| c.iter().map(|o| *o as u64).sum())
            .unwrap_or(0)
    }

    /// Messages in `topic` the group has not acknowledged yet.
    pub fn lag(&self, topic: &str, group_id: &str) -> u64 {
        let total = self.records(topic).len() as u64;
        total.saturating_sub(self.committed(topic, group_id))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave State half-updated in a
        // way later readers care about.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.inner.partitions as u64) as usize
    }

    fn append(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let partition = self.partition_for(key);
        let partitions = self.inner.partitions;
        {
            let mut state = self.state();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            if !state.available {
                return Err(BrokerError::Connection("broker unavailable".to_string()));
            }

            let sequence = state.next_sequence;
            state.next_sequence += 1;

            let log = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| vec![Vec::new(); partitions]);
            let offset = log[partition].len() as i64;
            log[partition].push(Record {
                partition: partition as i32,
                offset,
                key: Some(key.to_string()),
                payload,
                timestamp: Utc::now(),
                sequence,
            });
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Join the group, creating its cursor from `reset` if it has none.
    fn join(&self, topic: &str, group_id: &str, reset: OffsetReset) -> Result<Vec<i64>, BrokerError> {
        let partitions = self.inner.partitions;
        let mut state = self.state();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if !state.available {
            return Err(BrokerError::Connection("broker unavailable".to_string()));
        }

        let ends: Vec<i64> = match state.topics.get(topic) {
            Some(log) => log.iter().map(|p| p.len() as i64).collect(),
            None => vec![0; partitions],
        };

        let cursor = state
            .cursors
            .entry((topic.to_string(), group_id.to_string()))
            .or_insert_with(|| match reset {
                OffsetReset::Earliest => vec![0; partitions],
                OffsetReset::Latest => ends,
            });
        Ok(cursor.clone())
    }

    fn commit(&self, topic: &str, group_id: &str, partition: usize, offset: i64) -> Result<(), BrokerError> {
        let mut state = self.state();
        if !state.available {
            return Err(BrokerError::Acknowledge("broker unavailable".to_string()));
        }
        let partitions = self.inner.partitions;
        let cursor = state
            .cursors
            .entry((topic.to_string(), group_id.to_string()))
            .or_insert_with(|| vec![0; partitions]);
        if cursor[partition] < offset + 1 {
            cursor[partition] = offset + 1;
        }
        Ok(())
    }
}

/// Producer bound to one topic of an [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct InMemoryProducer {
    broker: InMemoryBroker,
    topic: String,
}

#[async_trait]
impl MessageProducer for InMemoryProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.broker.append(&self.topic, key, payload)
    }
}

/// Consumer bound to one topic and group of an [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    topic: String,
    group_id: String,
    reset: OffsetReset,
}

#[async_trait]
impl MessageConsumer for InMemoryConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn probe(&self) -> Result<(), BrokerError> {
        let state = self.broker.state();
        if state.available && !state.closed {
            Ok(())
        } else {
            Err(BrokerError::Connection("broker unavailable".to_string()))
        }
    }

    async fn subscribe(&self) -> Result<DeliveryStream, BrokerError> {
        let positions = self.broker.join(&self.topic, &self.group_id, self.reset)?;

        let reader = Reader {
            broker: self.broker.clone(),
            topic: self.topic.clone(),
            group_id: self.group_id.clone(),
            positions,
            next_partition: 0,
        };

        Ok(stream::unfold(reader, |mut reader| async move {
            let delivery = reader.next().await?;
            Some((Ok(delivery), reader))
        })
        .boxed())
    }
}

/// Per-subscription read position (ahead of the committed cursor).
struct Reader {
    broker: InMemoryBroker,
    topic: String,
    group_id: String,
    positions: Vec<i64>,
    next_partition: usize,
}

impl Reader {
    /// Wait for the next record in any partition; `None` once the broker closes.
    async fn next(&mut self) -> Option<Delivery> {
        let inner = self.broker.inner.clone();
        loop {
            let notified = inner.notify.notified();

            if let Some(record) = self.take_ready() {
                let ack = InMemoryAck {
                    broker: self.broker.clone(),
                    topic: self.topic.clone(),
                    group_id: self.group_id.clone(),
                    partition: record.partition as usize,
                    offset: record.offset,
                };
                return Some(Delivery::new(
                    self.topic.clone(),
                    record.partition,
                    record.offset,
                    record.key,
                    record.payload,
                    Box::new(ack),
                ));
            }
            if self.broker.state().closed {
                return None;
            }

            notified.await;
        }
    }

    /// Round-robin over partitions so one busy key cannot starve the others.
    fn take_ready(&mut self) -> Option<Record> {
        let state = self.broker.state();
        if !state.available || state.closed {
            return None;
        }
        let log = state.topics.get(&self.topic)?;
        let partitions = log.len();

        for step in 0..partitions {
            let p = (self.next_partition + step) % partitions;
            let pos = self.positions[p];
            if let Some(record) = log[p].get(pos as usize) {
                self.positions[p] = pos + 1;
                self.next_partition = (p + 1) % partitions;
                return Some(record.clone());
            }
        }
        None
    }
}

struct InMemoryAck {
    broker: InMemoryBroker,
    topic: String,
    group_id: String,
    partition: usize,
    offset: i64,
}

#[async_trait]
impl Acknowledge for InMemoryAck {
    async fn acknowledge(&self) -> Result<(), BrokerError> {
        self.broker
            .commit(&self.topic, &self.group_id, self.partition, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_always_maps_to_same_partition() {
        let broker = InMemoryBroker::with_partitions(8);
        let producer = broker.producer("t");
        producer.publish("k", vec![1]).await.unwrap();
        producer.publish("k", vec![2]).await.unwrap();

        let records = broker.records("t");
        assert_eq!(records[0].partition, records[1].partition);
        assert_eq!(records[1].offset, records[0].offset + 1);
    }

    #[tokio::test]
    async fn closing_ends_open_subscriptions() {
        let broker = InMemoryBroker::new();
        let consumer = broker.consumer("t", "g", OffsetReset::Earliest);
        let mut stream = consumer.subscribe().await.unwrap();

        let closer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            closer.close();
        });

        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn subscriber_wakes_up_for_later_publishes() {
        let broker = InMemoryBroker::new();
        let consumer = broker.consumer("t", "g", OffsetReset::Earliest);
        let mut stream = consumer.subscribe().await.unwrap();

        let producer = broker.producer("t");
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            producer.publish("k", b"late".to_vec()).await.unwrap();
        });

        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.payload(), b"late");
    }

    #[tokio::test]
    async fn acknowledgment_never_moves_the_cursor_backwards() {
        let broker = InMemoryBroker::with_partitions(1);
        let producer = broker.producer("t");
        producer.publish("a", vec![0]).await.unwrap();
        producer.publish("a", vec![1]).await.unwrap();

        let consumer = broker.consumer("t", "g", OffsetReset::Earliest);
        let mut stream = consumer.subscribe().await.unwrap();
        let mut first = stream.next().await.unwrap().unwrap();
        let mut second = stream.next().await.unwrap().unwrap();

        second.acknowledge().await.unwrap();
        first.acknowledge().await.unwrap();

        assert_eq!(broker.committed("t", "g"), 2);
    }
}
