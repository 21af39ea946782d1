//! Redis Streams transport (durable, consumer groups, explicit XACK).
//!
//! - **Stream key**: the configured topic.
//! - **Entries**: `XADD <topic> * key <message key> payload <bytes>`.
//! - **Consumer groups**: created on subscribe (`XGROUP CREATE .. MKSTREAM`),
//!   starting at `0` for `earliest` and `$` for `latest`. An existing group
//!   keeps its position.
//! - **Consumers**: named after the client id; a subscription first re-reads
//!   its own pending (delivered, unacknowledged) entries, then new ones.
//! - **Acknowledgment**: `XACK` removes the entry from the pending list.
//!
//! A stream has no partitions; every delivery reports partition 0, so ordering
//! holds across all keys.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadReply};
use tracing::{info, warn};

use petstore_messaging::{
    Acknowledge, BrokerError, Delivery, DeliveryStream, MessageConsumer, MessageProducer, OffsetReset,
};

use crate::config::{ConsumerConfig, ProducerConfig};

const KEY_FIELD: &str = "key";
const PAYLOAD_FIELD: &str = "payload";
const READ_COUNT: usize = 16;
const BLOCK_MS: u64 = 1_000;

pub struct RedisStreamsProducer {
    client: redis::Client,
    topic: String,
    timeout: Duration,
}

impl RedisStreamsProducer {
    pub fn new(config: &ProducerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.bootstrap_server.as_str())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            topic: config.topic.clone(),
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl MessageProducer for RedisStreamsProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let add = async {
            let mut conn = connect(&self.client).await?;
            let _: String = redis::cmd("XADD")
                .arg(&self.topic)
                .arg("*")
                .arg(KEY_FIELD)
                .arg(key)
                .arg(PAYLOAD_FIELD)
                .arg(payload)
                .query_async(&mut conn)
                .await
                .map_err(|e| BrokerError::Publish(format!("XADD failed: {e}")))?;
            Ok(())
        };

        tokio::time::timeout(self.timeout, add)
            .await
            .map_err(|_| BrokerError::Timeout(format!("XADD to {} after {:?}", self.topic, self.timeout)))?
    }
}

pub struct RedisStreamsConsumer {
    client: redis::Client,
    topic: String,
    group_id: String,
    consumer_name: String,
    offset_reset: OffsetReset,
    timeout: Duration,
}

impl RedisStreamsConsumer {
    pub fn new(config: &ConsumerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.bootstrap_server.as_str())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            topic: config.topic.clone(),
            group_id: config.group_id.clone(),
            consumer_name: config.client_id.clone(),
            offset_reset: config.offset_reset,
            timeout: config.timeout,
        })
    }

    /// Create the consumer group unless it exists.
    async fn ensure_group(&self, conn: &mut MultiplexedConnection) -> Result<(), BrokerError> {
        let start = match self.offset_reset {
            OffsetReset::Earliest => "0",
            OffsetReset::Latest => "$",
        };

        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.topic)
            .arg(&self.group_id)
            .arg(start)
            .arg("MKSTREAM")
            .query_async(conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BrokerError::Subscribe(format!("XGROUP CREATE failed: {e}"))),
        }
    }
}

#[async_trait]
impl MessageConsumer for RedisStreamsConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn probe(&self) -> Result<(), BrokerError> {
        let ping = async {
            let mut conn = connect(&self.client).await?;
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
            Ok(())
        };

        tokio::time::timeout(self.timeout, ping)
            .await
            .map_err(|_| BrokerError::Timeout(format!("no PONG within {:?}", self.timeout)))?
    }

    async fn subscribe(&self) -> Result<DeliveryStream, BrokerError> {
        let mut conn = connect(&self.client).await?;
        self.ensure_group(&mut conn).await?;

        info!(stream = %self.topic, group_id = %self.group_id, consumer = %self.consumer_name, "subscribed to Redis stream");

        let reader = Reader {
            conn,
            topic: self.topic.clone(),
            group_id: self.group_id.clone(),
            consumer_name: self.consumer_name.clone(),
            // Own pending entries first: they were delivered to a previous
            // subscription under this name and never acknowledged.
            cursor: "0".to_string(),
            buffer: VecDeque::new(),
        };

        Ok(stream::unfold(reader, |mut reader| async move {
            let item = reader.next().await;
            Some((item, reader))
        })
        .boxed())
    }
}

struct Reader {
    conn: MultiplexedConnection,
    topic: String,
    group_id: String,
    consumer_name: String,
    /// `0` while draining the pending list, then `>` for new entries.
    cursor: String,
    buffer: VecDeque<Delivery>,
}

impl Reader {
    async fn next(&mut self) -> Result<Delivery, BrokerError> {
        loop {
            if let Some(delivery) = self.buffer.pop_front() {
                return Ok(delivery);
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<(), BrokerError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group_id)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(READ_COUNT);
        if self.cursor == ">" {
            cmd.arg("BLOCK").arg(BLOCK_MS);
        }
        cmd.arg("STREAMS").arg(&self.topic).arg(&self.cursor);

        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut self.conn)
            .await
            .map_err(|e| BrokerError::Receive(format!("XREADGROUP failed: {e}")))?;

        let entries: Vec<StreamId> = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default();

        if entries.is_empty() && self.cursor != ">" {
            self.cursor = ">".to_string();
            return Ok(());
        }

        for entry in entries {
            if self.cursor != ">" {
                self.cursor = entry.id.clone();
            }
            let id = entry.id.clone();
            match self.to_delivery(entry) {
                Ok(delivery) => self.buffer.push_back(delivery),
                Err(e) => {
                    warn!(entry_id = %id, error = %e, "skipping malformed stream entry");
                    // Otherwise it stays pending and is re-read on every subscription.
                    if let Err(e) = self.ack(&id).acknowledge().await {
                        warn!(entry_id = %id, error = %e, "failed to acknowledge malformed stream entry");
                    }
                }
            }
        }
        Ok(())
    }

    fn ack(&self, id: &str) -> RedisAck {
        RedisAck {
            conn: self.conn.clone(),
            topic: self.topic.clone(),
            group_id: self.group_id.clone(),
            id: id.to_string(),
        }
    }

    fn to_delivery(&self, entry: StreamId) -> Result<Delivery, BrokerError> {
        let key: Option<String> = entry.get(KEY_FIELD);
        let payload: Vec<u8> = entry
            .get(PAYLOAD_FIELD)
            .ok_or_else(|| BrokerError::Receive(format!("entry {} has no payload", entry.id)))?;

        let ack = self.ack(&entry.id);

        Ok(Delivery::new(
            self.topic.clone(),
            0,
            entry_offset(&entry.id),
            key,
            payload,
            Box::new(ack),
        ))
    }
}

/// Millisecond part of an entry id (`<ms>-<seq>`).
fn entry_offset(id: &str) -> i64 {
    id.split('-')
        .next()
        .and_then(|ms| ms.parse().ok())
        .unwrap_or_default()
}

struct RedisAck {
    conn: MultiplexedConnection,
    topic: String,
    group_id: String,
    id: String,
}

#[async_trait]
impl Acknowledge for RedisAck {
    async fn acknowledge(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("XACK")
            .arg(&self.topic)
            .arg(&self.group_id)
            .arg(&self.id)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Acknowledge(format!("XACK failed: {e}")))?;
        Ok(())
    }
}

async fn connect(client: &redis::Client) -> Result<MultiplexedConnection, BrokerError> {
    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_is_the_millisecond_part_of_the_id() {
        assert_eq!(entry_offset("1526919030474-55"), 1_526_919_030_474);
        assert_eq!(entry_offset("garbage"), 0);
    }
}
