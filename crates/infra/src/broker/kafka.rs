//! Kafka transport (`rdkafka`).
//!
//! - Producer: `FutureProducer`, one record per command keyed by the command
//!   id; `acks` and the delivery timeout come from [`ProducerConfig`].
//! - Consumer: one `StreamConsumer` per subscription with auto-commit off.
//!   Acknowledging a delivery commits `offset + 1` for its partition.
//! - Probe: a metadata request for the topic, bounded by the consumer
//!   timeout, so an unreachable cluster fails the subscription instead of
//!   retrying forever in the background.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info};

use petstore_messaging::{
    Acknowledge, BrokerError, Delivery, DeliveryStream, MessageConsumer, MessageProducer,
};

use crate::config::{ConsumerConfig, ProducerConfig};

pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &ProducerConfig) -> Result<Self, BrokerError> {
        info!(brokers = %config.bootstrap_server, topic = %config.topic, "creating Kafka producer");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_server)
            .set("client.id", &config.client_id)
            .set("acks", config.ack.as_str())
            .set("message.timeout.ms", config.timeout.as_millis().to_string())
            .create()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl MessageProducer for KafkaProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let record = FutureRecord::to(&self.topic)
            .key(key)
            .payload(payload.as_slice());

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }
}

pub struct KafkaConsumer {
    client: ClientConfig,
    topic: String,
    group_id: String,
    timeout: Duration,
}

impl KafkaConsumer {
    pub fn new(config: &ConsumerConfig) -> Self {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &config.bootstrap_server)
            .set("client.id", &config.client_id)
            .set("group.id", &config.group_id)
            .set("auto.offset.reset", config.offset_reset.as_str())
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "10000");

        Self {
            client,
            topic: config.topic.clone(),
            group_id: config.group_id.clone(),
            timeout: config.timeout,
        }
    }
}

#[async_trait]
impl MessageConsumer for KafkaConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn probe(&self) -> Result<(), BrokerError> {
        let probe: BaseConsumer = self
            .client
            .create()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let topic = self.topic.clone();
        let timeout = self.timeout;

        // fetch_metadata blocks the calling thread.
        tokio::task::spawn_blocking(move || probe.fetch_metadata(Some(&topic), timeout))
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?
            .map_err(|e| BrokerError::Timeout(format!("no metadata within {timeout:?}: {e}")))?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<DeliveryStream, BrokerError> {
        let consumer: StreamConsumer = self
            .client
            .create()
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
        consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

        info!(topic = %self.topic, group_id = %self.group_id, "subscribed to Kafka topic");

        let consumer = Arc::new(consumer);
        Ok(stream::unfold(consumer, |consumer| async move {
            let item = match consumer.recv().await {
                Ok(msg) => {
                    let ack = KafkaAck {
                        consumer: consumer.clone(),
                        topic: msg.topic().to_string(),
                        partition: msg.partition(),
                        offset: msg.offset(),
                    };
                    Ok(Delivery::new(
                        msg.topic(),
                        msg.partition(),
                        msg.offset(),
                        msg.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                        msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                        Box::new(ack),
                    ))
                }
                Err(e) => Err(BrokerError::Receive(e.to_string())),
            };
            Some((item, consumer))
        })
        .boxed())
    }
}

struct KafkaAck {
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: i32,
    offset: i64,
}

#[async_trait]
impl Acknowledge for KafkaAck {
    async fn acknowledge(&self) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, self.partition, Offset::Offset(self.offset + 1))
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))?;
        debug!(partition = self.partition, offset = self.offset, "offset committed");
        Ok(())
    }
}
