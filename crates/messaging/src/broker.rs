//! Broker abstraction (transport mechanics only).
//!
//! This module is the seam between the command pipeline and a durable,
//! partitioned log (Kafka, Redis Streams, or the in-memory broker used in
//! tests). It knows nothing about commands: payloads are bytes and keys are
//! strings.
//!
//! ## Delivery model
//!
//! - **Keyed partitioning**: messages with the same key land in the same
//!   partition and are delivered in publish order. Nothing is promised across
//!   different keys.
//! - **Consumer groups**: a subscription reads under a group id; the group's
//!   cursor is what survives a restart.
//! - **Explicit acknowledgment**: every [`Delivery`] carries an acknowledger.
//!   When it is invoked is a policy decision of the caller (see [`AckPolicy`]);
//!   the broker only advances the cursor when told to.
//!
//! ## Cancellation
//!
//! Dropping a [`DeliveryStream`] ends the subscription and releases whatever
//! connection backs it. Nothing is rolled back: messages already delivered
//! but not acknowledged are simply seen again by the next subscription of the
//! same group.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::BrokerError;

/// When a consumer advances its cursor for a message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Acknowledge as soon as the message is handed to the subscriber.
    ///
    /// A crash between delivery and the end of processing loses that message
    /// for this group.
    #[default]
    OnReceive,
    /// Acknowledge once the subscriber reports it is done with the message.
    ///
    /// A crash before that point redelivers the message to the next
    /// subscription, so processing must tolerate replays. On offset-based
    /// brokers (Kafka, in-memory) acknowledging a later message in the same
    /// partition commits past every earlier one, so a message left
    /// unacknowledged is only redelivered if nothing after it in its
    /// partition was acknowledged first. Redis Streams tracks each entry and
    /// redelivers it regardless.
    AfterProcessing,
}

/// Where a consumer group with no committed cursor starts reading.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }
}

/// Advances a consumer group's cursor past one message.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn acknowledge(&self) -> Result<(), BrokerError>;
}

/// One message read from a topic.
pub struct Delivery {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<String>,
    payload: Vec<u8>,
    acknowledger: Option<Box<dyn Acknowledge>>,
}

impl Delivery {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Option<String>,
        payload: Vec<u8>,
        acknowledger: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key,
            payload,
            acknowledger: Some(acknowledger),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledger.is_none()
    }

    /// Acknowledge this message. Further calls are no-ops.
    pub async fn acknowledge(&mut self) -> Result<(), BrokerError> {
        match self.acknowledger.take() {
            Some(ack) => ack.acknowledge().await,
            None => Ok(()),
        }
    }

    /// Detach the acknowledger so it can outlive the payload.
    pub fn into_receipt(mut self) -> (Receipt, Option<String>, Vec<u8>) {
        let receipt = Receipt(self.acknowledger.take());
        (receipt, self.key, self.payload)
    }
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("key", &self.key)
            .field("payload_len", &self.payload.len())
            .field("acknowledged", &self.is_acknowledged())
            .finish()
    }
}

/// A pending acknowledgment, detached from its message.
///
/// Empty when the message was already acknowledged on receive.
#[derive(Default)]
pub struct Receipt(Option<Box<dyn Acknowledge>>);

impl Receipt {
    pub fn is_pending(&self) -> bool {
        self.0.is_some()
    }

    pub async fn acknowledge(self) -> Result<(), BrokerError> {
        match self.0 {
            Some(ack) => ack.acknowledge().await,
            None => Ok(()),
        }
    }
}

impl core::fmt::Debug for Receipt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Receipt").field(&self.is_pending()).finish()
    }
}

/// Unbounded, non-restartable sequence of deliveries from one subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Appends keyed messages to one topic.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    fn topic(&self) -> &str;

    /// Append one message and wait until the broker's acknowledgment policy
    /// is satisfied. Never retries internally.
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
}

/// Reads one topic under one consumer group.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    fn topic(&self) -> &str;

    fn group_id(&self) -> &str;

    /// Check that the broker is reachable, bounded by the consumer's timeout.
    ///
    /// Some clients retry connection errors forever once subscribed; probing
    /// first turns an unreachable broker into an error at subscribe time.
    async fn probe(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn subscribe(&self) -> Result<DeliveryStream, BrokerError>;
}

#[async_trait]
impl<P> MessageProducer for Arc<P>
where
    P: MessageProducer + ?Sized,
{
    fn topic(&self) -> &str {
        (**self).topic()
    }

    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        (**self).publish(key, payload).await
    }
}

#[async_trait]
impl<C> MessageConsumer for Arc<C>
where
    C: MessageConsumer + ?Sized,
{
    fn topic(&self) -> &str {
        (**self).topic()
    }

    fn group_id(&self) -> &str {
        (**self).group_id()
    }

    async fn probe(&self) -> Result<(), BrokerError> {
        (**self).probe().await
    }

    async fn subscribe(&self) -> Result<DeliveryStream, BrokerError> {
        (**self).subscribe().await
    }
}
