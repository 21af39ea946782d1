//! Command and payload consumers.
//!
//! Both consumers turn a broker subscription into a lazy stream. Per-message
//! failures (undecodable payloads, a failed acknowledgment) surface as `Err`
//! items and the stream keeps going; only establishing the subscription can
//! fail as a whole.

use futures_util::stream::{BoxStream, StreamExt};
use tracing::{debug, instrument, warn};

use petstore_core::Command;

use crate::broker::{AckPolicy, Delivery, MessageConsumer, Receipt};
use crate::codec;
use crate::error::{ConsumeError, SubscribeError};

/// Stream of decoded commands.
pub type CommandStream = BoxStream<'static, Result<Command, ConsumeError>>;

/// Stream of commands with their (possibly still pending) acknowledgment.
pub type ReceivedStream = BoxStream<'static, Result<ReceivedCommand, ConsumeError>>;

/// Stream of raw payloads.
pub type PayloadStream = BoxStream<'static, Result<String, ConsumeError>>;

/// A decoded command plus what is left to acknowledge for it.
#[derive(Debug)]
pub struct ReceivedCommand {
    pub command: Command,
    pub receipt: Receipt,
}

/// Subscribes to a topic and yields decoded commands.
#[derive(Debug, Clone)]
pub struct CommandsConsumer<C> {
    consumer: C,
    ack_policy: AckPolicy,
}

impl<C> CommandsConsumer<C> {
    pub fn new(consumer: C) -> Self {
        Self::with_ack_policy(consumer, AckPolicy::default())
    }

    pub fn with_ack_policy(consumer: C, ack_policy: AckPolicy) -> Self {
        Self {
            consumer,
            ack_policy,
        }
    }

    pub fn ack_policy(&self) -> AckPolicy {
        self.ack_policy
    }

    pub fn inner(&self) -> &C {
        &self.consumer
    }
}

impl<C> CommandsConsumer<C>
where
    C: MessageConsumer,
{
    /// Subscribe and yield commands, acknowledging each one on delivery.
    ///
    /// This always acknowledges on receive, whatever the configured policy;
    /// use [`receive`](Self::receive) to defer acknowledgment.
    pub async fn receive_commands(&self) -> Result<CommandStream, SubscribeError> {
        let stream = open(&self.consumer).await?;
        Ok(stream
            .then(|delivery| async move {
                let mut delivery = delivery.map_err(ConsumeError::Receive)?;
                acknowledge(&mut delivery).await?;
                decode(&delivery)
            })
            .boxed())
    }

    /// Subscribe and yield commands, acknowledging according to the policy.
    ///
    /// Under [`AckPolicy::AfterProcessing`] each command comes with a pending
    /// [`Receipt`] the caller settles when it is done. Undecodable messages
    /// are acknowledged straight away either way; they would never decode on
    /// redelivery.
    pub async fn receive(&self) -> Result<ReceivedStream, SubscribeError> {
        let stream = open(&self.consumer).await?;
        let policy = self.ack_policy;
        Ok(stream
            .then(move |delivery| async move {
                let mut delivery = delivery.map_err(ConsumeError::Receive)?;

                let command = match decode(&delivery) {
                    Ok(command) => command,
                    Err(err) => {
                        acknowledge(&mut delivery).await?;
                        return Err(err);
                    }
                };

                if policy == AckPolicy::OnReceive {
                    acknowledge(&mut delivery).await?;
                }

                let (receipt, _, _) = delivery.into_receipt();
                Ok(ReceivedCommand { command, receipt })
            })
            .boxed())
    }
}

/// Lower-level consumer: yields message bodies as strings, with no envelope.
#[derive(Debug, Clone)]
pub struct PayloadConsumer<C> {
    consumer: C,
}

impl<C> PayloadConsumer<C> {
    pub fn new(consumer: C) -> Self {
        Self { consumer }
    }
}

impl<C> PayloadConsumer<C>
where
    C: MessageConsumer,
{
    /// Subscribe and yield UTF-8 payloads, acknowledging each one on delivery.
    pub async fn receive_payloads(&self) -> Result<PayloadStream, SubscribeError> {
        let stream = open(&self.consumer).await?;
        Ok(stream
            .then(|delivery| async move {
                let mut delivery = delivery.map_err(ConsumeError::Receive)?;
                acknowledge(&mut delivery).await?;

                let (_, key, payload) = delivery.into_receipt();
                String::from_utf8(payload).map_err(|_| ConsumeError::NotUtf8 { key })
            })
            .boxed())
    }
}

#[instrument(
    skip(consumer),
    fields(topic = %consumer.topic(), group_id = %consumer.group_id()),
    err
)]
async fn open<C: MessageConsumer>(consumer: &C) -> Result<crate::broker::DeliveryStream, SubscribeError> {
    consumer
        .probe()
        .await
        .map_err(|source| SubscribeError::Connecting {
            topic: consumer.topic().to_string(),
            source,
        })?;

    let stream = consumer
        .subscribe()
        .await
        .map_err(|source| SubscribeError::Subscribe {
            topic: consumer.topic().to_string(),
            source,
        })?;

    debug!("subscribed");
    Ok(stream)
}

async fn acknowledge(delivery: &mut Delivery) -> Result<(), ConsumeError> {
    delivery.acknowledge().await.map_err(|source| {
        warn!(key = ?delivery.key(), error = %source, "failed to acknowledge message");
        ConsumeError::Acknowledge {
            key: delivery.key().map(str::to_owned),
            source,
        }
    })
}

fn decode(delivery: &Delivery) -> Result<Command, ConsumeError> {
    codec::decode(delivery.payload()).map_err(|source| ConsumeError::Decode {
        key: delivery.key().map(str::to_owned),
        source,
    })
}
