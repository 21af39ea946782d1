use tracing::{debug, instrument};

use petstore_core::{Command, CommandId};

use crate::broker::MessageProducer;
use crate::codec;
use crate::error::PublishFailure;

/// Publishes commands to the configured topic.
///
/// Each command is keyed by its id, so the broker assigns all copies of one
/// command (including caller retries) to the same partition. At-least-once
/// from the caller's perspective: a successful `send` appends exactly one
/// message, and nothing here deduplicates retried calls.
#[derive(Debug, Clone)]
pub struct CommandsProducer<P> {
    producer: P,
}

impl<P> CommandsProducer<P> {
    pub fn new(producer: P) -> Self {
        Self { producer }
    }

    pub fn inner(&self) -> &P {
        &self.producer
    }
}

impl<P> CommandsProducer<P>
where
    P: MessageProducer,
{
    /// Encode and publish `command`; returns its id once the broker accepted it.
    #[instrument(
        skip(self, command),
        fields(
            topic = %self.producer.topic(),
            command_id = %command.id(),
            command_name = %command.name()
        ),
        err
    )]
    pub async fn send(&self, command: &Command) -> Result<CommandId, PublishFailure> {
        let id = command.id();
        let payload = codec::encode(command).map_err(|source| PublishFailure::Encode {
            command_id: id,
            source,
        })?;

        self.producer
            .publish(&id.to_string(), payload)
            .await
            .map_err(|source| PublishFailure::Broker {
                command_id: id,
                topic: self.producer.topic().to_string(),
                source,
            })?;

        debug!("command published");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use petstore_core::CommandBuilder;

    use crate::in_memory_broker::InMemoryBroker;

    #[tokio::test]
    async fn send_appends_one_message_keyed_by_id() {
        let broker = InMemoryBroker::new();
        let producer = CommandsProducer::new(broker.producer("commands"));

        let cmd = CommandBuilder::new("pet_create").value("name", "x").build();
        let id = producer.send(&cmd).await.unwrap();

        assert_eq!(id, cmd.id());
        let records = broker.records("commands");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key.as_deref(), Some(id.to_string().as_str()));
        assert_eq!(codec::decode(&records[0].payload).unwrap(), cmd);
    }

    #[tokio::test]
    async fn unavailable_broker_is_a_publish_failure_with_no_effect() {
        let broker = InMemoryBroker::new();
        let producer = CommandsProducer::new(broker.producer("commands"));
        broker.set_available(false);

        let cmd = CommandBuilder::new("pet_create").build();
        let err = producer.send(&cmd).await.unwrap_err();

        assert!(matches!(err, PublishFailure::Broker { .. }));
        assert_eq!(err.command_id(), cmd.id());
        assert!(broker.records("commands").is_empty());
    }

    #[tokio::test]
    async fn unencodable_command_is_refused_before_publishing() {
        let broker = InMemoryBroker::new();
        let producer = CommandsProducer::new(broker.producer("commands"));

        let cmd = CommandBuilder::new("pet_create").value("weight", f64::INFINITY).build();
        let err = producer.send(&cmd).await.unwrap_err();

        assert!(matches!(
            err,
            PublishFailure::Encode {
                source: crate::error::CodecError::NonFiniteFloat { .. },
                ..
            }
        ));
        assert!(broker.records("commands").is_empty());
    }

    #[tokio::test]
    async fn retried_sends_are_not_deduplicated() {
        let broker = InMemoryBroker::new();
        let producer = CommandsProducer::new(broker.producer("commands"));

        let cmd = CommandBuilder::new("pet_create").build();
        producer.send(&cmd).await.unwrap();
        producer.send(&cmd).await.unwrap();

        let records = broker.records("commands");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].partition, records[1].partition);
    }
}
