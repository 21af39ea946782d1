//! Broker transports for the commands topic.
//!
//! The transport seam itself lives in `petstore-messaging` as pure mechanics.
//! This module provides the networked implementations and picks one from
//! configuration.

use std::sync::Arc;

use thiserror::Error;

use petstore_messaging::{BrokerError, InMemoryBroker, MessageConsumer, MessageProducer};

use crate::config::{BrokerKind, ConsumerConfig, ProducerConfig};

#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "kafka")]
pub use kafka::{KafkaConsumer, KafkaProducer};
#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsConsumer, RedisStreamsProducer};

#[derive(Debug, Error)]
pub enum BrokerSetupError {
    #[error("{0} support is not compiled in (enable the `{0}` feature)")]
    NotCompiled(&'static str),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Builds producers and consumers for the configured transport.
///
/// `Memory` hands out handles on one shared [`InMemoryBroker`], so a producer
/// and a consumer from the same factory see each other's messages.
#[derive(Debug, Clone)]
pub struct BrokerFactory {
    kind: BrokerKind,
    memory: InMemoryBroker,
}

impl BrokerFactory {
    pub fn new(kind: BrokerKind) -> Self {
        Self {
            kind,
            memory: InMemoryBroker::new(),
        }
    }

    pub fn kind(&self) -> BrokerKind {
        self.kind
    }

    /// The broker backing [`BrokerKind::Memory`].
    pub fn memory(&self) -> &InMemoryBroker {
        &self.memory
    }

    pub fn producer(&self, config: &ProducerConfig) -> Result<Arc<dyn MessageProducer>, BrokerSetupError> {
        match self.kind {
            BrokerKind::Memory => Ok(Arc::new(self.memory.producer(config.topic.clone()))),
            #[cfg(feature = "kafka")]
            BrokerKind::Kafka => Ok(Arc::new(KafkaProducer::new(config)?)),
            #[cfg(feature = "redis")]
            BrokerKind::Redis => Ok(Arc::new(RedisStreamsProducer::new(config)?)),
            #[allow(unreachable_patterns)]
            other => Err(BrokerSetupError::NotCompiled(other.as_str())),
        }
    }

    pub fn consumer(&self, config: &ConsumerConfig) -> Result<Arc<dyn MessageConsumer>, BrokerSetupError> {
        match self.kind {
            BrokerKind::Memory => Ok(Arc::new(self.memory.consumer(
                config.topic.clone(),
                config.group_id.clone(),
                config.offset_reset,
            ))),
            #[cfg(feature = "kafka")]
            BrokerKind::Kafka => Ok(Arc::new(KafkaConsumer::new(config))),
            #[cfg(feature = "redis")]
            BrokerKind::Redis => Ok(Arc::new(RedisStreamsConsumer::new(config)?)),
            #[allow(unreachable_patterns)]
            other => Err(BrokerSetupError::NotCompiled(other.as_str())),
        }
    }
}
