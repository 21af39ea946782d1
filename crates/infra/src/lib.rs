//! Infrastructure layer: configuration, dispatch, processors, storage and
//! broker transports for the command pipeline.

pub mod broker;
pub mod command_dispatcher;
pub mod config;
pub mod pet_store;
pub mod processor;
pub mod sink;

#[cfg(test)]
mod integration_tests;

pub use command_dispatcher::{CommandDispatcher, DispatchError, DuplicateProcessor, ProcessorRegistry};
pub use config::{BrokerKind, ConfigError, ConsumerConfig, ProducerConfig, StoreConfig, StreamConfig};
pub use processor::{CommandProcessor, CreatePetProcessor, ProcessingFailure};
pub use sink::{CommandSink, SinkError, SinkHandle, SinkStats};
