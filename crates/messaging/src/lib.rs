//! Command transport: wire codec, broker seam, producer and consumers.
//!
//! Nothing in here interprets a command; that happens in the dispatcher and
//! processors of `petstore-infra`.

pub mod broker;
pub mod codec;
pub mod consumer;
pub mod error;
pub mod in_memory_broker;
pub mod producer;

pub use broker::{
    AckPolicy, Acknowledge, Delivery, DeliveryStream, MessageConsumer, MessageProducer,
    OffsetReset, Receipt,
};
pub use consumer::{
    CommandStream, CommandsConsumer, PayloadConsumer, PayloadStream, ReceivedCommand,
    ReceivedStream,
};
pub use error::{BrokerError, CodecError, ConsumeError, PublishFailure, SubscribeError};
pub use in_memory_broker::{InMemoryBroker, InMemoryConsumer, InMemoryProducer, Record};
pub use producer::CommandsProducer;
