//! Messaging error model.

use thiserror::Error;

use petstore_core::CommandId;

/// A command could not be mapped to or from its wire form.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode command: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode command: {0}")]
    Decode(#[source] serde_json::Error),

    /// JSON has no NaN or infinity; such a value would be written as `null`.
    #[error("attribute '{attribute}' holds a non-finite float")]
    NonFiniteFloat { attribute: String },
}

/// Transport-level failure reported by a broker backend.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker publish error: {0}")]
    Publish(String),

    #[error("broker subscribe error: {0}")]
    Subscribe(String),

    #[error("broker acknowledge error: {0}")]
    Acknowledge(String),

    #[error("broker receive error: {0}")]
    Receive(String),

    #[error("broker operation timed out: {0}")]
    Timeout(String),

    #[error("broker is closed")]
    Closed,
}

/// A command was not durably accepted by the broker.
///
/// No partial effect: nothing is appended for this call. Retrying is the
/// caller's decision; a retry that follows an ambiguous failure may append a
/// second copy.
#[derive(Debug, Error)]
pub enum PublishFailure {
    #[error("failed to encode command {command_id}: {source}")]
    Encode {
        command_id: CommandId,
        #[source]
        source: CodecError,
    },

    #[error("failed to publish command {command_id} to '{topic}': {source}")]
    Broker {
        command_id: CommandId,
        topic: String,
        #[source]
        source: BrokerError,
    },
}

impl PublishFailure {
    pub fn command_id(&self) -> CommandId {
        match self {
            Self::Encode { command_id, .. } | Self::Broker { command_id, .. } => *command_id,
        }
    }
}

/// The subscription could not be established.
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// The broker did not answer the connection probe in time.
    #[error("could not connect to broker for topic '{topic}': {source}")]
    Connecting {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("could not subscribe to topic '{topic}': {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },
}

/// A single message could not be delivered as a command.
///
/// Scoped to that one message: the stream keeps going.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("failed to receive message: {0}")]
    Receive(#[source] BrokerError),

    #[error("failed to decode message with key {key:?}: {source}")]
    Decode {
        key: Option<String>,
        #[source]
        source: CodecError,
    },

    #[error("message with key {key:?} is not valid UTF-8")]
    NotUtf8 { key: Option<String> },

    #[error("failed to acknowledge message with key {key:?}: {source}")]
    Acknowledge {
        key: Option<String>,
        #[source]
        source: BrokerError,
    },
}
