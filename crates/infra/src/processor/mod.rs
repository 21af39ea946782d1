//! Command processors: one per command name.
//!
//! A processor is registered once at startup (see
//! [`ProcessorRegistry`](crate::command_dispatcher::ProcessorRegistry)); the
//! dispatcher only ever calls `process` after `validate` returned `true`.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use petstore_core::{Command, CommandId};

pub mod create_pet;

pub use create_pet::CreatePetProcessor;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A processor failed after accepting the command.
///
/// Carries the originating command for diagnostics and the step that failed.
/// Whatever was written before the failure has been rolled back.
#[derive(Debug, Error)]
#[error("processing {command_name} command {command_id} failed at {stage}: {source}")]
pub struct ProcessingFailure {
    pub command_id: CommandId,
    pub command_name: String,
    pub stage: &'static str,
    #[source]
    pub source: BoxError,
}

impl ProcessingFailure {
    pub fn new(command: &Command, stage: &'static str, source: impl Into<BoxError>) -> Self {
        Self {
            command_id: command.id(),
            command_name: command.name().to_string(),
            stage,
            source: source.into(),
        }
    }
}

#[async_trait]
pub trait CommandProcessor: Send + Sync {
    /// The command name this processor handles.
    fn name(&self) -> &str;

    /// Shape check: are the attributes this processor needs all present?
    fn validate(&self, command: &Command) -> bool;

    async fn process(&self, command: &Command) -> Result<(), ProcessingFailure>;
}

#[async_trait]
impl<P> CommandProcessor for Arc<P>
where
    P: CommandProcessor + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn validate(&self, command: &Command) -> bool {
        (**self).validate(command)
    }

    async fn process(&self, command: &Command) -> Result<(), ProcessingFailure> {
        (**self).process(command).await
    }
}
