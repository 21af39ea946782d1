//! Command dispatch (routing a consumed command to its processor).
//!
//! ## Dispatch Flow
//!
//! ```text
//! Command
//!   ↓
//! 1. Lookup processor by command name      → ProcessorNotFound
//!   ↓
//! 2. Validate attributes (shape only)      → Validation
//!   ↓
//! 3. Process (transactional write)         → Processing(ProcessingFailure)
//! ```
//!
//! Steps 1 and 2 are terminal for the command: redelivering it cannot make it
//! succeed. Step 3 may be transient (store unavailable) or permanent (the pet
//! already exists); the failure carries its cause so callers can tell.
//!
//! The registry is built once at startup and never mutated afterwards, so a
//! dispatcher can be cloned into any number of concurrent workers.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};

use petstore_core::{Command, CommandId};

use crate::processor::{CommandProcessor, ProcessingFailure};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no processor registered for {command_name} (command {command_id})")]
    ProcessorNotFound {
        command_id: CommandId,
        command_name: String,
    },

    #[error("{command_name} command {command_id} is missing required attributes")]
    Validation {
        command_id: CommandId,
        command_name: String,
    },

    #[error(transparent)]
    Processing(#[from] ProcessingFailure),
}

impl DispatchError {
    /// Unknown or invalid commands; retrying them cannot help.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing(_))
    }

    pub fn command_id(&self) -> CommandId {
        match self {
            Self::ProcessorNotFound { command_id, .. } | Self::Validation { command_id, .. } => {
                *command_id
            }
            Self::Processing(failure) => failure.command_id,
        }
    }
}

/// Two processors claimed the same command name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("more than one processor registered for {0}")]
pub struct DuplicateProcessor(pub String);

/// Read-only mapping from command name to processor.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn CommandProcessor>>,
}

impl ProcessorRegistry {
    pub fn new<I>(processors: I) -> Result<Self, DuplicateProcessor>
    where
        I: IntoIterator<Item = Arc<dyn CommandProcessor>>,
    {
        let mut map: HashMap<String, Arc<dyn CommandProcessor>> = HashMap::new();
        for processor in processors {
            let name = processor.name().to_string();
            if map.contains_key(&name) {
                return Err(DuplicateProcessor(name));
            }
            map.insert(name, processor);
        }
        Ok(Self { processors: map })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CommandProcessor>> {
        self.processors.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.processors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl core::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("ProcessorRegistry")
            .field("processors", &names)
            .finish()
    }
}

/// Routes commands to their processors. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    registry: Arc<ProcessorRegistry>,
}

impl CommandDispatcher {
    pub fn new(registry: ProcessorRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    /// Lookup → validate → process. `process` is never called for a command
    /// that fails validation.
    #[instrument(
        skip(self, command),
        fields(command_id = %command.id(), command_name = %command.name()),
        err
    )]
    pub async fn dispatch(&self, command: &Command) -> Result<(), DispatchError> {
        let processor =
            self.registry
                .get(command.name())
                .ok_or_else(|| DispatchError::ProcessorNotFound {
                    command_id: command.id(),
                    command_name: command.name().to_string(),
                })?;

        if !processor.validate(command) {
            return Err(DispatchError::Validation {
                command_id: command.id(),
                command_name: command.name().to_string(),
            });
        }

        processor.process(command).await?;
        debug!("command processed");
        Ok(())
    }
}
