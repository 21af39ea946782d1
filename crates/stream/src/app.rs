//! Runtime wiring: config → broker consumer → processor registry → sink.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use petstore_infra::broker::{BrokerFactory, BrokerSetupError};
use petstore_infra::pet_store::{InMemoryPetStore, PostgresPetStore, StoreError};
use petstore_infra::{
    BrokerKind, CommandDispatcher, CommandProcessor, CommandSink, ConsumerConfig, CreatePetProcessor, DuplicateProcessor,
    ProcessorRegistry, SinkHandle, StoreConfig, StreamConfig,
};
use petstore_messaging::CommandsConsumer;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("no commands consumer configured (set PETSTORE_COMMANDS_CONSUMER_BOOTSTRAP_SERVER)")]
    ConsumerDisabled,

    #[error(transparent)]
    Broker(#[from] BrokerSetupError),

    #[error("pet store: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] DuplicateProcessor),
}

/// The processors this service runs, backed by the configured store.
pub async fn build_processors(store: &StoreConfig) -> Result<Vec<Arc<dyn CommandProcessor>>, StartupError> {
    let create_pet: Arc<dyn CommandProcessor> = match &store.database_url {
        Some(url) => {
            let store = PostgresPetStore::connect(url, store.max_connections).await?;
            info!("using Postgres pet store");
            Arc::new(CreatePetProcessor::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; pets are kept in memory and lost on exit");
            Arc::new(CreatePetProcessor::new(InMemoryPetStore::new()))
        }
    };

    Ok(vec![create_pet])
}

/// Subscribe and start dispatching in the background.
pub fn start(
    config: &ConsumerConfig,
    factory: &BrokerFactory,
    processors: Vec<Arc<dyn CommandProcessor>>,
) -> Result<SinkHandle, StartupError> {
    let registry = ProcessorRegistry::new(processors)?;
    info!(processors = ?registry.names().collect::<Vec<_>>(), broker = factory.kind().as_str(), "starting command sink");

    let consumer = CommandsConsumer::with_ack_policy(factory.consumer(config)?, config.ack_policy);
    Ok(CommandSink::new(consumer, CommandDispatcher::new(registry), config.workers).spawn())
}

/// Everything [`start`] needs, from a loaded [`StreamConfig`].
pub async fn start_from_config(config: &StreamConfig) -> Result<SinkHandle, StartupError> {
    let consumer = config.consumer.as_ref().ok_or(StartupError::ConsumerDisabled)?;
    if config.broker == BrokerKind::Memory {
        warn!("using the in-memory broker; only this process can publish to it");
    }
    let factory = BrokerFactory::new(config.broker);
    let processors = build_processors(&config.store).await?;
    start(consumer, &factory, processors)
}
