//! Command sink: consumer → dispatcher, as a background task.
//!
//! - Subscribes through a [`CommandsConsumer`] and hands each command to one
//!   of N dispatch workers, chosen by hashing the command id. Commands with the
//!   same id (the message key) always go to the same worker, so per-key order
//!   survives; distinct keys are dispatched concurrently.
//! - Per-message errors are logged and counted; they never end the loop.
//! - Under [`AckPolicy::AfterProcessing`](petstore_messaging::AckPolicy) a
//!   message is acknowledged once dispatch succeeded or was rejected as
//!   unknown/invalid. Processing failures stay unacknowledged, but on
//!   offset-based brokers a later acknowledged message in the same partition
//!   still commits past them.
//! - Shutdown stops reading, drops the subscription, and lets the workers
//!   finish what they already received.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use petstore_core::CommandId;
use petstore_messaging::{CommandsConsumer, ConsumeError, MessageConsumer, ReceivedCommand, SubscribeError};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};

const WORKER_QUEUE: usize = 64;

/// Per-message outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub processed: u64,
    /// Unknown command name or failed validation.
    pub rejected: u64,
    /// Processor errors.
    pub failed: u64,
    /// Messages that could not be received or decoded.
    pub decode_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    decode_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SinkStats {
        SinkStats {
            processed: self.processed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),

    #[error("sink task failed: {0}")]
    Task(#[from] JoinError),
}

pub struct CommandSink<C> {
    consumer: CommandsConsumer<C>,
    dispatcher: CommandDispatcher,
    workers: usize,
}

impl<C> CommandSink<C>
where
    C: MessageConsumer + 'static,
{
    pub fn new(consumer: CommandsConsumer<C>, dispatcher: CommandDispatcher, workers: usize) -> Self {
        Self {
            consumer,
            dispatcher,
            workers: workers.max(1),
        }
    }

    /// Start the sink on the current tokio runtime.
    pub fn spawn(self) -> SinkHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let counters = Arc::new(Counters::default());
        let join = tokio::spawn(self.run(shutdown_rx, counters.clone()));

        SinkHandle {
            shutdown: Some(shutdown_tx),
            join,
            counters,
        }
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>, counters: Arc<Counters>) -> Result<SinkStats, SinkError> {
        let mut stream = self.consumer.receive().await?;
        info!(
            topic = %self.consumer.inner().topic(),
            group_id = %self.consumer.inner().group_id(),
            workers = self.workers,
            ack_policy = ?self.consumer.ack_policy(),
            "command sink started"
        );

        let mut queues = Vec::with_capacity(self.workers);
        let mut workers = Vec::with_capacity(self.workers);
        for index in 0..self.workers {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE);
            queues.push(tx);
            workers.push(tokio::spawn(worker(index, rx, self.dispatcher.clone(), counters.clone())));
        }

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("shutdown requested");
                    break;
                }
                next = stream.next() => match next {
                    None => {
                        debug!("subscription ended");
                        break;
                    }
                    Some(Ok(received)) => {
                        let index = shard(received.command.id(), queues.len());
                        // A full queue must not hold up shutdown.
                        tokio::select! {
                            sent = queues[index].send(received) => {
                                if sent.is_err() {
                                    warn!(worker = index, "dispatch worker is gone; stopping");
                                    break;
                                }
                            }
                            _ = &mut shutdown => {
                                debug!(worker = index, "shutdown requested while the worker queue was full");
                                break;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                        log_consume_error(&err);
                    }
                },
            }
        }

        // Release the subscription before draining the workers.
        drop(stream);
        drop(queues);
        for handle in workers {
            handle.await?;
        }

        let stats = counters.snapshot();
        info!(?stats, "command sink stopped");
        Ok(stats)
    }
}

/// Handle to control and join a running sink.
#[derive(Debug)]
pub struct SinkHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<SinkStats, SinkError>>,
    counters: Arc<Counters>,
}

impl SinkHandle {
    /// Counts so far.
    pub fn stats(&self) -> SinkStats {
        self.counters.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request graceful shutdown and wait for the sink to stop.
    pub async fn shutdown(mut self) -> Result<SinkStats, SinkError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.join().await
    }

    /// Wait for the sink to stop on its own (subscription ended or failed).
    pub async fn join(self) -> Result<SinkStats, SinkError> {
        self.join.await?
    }

    /// Run until `signal` resolves, then shut down gracefully. Returns early
    /// if the sink stops on its own first.
    pub async fn run_until<F>(mut self, signal: F) -> Result<SinkStats, SinkError>
    where
        F: Future<Output = ()>,
    {
        let stopped = tokio::select! {
            res = &mut self.join => Some(res),
            _ = signal => None,
        };
        match stopped {
            Some(res) => res?,
            None => self.shutdown().await,
        }
    }
}

async fn worker(
    index: usize,
    mut rx: mpsc::Receiver<ReceivedCommand>,
    dispatcher: CommandDispatcher,
    counters: Arc<Counters>,
) {
    while let Some(ReceivedCommand { command, receipt }) = rx.recv().await {
        let outcome = dispatcher.dispatch(&command).await;

        let settle = match &outcome {
            Ok(()) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) if err.is_terminal() => {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(worker = index, command_id = %command.id(), kind = kind(err), error = %err, "command rejected");
                true
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker = index, command_id = %command.id(), kind = kind(err), error = %err, "command processing failed");
                false
            }
        };

        if settle {
            if let Err(err) = receipt.acknowledge().await {
                warn!(worker = index, command_id = %command.id(), error = %err, "failed to acknowledge command");
            }
        }
    }
}

fn kind(err: &DispatchError) -> &'static str {
    match err {
        DispatchError::ProcessorNotFound { .. } => "processor_not_found",
        DispatchError::Validation { .. } => "validation",
        DispatchError::Processing(_) => "processing",
    }
}

fn log_consume_error(err: &ConsumeError) {
    match err {
        ConsumeError::Decode { key, source } => {
            warn!(key = ?key, error = %source, "dropping undecodable message")
        }
        other => warn!(error = %other, "failed to consume message"),
    }
}

fn shard(id: CommandId, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use petstore_core::pet::attr;
    use petstore_core::{CommandBuilder, CreatePet, PET_CREATE};
    use petstore_messaging::{AckPolicy, CommandsProducer, InMemoryBroker, MessageProducer, OffsetReset};

    use crate::command_dispatcher::ProcessorRegistry;
    use crate::pet_store::{InMemoryPetStore, ReferenceKind, WriteStep};
    use crate::processor::{CommandProcessor, CreatePetProcessor};

    const TOPIC: &str = "pet-commands";
    const GROUP: &str = "pet-stream";

    fn dispatcher(store: &InMemoryPetStore) -> CommandDispatcher {
        let registry = ProcessorRegistry::new([
            Arc::new(CreatePetProcessor::new(store.clone())) as Arc<dyn CommandProcessor>
        ])
        .unwrap();
        CommandDispatcher::new(registry)
    }

    fn pet(name: &str) -> petstore_core::Command {
        CreatePet {
            name: name.into(),
            dob: chrono::Utc::now(),
            category: "cat".into(),
            breed: "siamese".into(),
            vaccines: vec!["rabies".into()],
            tags: None,
        }
        .into_command()
    }

    async fn wait_for(handle: &SinkHandle, done: impl Fn(SinkStats) -> bool) -> SinkStats {
        for _ in 0..200 {
            let stats = handle.stats();
            if done(stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sink did not reach the expected state: {:?}", handle.stats());
    }

    #[tokio::test]
    async fn errors_are_isolated_and_the_sink_keeps_going() {
        let broker = InMemoryBroker::new();
        let store = InMemoryPetStore::new();
        let producer = CommandsProducer::new(broker.producer(TOPIC));

        producer.send(&pet("first")).await.unwrap();
        producer
            .send(&CommandBuilder::new("invalid_command").build())
            .await
            .unwrap();
        producer
            .send(&CommandBuilder::new(PET_CREATE).value(attr::NAME, "no vaccines").build())
            .await
            .unwrap();
        broker.producer(TOPIC).publish("junk", b"{".to_vec()).await.unwrap();
        producer.send(&pet("last")).await.unwrap();

        let consumer = CommandsConsumer::new(broker.consumer(TOPIC, GROUP, OffsetReset::Earliest));
        let handle = CommandSink::new(consumer, dispatcher(&store), 3).spawn();

        wait_for(&handle, |s| s.processed == 2 && s.rejected == 2 && s.decode_errors == 1).await;
        let stats = handle.shutdown().await.unwrap();

        assert_eq!(stats.failed, 0);
        assert_eq!(store.count_pets(), 2);
        assert_eq!(store.count_references(ReferenceKind::Category), 1);
    }

    #[tokio::test]
    async fn processing_failures_stay_unacknowledged_after_processing() {
        let broker = InMemoryBroker::with_partitions(1);
        let store = InMemoryPetStore::new();
        store.fail_on(WriteStep::InsertPet);

        let producer = CommandsProducer::new(broker.producer(TOPIC));
        producer.send(&pet("a")).await.unwrap();

        let consumer = CommandsConsumer::with_ack_policy(
            broker.consumer(TOPIC, GROUP, OffsetReset::Earliest),
            AckPolicy::AfterProcessing,
        );
        let handle = CommandSink::new(consumer, dispatcher(&store), 1).spawn();
        wait_for(&handle, |s| s.failed == 1).await;
        handle.shutdown().await.unwrap();

        assert_eq!(broker.lag(TOPIC, GROUP), 1);

        // Once the store recovers, a new subscription picks the command up again.
        store.clear_failures();
        let consumer = CommandsConsumer::with_ack_policy(
            broker.consumer(TOPIC, GROUP, OffsetReset::Earliest),
            AckPolicy::AfterProcessing,
        );
        let handle = CommandSink::new(consumer, dispatcher(&store), 1).spawn();
        wait_for(&handle, |s| s.processed == 1).await;
        handle.shutdown().await.unwrap();

        assert_eq!(broker.lag(TOPIC, GROUP), 0);
        assert_eq!(store.count_pets(), 1);
    }

    #[tokio::test]
    async fn later_ack_in_a_partition_commits_past_an_earlier_failure() {
        let broker = InMemoryBroker::with_partitions(1);
        let store = InMemoryPetStore::new();
        let producer = CommandsProducer::new(broker.producer(TOPIC));

        let bad_dob = CommandBuilder::new(PET_CREATE)
            .value(attr::NAME, "a")
            .value(attr::DOB, "not a date")
            .value(attr::CATEGORY, "cat")
            .value(attr::BREED, "siamese")
            .values(attr::VACCINES, vec!["rabies"])
            .build();
        producer.send(&bad_dob).await.unwrap();
        producer.send(&pet("b")).await.unwrap();

        let consumer = CommandsConsumer::with_ack_policy(
            broker.consumer(TOPIC, GROUP, OffsetReset::Earliest),
            AckPolicy::AfterProcessing,
        );
        let handle = CommandSink::new(consumer, dispatcher(&store), 1).spawn();
        wait_for(&handle, |s| s.failed == 1 && s.processed == 1).await;
        handle.shutdown().await.unwrap();

        assert_eq!(broker.lag(TOPIC, GROUP), 0);
        assert_eq!(store.count_pets(), 1);
    }

    #[tokio::test]
    async fn on_receive_policy_acknowledges_even_failed_commands() {
        let broker = InMemoryBroker::new();
        let store = InMemoryPetStore::new();
        store.fail_on(WriteStep::Commit);

        CommandsProducer::new(broker.producer(TOPIC))
            .send(&pet("a"))
            .await
            .unwrap();

        let consumer = CommandsConsumer::new(broker.consumer(TOPIC, GROUP, OffsetReset::Earliest));
        let handle = CommandSink::new(consumer, dispatcher(&store), 2).spawn();
        wait_for(&handle, |s| s.failed == 1).await;
        handle.shutdown().await.unwrap();

        assert_eq!(broker.lag(TOPIC, GROUP), 0);
        assert_eq!(store.count_pets(), 0);
    }

    #[tokio::test]
    async fn unreachable_broker_fails_the_sink() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);

        let consumer = CommandsConsumer::new(broker.consumer(TOPIC, GROUP, OffsetReset::Earliest));
        let handle = CommandSink::new(consumer, dispatcher(&InMemoryPetStore::new()), 1).spawn();

        assert!(matches!(
            handle.join().await,
            Err(SinkError::Subscribe(SubscribeError::Connecting { .. }))
        ));
    }

    #[tokio::test]
    async fn closing_the_broker_stops_the_sink() {
        let broker = InMemoryBroker::new();
        let consumer = CommandsConsumer::new(broker.consumer(TOPIC, GROUP, OffsetReset::Earliest));
        let handle = CommandSink::new(consumer, dispatcher(&InMemoryPetStore::new()), 1).spawn();

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.close();

        assert_eq!(handle.join().await.unwrap(), SinkStats::default());
    }

    #[tokio::test]
    async fn run_until_shuts_down_when_the_signal_fires() {
        let broker = InMemoryBroker::new();
        let store = InMemoryPetStore::new();
        CommandsProducer::new(broker.producer(TOPIC))
            .send(&pet("a"))
            .await
            .unwrap();

        let consumer = CommandsConsumer::new(broker.consumer(TOPIC, GROUP, OffsetReset::Earliest));
        let handle = CommandSink::new(consumer, dispatcher(&store), 1).spawn();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let running = tokio::spawn(handle.run_until(async move {
            let _ = stop_rx.await;
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(()).unwrap();

        let stats = running.await.unwrap().unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(store.count_pets(), 1);
    }

    /// Holds every command until the gate opens.
    struct Gated {
        gate: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait::async_trait]
    impl CommandProcessor for Gated {
        fn name(&self) -> &str {
            "gated"
        }

        fn validate(&self, _: &petstore_core::Command) -> bool {
            true
        }

        async fn process(&self, _: &petstore_core::Command) -> Result<(), crate::processor::ProcessingFailure> {
            let _permit = self.gate.acquire().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_is_seen_while_a_worker_queue_is_full() {
        let broker = InMemoryBroker::with_partitions(1);
        let producer = CommandsProducer::new(broker.producer(TOPIC));
        let total = WORKER_QUEUE + 2;
        for _ in 0..total {
            producer.send(&CommandBuilder::new("gated").build()).await.unwrap();
        }

        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let registry = ProcessorRegistry::new([
            Arc::new(Gated { gate: gate.clone() }) as Arc<dyn CommandProcessor>
        ])
        .unwrap();
        let consumer = CommandsConsumer::with_ack_policy(
            broker.consumer(TOPIC, GROUP, OffsetReset::Earliest),
            AckPolicy::AfterProcessing,
        );
        let handle = CommandSink::new(consumer, CommandDispatcher::new(registry), 1).spawn();

        // One command in the worker, a full queue, one more waiting for room.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stopping = tokio::spawn(handle.shutdown());
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.add_permits(1);

        let stats = stopping.await.unwrap().unwrap();
        assert_eq!(stats.processed, (WORKER_QUEUE + 1) as u64);
        assert_eq!(broker.lag(TOPIC, GROUP), 1);
    }

    #[test]
    fn same_id_always_lands_on_the_same_worker() {
        let id = CommandId::new();
        let first = shard(id, 7);
        assert!((0..10).all(|_| shard(id, 7) == first));
        assert!(first < 7);
    }
}
