//! Integration tests for the full command pipeline.
//!
//! Tests: CreatePet → Producer → Broker → Consumer → Sink → Dispatcher → PetStore
//!
//! Verifies:
//! - A well-formed create command lands as one pet with its references and links
//! - Reference rows are shared between commands
//! - Bad commands are isolated from good ones

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use petstore_core::{Command, CommandBuilder, CreatePet};
    use petstore_messaging::{CommandsConsumer, CommandsProducer, InMemoryBroker, InMemoryProducer, OffsetReset};

    use crate::command_dispatcher::{CommandDispatcher, ProcessorRegistry};
    use crate::pet_store::{InMemoryPetStore, ReferenceKind};
    use crate::processor::{CommandProcessor, CreatePetProcessor};
    use crate::sink::{CommandSink, SinkHandle, SinkStats};

    const TOPIC: &str = "pet-commands";

    fn setup(workers: usize) -> (CommandsProducer<InMemoryProducer>, InMemoryPetStore, SinkHandle) {
        let broker = InMemoryBroker::with_partitions(4);
        let store = InMemoryPetStore::new();

        let registry = ProcessorRegistry::new([
            Arc::new(CreatePetProcessor::new(store.clone())) as Arc<dyn CommandProcessor>
        ])
        .unwrap();
        let consumer = CommandsConsumer::new(broker.consumer(TOPIC, "pet-stream", OffsetReset::Earliest));
        let handle = CommandSink::new(consumer, CommandDispatcher::new(registry), workers).spawn();

        (CommandsProducer::new(broker.producer(TOPIC)), store, handle)
    }

    fn create(name: &str, category: &str, tags: Option<Vec<&str>>) -> Command {
        CreatePet {
            name: name.into(),
            dob: Utc.with_ymd_and_hms(2019, 1, 2, 3, 4, 5).unwrap(),
            category: category.into(),
            breed: "breed".into(),
            vaccines: vec!["vaccine1".into(), "vaccine2".into()],
            tags: tags.map(|t| t.into_iter().map(String::from).collect()),
        }
        .into_command()
    }

    async fn settle(handle: &SinkHandle, expected: u64) -> SinkStats {
        for _ in 0..300 {
            let s = handle.stats();
            if s.processed + s.rejected + s.failed + s.decode_errors >= expected {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pipeline did not settle: {:?}", handle.stats());
    }

    #[tokio::test]
    async fn create_pet_flows_end_to_end() {
        let (producer, store, handle) = setup(2);
        let cmd = create("name", "category", Some(vec!["tag1", "tag2", "tag3"]));

        let id = producer.send(&cmd).await.unwrap();
        settle(&handle, 1).await;
        let stats = handle.shutdown().await.unwrap();

        assert_eq!(stats.processed, 1);
        let pet_id = id.to_string();
        assert!(store.pet(&pet_id).is_some());
        assert_eq!(store.linked_names(&pet_id, ReferenceKind::Vaccine), vec!["vaccine1", "vaccine2"]);
        assert_eq!(store.linked_names(&pet_id, ReferenceKind::Tag), vec!["tag1", "tag2", "tag3"]);
        assert_eq!(store.count_references(ReferenceKind::Category), 1);
        assert_eq!(store.count_references(ReferenceKind::Breed), 1);
    }

    #[tokio::test]
    async fn many_commands_share_reference_rows() {
        let (producer, store, handle) = setup(4);

        for n in 0..20 {
            let category = if n % 2 == 0 { "dog" } else { "cat" };
            producer
                .send(&create(&format!("pet-{n}"), category, None))
                .await
                .unwrap();
        }
        settle(&handle, 20).await;
        let stats = handle.shutdown().await.unwrap();

        assert_eq!(stats.processed, 20);
        assert_eq!(store.count_pets(), 20);
        assert_eq!(store.count_references(ReferenceKind::Category), 2);
        assert_eq!(store.count_references(ReferenceKind::Vaccine), 2);
        assert_eq!(store.count_links(ReferenceKind::Vaccine), 40);
        assert_eq!(store.count_links(ReferenceKind::Tag), 0);
    }

    #[tokio::test]
    async fn rejected_commands_do_not_block_the_rest() {
        let (producer, store, handle) = setup(1);

        producer
            .send(&CommandBuilder::new("invalid_command").build())
            .await
            .unwrap();
        producer.send(&create("ok", "category", None)).await.unwrap();

        let stats = settle(&handle, 2).await;
        handle.shutdown().await.unwrap();

        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(store.count_pets(), 1);
    }
}
