//! `pet_create`: turn one command into a pet row, its reference rows and its
//! join rows, atomically.
//!
//! ```text
//! begin
//!   ensure category, breed, each tag, each vaccine   (upsert by name, sorted)
//!   insert pet (id = command id, references resolved by name)
//!   link each tag, then each vaccine                 (resolved by name)
//! commit
//! ```
//!
//! The first failing statement rolls the whole transaction back.

use chrono::{DateTime, Utc};
use tracing::{instrument, warn};

use async_trait::async_trait;
use petstore_core::pet::attr;
use petstore_core::{AttributeError, Command, PET_CREATE};

use crate::pet_store::{NewPetRow, PetWriteStore, PetWriteTx, ReferenceKind, StoreError};

use super::{CommandProcessor, ProcessingFailure};

const REQUIRED: [&str; 5] = [attr::NAME, attr::DOB, attr::CATEGORY, attr::BREED, attr::VACCINES];

#[derive(Debug, Clone)]
pub struct CreatePetProcessor<S> {
    store: S,
}

impl<S> CreatePetProcessor<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

/// Attributes of a `pet_create` command, typed.
#[derive(Debug)]
struct PetInput {
    pet: NewPetRow,
    vaccines: Vec<String>,
    tags: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
enum InputError {
    #[error(transparent)]
    Attribute(#[from] AttributeError),

    #[error("dob {value:?} is not an RFC 3339 instant: {source}")]
    Dob {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

impl PetInput {
    fn from_command(command: &Command) -> Result<Self, InputError> {
        let dob: String = command.get(attr::DOB)?;
        let dob = DateTime::parse_from_rfc3339(&dob)
            .map_err(|source| InputError::Dob {
                value: dob.clone(),
                source,
            })?
            .with_timezone(&Utc);

        Ok(Self {
            pet: NewPetRow {
                id: command.id().to_string(),
                name: command.get(attr::NAME)?,
                dob,
                category: command.get(attr::CATEGORY)?,
                breed: command.get(attr::BREED)?,
            },
            vaccines: distinct(command.get_list(attr::VACCINES)?),
            tags: distinct(command.get_optional::<Vec<String>>(attr::TAGS)?.unwrap_or_default()),
        })
    }
}

/// Drop repeated names, keeping first occurrences in order; a pet is linked
/// to a reference at most once.
fn distinct(names: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

fn sorted(names: &[String]) -> Vec<&str> {
    let mut names: Vec<&str> = names.iter().map(String::as_str).collect();
    names.sort_unstable();
    names
}

async fn write<T: PetWriteTx>(tx: &mut T, input: &PetInput) -> Result<(), (&'static str, StoreError)> {
    let pet = &input.pet;

    tx.ensure_reference(ReferenceKind::Category, &pet.category)
        .await
        .map_err(|e| ("category", e))?;
    tx.ensure_reference(ReferenceKind::Breed, &pet.breed)
        .await
        .map_err(|e| ("breed", e))?;
    // Concurrent upserts of the same names must take the unique-index locks
    // in one global order, or two transactions can deadlock.
    for tag in sorted(&input.tags) {
        tx.ensure_reference(ReferenceKind::Tag, tag)
            .await
            .map_err(|e| ("tags", e))?;
    }
    for vaccine in sorted(&input.vaccines) {
        tx.ensure_reference(ReferenceKind::Vaccine, vaccine)
            .await
            .map_err(|e| ("vaccines", e))?;
    }

    tx.insert_pet(pet).await.map_err(|e| ("pet", e))?;

    for tag in &input.tags {
        tx.link_reference(&pet.id, ReferenceKind::Tag, tag)
            .await
            .map_err(|e| ("pets_tags", e))?;
    }
    for vaccine in &input.vaccines {
        tx.link_reference(&pet.id, ReferenceKind::Vaccine, vaccine)
            .await
            .map_err(|e| ("pets_vaccines", e))?;
    }

    Ok(())
}

#[async_trait]
impl<S> CommandProcessor for CreatePetProcessor<S>
where
    S: PetWriteStore,
{
    fn name(&self) -> &str {
        PET_CREATE
    }

    /// Tags are optional.
    fn validate(&self, command: &Command) -> bool {
        REQUIRED.iter().all(|a| command.contains(a))
    }

    #[instrument(
        skip(self, command),
        fields(command_id = %command.id(), command_name = %command.name()),
        err
    )]
    async fn process(&self, command: &Command) -> Result<(), ProcessingFailure> {
        let input =
            PetInput::from_command(command).map_err(|e| ProcessingFailure::new(command, "parse", e))?;

        let mut tx = self
            .store
            .begin()
            .await
            .map_err(|e| ProcessingFailure::new(command, "begin", e))?;

        if let Err((stage, err)) = write(&mut tx, &input).await {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback failed; transaction is discarded with its connection");
            }
            return Err(ProcessingFailure::new(command, stage, err));
        }

        tx.commit()
            .await
            .map_err(|e| ProcessingFailure::new(command, "commit", e))
    }
}
