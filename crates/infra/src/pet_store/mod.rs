//! Write side of the pet tables.
//!
//! ## Tables
//!
//! | table | key | columns |
//! |---|---|---|
//! | `pets` | `id` (command id) | `name`, `dob`, `category` → `categories.id`, `breed` → `breeds.id` |
//! | `categories`, `breeds`, `tags`, `vaccines` | `id` (serial) | `name` (unique, non-empty) |
//! | `pets_tags` | (`id_pet`, `id_tag`) | |
//! | `pets_vaccines` | (`id_pet`, `id_vaccine`) | |
//!
//! The schema is provisioned elsewhere; stores only issue DML.
//!
//! ## Transactions
//!
//! Every write goes through a [`PetWriteTx`]. Nothing is visible to other
//! transactions before `commit`, and a transaction dropped without `commit`
//! is rolled back.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryPetStore, PetRow, WriteStep};
pub use postgres::PostgresPetStore;

/// Shared, name-keyed lookup data referenced by pets.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReferenceKind {
    Category,
    Breed,
    Tag,
    Vaccine,
}

impl ReferenceKind {
    pub const ALL: [ReferenceKind; 4] = [Self::Category, Self::Breed, Self::Tag, Self::Vaccine];

    pub fn table(&self) -> &'static str {
        match self {
            Self::Category => "categories",
            Self::Breed => "breeds",
            Self::Tag => "tags",
            Self::Vaccine => "vaccines",
        }
    }

    /// Join table and its reference column, for kinds a pet can have many of.
    pub fn link_table(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::Tag => Some(("pets_tags", "id_tag")),
            Self::Vaccine => Some(("pets_vaccines", "id_vaccine")),
            Self::Category | Self::Breed => None,
        }
    }
}

impl core::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.table())
    }
}

/// A pet row to insert; `category` and `breed` are resolved by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPetRow {
    pub id: String,
    pub name: String,
    pub dob: DateTime<Utc>,
    pub category: String,
    pub breed: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// A row with the same key already exists (replayed command).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A referenced row could not be resolved by name.
    #[error("no {kind} named {name:?}")]
    MissingReference { kind: ReferenceKind, name: String },

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),
}

/// Opens write transactions.
#[async_trait]
pub trait PetWriteStore: Send + Sync {
    type Tx: PetWriteTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// One write transaction. Statements fail fast: after an error the caller
/// is expected to roll back.
#[async_trait]
pub trait PetWriteTx: Send {
    /// Insert the reference row unless one with this name exists. Safe
    /// against concurrent transactions inserting the same name.
    async fn ensure_reference(&mut self, kind: ReferenceKind, name: &str) -> Result<(), StoreError>;

    async fn insert_pet(&mut self, pet: &NewPetRow) -> Result<(), StoreError>;

    /// Link a pet to a tag or vaccine, resolving the reference by name.
    async fn link_reference(
        &mut self,
        pet_id: &str,
        kind: ReferenceKind,
        name: &str,
    ) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> PetWriteStore for Arc<S>
where
    S: PetWriteStore,
{
    type Tx = S::Tx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        (**self).begin().await
    }
}

pub(crate) fn no_link_table(kind: ReferenceKind) -> StoreError {
    StoreError::Constraint(format!("pets have no join table for {kind}"))
}
