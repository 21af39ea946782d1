use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{no_link_table, NewPetRow, PetWriteStore, PetWriteTx, ReferenceKind, StoreError};

/// A step of a write transaction, for failure injection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WriteStep {
    Begin,
    EnsureReference(ReferenceKind),
    InsertPet,
    LinkReference(ReferenceKind),
    Commit,
}

/// A committed pet row with resolved reference ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PetRow {
    pub id: String,
    pub name: String,
    pub dob: DateTime<Utc>,
    pub category: i64,
    pub breed: i64,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    next_id: i64,
    references: BTreeMap<ReferenceKind, BTreeMap<String, i64>>,
    pets: BTreeMap<String, PetRow>,
    links: BTreeMap<ReferenceKind, BTreeSet<(String, i64)>>,
}

#[derive(Debug, Clone)]
enum Op {
    EnsureReference(ReferenceKind, String),
    InsertPet(NewPetRow),
    Link(String, ReferenceKind, String),
}

impl Tables {
    fn reference_id(&self, kind: ReferenceKind, name: &str) -> Result<i64, StoreError> {
        self.references
            .get(&kind)
            .and_then(|names| names.get(name))
            .copied()
            .ok_or_else(|| StoreError::MissingReference {
                kind,
                name: name.to_string(),
            })
    }

    fn apply(&mut self, op: &Op) -> Result<(), StoreError> {
        match op {
            Op::EnsureReference(kind, name) => {
                if name.is_empty() {
                    return Err(StoreError::Constraint(format!(
                        "{kind}.name must not be empty"
                    )));
                }
                let names = self.references.entry(*kind).or_default();
                if !names.contains_key(name) {
                    self.next_id += 1;
                    names.insert(name.clone(), self.next_id);
                }
                Ok(())
            }
            Op::InsertPet(pet) => {
                let category = self.reference_id(ReferenceKind::Category, &pet.category)?;
                let breed = self.reference_id(ReferenceKind::Breed, &pet.breed)?;
                if self.pets.contains_key(&pet.id) {
                    return Err(StoreError::Conflict(format!("pets.id {} already exists", pet.id)));
                }
                self.pets.insert(
                    pet.id.clone(),
                    PetRow {
                        id: pet.id.clone(),
                        name: pet.name.clone(),
                        dob: pet.dob,
                        category,
                        breed,
                    },
                );
                Ok(())
            }
            Op::Link(pet_id, kind, name) => {
                let (table, _) = kind.link_table().ok_or_else(|| no_link_table(*kind))?;
                if !self.pets.contains_key(pet_id) {
                    return Err(StoreError::Constraint(format!(
                        "{table}.id_pet {pet_id} does not reference a pet"
                    )));
                }
                let id = self.reference_id(*kind, name)?;
                if !self.links.entry(*kind).or_default().insert((pet_id.clone(), id)) {
                    return Err(StoreError::Conflict(format!(
                        "{table} already links {pet_id} to {name}"
                    )));
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    failures: Mutex<HashSet<WriteStep>>,
    begun: AtomicUsize,
}

/// In-memory pet store.
///
/// Intended for tests/dev. Each transaction works on a private copy of the
/// tables and replays its statements onto the shared tables at commit, so a
/// failed or dropped transaction leaves no trace. Failures can be injected
/// at any [`WriteStep`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryPetStore {
    shared: Arc<Shared>,
}

impl InMemoryPetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later occurrence of `step` fail with `StoreError::Unavailable`.
    pub fn fail_on(&self, step: WriteStep) {
        lock(&self.shared.failures).insert(step);
    }

    pub fn clear_failures(&self) {
        lock(&self.shared.failures).clear();
    }

    /// Transactions opened so far.
    pub fn begun(&self) -> usize {
        self.shared.begun.load(Ordering::SeqCst)
    }

    pub fn pet(&self, id: &str) -> Option<PetRow> {
        lock(&self.shared.tables).pets.get(id).cloned()
    }

    pub fn reference_id(&self, kind: ReferenceKind, name: &str) -> Option<i64> {
        lock(&self.shared.tables).reference_id(kind, name).ok()
    }

    pub fn count_pets(&self) -> usize {
        lock(&self.shared.tables).pets.len()
    }

    pub fn count_references(&self, kind: ReferenceKind) -> usize {
        lock(&self.shared.tables)
            .references
            .get(&kind)
            .map_or(0, BTreeMap::len)
    }

    /// Join rows of `kind` in total.
    pub fn count_links(&self, kind: ReferenceKind) -> usize {
        lock(&self.shared.tables)
            .links
            .get(&kind)
            .map_or(0, BTreeSet::len)
    }

    /// Names of the `kind` references linked to `pet_id`, sorted.
    pub fn linked_names(&self, pet_id: &str, kind: ReferenceKind) -> Vec<String> {
        let tables = lock(&self.shared.tables);
        let ids: BTreeSet<i64> = tables
            .links
            .get(&kind)
            .map(|links| {
                links
                    .iter()
                    .filter(|(pet, _)| pet == pet_id)
                    .map(|(_, id)| *id)
                    .collect()
            })
            .unwrap_or_default();

        let mut names: Vec<String> = tables
            .references
            .get(&kind)
            .map(|names| {
                names
                    .iter()
                    .filter(|(_, id)| ids.contains(*id))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    fn check(&self, step: WriteStep) -> Result<(), StoreError> {
        if lock(&self.shared.failures).contains(&step) {
            return Err(StoreError::Unavailable(format!("injected failure at {step:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl PetWriteStore for InMemoryPetStore {
    type Tx = InMemoryPetTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        self.check(WriteStep::Begin)?;
        self.shared.begun.fetch_add(1, Ordering::SeqCst);
        let snapshot = lock(&self.shared.tables).clone();
        Ok(InMemoryPetTx {
            store: self.clone(),
            working: snapshot,
            ops: Vec::new(),
        })
    }
}

#[derive(Debug)]
pub struct InMemoryPetTx {
    store: InMemoryPetStore,
    working: Tables,
    ops: Vec<Op>,
}

impl InMemoryPetTx {
    fn stage(&mut self, step: WriteStep, op: Op) -> Result<(), StoreError> {
        self.store.check(step)?;
        self.working.apply(&op)?;
        self.ops.push(op);
        Ok(())
    }
}

#[async_trait]
impl PetWriteTx for InMemoryPetTx {
    async fn ensure_reference(&mut self, kind: ReferenceKind, name: &str) -> Result<(), StoreError> {
        self.stage(
            WriteStep::EnsureReference(kind),
            Op::EnsureReference(kind, name.to_string()),
        )
    }

    async fn insert_pet(&mut self, pet: &NewPetRow) -> Result<(), StoreError> {
        self.stage(WriteStep::InsertPet, Op::InsertPet(pet.clone()))
    }

    async fn link_reference(
        &mut self,
        pet_id: &str,
        kind: ReferenceKind,
        name: &str,
    ) -> Result<(), StoreError> {
        self.stage(
            WriteStep::LinkReference(kind),
            Op::Link(pet_id.to_string(), kind, name.to_string()),
        )
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.store.check(WriteStep::Commit)?;

        // Replay against the latest committed state: another transaction may
        // have committed the same pet or reference names meanwhile.
        let mut tables = lock(&self.store.shared.tables);
        let mut next = tables.clone();
        for op in &self.ops {
            next.apply(op)?;
        }
        *tables = next;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
