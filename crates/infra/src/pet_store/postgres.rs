//! Postgres-backed pet store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key / not null / check violation) | `23503` / `23502` / `23514` | `Constraint` |
//! | Database (connection exception class) | `08xxx` | `Unavailable` |
//! | Database (other) | Any other | `Database` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` |
//! | Other | N/A | `Database` |
//!
//! Reference names are resolved inside each statement (`INSERT .. SELECT`),
//! so a statement that matches nothing reports `MissingReference` instead of
//! silently inserting zero rows.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::instrument;

use super::{no_link_table, NewPetRow, PetWriteStore, PetWriteTx, ReferenceKind, StoreError};

#[derive(Debug, Clone)]
pub struct PostgresPetStore {
    pool: PgPool,
}

impl PostgresPetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool; fails fast when the database cannot be reached.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PetWriteStore for PostgresPetStore {
    type Tx = PostgresPetTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PostgresPetTx { tx })
    }
}

/// Dropping it without `commit` rolls back (sqlx issues the ROLLBACK when the
/// connection returns to the pool).
pub struct PostgresPetTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl PetWriteTx for PostgresPetTx {
    #[instrument(skip(self), fields(table = kind.table()), err)]
    async fn ensure_reference(&mut self, kind: ReferenceKind, name: &str) -> Result<(), StoreError> {
        // Single statement: concurrent inserts of the same name resolve to one
        // row without raising a unique violation.
        let sql = format!(
            "INSERT INTO {} (name) VALUES ($1) ON CONFLICT (name) DO NOTHING",
            kind.table()
        );
        sqlx::query(&sql)
            .bind(name)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("ensure_reference", e))?;
        Ok(())
    }

    #[instrument(skip(self, pet), fields(pet_id = %pet.id), err)]
    async fn insert_pet(&mut self, pet: &NewPetRow) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO pets (id, name, dob, category, breed)
            SELECT $1, $2, $3, c.id, b.id
            FROM categories c, breeds b
            WHERE c.name = $4 AND b.name = $5
            "#,
        )
        .bind(&pet.id)
        .bind(&pet.name)
        .bind(pet.dob)
        .bind(&pet.category)
        .bind(&pet.breed)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_pet", e))?;

        if result.rows_affected() == 0 {
            return Err(self.missing_pet_reference(pet).await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(table = kind.table()), err)]
    async fn link_reference(
        &mut self,
        pet_id: &str,
        kind: ReferenceKind,
        name: &str,
    ) -> Result<(), StoreError> {
        let (link_table, column) = kind.link_table().ok_or_else(|| no_link_table(kind))?;
        let sql = format!(
            "INSERT INTO {link_table} (id_pet, {column}) SELECT $1, r.id FROM {} r WHERE r.name = $2",
            kind.table()
        );

        let result = sqlx::query(&sql)
            .bind(pet_id)
            .bind(name)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("link_reference", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MissingReference {
                kind,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

impl PostgresPetTx {
    /// Work out which of the pet's two references is missing.
    async fn missing_pet_reference(&mut self, pet: &NewPetRow) -> StoreError {
        let category: Result<Option<i32>, _> =
            sqlx::query_scalar("SELECT id FROM categories WHERE name = $1")
                .bind(&pet.category)
                .fetch_optional(&mut *self.tx)
                .await;

        match category {
            Ok(Some(_)) => StoreError::MissingReference {
                kind: ReferenceKind::Breed,
                name: pet.breed.clone(),
            },
            Ok(None) => StoreError::MissingReference {
                kind: ReferenceKind::Category,
                name: pet.category.clone(),
            },
            Err(e) => map_sqlx_error("insert_pet", e),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") | Some("23502") | Some("23514") => StoreError::Constraint(msg),
                Some(code) if code.starts_with("08") => StoreError::Unavailable(msg),
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("timed out acquiring a connection in {}", operation))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        _ => StoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}
