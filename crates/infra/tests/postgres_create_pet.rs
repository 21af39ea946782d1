//! `pet_create` against a real Postgres.
//!
//! Runs only when `DATABASE_URL` is set. Each test provisions its own schema
//! and drops it afterwards.

use chrono::{TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};

use petstore_core::{Command, CreatePet};
use petstore_infra::pet_store::PostgresPetStore;
use petstore_infra::{CommandProcessor, CreatePetProcessor};

const SCHEMA_DDL: &str = r#"
CREATE TABLE categories (id SERIAL PRIMARY KEY, name TEXT NOT NULL UNIQUE CHECK (name <> ''));
CREATE TABLE breeds     (id SERIAL PRIMARY KEY, name TEXT NOT NULL UNIQUE CHECK (name <> ''));
CREATE TABLE tags       (id SERIAL PRIMARY KEY, name TEXT NOT NULL UNIQUE CHECK (name <> ''));
CREATE TABLE vaccines   (id SERIAL PRIMARY KEY, name TEXT NOT NULL UNIQUE CHECK (name <> ''));
CREATE TABLE pets (
    id       TEXT PRIMARY KEY,
    name     TEXT NOT NULL CHECK (name <> ''),
    dob      TIMESTAMPTZ NOT NULL,
    category INT NOT NULL REFERENCES categories (id),
    breed    INT NOT NULL REFERENCES breeds (id)
);
CREATE TABLE pets_tags (
    id_pet TEXT NOT NULL REFERENCES pets (id),
    id_tag INT  NOT NULL REFERENCES tags (id),
    PRIMARY KEY (id_pet, id_tag)
);
CREATE TABLE pets_vaccines (
    id_pet     TEXT NOT NULL REFERENCES pets (id),
    id_vaccine INT  NOT NULL REFERENCES vaccines (id),
    PRIMARY KEY (id_pet, id_vaccine)
);
CREATE FUNCTION reject_poison() RETURNS trigger AS $$
BEGIN
    IF (SELECT name FROM vaccines WHERE id = NEW.id_vaccine) = 'poison' THEN
        RAISE EXCEPTION 'poison may not be linked' USING ERRCODE = '23514';
    END IF;
    RETURN NEW;
END
$$ LANGUAGE plpgsql;
CREATE TRIGGER pets_vaccines_reject_poison
    BEFORE INSERT ON pets_vaccines
    FOR EACH ROW EXECUTE FUNCTION reject_poison();
"#;

struct TestDb {
    admin: PgPool,
    pool: PgPool,
    schema: String,
}

impl TestDb {
    async fn try_new(name: &str) -> Option<Self> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL not set; skipping {name}");
            return None;
        };

        let schema = format!(
            "petstore_{name}_{}_{}",
            std::process::id(),
            Utc::now().timestamp_subsec_nanos()
        );

        let admin = PgPool::connect(&url).await.unwrap();
        admin
            .execute(format!("CREATE SCHEMA {schema}").as_str())
            .await
            .unwrap();

        let search_path = format!("SET search_path TO {schema}");
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .after_connect(move |conn, _meta| {
                let search_path = search_path.clone();
                Box::pin(async move {
                    conn.execute(search_path.as_str()).await?;
                    Ok(())
                })
            })
            .connect(&url)
            .await
            .unwrap();
        pool.execute(SCHEMA_DDL).await.unwrap();

        Some(Self { admin, pool, schema })
    }

    fn processor(&self) -> CreatePetProcessor<PostgresPetStore> {
        CreatePetProcessor::new(PostgresPetStore::new(self.pool.clone()))
    }

    async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    async fn drop(self) {
        self.pool.close().await;
        self.admin
            .execute(format!("DROP SCHEMA {} CASCADE", self.schema).as_str())
            .await
            .unwrap();
    }
}

fn create(name: &str, category: &str, tags: Option<Vec<&str>>) -> Command {
    create_with_vaccines(name, category, vec!["vaccine1", "vaccine2"], tags)
}

fn create_with_vaccines(name: &str, category: &str, vaccines: Vec<&str>, tags: Option<Vec<&str>>) -> Command {
    CreatePet {
        name: name.into(),
        dob: Utc.with_ymd_and_hms(2019, 1, 2, 3, 4, 5).unwrap(),
        category: category.into(),
        breed: "breed".into(),
        vaccines: vaccines.into_iter().map(String::from).collect(),
        tags: tags.map(|t| t.into_iter().map(String::from).collect()),
    }
    .into_command()
}

#[tokio::test]
async fn creates_pet_with_references_and_links() {
    let Some(db) = TestDb::try_new("create").await else {
        return;
    };
    let processor = db.processor();
    let cmd = create("name", "category", Some(vec!["tag1", "tag2", "tag3"]));

    processor.process(&cmd).await.unwrap();

    let (name, category): (String, String) = sqlx::query_as(
        "SELECT p.name, c.name FROM pets p JOIN categories c ON c.id = p.category WHERE p.id = $1",
    )
    .bind(cmd.id().to_string())
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(name, "name");
    assert_eq!(category, "category");

    assert_eq!(db.count("pets").await, 1);
    assert_eq!(db.count("breeds").await, 1);
    assert_eq!(db.count("tags").await, 3);
    assert_eq!(db.count("vaccines").await, 2);
    assert_eq!(db.count("pets_tags").await, 3);
    assert_eq!(db.count("pets_vaccines").await, 2);

    db.drop().await;
}

#[tokio::test]
async fn reference_rows_are_shared_and_tags_optional() {
    let Some(db) = TestDb::try_new("shared").await else {
        return;
    };
    let processor = db.processor();

    processor.process(&create("first", "dog", None)).await.unwrap();
    processor.process(&create("second", "dog", None)).await.unwrap();

    assert_eq!(db.count("pets").await, 2);
    assert_eq!(db.count("categories").await, 1);
    assert_eq!(db.count("vaccines").await, 2);
    assert_eq!(db.count("pets_vaccines").await, 4);
    assert_eq!(db.count("tags").await, 0);
    assert_eq!(db.count("pets_tags").await, 0);

    db.drop().await;
}

#[tokio::test]
async fn replayed_command_conflicts_and_leaves_rows_untouched() {
    let Some(db) = TestDb::try_new("replay").await else {
        return;
    };
    let processor = db.processor();
    let cmd = create("name", "category", Some(vec!["tag1"]));

    processor.process(&cmd).await.unwrap();
    let err = processor.process(&cmd).await.unwrap_err();

    assert_eq!(err.stage, "pet");
    assert_eq!(db.count("pets").await, 1);
    assert_eq!(db.count("pets_tags").await, 1);
    assert_eq!(db.count("pets_vaccines").await, 2);

    db.drop().await;
}

#[tokio::test]
async fn empty_reference_name_rolls_back_everything() {
    let Some(db) = TestDb::try_new("rollback").await else {
        return;
    };
    let processor = db.processor();

    let err = processor
        .process(&create("name", "category", Some(vec!["tag1", ""])))
        .await
        .unwrap_err();

    assert_eq!(err.stage, "tags");
    assert_eq!(db.count("categories").await, 0);
    assert_eq!(db.count("tags").await, 0);
    assert_eq!(db.count("pets").await, 0);

    db.drop().await;
}

#[tokio::test]
async fn failure_at_the_last_link_rolls_back_every_row() {
    let Some(db) = TestDb::try_new("last_link").await else {
        return;
    };
    let processor = db.processor();
    let cmd = create_with_vaccines("name", "category", vec!["vaccine1", "poison"], Some(vec!["tag1", "tag2"]));

    let err = processor.process(&cmd).await.unwrap_err();

    assert_eq!(err.stage, "pets_vaccines");
    for table in ["pets", "pets_tags", "pets_vaccines", "categories", "breeds", "tags", "vaccines"] {
        assert_eq!(db.count(table).await, 0, "{table} kept rows");
    }

    db.drop().await;
}

#[tokio::test]
async fn concurrent_creates_with_reversed_names_both_commit() {
    let Some(db) = TestDb::try_new("concurrent").await else {
        return;
    };
    let first = db.processor();
    let second = db.processor();

    for round in 0..20 {
        let a = create_with_vaccines(
            &format!("a-{round}"),
            "category",
            vec!["vaccine1", "vaccine2"],
            Some(vec!["tag-a", "tag-b"]),
        );
        let b = create_with_vaccines(
            &format!("b-{round}"),
            "category",
            vec!["vaccine2", "vaccine1"],
            Some(vec!["tag-b", "tag-a"]),
        );

        let (ra, rb) = tokio::join!(first.process(&a), second.process(&b));
        ra.unwrap();
        rb.unwrap();
    }

    assert_eq!(db.count("pets").await, 40);
    assert_eq!(db.count("tags").await, 2);
    assert_eq!(db.count("vaccines").await, 2);
    assert_eq!(db.count("pets_tags").await, 80);

    db.drop().await;
}
