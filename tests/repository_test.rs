//! Integration tests for the generic repository against SQLite.

use resilient_db::config::DatabaseSettings;
use resilient_db::db::{OrderBy, QueryBuilder, Statement};
use resilient_db::models::{ColumnDef, ColumnType, Entity, Record, SqlValue};
use resilient_db::{DbError, LifecycleManager, ListQuery, Repository};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    #[serde(default)]
    id: Option<i64>,
    name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    age: Option<i64>,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    profile: Option<JsonValue>,
}

impl User {
    fn named(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            email: None,
            age: None,
            active: None,
            profile: None,
        }
    }
}

impl Entity for User {
    const TABLE: &'static str = "users";
    const COLUMNS: &'static [ColumnDef] = &[
        ColumnDef::new("name", ColumnType::Text),
        ColumnDef::new("email", ColumnType::Text).nullable().unique(),
        ColumnDef::new("age", ColumnType::BigInt).nullable(),
        ColumnDef::new("active", ColumnType::Boolean).nullable(),
        ColumnDef::new("profile", ColumnType::Json).nullable(),
    ];

    fn id(&self) -> Option<i64> {
        self.id
    }
}

/// Entity whose table and column names are reserved words and metacharacters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Awkward {
    #[serde(default)]
    id: Option<i64>,
    group: String,
    #[serde(rename = "select\"quote")]
    quoted: Option<String>,
    #[serde(rename = "semi;colon --")]
    semi: Option<i64>,
}

impl Entity for Awkward {
    const TABLE: &'static str = "order";
    const COLUMNS: &'static [ColumnDef] = &[
        ColumnDef::new("group", ColumnType::Text),
        ColumnDef::new("select\"quote", ColumnType::Text).nullable(),
        ColumnDef::new("semi;colon --", ColumnType::BigInt).nullable(),
    ];

    fn id(&self) -> Option<i64> {
        self.id
    }
}

struct TestDb {
    _dir: TempDir,
    repo: Repository,
}

async fn setup() -> TestDb {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("repo.db");
    let settings = DatabaseSettings::new(format!("sqlite:{}", path.display())).unwrap();
    let lifecycle =
        LifecycleManager::new(settings, vec![User::table_def(), Awkward::table_def()]);
    lifecycle.start();

    tokio::time::timeout(Duration::from_secs(10), lifecycle.wait_until_ready())
        .await
        .expect("database did not become ready")
        .unwrap();

    TestDb {
        _dir: dir,
        repo: Repository::new(lifecycle),
    }
}

#[tokio::test]
async fn test_create_then_get_round_trip() {
    let db = setup().await;
    let user = User {
        id: None,
        name: "Alice".into(),
        email: Some("alice@example.com".into()),
        age: Some(31),
        active: Some(true),
        profile: Some(json!({"theme": "dark", "tags": ["a", "b"]})),
    };

    let created = db.repo.create(&user).await.unwrap();
    let id = created.id().expect("server-assigned id");
    assert_eq!(User { id: None, ..created.clone() }, user);

    let fetched: User = db.repo.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(fetched, created);

    let missing: Option<User> = db.repo.get_by_id(id + 1000).await.unwrap();
    assert!(missing.is_none());

    db.repo.lifecycle().close().await;
}

#[tokio::test]
async fn test_list_pages_in_insertion_order() {
    let db = setup().await;
    for name in ["A", "B", "C"] {
        db.repo.create(&User::named(name)).await.unwrap();
    }

    let first: Vec<User> = db.repo.list(&ListQuery::new(2, 0)).await.unwrap();
    let names: Vec<_> = first.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["A", "B"]);

    let second: Vec<User> = db.repo.list(&ListQuery::new(2, 2)).await.unwrap();
    let names: Vec<_> = second.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["C"]);

    let desc: Vec<User> = db
        .repo
        .list(&ListQuery::default().order_by(OrderBy::desc("name")))
        .await
        .unwrap();
    let names: Vec<_> = desc.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["C", "B", "A"]);
}

#[tokio::test]
async fn test_list_filters_and_limit_ceiling() {
    let db = setup().await;
    let mut bob = User::named("Bob");
    bob.age = Some(40);
    bob.active = Some(false);
    db.repo.create(&bob).await.unwrap();
    db.repo.create(&User::named("Carol")).await.unwrap();
    db.repo.create(&User::named("Dave")).await.unwrap();

    let filtered: Vec<User> = db
        .repo
        .list(&ListQuery::default().filter("age", 40).filter("active", false))
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].name, "Bob");

    let without_age: Vec<User> = db
        .repo
        .list(&ListQuery::default().filter("age", SqlValue::Null))
        .await
        .unwrap();
    assert_eq!(without_age.len(), 2);

    let capped = db.repo.clone().with_max_list_limit(2);
    let page: Vec<User> = capped.list(&ListQuery::new(500, 0)).await.unwrap();
    assert_eq!(page.len(), 2);

    // A zero ceiling still returns a row per page.
    let floor = db.repo.clone().with_max_list_limit(0);
    let page: Vec<User> = floor.list(&ListQuery::default()).await.unwrap();
    assert_eq!(page.len(), 1);
}

#[tokio::test]
async fn test_list_rejects_unknown_columns() {
    let db = setup().await;

    let err = db
        .repo
        .list::<User>(&ListQuery::default().filter("name\" OR 1=1 --", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err.root(), DbError::InvalidInput { .. }));

    let err = db
        .repo
        .list::<User>(&ListQuery::default().order_by(OrderBy::asc("password")))
        .await
        .unwrap_err();
    assert!(matches!(err.root(), DbError::InvalidInput { .. }));
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn test_bulk_create_returns_rows_in_input_order() {
    let db = setup().await;
    let rows = vec![
        Record::new().set("name", "Alice"),
        Record::new().set("name", "Bob"),
    ];

    let created: Vec<User> = db.repo.bulk_create(&rows).await.unwrap();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0].name, "Alice");
    assert_eq!(created[1].name, "Bob");
    assert!(created[0].id.is_some());
    assert_ne!(created[0].id, created[1].id);

    let none: Vec<User> = db.repo.bulk_create(&[]).await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_update_partial_and_empty() {
    let db = setup().await;
    let created = db.repo.create(&User::named("Eve")).await.unwrap();
    let id = created.id.unwrap();

    let unchanged: User = db.repo.update(id, &Record::new()).await.unwrap().unwrap();
    assert_eq!(unchanged, created);

    let changes = Record::new()
        .set("email", "eve@example.com")
        .set("profile", json!({"beta": true}));
    let updated: User = db.repo.update(id, &changes).await.unwrap().unwrap();
    assert_eq!(updated.name, "Eve");
    assert_eq!(updated.email.as_deref(), Some("eve@example.com"));
    assert_eq!(updated.profile, Some(json!({"beta": true})));

    let missing: Option<User> = db
        .repo
        .update(id + 100, &Record::new().set("age", 1))
        .await
        .unwrap();
    assert!(missing.is_none());

    let err = db
        .repo
        .update::<User>(id, &Record::new().set("id", 99))
        .await
        .unwrap_err();
    assert!(matches!(err.root(), DbError::InvalidInput { .. }));
}

#[tokio::test]
async fn test_delete_reports_existence() {
    let db = setup().await;
    let created = db.repo.create(&User::named("Frank")).await.unwrap();
    let id = created.id.unwrap();

    assert!(db.repo.delete::<User>(id).await.unwrap());
    assert!(!db.repo.delete::<User>(id).await.unwrap());
    assert!(!db.repo.delete::<User>(987_654).await.unwrap());
}

#[tokio::test]
async fn test_unique_violation_is_client_error() {
    let db = setup().await;
    let mut first = User::named("G1");
    first.email = Some("dup@example.com".into());
    db.repo.create(&first).await.unwrap();

    let mut second = User::named("G2");
    second.email = Some("dup@example.com".into());
    let err = db.repo.create(&second).await.unwrap_err();
    assert!(err.is_client_error());
    assert!(!err.to_string().contains("G2"));
}

#[tokio::test]
async fn test_hostile_values_are_stored_literally() {
    let db = setup().await;
    let hostile = "'; DROP TABLE users; --";
    let created = db.repo.create(&User::named(hostile)).await.unwrap();

    let found: Vec<User> = db
        .repo
        .list(&ListQuery::default().filter("name", hostile))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, created.id);
}

#[tokio::test]
async fn test_transaction_is_all_or_nothing() {
    let db = setup().await;
    let builder = QueryBuilder::new(db.repo.lifecycle().dialect());
    let insert_a = builder
        .build_insert("users", &Record::new().set("name", "TxA"))
        .unwrap();
    let invalid = Statement::new("INSERT INTO no_such_table (x) VALUES (1)", Vec::new());

    let err = db
        .repo
        .execute_transaction([insert_a.clone(), invalid])
        .await
        .unwrap_err();
    assert!(err.is_client_error());

    let rows: Vec<User> = db
        .repo
        .list(&ListQuery::default().filter("name", "TxA"))
        .await
        .unwrap();
    assert!(rows.is_empty());

    let insert_b = builder
        .build_insert("users", &Record::new().set("name", "TxB"))
        .unwrap();
    db.repo
        .execute_transaction(vec![insert_a, insert_b])
        .await
        .unwrap();
    let rows: Vec<User> = db.repo.list(&ListQuery::default()).await.unwrap();
    let names: Vec<_> = rows.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["TxA", "TxB"]);
}

#[tokio::test]
async fn test_raw_query_and_command() {
    let db = setup().await;
    db.repo.create(&User::named("Hal")).await.unwrap();
    db.repo.create(&User::named("Ida")).await.unwrap();

    let affected = db
        .repo
        .execute_command("UPDATE users SET age = ?1", vec![SqlValue::Int(50)])
        .await
        .unwrap();
    assert_eq!(affected, 2);

    let rows = db
        .repo
        .execute_raw_query(
            "SELECT name, age FROM users WHERE name = ?1",
            vec![SqlValue::from("Ida")],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], json!("Ida"));
    assert_eq!(rows[0]["age"], json!(50));

    let err = db
        .repo
        .execute_raw_query("SELEKT 1", Vec::new())
        .await
        .unwrap_err();
    assert!(err.is_client_error());
}

#[tokio::test]
async fn test_reserved_and_quoted_identifiers() {
    let db = setup().await;
    let row = Awkward {
        id: None,
        group: "g1".into(),
        quoted: Some("q\"v".into()),
        semi: Some(7),
    };

    let created = db.repo.create(&row).await.unwrap();
    let id = created.id.unwrap();
    assert_eq!(created.group, "g1");
    assert_eq!(created.quoted.as_deref(), Some("q\"v"));

    let listed: Vec<Awkward> = db
        .repo
        .list(
            &ListQuery::default()
                .filter("group", "g1")
                .order_by(OrderBy::desc("semi;colon --")),
        )
        .await
        .unwrap();
    assert_eq!(listed, vec![created.clone()]);

    let updated: Awkward = db
        .repo
        .update(id, &Record::new().set("select\"quote", "changed"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.quoted.as_deref(), Some("changed"));

    assert!(db.repo.delete::<Awkward>(id).await.unwrap());
}
