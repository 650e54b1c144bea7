//! End-to-end tests over SQLite.

use serde_json::json;
use tempfile::TempDir;

use crate::dialect::{Criterion, Join, Operand, Operator, Order, Select, Update};
use crate::driver::DriverKind;
use crate::error::DbError;
use crate::materialize::Prefetch;
use crate::value::Value;
use crate::{Client, ClientConfig, TxState};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn client_with(schema: &str) -> (TempDir, Client) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");
    let config = ClientConfig::new(path.to_str().unwrap())
        .drivers(vec![DriverKind::Sqlite])
        .max_size(2);
    let client = Client::connect(config).await.unwrap();
    client.execute_script(schema).await.unwrap();
    (dir, client)
}

fn labels(records: &[crate::Record], column: &str) -> Vec<String> {
    records
        .iter()
        .map(|r| r.get(column).map(Value::to_text).unwrap_or_default())
        .collect()
}

async fn select_labels(client: &Client, criterion: Criterion) -> Vec<String> {
    let select = Select::new("items", &["id", "label"])
        .filter(criterion)
        .order_by(Order::asc("id"));
    labels(&client.fetch(&select, &[]).await.unwrap(), "label")
}

const ITEMS: &str = "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT);";

#[tokio::test]
async fn test_pattern_escaping_round_trip() {
    let (_dir, client) = client_with(ITEMS).await;
    for label in [r"50%_off\path", r"50X_off\path", r"50%Zoff\path", r"50%_offpath", "plain"] {
        client
            .execute_insert("INSERT INTO items (label) VALUES (?1)", &[label.into()])
            .await
            .unwrap();
    }

    let found = select_labels(&client, Criterion::parse("label__contains", r"%_off\")).await;
    assert_eq!(found, vec![r"50%_off\path".to_string()]);

    let found = select_labels(&client, Criterion::parse("label__icontains", r"%_OFF\")).await;
    assert_eq!(found, vec![r"50%_off\path".to_string()]);

    assert!(select_labels(&client, Criterion::parse("label__contains", "XYZ")).await.is_empty());
    assert!(select_labels(&client, Criterion::parse("label__icontains", "XYZ")).await.is_empty());

    // GLOB metacharacters are literal too
    client
        .execute_insert("INSERT INTO items (label) VALUES (?1)", &["a*[b]?".into()])
        .await
        .unwrap();
    let found = select_labels(&client, Criterion::parse("label__contains", "*[b]?")).await;
    assert_eq!(found, vec!["a*[b]?".to_string()]);
    assert!(select_labels(&client, Criterion::parse("label__contains", "*[c]?")).await.is_empty());
}

#[tokio::test]
async fn test_anchored_lookups() {
    let (_dir, client) = client_with(ITEMS).await;
    client
        .execute_insert("INSERT INTO items (label) VALUES (?1)", &["Hello".into()])
        .await
        .unwrap();

    let hit = vec!["Hello".to_string()];
    assert_eq!(select_labels(&client, Criterion::parse("label__istartswith", "he")).await, hit);
    assert!(select_labels(&client, Criterion::parse("label__istartswith", "ell")).await.is_empty());

    assert_eq!(select_labels(&client, Criterion::parse("label__startswith", "He")).await, hit);
    assert!(select_labels(&client, Criterion::parse("label__startswith", "he")).await.is_empty());

    assert_eq!(select_labels(&client, Criterion::parse("label__iendswith", "LO")).await, hit);
    assert!(select_labels(&client, Criterion::parse("label__endswith", "LO")).await.is_empty());

    assert_eq!(select_labels(&client, Criterion::parse("label__iexact", "HELLO")).await, hit);
    assert!(select_labels(&client, Criterion::parse("label__iexact", "HELL")).await.is_empty());
}

#[tokio::test]
async fn test_regex_and_comparisons() {
    let (_dir, client) = client_with(ITEMS).await;
    for label in ["apple", "banana", "avocado"] {
        client
            .execute_insert("INSERT INTO items (label) VALUES (?1)", &[label.into()])
            .await
            .unwrap();
    }
    client
        .execute_insert("INSERT INTO items (label) VALUES (NULL)", &[])
        .await
        .unwrap();

    assert_eq!(
        select_labels(&client, Criterion::parse("label__regex", "^a")).await,
        vec!["apple", "avocado"]
    );
    assert_eq!(
        select_labels(&client, Criterion::parse("label__not", "banana")).await,
        vec!["apple", "avocado", ""]
    );
    assert_eq!(
        select_labels(
            &client,
            Criterion::new("id", Operator::In, Operand::List(vec![1.into(), 3.into()]))
        )
        .await,
        vec!["apple", "avocado"]
    );
    assert!(select_labels(&client, Criterion::new("id", Operator::In, Operand::List(vec![])))
        .await
        .is_empty());
    assert_eq!(
        select_labels(&client, Criterion::parse("label__isnull", true)).await,
        vec![""]
    );
    assert_eq!(select_labels(&client, Criterion::parse("id__gt", 2)).await.len(), 2);
}

#[tokio::test]
async fn test_json_filter() {
    let (_dir, client) = client_with("CREATE TABLE docs (id INTEGER PRIMARY KEY, data TEXT);").await;
    for doc in [json!({"owner": {"name": "ann"}, "n": 1}), json!({"owner": {"name": "bob"}, "n": 2})] {
        client
            .execute_insert("INSERT INTO docs (data) VALUES (?1)", &[Value::Json(doc)])
            .await
            .unwrap();
    }

    let select = Select::new("docs", &["id"]).filter(Criterion::new(
        "data",
        Operator::JsonFilter,
        Operand::Path(vec!["owner".into(), "name".into()], "bob".into()),
    ));
    let records = client.fetch(&select, &[]).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("id"), Some(&Value::Int(2)));

    let select = Select::new("docs", &["id"]).filter(Criterion::new(
        "data",
        Operator::JsonFilter,
        Operand::Path(vec!["n".into()], 1.into()),
    ));
    assert_eq!(client.fetch(&select, &[]).await.unwrap().len(), 1);

    let select = Select::new("docs", &["id"])
        .filter(Criterion::parse("data__json_contains", Value::Json(json!({"n": 1}))));
    assert!(matches!(client.fetch(&select, &[]).await, Err(DbError::Unsupported(_))));
}

#[tokio::test]
async fn test_execute_operations() {
    let (_dir, client) = client_with(ITEMS).await;

    let first = client
        .execute_insert("INSERT INTO items (label) VALUES (?1)", &["a".into()])
        .await
        .unwrap();
    let second = client
        .execute_insert("INSERT INTO items (label) VALUES (?1)", &["b".into()])
        .await
        .unwrap();
    assert_eq!(first, Some(1));
    assert_eq!(second, Some(2));

    let (count, rows) = client
        .execute_query("SELECT id, label FROM items ORDER BY id", &[])
        .await
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(rows[1].get("label"), Some(&Value::Text("b".into())));
    assert_eq!(rows[0].fields().len(), 2);

    let (changed, rows) = client
        .execute_query("UPDATE items SET label = 'z'", &[])
        .await
        .unwrap();
    assert_eq!(changed, 2);
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_execute_many_is_atomic() {
    let (_dir, client) =
        client_with("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT UNIQUE);").await;
    let sql = "INSERT INTO users (email) VALUES (?1)";

    let rows: Vec<Vec<Value>> = vec![vec!["a@x".into()], vec!["b@x".into()], vec!["a@x".into()]];
    match client.execute_many(sql, &rows).await {
        Err(DbError::IntegrityError(msg)) => assert!(msg.contains("UNIQUE")),
        other => panic!("unexpected {other:?}"),
    }
    let (count, _) = client.execute_query("SELECT * FROM users", &[]).await.unwrap();
    assert_eq!(count, 0);

    client.execute_many(sql, &rows[..2]).await.unwrap();
    let (count, _) = client.execute_query("SELECT * FROM users", &[]).await.unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn test_errors_are_translated() {
    let (_dir, client) = client_with(ITEMS).await;
    assert!(matches!(
        client.execute_script("SELEC 1").await,
        Err(DbError::OperationalError { .. })
    ));
    let err = client.execute_query("SELECT * FROM missing", &[]).await.unwrap_err();
    assert!(err.to_string().contains("no such table"));
    assert!(matches!(
        client
            .execute_insert("INSERT INTO items (id, label) VALUES (1, 'a'), (1, 'b')", &[])
            .await,
        Err(DbError::IntegrityError(_))
    ));
}

#[tokio::test]
async fn test_fetch_with_joins_and_prefetch() {
    let (_dir, client) = client_with(
        "CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT);
         CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT, author_id INTEGER);
         CREATE TABLE reviews (id INTEGER PRIMARY KEY, book_id INTEGER, stars INTEGER);
         INSERT INTO authors (id, name) VALUES (1, 'Le Guin');
         INSERT INTO books (id, title, author_id) VALUES (1, 'Earthsea', 1), (2, 'Anonymous', NULL);
         INSERT INTO reviews (book_id, stars) VALUES (1, 5), (1, 4);",
    )
    .await;

    let select = Select::new("books", &["id", "title", "author_id"])
        .primary_key("id")
        .join(Join::new("author", "authors", &["id", "name"], "author_id", "id").primary_key("id"))
        .order_by(Order::asc("id"));
    let reviews = Prefetch::new("reviews", "reviews", &["id", "stars"], "book_id").primary_key("id");
    let books = client.fetch(&select, &[reviews]).await.unwrap();
    assert_eq!(books.len(), 2);

    let earthsea = &books[0];
    assert_eq!(earthsea.identity(), Some(&Value::Int(1)));
    let author = earthsea.relation("author").unwrap();
    assert_eq!(author.get("name"), Some(&Value::Text("Le Guin".into())));
    assert_eq!(author.identity(), Some(&Value::Int(1)));
    let stars: Vec<i64> = earthsea
        .prefetched("reviews")
        .unwrap()
        .iter()
        .filter_map(|r| r.get("stars").and_then(Value::as_i64))
        .collect();
    assert_eq!(stars.len(), 2);
    assert!(stars.contains(&5) && stars.contains(&4));

    let anonymous = &books[1];
    assert!(anonymous.has_relation("author"));
    assert!(anonymous.relation("author").is_none());
    assert_eq!(anonymous.prefetched("reviews").unwrap().len(), 0);

    // filters on a joined alias
    let select = select.filter(Criterion::new("author.name", Operator::IStartsWith, "le"));
    let books = client.fetch(&select, &[]).await.unwrap();
    assert_eq!(books.len(), 1);
}

#[tokio::test]
async fn test_prefetch_splits_keys_into_batches() {
    let (_dir, client) = client_with(
        "CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT);
         CREATE TABLE comments (id INTEGER PRIMARY KEY, post_id INTEGER, body TEXT);
         INSERT INTO posts (id, title) VALUES (1, 'a'), (2, 'b'), (3, 'c'), (4, 'd'), (5, 'e');
         INSERT INTO comments (post_id, body) VALUES (1, 'x'), (3, 'y'), (3, 'z'), (5, 'w');",
    )
    .await;

    let select = Select::new("posts", &["id", "title"])
        .primary_key("id")
        .order_by(Order::asc("id"));
    let comments = Prefetch::new("comments", "comments", &["id", "body"], "post_id").batch_size(2);
    let posts = client.fetch(&select, &[comments]).await.unwrap();

    let counts: Vec<usize> = posts
        .iter()
        .map(|p| p.prefetched("comments").unwrap().len())
        .collect();
    assert_eq!(counts, vec![1, 0, 2, 0, 1]);
    assert_eq!(labels(posts[2].prefetched("comments").unwrap(), "body").len(), 2);
}

#[tokio::test]
async fn test_update_with_order_and_limit() {
    let (_dir, client) = client_with(
        "CREATE TABLE jobs (id INTEGER PRIMARY KEY, state TEXT);
         INSERT INTO jobs (state) VALUES ('queued'), ('queued'), ('queued'), ('done');",
    )
    .await;

    let claim = Update::new("jobs")
        .set("state", "claimed")
        .filter(Criterion::parse("state", "queued"))
        .order_by(Order::desc("id"))
        .limit(2);
    assert_eq!(client.update(&claim).await.unwrap(), 2);

    let claimed = Select::new("jobs", &["id"])
        .filter(Criterion::parse("state", "claimed"))
        .order_by(Order::asc("id"));
    let ids: Vec<Value> = client
        .fetch(&claimed, &[])
        .await
        .unwrap()
        .iter()
        .filter_map(|r| r.get("id").cloned())
        .collect();
    assert_eq!(ids, vec![Value::Int(2), Value::Int(3)]);
}

#[tokio::test]
async fn test_in_transaction_commits_and_rolls_back() {
    let (_dir, client) = client_with(ITEMS).await;

    let id = client
        .in_transaction(|tx| async move {
            tx.execute_insert("INSERT INTO items (label) VALUES (?1)", &["kept".into()])
                .await
        })
        .await
        .unwrap();
    assert_eq!(id, Some(1));

    let result: crate::Result<()> = client
        .in_transaction(|tx| async move {
            tx.execute("INSERT INTO items (label) VALUES (?1)", &["lost".into()])
                .await?;
            Err(DbError::ConfigError("abort".into()))
        })
        .await;
    assert!(matches!(result, Err(DbError::ConfigError(_))));

    // a body that finalizes on its own is not finalized twice
    client
        .in_transaction(|tx| async move {
            tx.rollback().await?;
            assert_eq!(tx.state(), TxState::Finalized);
            Ok(())
        })
        .await
        .unwrap();

    let (count, rows) = client.execute_query("SELECT label FROM items", &[]).await.unwrap();
    assert_eq!(count, 1);
    assert_eq!(rows[0].get("label"), Some(&Value::Text("kept".into())));
}

#[tokio::test]
async fn test_client_close_and_admin_operations() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("admin.db");
    let config = ClientConfig::new(path.to_str().unwrap()).drivers(vec![DriverKind::Sqlite]);
    let client = Client::new(config).unwrap();
    assert!(!client.pool().is_open());

    client.create_database().await.unwrap();
    assert!(path.exists());

    client.execute_script(ITEMS).await.unwrap();
    assert!(client.pool().is_open());
    client.close().await;
    client.close().await;
    assert_eq!(client.pool().open_count(), 0);

    client.drop_database().await.unwrap();
    assert!(!path.exists());
    client.drop_database().await.unwrap();
}

#[test]
fn test_client_rejects_bad_config() {
    let config = ClientConfig::new("x").drivers(vec![]);
    assert!(matches!(Client::new(config), Err(DbError::ConfigError(_))));

    let config = ClientConfig::new("x").min_size(3).max_size(2);
    assert!(matches!(Client::new(config), Err(DbError::ConfigError(_))));
}
