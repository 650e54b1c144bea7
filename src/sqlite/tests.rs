//! Tests for SQLite driver.

use std::collections::BTreeMap;

use super::*;
use crate::value::Value;

async fn open_memory() -> SqliteConnection {
    SqliteConnection::open(":memory:", &BTreeMap::new()).await.unwrap()
}

#[tokio::test]
async fn test_execute_and_query() {
    let conn = open_memory().await;

    conn.execute_batch("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT, value REAL)")
        .await
        .unwrap();

    let insert = conn
        .execute(
            "INSERT INTO test (name, value) VALUES (?, ?)",
            &[Value::Text("hello".to_string()), Value::Float(1.5)],
        )
        .await
        .unwrap();
    assert_eq!(insert.rows_affected, 1);
    assert_eq!(insert.last_insert_id, Some(1));
    assert!(insert.columns.is_empty());

    let result = conn.execute("SELECT * FROM test", &[]).await.unwrap();
    assert_eq!(result.columns, vec!["id", "name", "value"]);
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows_affected, 1);
    assert_eq!(result.last_insert_id, None);
    assert_eq!(result.rows[0][1], Value::Text("hello".to_string()));
    assert_eq!(result.rows[0][2], Value::Float(1.5));
}

#[tokio::test]
async fn test_update_reports_changes_without_rowid() {
    let conn = open_memory().await;
    conn.execute_batch(
        "CREATE TABLE test (id INTEGER PRIMARY KEY, n INTEGER);
         INSERT INTO test (n) VALUES (1), (2), (3);",
    )
    .await
    .unwrap();

    let result = conn
        .execute("UPDATE test SET n = n + 1 WHERE n > ?", &[Value::Int(1)])
        .await
        .unwrap();
    assert_eq!(result.rows_affected, 2);
    assert_eq!(result.last_insert_id, None);
}

#[tokio::test]
async fn test_null_and_blob_values() {
    let conn = open_memory().await;
    conn.execute_batch("CREATE TABLE test (id INTEGER, name TEXT, data BLOB)")
        .await
        .unwrap();

    let data = vec![0xDE, 0xAD, 0xBE, 0xEF];
    conn.execute(
        "INSERT INTO test (id, name, data) VALUES (?, ?, ?)",
        &[Value::Int(1), Value::Null, Value::Bytes(data.clone())],
    )
    .await
    .unwrap();

    let result = conn.execute("SELECT name, data FROM test", &[]).await.unwrap();
    assert_eq!(result.rows[0][0], Value::Null);
    assert_eq!(result.rows[0][1], Value::Bytes(data));
}

#[tokio::test]
async fn test_regexp_function() {
    let conn = open_memory().await;
    conn.execute_batch(
        "CREATE TABLE test (name TEXT);
         INSERT INTO test VALUES ('alpha-1'), ('beta'), (NULL);",
    )
    .await
    .unwrap();

    let result = conn
        .execute(
            "SELECT name FROM test WHERE name REGEXP ?",
            &[Value::Text("^[a-z]+-[0-9]$".into())],
        )
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0][0], Value::Text("alpha-1".into()));
}

#[tokio::test]
async fn test_options_become_pragmas() {
    let mut options = BTreeMap::new();
    options.insert("foreign_keys".to_string(), "ON".to_string());
    let conn = SqliteConnection::open(":memory:", &options).await.unwrap();

    let result = conn.execute("PRAGMA foreign_keys", &[]).await.unwrap();
    assert_eq!(result.rows[0][0], Value::Int(1));

    options.insert("bad name".to_string(), "1".to_string());
    assert!(matches!(
        SqliteConnection::open(":memory:", &options).await,
        Err(SqliteError::InvalidOption(_))
    ));
}

#[tokio::test]
async fn test_constraint_violation_surfaces_as_sqlite_error() {
    let conn = open_memory().await;
    conn.execute_batch("CREATE TABLE test (id INTEGER PRIMARY KEY)")
        .await
        .unwrap();
    conn.execute("INSERT INTO test (id) VALUES (1)", &[]).await.unwrap();

    let err = conn
        .execute("INSERT INTO test (id) VALUES (1)", &[])
        .await
        .unwrap_err();
    match err {
        SqliteError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
            assert_eq!(e.code, rusqlite::ErrorCode::ConstraintViolation);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_transaction_rollback() {
    let conn = open_memory().await;
    conn.execute_batch("CREATE TABLE test (id INTEGER)").await.unwrap();

    conn.begin().await.unwrap();
    conn.execute("INSERT INTO test VALUES (1)", &[]).await.unwrap();
    conn.rollback().await.unwrap();

    let result = conn.execute("SELECT COUNT(*) FROM test", &[]).await.unwrap();
    assert_eq!(result.rows[0][0], Value::Int(0));
}

#[tokio::test]
async fn test_create_and_drop_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("created.db");
    let path = path.to_str().unwrap();

    let admin = open_memory().await;
    admin.create_database(path).await.unwrap();
    assert!(std::path::Path::new(path).exists());

    admin.drop_database(path).await.unwrap();
    assert!(!std::path::Path::new(path).exists());

    match admin.drop_database(path).await {
        Err(SqliteError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
        other => panic!("unexpected {other:?}"),
    }
    admin.close().await.unwrap();
}
