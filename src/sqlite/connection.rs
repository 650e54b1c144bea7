//! SQLite connection implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use tokio_rusqlite::Connection;

use super::error::{SqliteError, SqliteResult};
use super::types::value_from_ref;
use crate::value::{Row, Value};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result of a statement execution.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Rows returned for queries, rows changed for DML
    pub rows_affected: u64,
    /// Rowid of the last inserted row, for INSERT/REPLACE statements
    pub last_insert_id: Option<i64>,
}

/// A SQLite connection.
pub struct SqliteConnection {
    conn: Connection,
}

impl SqliteConnection {
    /// Open a SQLite database.
    ///
    /// Supports:
    /// - `:memory:` for in-memory database
    /// - File path for disk-based database (WAL mode is enabled)
    ///
    /// Each option is applied as `PRAGMA key = value`. A `regexp()` function
    /// is registered so `REGEXP` works.
    pub async fn open(path: &str, options: &BTreeMap<String, String>) -> SqliteResult<Self> {
        let is_memory = path == ":memory:";
        let conn = if is_memory {
            Connection::open_in_memory().await?
        } else {
            Connection::open(path).await?
        };

        let mut setup = String::new();
        if !is_memory {
            setup.push_str(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA busy_timeout=5000;
                 PRAGMA cache_size=-64000;",
            );
        }
        for (key, value) in options {
            setup.push_str(&pragma(key, value)?);
        }

        conn.call(move |c| {
            register_regexp(c)?;
            if !setup.is_empty() {
                c.execute_batch(&setup)?;
            }
            Ok(())
        })
        .await?;

        tracing::debug!(path, "sqlite connection opened");
        Ok(Self { conn })
    }

    /// Execute one statement.
    ///
    /// Statements that produce columns (SELECT, `RETURNING`, most PRAGMAs)
    /// are stepped for rows; everything else is executed for its change
    /// count.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> SqliteResult<QueryResult> {
        let sql = sql.to_string();
        let params: Vec<Value> = params.to_vec();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&sql)?;
                let readonly = stmt.readonly();
                let columns: Vec<String> =
                    stmt.column_names().iter().map(|s| s.to_string()).collect();

                let mut result = QueryResult {
                    columns,
                    ..Default::default()
                };

                if result.columns.is_empty() {
                    stmt.execute(rusqlite::params_from_iter(params.iter()))?;
                } else {
                    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
                    while let Some(row) = rows.next()? {
                        let mut values = Row::with_capacity(result.columns.len());
                        for i in 0..result.columns.len() {
                            values.push(value_from_ref(row.get_ref(i)?));
                        }
                        result.rows.push(values);
                    }
                }
                drop(stmt);

                if readonly {
                    result.rows_affected = result.rows.len() as u64;
                } else {
                    result.rows_affected = conn.changes() as u64;
                    if is_insert(&sql) && result.rows_affected > 0 {
                        result.last_insert_id = Some(conn.last_insert_rowid());
                    }
                }
                Ok(result)
            })
            .await
            .map_err(SqliteError::from)
    }

    /// Execute multiple statements (scripts, transaction control).
    pub async fn execute_batch(&self, sql: &str) -> SqliteResult<()> {
        let sql = sql.to_string();
        self.conn
            .call(move |conn| {
                conn.execute_batch(&sql)?;
                Ok(())
            })
            .await
            .map_err(SqliteError::from)
    }

    pub async fn begin(&self) -> SqliteResult<()> {
        self.execute_batch("BEGIN").await
    }

    pub async fn commit(&self) -> SqliteResult<()> {
        self.execute_batch("COMMIT").await
    }

    pub async fn rollback(&self) -> SqliteResult<()> {
        self.execute_batch("ROLLBACK").await
    }

    /// Create a database file by attaching it, which makes SQLite create it.
    pub async fn create_database(&self, path: &str) -> SqliteResult<()> {
        if path == ":memory:" {
            return Ok(());
        }
        let path = path.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("ATTACH DATABASE ?1 AS connkit_admin", [&path])?;
                let init = conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS connkit_admin.connkit_init (x);
                     DROP TABLE connkit_admin.connkit_init;",
                );
                conn.execute_batch("DETACH DATABASE connkit_admin")?;
                init?;
                Ok(())
            })
            .await
            .map_err(SqliteError::from)
    }

    /// Delete a database file and its WAL/SHM companions.
    ///
    /// A missing main file is reported as `Io(NotFound)`.
    pub async fn drop_database(&self, path: &str) -> SqliteResult<()> {
        if path == ":memory:" {
            return Ok(());
        }
        tokio::fs::remove_file(path).await?;
        for suffix in ["-wal", "-shm"] {
            match tokio::fs::remove_file(format!("{}{}", path, suffix)).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    /// Close the connection, waiting for the background thread to finish.
    pub async fn close(self) -> SqliteResult<()> {
        self.conn.close().await.map_err(SqliteError::from)
    }
}

/// Render one option as a PRAGMA statement.
fn pragma(key: &str, value: &str) -> SqliteResult<String> {
    let valid_key = !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_key {
        return Err(SqliteError::InvalidOption(format!("invalid pragma name: {}", key)));
    }
    let valid_value = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !valid_value {
        return Err(SqliteError::InvalidOption(format!(
            "invalid value for pragma {}: {}",
            key, value
        )));
    }
    Ok(format!("PRAGMA {}={};", key, value))
}

fn is_insert(sql: &str) -> bool {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("");
    keyword.eq_ignore_ascii_case("insert") || keyword.eq_ignore_ascii_case("replace")
}

/// Register `regexp(pattern, text)`, the function behind `text REGEXP pattern`.
///
/// The compiled pattern is cached per statement as auxiliary data.
fn register_regexp(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let regex: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> Result<_, BoxError> {
                Ok(Regex::new(vr.as_str()?)?)
            })?;
            let matched = match ctx.get_raw(1) {
                ValueRef::Null => false,
                ValueRef::Text(t) | ValueRef::Blob(t) => regex.is_match(&String::from_utf8_lossy(t)),
                ValueRef::Integer(i) => regex.is_match(&i.to_string()),
                ValueRef::Real(f) => regex.is_match(&f.to_string()),
            };
            Ok(matched)
        },
    )
}
