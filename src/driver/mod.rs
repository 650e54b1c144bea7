//! Driver Registry.
//!
//! A static, ordered table of the wire drivers this build knows about. The
//! client probes a preference list against it once, at construction, and
//! every connection afterwards goes through the selected [`DriverHandle`].

use serde::{Deserialize, Serialize};

use crate::config::ClientConfig;
use crate::dialect::Dialect;
use crate::error::{DbError, Result};
use crate::translate::guarded;
use crate::value::{Row, Value};

#[cfg(feature = "postgres")]
use crate::pg::{PgConfig, PgConnection};
#[cfg(feature = "sqlite")]
use crate::sqlite::SqliteConnection;

/// Database used when connecting "without a database" for admin statements.
const DEFAULT_MAINTENANCE_DB: &str = "postgres";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Postgres,
    Sqlite,
}

impl DriverKind {
    pub fn name(self) -> &'static str {
        match self {
            DriverKind::Postgres => "postgres",
            DriverKind::Sqlite => "sqlite",
        }
    }

    pub fn dialect(self) -> Dialect {
        match self {
            DriverKind::Postgres => Dialect::Postgres,
            DriverKind::Sqlite => Dialect::Sqlite,
        }
    }

    pub fn default_port(self) -> Option<u16> {
        match self {
            DriverKind::Postgres => Some(5432),
            DriverKind::Sqlite => None,
        }
    }

    /// Whether the driver reports the generated key of an INSERT itself.
    pub fn native_lastrowid(self) -> bool {
        matches!(self, DriverKind::Sqlite)
    }
}

struct RegistryEntry {
    kind: DriverKind,
    compiled: bool,
}

/// Known drivers in fixed priority order.
static REGISTRY: &[RegistryEntry] = &[
    RegistryEntry {
        kind: DriverKind::Postgres,
        compiled: cfg!(feature = "postgres"),
    },
    RegistryEntry {
        kind: DriverKind::Sqlite,
        compiled: cfg!(feature = "sqlite"),
    },
];

/// Whether `kind` is available in this build.
pub fn probe(kind: DriverKind) -> bool {
    REGISTRY.iter().any(|entry| entry.kind == kind && entry.compiled)
}

/// Pick the first available driver from `preference`.
///
/// Fails with `ConfigError` if none of them is available; callers treat this
/// as fatal and do not retry.
pub fn select_driver(preference: &[DriverKind]) -> Result<DriverHandle> {
    match preference.iter().copied().find(|kind| probe(*kind)) {
        Some(kind) => {
            tracing::debug!(driver = kind.name(), "selected database driver");
            Ok(DriverHandle { kind })
        }
        None => {
            let available: Vec<&str> = REGISTRY
                .iter()
                .filter(|entry| entry.compiled)
                .map(|entry| entry.kind.name())
                .collect();
            Err(DbError::ConfigError(format!(
                "no database driver available for preference {:?} (compiled in: {:?})",
                preference.iter().map(|k| k.name()).collect::<Vec<_>>(),
                available
            )))
        }
    }
}

/// The driver selected for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverHandle {
    kind: DriverKind,
}

impl DriverHandle {
    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    pub fn dialect(&self) -> Dialect {
        self.kind.dialect()
    }

    /// Open one physical connection.
    ///
    /// With `with_database == false` the connection does not select the
    /// configured database: PostgreSQL connects to the maintenance database
    /// (`options["maintenance_db"]`, default `postgres`) and SQLite opens an
    /// in-memory database.
    pub async fn connect(&self, config: &ClientConfig, with_database: bool) -> Result<DriverConnection> {
        match self.kind {
            #[cfg(feature = "postgres")]
            DriverKind::Postgres => {
                let database = (!with_database).then(|| {
                    config
                        .options
                        .get("maintenance_db")
                        .map(String::as_str)
                        .unwrap_or(DEFAULT_MAINTENANCE_DB)
                });
                let pg_config = PgConfig::from_client(config, database);
                let conn = guarded(PgConnection::connect(pg_config)).await?;
                Ok(DriverConnection::Postgres(conn))
            }
            #[cfg(feature = "sqlite")]
            DriverKind::Sqlite => {
                let path = if with_database { config.database.as_str() } else { ":memory:" };
                let conn = guarded(SqliteConnection::open(path, &config.options)).await?;
                Ok(DriverConnection::Sqlite(conn))
            }
            #[allow(unreachable_patterns)]
            other => Err(DbError::ConfigError(format!(
                "driver {} is not compiled in",
                other.name()
            ))),
        }
    }
}

/// Normalized result of one statement.
#[derive(Debug, Default)]
pub struct DriverResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Rows returned (queries) or changed (DML)
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// One physical connection of the selected driver.
pub enum DriverConnection {
    #[cfg(feature = "postgres")]
    Postgres(PgConnection),
    #[cfg(feature = "sqlite")]
    Sqlite(SqliteConnection),
}

impl DriverConnection {
    pub fn kind(&self) -> DriverKind {
        match self {
            #[cfg(feature = "postgres")]
            DriverConnection::Postgres(_) => DriverKind::Postgres,
            #[cfg(feature = "sqlite")]
            DriverConnection::Sqlite(_) => DriverKind::Sqlite,
        }
    }

    /// Execute one parameterized statement.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<DriverResult> {
        match self {
            #[cfg(feature = "postgres")]
            DriverConnection::Postgres(conn) => {
                let result = guarded(conn.query(sql, params)).await?;
                let last_insert_id = result.returned_id();
                let rows_affected = if result.command_tag.is_empty() {
                    result.rows.len() as u64
                } else {
                    result.rows_affected()
                };
                Ok(DriverResult {
                    columns: result.columns,
                    rows: result.rows,
                    rows_affected,
                    last_insert_id,
                })
            }
            #[cfg(feature = "sqlite")]
            DriverConnection::Sqlite(conn) => {
                let result = guarded(conn.execute(sql, params)).await?;
                Ok(DriverResult {
                    columns: result.columns,
                    rows: result.rows,
                    rows_affected: result.rows_affected,
                    last_insert_id: result.last_insert_id,
                })
            }
        }
    }

    /// Execute a script of one or more statements, discarding results.
    pub async fn execute_script(&mut self, sql: &str) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            DriverConnection::Postgres(conn) => guarded(conn.simple_query(sql)).await.map(drop),
            #[cfg(feature = "sqlite")]
            DriverConnection::Sqlite(conn) => guarded(conn.execute_batch(sql)).await,
        }
    }

    pub async fn begin(&mut self) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            DriverConnection::Postgres(conn) => guarded(conn.begin()).await,
            #[cfg(feature = "sqlite")]
            DriverConnection::Sqlite(conn) => guarded(conn.begin()).await,
        }
    }

    pub async fn commit(&mut self) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            DriverConnection::Postgres(conn) => guarded(conn.commit()).await,
            #[cfg(feature = "sqlite")]
            DriverConnection::Sqlite(conn) => guarded(conn.commit()).await,
        }
    }

    pub async fn rollback(&mut self) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            DriverConnection::Postgres(conn) => guarded(conn.rollback()).await,
            #[cfg(feature = "sqlite")]
            DriverConnection::Sqlite(conn) => guarded(conn.rollback()).await,
        }
    }

    /// Create database `name` (a file path for SQLite).
    pub async fn create_database(&mut self, name: &str) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            DriverConnection::Postgres(conn) => guarded(conn.create_database(name)).await,
            #[cfg(feature = "sqlite")]
            DriverConnection::Sqlite(conn) => guarded(conn.create_database(name)).await,
        }
    }

    pub async fn drop_database(&mut self, name: &str) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            DriverConnection::Postgres(conn) => guarded(conn.drop_database(name)).await,
            #[cfg(feature = "sqlite")]
            DriverConnection::Sqlite(conn) => guarded(conn.drop_database(name)).await,
        }
    }

    /// Whether the transport is known to be dead.
    pub fn is_closed(&self) -> bool {
        match self {
            #[cfg(feature = "postgres")]
            DriverConnection::Postgres(conn) => conn.is_closed(),
            #[cfg(feature = "sqlite")]
            DriverConnection::Sqlite(_) => false,
        }
    }

    pub async fn close(self) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            DriverConnection::Postgres(mut conn) => guarded(conn.close()).await,
            #[cfg(feature = "sqlite")]
            DriverConnection::Sqlite(conn) => guarded(conn.close()).await,
        }
    }
}
