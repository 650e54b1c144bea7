//! connkit - a pooled, transactional database client.
//!
//! One client API over several wire drivers (PostgreSQL, SQLite), with a
//! bounded connection pool, transaction contexts, dialect-aware filter
//! compilation and relation-aware result materialization.
//!
//! ```ignore
//! use connkit::{Client, ClientConfig, Criterion, Select};
//!
//! let client = Client::connect(ClientConfig::from_url("sqlite://app.db")?).await?;
//! client.execute_script("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)").await?;
//! let id = client.execute_insert("INSERT INTO users (name) VALUES (?1)", &["ann".into()]).await?;
//! let users = client
//!     .fetch(&Select::new("users", &["id", "name"]).filter(Criterion::parse("name__istartswith", "a")), &[])
//!     .await?;
//! ```

#[cfg(not(any(feature = "postgres", feature = "sqlite")))]
compile_error!("connkit needs at least one driver feature: `postgres` or `sqlite`");

pub mod client;
pub mod config;
pub mod dialect;
pub mod driver;
pub mod error;
pub mod materialize;
pub mod pool;
pub mod transaction;
pub mod translate;
pub mod value;

#[cfg(feature = "postgres")]
pub mod pg;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(all(test, feature = "sqlite"))]
mod tests;

pub use client::Client;
pub use config::{merge_options, ClientConfig, DriverOptions};
pub use dialect::{BuiltQuery, Criterion, Dialect, Join, Operand, Operator, Order, Select, Update};
pub use driver::{probe, select_driver, DriverHandle, DriverKind};
pub use error::{DbError, Result};
pub use materialize::{JoinSlice, Prefetch, Record, RowShape};
pub use pool::{ConnectionPool, PooledConnection};
pub use transaction::{TransactionContext, TxState};
pub use translate::{translate, NativeError};
pub use value::{Row, Value, ValueKey};
