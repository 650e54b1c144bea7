//! SQLite driver.
//!
//! Built on rusqlite with tokio-rusqlite running each connection on its own
//! background thread, so statements never block the async runtime.

pub mod connection;
pub mod error;
pub mod types;

#[cfg(test)]
mod tests;

pub use connection::{QueryResult, SqliteConnection};
pub use error::{SqliteError, SqliteResult};
