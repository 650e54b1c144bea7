//! PostgreSQL wire protocol driver.
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `connection`: Connection state machine, authentication and queries
//! - `types`: Text-format value encoding/decoding
//! - `scram`: SCRAM-SHA-256 client

pub mod connection;
pub mod error;
pub mod protocol;
pub mod scram;
pub mod types;


pub use connection::{PgConfig, PgConnection, QueryResult};
pub use error::{PgError, PgResult};
pub use types::Oid;
