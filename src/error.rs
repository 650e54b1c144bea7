//! Canonical error taxonomy surfaced to callers.
//!
//! Driver errors never reach callers directly: the translator in
//! [`crate::translate`] maps them onto these kinds. Errors the translator
//! does not recognise are carried unmodified in [`DbError::Native`].

use thiserror::Error;

use crate::translate::NativeError;

/// SQLSTATE / errno codes that mean "the object does not exist".
const MISSING_OBJECT_CODES: &[&str] = &[
    "3D000", // invalid_catalog_name (database)
    "42P01", // undefined_table
    "42704", // undefined_object
    "ENOENT",
];

#[derive(Error, Debug)]
pub enum DbError {
    /// Handshake, authentication or network failure.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Server-side execution failure unrelated to data integrity.
    #[error("Operational error: {message}")]
    OperationalError {
        message: String,
        /// Driver error code (SQLSTATE, SQLite result code name, errno name)
        code: Option<String>,
    },

    /// Constraint violation (unique, foreign key, not null, check).
    #[error("Integrity error: {0}")]
    IntegrityError(String),

    /// Commit/rollback on a finalized transaction, or a transaction
    /// operation outside an active context.
    #[error("Transaction management error: {0}")]
    TransactionManagementError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Operator or statement shape the target dialect cannot express.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A driver error outside the known set, passed through untouched.
    #[error(transparent)]
    Native(NativeError),
}

impl DbError {
    pub(crate) fn operational(message: impl Into<String>, code: Option<&str>) -> Self {
        DbError::OperationalError {
            message: message.into(),
            code: code.map(str::to_string),
        }
    }

    pub(crate) fn transaction(message: impl Into<String>) -> Self {
        DbError::TransactionManagementError(message.into())
    }

    /// Whether this is the "object does not exist" class of operational error.
    pub fn is_missing_object(&self) -> bool {
        match self {
            DbError::OperationalError {
                code: Some(code), ..
            } => MISSING_OBJECT_CODES.contains(&code.as_str()),
            _ => false,
        }
    }

    /// Whether the failure invalidates the connection it happened on.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, DbError::ConnectionError(_))
    }

    /// Re-classify a canonical failure as a connection error.
    ///
    /// Used while opening the pool, where any handshake failure is fatal for
    /// the `open()` call. Native errors stay native.
    pub(crate) fn into_connection_error(self) -> Self {
        match self {
            DbError::Native(_) | DbError::ConnectionError(_) => self,
            other => DbError::ConnectionError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
