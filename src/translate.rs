//! Error Translator: native driver errors onto the canonical taxonomy.
//!
//! Every call into a driver goes through [`guarded`] (or [`translate`]
//! directly), so nothing above the driver layer sees a driver error type
//! except inside [`DbError::Native`], which is reserved for failures outside
//! the known set.

use std::fmt;
use std::future::Future;

use crate::error::DbError;

#[cfg(feature = "postgres")]
use crate::pg::PgError;
#[cfg(feature = "sqlite")]
use crate::sqlite::SqliteError;

/// An error raised by one of the compiled-in drivers.
#[derive(Debug)]
pub enum NativeError {
    #[cfg(feature = "postgres")]
    Postgres(PgError),
    #[cfg(feature = "sqlite")]
    Sqlite(SqliteError),
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "postgres")]
            NativeError::Postgres(e) => fmt::Display::fmt(e, f),
            #[cfg(feature = "sqlite")]
            NativeError::Sqlite(e) => fmt::Display::fmt(e, f),
            #[allow(unreachable_patterns)]
            _ => Ok(()),
        }
    }
}

impl std::error::Error for NativeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            #[cfg(feature = "postgres")]
            NativeError::Postgres(e) => std::error::Error::source(e),
            #[cfg(feature = "sqlite")]
            NativeError::Sqlite(e) => std::error::Error::source(e),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }
}

#[cfg(feature = "postgres")]
impl From<PgError> for NativeError {
    fn from(e: PgError) -> Self {
        NativeError::Postgres(e)
    }
}

#[cfg(feature = "sqlite")]
impl From<SqliteError> for NativeError {
    fn from(e: SqliteError) -> Self {
        NativeError::Sqlite(e)
    }
}

/// Map a native driver error onto its canonical kind.
///
/// Each known native class maps to exactly one canonical kind and keeps its
/// original message. Anything unrecognised comes back as
/// [`DbError::Native`] with the error untouched.
pub fn translate(err: impl Into<NativeError>) -> DbError {
    let err = err.into();
    match err {
        #[cfg(feature = "postgres")]
        NativeError::Postgres(e) => translate_postgres(e),
        #[cfg(feature = "sqlite")]
        NativeError::Sqlite(e) => translate_sqlite(e),
        #[allow(unreachable_patterns)]
        other => DbError::Native(other),
    }
}

/// Await a driver future, translating its error.
pub async fn guarded<T, E, F>(fut: F) -> Result<T, DbError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<NativeError>,
{
    fut.await.map_err(translate)
}

#[cfg(feature = "postgres")]
fn translate_postgres(err: PgError) -> DbError {
    match err {
        PgError::Io(_) | PgError::Auth(_) | PgError::ConnectionClosed | PgError::Timeout => {
            DbError::ConnectionError(err.to_string())
        }
        PgError::Server { ref code, .. } => {
            let message = err.to_string();
            // SQLSTATE class is the first two characters
            match code.get(..2) {
                Some("23") => DbError::IntegrityError(message),
                // connection exception, invalid authorization
                Some("08") | Some("28") => DbError::ConnectionError(message),
                _ => DbError::OperationalError {
                    code: Some(code.clone()),
                    message,
                },
            }
        }
        PgError::Protocol(_) | PgError::Type(_) => DbError::Native(NativeError::Postgres(err)),
    }
}

#[cfg(feature = "sqlite")]
fn translate_sqlite(err: SqliteError) -> DbError {
    use rusqlite::ErrorCode;

    match err {
        SqliteError::Sqlite(rusqlite::Error::SqliteFailure(ref failure, _)) => {
            let message = err.to_string();
            match failure.code {
                ErrorCode::ConstraintViolation => DbError::IntegrityError(message),
                ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::PermissionDenied => {
                    DbError::ConnectionError(message)
                }
                code => DbError::OperationalError {
                    code: Some(format!("{:?}", code)),
                    message,
                },
            }
        }
        SqliteError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
            DbError::operational(err.to_string(), Some("ENOENT"))
        }
        SqliteError::Io(_) | SqliteError::ConnectionClosed => DbError::ConnectionError(err.to_string()),
        other => DbError::Native(NativeError::Sqlite(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "postgres")]
    fn server_error(code: &str, message: &str) -> PgError {
        PgError::Server {
            severity: "ERROR".to_string(),
            code: code.to_string(),
            message: message.to_string(),
            detail: None,
            hint: None,
        }
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn test_postgres_sqlstate_classes() {
        let err = translate(server_error("23505", "duplicate key value"));
        match err {
            DbError::IntegrityError(msg) => assert!(msg.contains("duplicate key value")),
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            translate(server_error("28P01", "password authentication failed")),
            DbError::ConnectionError(_)
        ));
        assert!(matches!(
            translate(server_error("08006", "connection failure")),
            DbError::ConnectionError(_)
        ));

        match translate(server_error("42601", "syntax error at or near \"SELEC\"")) {
            DbError::OperationalError { code, message } => {
                assert_eq!(code.as_deref(), Some("42601"));
                assert!(message.contains("syntax error"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let missing = translate(server_error("3D000", "database \"nope\" does not exist"));
        assert!(missing.is_missing_object());
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn test_postgres_transport_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(translate(PgError::Io(io)), DbError::ConnectionError(_)));
        assert!(matches!(translate(PgError::Timeout), DbError::ConnectionError(_)));
        assert!(matches!(
            translate(PgError::Auth("Password required".into())),
            DbError::ConnectionError(_)
        ));
        assert!(matches!(translate(PgError::ConnectionClosed), DbError::ConnectionError(_)));
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn test_postgres_unknown_passes_through() {
        match translate(PgError::Protocol("unexpected message".into())) {
            DbError::Native(NativeError::Postgres(PgError::Protocol(msg))) => {
                assert_eq!(msg, "unexpected message")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(feature = "sqlite")]
    fn sqlite_failure(code: std::os::raw::c_int, msg: &str) -> SqliteError {
        SqliteError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(code),
            Some(msg.to_string()),
        ))
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_sqlite_failure_codes() {
        match translate(sqlite_failure(
            rusqlite::ffi::SQLITE_CONSTRAINT,
            "UNIQUE constraint failed: users.email",
        )) {
            DbError::IntegrityError(msg) => {
                assert!(msg.contains("UNIQUE constraint failed: users.email"))
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            translate(sqlite_failure(rusqlite::ffi::SQLITE_CANTOPEN, "unable to open")),
            DbError::ConnectionError(_)
        ));

        match translate(sqlite_failure(rusqlite::ffi::SQLITE_ERROR, "no such table: t")) {
            DbError::OperationalError { code, .. } => assert_eq!(code.as_deref(), Some("Unknown")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_sqlite_io_errors() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = translate(SqliteError::Io(missing));
        assert!(err.is_missing_object());

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(translate(SqliteError::Io(denied)), DbError::ConnectionError(_)));
        assert!(matches!(
            translate(SqliteError::ConnectionClosed),
            DbError::ConnectionError(_)
        ));
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_sqlite_unknown_passes_through() {
        let err = translate(SqliteError::InvalidOption("invalid pragma name: x y".into()));
        match err {
            DbError::Native(NativeError::Sqlite(SqliteError::InvalidOption(msg))) => {
                assert_eq!(msg, "invalid pragma name: x y")
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = translate(SqliteError::Sqlite(rusqlite::Error::InvalidColumnIndex(9)));
        assert!(matches!(err, DbError::Native(_)));
        assert!(err.to_string().starts_with("SQLite error:"));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_guarded_translates() {
        let result: Result<(), DbError> =
            guarded(async { Err::<(), _>(SqliteError::ConnectionClosed) }).await;
        assert!(matches!(result, Err(DbError::ConnectionError(_))));

        let ok: Result<i32, DbError> = guarded(async { Ok::<_, SqliteError>(7) }).await;
        assert_eq!(ok.unwrap(), 7);
    }
}
