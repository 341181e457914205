//! Translation of native engine errors

use super::error::{DataAccessError, DataAccessErrorKind, DatabaseError};
use tracing::debug;

/// Maps a native engine error onto a [`DataAccessError`]
pub trait ErrorTranslator: Send + Sync {
    fn translate(&self, error: DatabaseError) -> DataAccessError;
}

/// Translator covering the errors of the bundled backends
///
/// | native error                                  | kind              |
/// |-----------------------------------------------|-------------------|
/// | locked / busy / deadlock                      | `ResourceLocked`  |
/// | not storable, type mismatch, bad parameters   | `InvalidUsage`    |
/// | I/O, connection lost, closed, cannot open     | `ResourceFailure` |
/// | anything else                                 | `Unknown`         |
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorTranslator;

impl DefaultErrorTranslator {
    pub fn new() -> Self {
        Self
    }

    /// Classify a native error without consuming it
    pub fn classify(&self, error: &DatabaseError) -> DataAccessErrorKind {
        match error {
            DatabaseError::DatabaseLocked(_) => DataAccessErrorKind::ResourceLocked,
            DatabaseError::NotStorable(_) | DatabaseError::TypeMismatch { .. } => {
                DataAccessErrorKind::InvalidUsage
            }
            DatabaseError::ConnectionError(_)
            | DatabaseError::ConnectionClosed
            | DatabaseError::IoError(_)
            | DatabaseError::PoolError(_) => DataAccessErrorKind::ResourceFailure,
            #[cfg(feature = "sqlite")]
            DatabaseError::SqliteError(e) => classify_sqlite(e),
            #[cfg(feature = "postgres")]
            DatabaseError::PostgresError(e) => classify_postgres(e),
            DatabaseError::QueryError(_)
            | DatabaseError::QueryTimeout { .. }
            | DatabaseError::Other(_) => DataAccessErrorKind::Unknown,
        }
    }
}

impl ErrorTranslator for DefaultErrorTranslator {
    fn translate(&self, error: DatabaseError) -> DataAccessError {
        let kind = self.classify(&error);
        debug!(%kind, error = %error, "translated engine error");
        let message = error.to_string();
        DataAccessError::new(kind, message, error)
    }
}

#[cfg(feature = "sqlite")]
fn classify_sqlite(error: &rusqlite::Error) -> DataAccessErrorKind {
    use rusqlite::ErrorCode;

    match error {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                DataAccessErrorKind::ResourceLocked
            }
            ErrorCode::TypeMismatch | ErrorCode::TooBig | ErrorCode::ParameterOutOfRange => {
                DataAccessErrorKind::InvalidUsage
            }
            ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull
            | ErrorCode::ReadOnly
            | ErrorCode::DatabaseCorrupt
            | ErrorCode::NotADatabase => DataAccessErrorKind::ResourceFailure,
            _ => DataAccessErrorKind::Unknown,
        },
        rusqlite::Error::InvalidParameterCount(..)
        | rusqlite::Error::InvalidParameterName(_)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::ToSqlConversionFailure(_)
        | rusqlite::Error::FromSqlConversionFailure(..) => DataAccessErrorKind::InvalidUsage,
        rusqlite::Error::InvalidPath(_) => DataAccessErrorKind::ResourceFailure,
        _ => DataAccessErrorKind::Unknown,
    }
}

#[cfg(feature = "postgres")]
fn classify_postgres(error: &tokio_postgres::Error) -> DataAccessErrorKind {
    use tokio_postgres::error::SqlState;

    if error.is_closed() {
        return DataAccessErrorKind::ResourceFailure;
    }
    match error.code() {
        Some(code)
            if *code == SqlState::LOCK_NOT_AVAILABLE
                || *code == SqlState::T_R_DEADLOCK_DETECTED =>
        {
            DataAccessErrorKind::ResourceLocked
        }
        Some(code)
            if *code == SqlState::DATATYPE_MISMATCH
                || *code == SqlState::INVALID_PARAMETER_VALUE
                || *code == SqlState::STRING_DATA_RIGHT_TRUNCATION =>
        {
            DataAccessErrorKind::InvalidUsage
        }
        Some(code)
            if *code == SqlState::CONNECTION_EXCEPTION
                || *code == SqlState::CONNECTION_FAILURE
                || *code == SqlState::IO_ERROR =>
        {
            DataAccessErrorKind::ResourceFailure
        }
        _ => DataAccessErrorKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_errors_map_to_kinds() {
        let translator = DefaultErrorTranslator::new();
        let cases = [
            (DatabaseError::locked("busy"), DataAccessErrorKind::ResourceLocked),
            (DatabaseError::not_storable("blob"), DataAccessErrorKind::InvalidUsage),
            (
                DatabaseError::type_mismatch("integer", "text"),
                DataAccessErrorKind::InvalidUsage,
            ),
            (DatabaseError::ConnectionClosed, DataAccessErrorKind::ResourceFailure),
            (
                DatabaseError::IoError(std::io::Error::new(std::io::ErrorKind::Other, "disk")),
                DataAccessErrorKind::ResourceFailure,
            ),
            (DatabaseError::query("syntax"), DataAccessErrorKind::Unknown),
        ];

        for (error, expected) in cases {
            assert_eq!(translator.translate(error).kind(), expected);
        }
    }

    #[test]
    fn test_translation_keeps_source() {
        use std::error::Error;

        let translated = DefaultErrorTranslator.translate(DatabaseError::locked("file.db"));
        assert!(translated.message.contains("file.db"));
        assert!(translated.source().is_some());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_sqlite_busy_is_resource_locked() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert_eq!(
            DefaultErrorTranslator.classify(&DatabaseError::from(busy)),
            DataAccessErrorKind::ResourceLocked
        );

        let misuse = rusqlite::Error::InvalidParameterCount(1, 2);
        assert_eq!(
            DefaultErrorTranslator.classify(&DatabaseError::from(misuse)),
            DataAccessErrorKind::InvalidUsage
        );
    }
}
