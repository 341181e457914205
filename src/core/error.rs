//! Error types for connection binding and transaction coordination
//!
//! Three layers are kept apart:
//! - [`DatabaseError`]: native failures reported by a backend engine
//! - [`DataAccessError`]: engine failures translated for application code
//! - [`TransactionError`]: failures of the coordination layer itself

use super::connection::DataSourceId;
use super::definition::IsolationLevel;
use chrono::{DateTime, Utc};

/// Result type alias for native engine operations
pub type DatabaseResult<T> = std::result::Result<T, DatabaseError>;

/// Result type alias for coordination-layer operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Native engine errors
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Connection could not be opened or was lost
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Operation attempted on a closed connection
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Statement execution error
    #[error("Query execution error: {0}")]
    QueryError(String),

    /// Statement timeout
    #[error("Query timeout after {timeout_ms}ms")]
    QueryTimeout { timeout_ms: u64 },

    /// The underlying database is locked by another owner
    #[error("Database is locked: {0}")]
    DatabaseLocked(String),

    /// The engine refused to store a value
    #[error("Value is not storable: {0}")]
    NotStorable(String),

    /// Type conversion error
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// SQLite error
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// PostgreSQL error
    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    PostgresError(#[from] tokio_postgres::Error),

    /// Embedded connection pool error
    #[error("Pool error: {0}")]
    PoolError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl DatabaseError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        DatabaseError::ConnectionError(msg.into())
    }

    /// Create a new query error
    pub fn query<S: Into<String>>(msg: S) -> Self {
        DatabaseError::QueryError(msg.into())
    }

    /// Create a query timeout error
    pub fn query_timeout(timeout_ms: u64) -> Self {
        DatabaseError::QueryTimeout { timeout_ms }
    }

    /// Create a database locked error
    pub fn locked<S: Into<String>>(msg: S) -> Self {
        DatabaseError::DatabaseLocked(msg.into())
    }

    /// Create a not-storable error
    pub fn not_storable<S: Into<String>>(msg: S) -> Self {
        DatabaseError::NotStorable(msg.into())
    }

    /// Create a new type mismatch error
    pub fn type_mismatch(expected: &str, actual: &str) -> Self {
        DatabaseError::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create a pool error
    pub fn pool<S: Into<String>>(msg: S) -> Self {
        DatabaseError::PoolError(msg.into())
    }

    /// Create a generic error
    pub fn other<S: Into<String>>(msg: S) -> Self {
        DatabaseError::Other(msg.into())
    }
}

/// Category of a translated data access failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataAccessErrorKind {
    /// The resource is locked by another owner
    ResourceLocked,
    /// The API was used incorrectly, e.g. a non-storable value
    InvalidUsage,
    /// The resource failed, typically I/O or a lost connection
    ResourceFailure,
    /// Anything the translator does not recognise
    Unknown,
}

impl DataAccessErrorKind {
    pub fn to_str(&self) -> &'static str {
        match self {
            DataAccessErrorKind::ResourceLocked => "resource locked",
            DataAccessErrorKind::InvalidUsage => "invalid usage",
            DataAccessErrorKind::ResourceFailure => "resource failure",
            DataAccessErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DataAccessErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

/// An engine failure translated for application code
#[derive(Debug, thiserror::Error)]
#[error("Data access failure ({kind}): {message}")]
pub struct DataAccessError {
    pub kind: DataAccessErrorKind,
    pub message: String,
    #[source]
    pub source: DatabaseError,
}

impl DataAccessError {
    pub fn new(kind: DataAccessErrorKind, message: impl Into<String>, source: DatabaseError) -> Self {
        Self {
            kind,
            message: message.into(),
            source,
        }
    }

    pub fn kind(&self) -> DataAccessErrorKind {
        self.kind
    }
}

/// Errors raised by the coordination layer
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// A transaction could not be started
    #[error("Cannot create transaction: {message}")]
    CannotCreateTransaction {
        message: String,
        #[source]
        source: Option<Box<TransactionError>>,
    },

    /// The engine has no isolation levels beyond its default
    #[error("Isolation level {0} is not supported")]
    UnsupportedIsolation(IsolationLevel),

    /// Operation not allowed in the current transaction state
    #[error("Illegal transaction state: {0}")]
    IllegalTransactionState(String),

    /// Engine commit or rollback failed
    #[error("{message}")]
    TransactionSystem {
        message: String,
        #[source]
        source: DatabaseError,
    },

    /// Commit turned into a rollback because the transaction was rollback-only
    #[error("Unexpected rollback: {0}")]
    UnexpectedRollback(String),

    /// The transaction deadline has passed
    #[error("Transaction timed out: deadline was {deadline}")]
    TransactionTimedOut { deadline: DateTime<Utc> },

    /// A holder is already bound for this data source in this context
    #[error("Resource already bound for data source {0}")]
    DuplicateBinding(DataSourceId),

    /// No holder is bound for this data source in this context
    #[error("No resource bound for data source {0}")]
    NotBound(DataSourceId),

    /// A holder or registry invariant was violated
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Translated engine failure
    #[error(transparent)]
    DataAccess(#[from] DataAccessError),

    /// Untranslated engine failure
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl TransactionError {
    /// Create a cannot-create-transaction error without a cause
    pub fn cannot_create<S: Into<String>>(msg: S) -> Self {
        TransactionError::CannotCreateTransaction {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a cannot-create-transaction error wrapping its cause
    pub fn cannot_create_with_source<S: Into<String>>(msg: S, source: TransactionError) -> Self {
        TransactionError::CannotCreateTransaction {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an illegal transaction state error
    pub fn illegal_transaction_state<S: Into<String>>(msg: S) -> Self {
        TransactionError::IllegalTransactionState(msg.into())
    }

    /// Wrap an engine commit/rollback failure
    pub fn system<S: Into<String>>(msg: S, source: DatabaseError) -> Self {
        TransactionError::TransactionSystem {
            message: msg.into(),
            source,
        }
    }

    /// Create an illegal state error
    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        TransactionError::IllegalState(msg.into())
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        TransactionError::Configuration(msg.into())
    }

    /// True for both ways a transaction can fail to start
    pub fn is_cannot_create(&self) -> bool {
        matches!(
            self,
            TransactionError::CannotCreateTransaction { .. }
                | TransactionError::UnsupportedIsolation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = DatabaseError::connection("Failed to connect");
        assert!(matches!(err, DatabaseError::ConnectionError(_)));

        let err = DatabaseError::locked("file.db");
        assert!(matches!(err, DatabaseError::DatabaseLocked(_)));

        let err = TransactionError::system("Cannot commit", DatabaseError::query("boom"));
        assert!(matches!(err, TransactionError::TransactionSystem { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = DatabaseError::connection("Connection refused");
        assert_eq!(err.to_string(), "Connection error: Connection refused");

        let err = TransactionError::UnsupportedIsolation(IsolationLevel::Serializable);
        assert_eq!(err.to_string(), "Isolation level serializable is not supported");

        let err = DataAccessError::new(
            DataAccessErrorKind::ResourceLocked,
            "Database is already locked",
            DatabaseError::locked("db"),
        );
        assert_eq!(
            err.to_string(),
            "Data access failure (resource locked): Database is already locked"
        );
    }

    #[test]
    fn test_cannot_create_covers_unsupported_isolation() {
        assert!(TransactionError::cannot_create("no").is_cannot_create());
        assert!(TransactionError::UnsupportedIsolation(IsolationLevel::ReadCommitted).is_cannot_create());
        assert!(!TransactionError::illegal_state("x").is_cannot_create());
    }

    #[test]
    fn test_cannot_create_keeps_source() {
        use std::error::Error;

        let err = TransactionError::cannot_create_with_source(
            "Cannot create transaction",
            TransactionError::Database(DatabaseError::connection("refused")),
        );
        assert!(err.source().is_some());
    }
}
