//! Core binding and transaction types
//!
//! This module provides the connection traits, the per-context registry,
//! reference-counted holders, the completion synchronization, the
//! transaction manager and the operation template.

pub mod access;
pub mod connection;
pub mod definition;
pub mod error;
pub mod holder;
pub mod manager;
pub mod registry;
pub mod synchronization;
pub mod template;
pub mod transaction;
pub mod translate;
pub mod value;

// Re-export commonly used types
pub use access::{acquire_connection, bind_transactional_holder, release_connection, ConnectionLease};
pub use connection::{Connection, ConnectionFactory, DataSource, DataSourceId};
pub use definition::{IsolationLevel, Propagation, TransactionDefinition};
pub use error::{
    DataAccessError, DataAccessErrorKind, DatabaseError, DatabaseResult, Result, TransactionError,
};
pub use holder::ResourceHolder;
pub use manager::{TransactionFuture, TransactionManager, TransactionManagerConfig};
pub use registry::ResourceRegistry;
pub use synchronization::{
    CompletionStatus, CompletionSynchronization, SyncState, TransactionSynchronization,
};
pub use template::ConnectionTemplate;
pub use transaction::{SuspendedResources, SuspendedTransaction, TransactionObject, TransactionStatus};
pub use translate::{DefaultErrorTranslator, ErrorTranslator};
pub use value::{Row, Value};
