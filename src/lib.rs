//! # txbind
//!
//! Resource binding and transaction coordination for engines that always run
//! inside an implicit transaction.
//!
//! A connection opened through this crate begins a transaction straight away;
//! commit and rollback finish it and begin the next one. On top of that model
//! the crate binds one reference-counted connection per data source to the
//! current unit of work, so every operation inside a transaction sees the same
//! connection, and closes it exactly once when the transaction is over and the
//! last user has handed it back.
//!
//! ## Features
//!
//! - **Explicit context**: bindings live in a [`ResourceRegistry`] value passed
//!   through every call; there is no global state
//! - **Propagation**: required, supports, mandatory, requires-new,
//!   not-supported and never, with suspend and resume of the outer transaction
//! - **Deferred close**: connections are closed after the transaction completes
//!   and the last lease is released, whichever comes last
//! - **Error translation**: native engine errors mapped onto a small set of
//!   data access kinds
//! - **Async**: built on Tokio
//!
//! ## Backends
//!
//! | Backend | Feature | Strategy |
//! |---------|---------|----------|
//! | In-memory store | always on | shared in-memory image |
//! | SQLite | `sqlite` (default) | database file or private in-memory database |
//! | Pooled SQLite | `sqlite` (default) | clients from one embedded pool |
//! | PostgreSQL | `postgres` | remote client |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use txbind::prelude::*;
//! use txbind::backends::memory::{MemoryConnectionFactory, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let store = MemoryStore::new();
//!     let data_source = DataSource::new(MemoryConnectionFactory::new(store.clone()));
//!     let manager = TransactionManager::new(data_source.clone());
//!     let template = ConnectionTemplate::new(data_source);
//!     let mut registry = ResourceRegistry::new();
//!
//!     let definition = TransactionDefinition::default().with_name("transfer");
//!     manager
//!         .execute_in_transaction(&mut registry, &definition, |registry| {
//!             let template = template.clone();
//!             Box::pin(async move {
//!                 template
//!                     .execute(registry, |conn| async move {
//!                         conn.put("alice", 90i64)?;
//!                         conn.put("bob", 110i64)
//!                     })
//!                     .await
//!             })
//!         })
//!         .await?;
//!
//!     assert_eq!(store.get("bob"), Some(Value::Integer(110)));
//!     Ok(())
//! }
//! ```
//!
//! ## Project Structure
//!
//! ```text
//! txbind/
//! ├── src/
//! │   ├── core/                # Binding and transaction coordination
//! │   │   ├── access.rs        # Acquire / release of connections
//! │   │   ├── connection.rs    # Connection and factory traits
//! │   │   ├── definition.rs    # Propagation, isolation, definition
//! │   │   ├── error.rs         # Error types
//! │   │   ├── holder.rs        # Reference-counted holder
//! │   │   ├── manager.rs       # Transaction manager
//! │   │   ├── registry.rs      # Per-context registry
//! │   │   ├── synchronization.rs
//! │   │   ├── template.rs      # Operation template
//! │   │   ├── transaction.rs   # Transaction object and status
//! │   │   ├── translate.rs     # Error translation
//! │   │   └── value.rs         # Value types
//! │   ├── backends/            # Connection strategies
//! │   └── lib.rs
//! ├── tests/                   # Integration and property tests
//! ├── benches/
//! └── Cargo.toml
//! ```

/// Core binding and transaction types
pub mod core;

/// Connection strategies
pub mod backends;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::core::{
        acquire_connection, release_connection, CompletionStatus, Connection, ConnectionFactory,
        ConnectionLease, ConnectionTemplate, DataAccessError, DataAccessErrorKind, DataSource,
        DatabaseError, DatabaseResult, IsolationLevel, Propagation, ResourceRegistry, Result, Row,
        TransactionDefinition, TransactionError, TransactionManager, TransactionManagerConfig,
        TransactionStatus, TransactionSynchronization, Value,
    };

    #[cfg(feature = "sqlite")]
    pub use crate::backends::{SqliteConnectionFactory, SqliteTarget};
}

// Re-export at root level for convenience
pub use crate::core::{
    DataSource, DatabaseError, DatabaseResult, ResourceRegistry, Result, TransactionDefinition,
    TransactionError, TransactionManager,
};
