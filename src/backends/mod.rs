//! Connection strategies
//!
//! Each backend supplies a [`Connection`](crate::core::Connection) and a
//! [`ConnectionFactory`](crate::core::ConnectionFactory) for one way of
//! reaching an engine.

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod pooled_sqlite;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{MemoryConnection, MemoryConnectionFactory, MemoryStore, StoreStats};

#[cfg(feature = "sqlite")]
pub use pooled_sqlite::{PoolStats, PooledSqliteConfig, PooledSqliteConnection, PooledSqliteFactory};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteConnection, SqliteConnectionFactory, SqliteTarget};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresConnection, PostgresConnectionFactory, RemoteConnectionParameters};
