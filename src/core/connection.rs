//! Connection and connection-factory traits
//!
//! Every backend implements [`Connection`] for its handle type and
//! [`ConnectionFactory`] for the strategy that opens it. A [`DataSource`]
//! pairs a factory with the identity used as the registry key.

use super::error::DatabaseResult;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A live handle to an engine that always runs inside an implicit transaction
///
/// Opening a connection begins a transaction; `commit` and `rollback` finish
/// it and immediately begin the next one.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Commit the current implicit transaction
    async fn commit(&self) -> DatabaseResult<()>;

    /// Roll back the current implicit transaction
    async fn rollback(&self) -> DatabaseResult<()>;

    /// Release the handle
    ///
    /// Pending work is committed before the handle is released, the way the
    /// engines behave when a client disconnects cleanly.
    async fn close(&self) -> DatabaseResult<()>;

    /// Check if the handle has been closed
    fn is_closed(&self) -> bool;

    /// Hint the remaining transaction time to the engine
    async fn apply_timeout(&self, _time_to_live: Duration) -> DatabaseResult<()> {
        Ok(())
    }
}

/// Strategy for opening connections of one kind
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a new connection
    ///
    /// Fails with the engine's native error.
    async fn create_connection(&self) -> DatabaseResult<Self::Connection>;
}

static NEXT_DATA_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a data source, used as the registry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataSourceId(u64);

impl DataSourceId {
    fn next() -> Self {
        DataSourceId(NEXT_DATA_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DataSourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A connection factory with a stable identity
///
/// Clones share the identity, so every clone maps to the same registry entry.
pub struct DataSource<F> {
    id: DataSourceId,
    factory: Arc<F>,
}

impl<F: ConnectionFactory> DataSource<F> {
    /// Create a data source with a fresh identity
    pub fn new(factory: F) -> Self {
        Self::from_arc(Arc::new(factory))
    }

    /// Create a data source around a shared factory with a fresh identity
    pub fn from_arc(factory: Arc<F>) -> Self {
        let id = DataSourceId::next();
        debug!(data_source = %id, "data source created");
        Self { id, factory }
    }

    pub fn id(&self) -> DataSourceId {
        self.id
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Open a new connection through the factory
    pub async fn get_connection(&self) -> DatabaseResult<F::Connection> {
        debug!(data_source = %self.id, "creating connection");
        self.factory.create_connection().await
    }
}

impl<F> Clone for DataSource<F> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<F> std::fmt::Debug for DataSource<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{MemoryConnectionFactory, MemoryStore};

    #[test]
    fn test_data_source_ids_are_unique() {
        let store = MemoryStore::new();
        let a = DataSource::new(MemoryConnectionFactory::new(store.clone()));
        let b = DataSource::new(MemoryConnectionFactory::new(store));

        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[tokio::test]
    async fn test_get_connection_uses_factory() {
        let store = MemoryStore::new();
        let ds = DataSource::new(MemoryConnectionFactory::new(store.clone()));

        let conn = ds.get_connection().await.unwrap();
        assert!(!conn.is_closed());
        assert_eq!(store.stats().opened, 1);
    }
}
