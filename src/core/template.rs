//! Callback template for single operations on a data source
//!
//! [`ConnectionTemplate::execute`] acquires the connection of the current
//! context, runs one operation on it and hands it back, whatever the
//! operation returned. Native errors come back translated.

use super::access::{acquire_connection, release_connection};
use super::connection::{ConnectionFactory, DataSource};
use super::error::{DatabaseResult, Result, TransactionError};
use super::registry::ResourceRegistry;
use super::translate::{DefaultErrorTranslator, ErrorTranslator};
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Runs operations against a data source inside whatever transaction is current
pub struct ConnectionTemplate<F> {
    data_source: DataSource<F>,
    translator: Arc<dyn ErrorTranslator>,
}

impl<F: ConnectionFactory> ConnectionTemplate<F> {
    /// Create a template using [`DefaultErrorTranslator`]
    pub fn new(data_source: DataSource<F>) -> Self {
        Self::with_translator(data_source, Arc::new(DefaultErrorTranslator))
    }

    pub fn with_translator(data_source: DataSource<F>, translator: Arc<dyn ErrorTranslator>) -> Self {
        Self {
            data_source,
            translator,
        }
    }

    pub fn data_source(&self) -> &DataSource<F> {
        &self.data_source
    }

    /// Run `op` with a connection from the current context
    ///
    /// The connection is released on every path. Native errors from opening
    /// the connection or from `op` are returned as
    /// [`TransactionError::DataAccess`].
    pub async fn execute<R, Op, Fut>(&self, registry: &mut ResourceRegistry, op: Op) -> Result<R>
    where
        R: Send,
        Op: FnOnce(Arc<F::Connection>) -> Fut + Send,
        Fut: Future<Output = DatabaseResult<R>> + Send,
    {
        let lease = acquire_connection(registry, &self.data_source)
            .await
            .map_err(|e| self.translate(e))?;

        let result = op(lease.connection()).await;
        let released = release_connection(Some(lease)).await;

        match result {
            Ok(value) => {
                released?;
                Ok(value)
            }
            Err(e) => {
                if let Err(release_error) = released {
                    warn!(error = %release_error, "failed to release connection after operation error");
                }
                Err(TransactionError::DataAccess(self.translator.translate(e)))
            }
        }
    }

    fn translate(&self, error: TransactionError) -> TransactionError {
        match error {
            TransactionError::Database(e) => TransactionError::DataAccess(self.translator.translate(e)),
            other => other,
        }
    }
}

impl<F> Clone for ConnectionTemplate<F> {
    fn clone(&self) -> Self {
        Self {
            data_source: self.data_source.clone(),
            translator: Arc::clone(&self.translator),
        }
    }
}

impl<F> std::fmt::Debug for ConnectionTemplate<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTemplate")
            .field("data_source", &self.data_source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{MemoryConnectionFactory, MemoryStore};
    use crate::core::error::DataAccessErrorKind;
    use crate::core::value::Value;

    #[tokio::test]
    async fn test_execute_releases_unmanaged_connection() {
        let store = MemoryStore::new();
        let template = ConnectionTemplate::new(DataSource::new(MemoryConnectionFactory::new(
            store.clone(),
        )));
        let mut registry = ResourceRegistry::new();

        template
            .execute(&mut registry, |conn| async move { conn.put("k", 1i64) })
            .await
            .unwrap();

        // closing an unmanaged connection commits its work
        assert_eq!(store.get("k"), Some(Value::Integer(1)));
        assert_eq!(store.stats().closed, 1);
    }

    #[tokio::test]
    async fn test_execute_translates_and_still_releases() {
        let store = MemoryStore::new();
        let template = ConnectionTemplate::new(DataSource::new(MemoryConnectionFactory::new(
            store.clone(),
        )));
        let mut registry = ResourceRegistry::new();

        let err = template
            .execute(&mut registry, |conn| async move { conn.put("", 1i64) })
            .await
            .unwrap_err();
        match err {
            TransactionError::DataAccess(e) => assert_eq!(e.kind(), DataAccessErrorKind::InvalidUsage),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.stats().closed, 1);
    }

    #[tokio::test]
    async fn test_open_failure_is_translated() {
        let store = MemoryStore::new();
        let data_source = DataSource::new(MemoryConnectionFactory::exclusive(store.clone()));
        let _blocker = data_source.get_connection().await.unwrap();
        let template = ConnectionTemplate::new(data_source);
        let mut registry = ResourceRegistry::new();

        let err = template
            .execute(&mut registry, |_conn| async move { Ok(()) })
            .await
            .unwrap_err();
        match err {
            TransactionError::DataAccess(e) => {
                assert_eq!(e.kind(), DataAccessErrorKind::ResourceLocked)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
