//! Transaction-aware connection access
//!
//! [`acquire_connection`] hands out the connection bound to the current
//! context when a transaction is running, and a fresh, caller-owned one when
//! none is. [`release_connection`] gives it back: transactional connections
//! stay open until their transaction is done with them, unmanaged ones are
//! closed on the spot.

use super::connection::{Connection, ConnectionFactory, DataSource, DataSourceId};
use super::error::Result;
use super::holder::ResourceHolder;
use super::registry::ResourceRegistry;
use super::synchronization::CompletionSynchronization;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, warn};

/// A connection handed out by [`acquire_connection`]
///
/// Must be handed back through [`release_connection`].
pub struct ConnectionLease<C> {
    connection: Arc<C>,
    holder: Option<Arc<ResourceHolder<C>>>,
}

impl<C: Connection> ConnectionLease<C> {
    /// Shared handle to the leased connection
    pub fn connection(&self) -> Arc<C> {
        Arc::clone(&self.connection)
    }

    /// The holder backing this lease, when the connection is transaction-bound
    pub fn holder(&self) -> Option<&Arc<ResourceHolder<C>>> {
        self.holder.as_ref()
    }

    pub fn is_transactional(&self) -> bool {
        self.holder.is_some()
    }
}

impl<C> std::fmt::Debug for ConnectionLease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl<C> Deref for ConnectionLease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.connection
    }
}

/// Get a connection for `data_source` in the current context
///
/// 1. A holder bound for the data source is reused: its reference count is
///    bumped and, if it has no connection yet, one is opened and stored.
/// 2. Otherwise a new connection is opened. If synchronization is active it
///    is wrapped in a holder, bound, and registered for release at
///    completion; if not, the caller owns it outright.
///
/// Factory failures are returned as the native `DatabaseError`.
pub async fn acquire_connection<F: ConnectionFactory>(
    registry: &mut ResourceRegistry,
    data_source: &DataSource<F>,
) -> Result<ConnectionLease<F::Connection>> {
    if let Some(holder) = registry.lookup::<F::Connection>(data_source.id()) {
        debug!(data_source = %data_source.id(), "reusing bound holder");
        holder.time_to_live()?;
        holder.acquire();

        let connection = match holder.connection() {
            Some(connection) => connection,
            None => match open_into_holder(&holder, data_source).await {
                Ok(connection) => connection,
                Err(e) => {
                    holder.release()?;
                    return Err(e);
                }
            },
        };
        return Ok(ConnectionLease {
            connection,
            holder: Some(holder),
        });
    }

    debug!(data_source = %data_source.id(), "no bound holder; opening connection");
    let connection = Arc::new(data_source.get_connection().await?);

    if !registry.is_synchronization_active() {
        return Ok(ConnectionLease {
            connection,
            holder: None,
        });
    }

    debug!(
        data_source = %data_source.id(),
        "binding connection to the running transaction"
    );
    let holder = Arc::new(ResourceHolder::from_shared(Arc::clone(&connection)));
    holder.acquire();
    bind_holder(registry, data_source.id(), Arc::clone(&holder), true)?;

    Ok(ConnectionLease {
        connection,
        holder: Some(holder),
    })
}

/// Open the lazily created connection of a bound holder
async fn open_into_holder<F: ConnectionFactory>(
    holder: &Arc<ResourceHolder<F::Connection>>,
    data_source: &DataSource<F>,
) -> Result<Arc<F::Connection>> {
    debug!(data_source = %data_source.id(), "holder has no connection yet; opening one");
    let connection = Arc::new(data_source.get_connection().await?);

    if let Err(e) = prepare_for_holder(holder, &connection).await {
        // the holder never saw this connection, so nothing else will close it
        if let Err(close_err) = connection.close().await {
            warn!(
                data_source = %data_source.id(),
                error = %close_err,
                "failed to close connection after preparing it failed"
            );
        }
        return Err(e);
    }
    Ok(connection)
}

async fn prepare_for_holder<C: Connection>(
    holder: &ResourceHolder<C>,
    connection: &Arc<C>,
) -> Result<()> {
    if let Some(time_to_live) = holder.time_to_live()? {
        connection.apply_timeout(time_to_live).await?;
    }
    holder.set_connection(Arc::clone(connection))
}

/// Bind the holder a transaction runs on and register its completion callback
///
/// The holder is claimed by the transaction until the callback releases it
/// after the engine commit or rollback. Without active synchronization the
/// claim is dropped by the transaction manager's cleanup instead.
pub fn bind_transactional_holder<C: Connection>(
    registry: &mut ResourceRegistry,
    data_source: DataSourceId,
    holder: Arc<ResourceHolder<C>>,
) -> Result<()> {
    bind_holder(registry, data_source, holder, false)
}

fn bind_holder<C: Connection>(
    registry: &mut ResourceRegistry,
    data_source: DataSourceId,
    holder: Arc<ResourceHolder<C>>,
    early_release: bool,
) -> Result<()> {
    holder.set_synchronized_with_transaction(true);
    registry.bind(data_source, Arc::clone(&holder))?;
    if registry.is_synchronization_active() {
        let synchronization = CompletionSynchronization::new(holder, data_source);
        let synchronization = if early_release {
            synchronization
        } else {
            synchronization.without_early_release()
        };
        registry.register_synchronization(Arc::new(synchronization))?;
    }
    Ok(())
}

/// Hand a leased connection back
///
/// Transactional leases only drop their reference; the connection is closed
/// here only if its transaction has already completed and this was the last
/// reference. Unmanaged leases are closed immediately.
pub async fn release_connection<C: Connection>(lease: Option<ConnectionLease<C>>) -> Result<()> {
    let Some(ConnectionLease { connection, holder }) = lease else {
        return Ok(());
    };

    match holder {
        Some(holder) => {
            drop(connection);
            let remaining = holder.release()?;
            debug!(remaining, "released transactional connection");
            if remaining == 0 && holder.dispose_if_unreferenced().await? {
                debug!("closed connection after its transaction completed");
            }
        }
        None => {
            debug!("closing unmanaged connection");
            if let Err(e) = connection.close().await {
                warn!(error = %e, "failed to close unmanaged connection");
                return Err(e.into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{MemoryConnection, MemoryConnectionFactory, MemoryStore};
    use crate::core::error::{DatabaseError, TransactionError};

    fn data_source(store: &MemoryStore) -> DataSource<MemoryConnectionFactory> {
        DataSource::new(MemoryConnectionFactory::new(store.clone()))
    }

    #[tokio::test]
    async fn test_unmanaged_connection_is_closed_on_release() {
        let store = MemoryStore::new();
        let ds = data_source(&store);
        let mut registry = ResourceRegistry::new();

        let lease = acquire_connection(&mut registry, &ds).await.unwrap();
        assert!(!lease.is_transactional());
        assert!(!registry.has_binding(ds.id()));

        release_connection(Some(lease)).await.unwrap();
        assert_eq!(store.stats().opened, 1);
        assert_eq!(store.stats().closed, 1);
    }

    #[tokio::test]
    async fn test_release_of_nothing_is_a_no_op() {
        release_connection::<MemoryConnection>(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_active_synchronization_binds_and_reuses() {
        let store = MemoryStore::new();
        let ds = data_source(&store);
        let mut registry = ResourceRegistry::new();
        registry.init_synchronization().unwrap();

        let first = acquire_connection(&mut registry, &ds).await.unwrap();
        assert!(first.is_transactional());
        assert!(registry.has_binding(ds.id()));
        assert_eq!(registry.synchronizations().unwrap().len(), 1);

        let second = acquire_connection(&mut registry, &ds).await.unwrap();
        assert!(Arc::ptr_eq(&first.connection(), &second.connection()));
        assert_eq!(second.holder().unwrap().reference_count(), 2);
        assert_eq!(store.stats().opened, 1);

        release_connection(Some(first)).await.unwrap();
        release_connection(Some(second)).await.unwrap();
        // still claimed by the transaction
        assert_eq!(store.stats().closed, 0);
        assert!(registry.has_binding(ds.id()));
    }

    #[tokio::test]
    async fn test_empty_holder_is_materialized_on_first_use() {
        let store = MemoryStore::new();
        let ds = data_source(&store);
        let mut registry = ResourceRegistry::new();
        let holder = Arc::new(ResourceHolder::<MemoryConnection>::empty());
        bind_transactional_holder(&mut registry, ds.id(), Arc::clone(&holder)).unwrap();
        assert_eq!(store.stats().opened, 0);

        let lease = acquire_connection(&mut registry, &ds).await.unwrap();
        assert!(holder.has_connection());
        assert_eq!(holder.reference_count(), 1);
        assert_eq!(store.stats().opened, 1);
        release_connection(Some(lease)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_materialization_undoes_acquire() {
        let store = MemoryStore::new();
        let ds = DataSource::new(MemoryConnectionFactory::exclusive(store.clone()));
        let _blocker = ds.get_connection().await.unwrap();

        let mut registry = ResourceRegistry::new();
        let holder = Arc::new(ResourceHolder::<MemoryConnection>::empty());
        bind_transactional_holder(&mut registry, ds.id(), Arc::clone(&holder)).unwrap();

        let err = acquire_connection(&mut registry, &ds).await.err().unwrap();
        assert!(matches!(
            err,
            TransactionError::Database(DatabaseError::DatabaseLocked(_))
        ));
        assert_eq!(holder.reference_count(), 0);
        assert!(!holder.has_connection());
    }

    #[tokio::test]
    async fn test_expired_holder_refuses_new_work() {
        let store = MemoryStore::new();
        let ds = data_source(&store);
        let mut registry = ResourceRegistry::new();
        let holder = Arc::new(ResourceHolder::<MemoryConnection>::empty());
        holder.set_timeout_in_seconds(1).unwrap();
        bind_transactional_holder(&mut registry, ds.id(), Arc::clone(&holder)).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        let err = acquire_connection(&mut registry, &ds).await.err().unwrap();
        assert!(matches!(err, TransactionError::TransactionTimedOut { .. }));
        assert!(holder.is_rollback_only());
        assert_eq!(store.stats().opened, 0);
    }
}
