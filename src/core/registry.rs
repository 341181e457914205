//! Context-scoped resource registry
//!
//! One [`ResourceRegistry`] value belongs to one unit of work (a task, a
//! request, a test). It maps each data source to the holder currently bound
//! for it and carries the synchronization callbacks of the transaction that
//! is running in that context. It is passed explicitly as `&mut` through
//! every call, so nothing here needs a lock.

use super::connection::{Connection, DataSourceId};
use super::error::{Result, TransactionError};
use super::holder::ResourceHolder;
use super::synchronization::TransactionSynchronization;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Type-erased view of a bound holder
pub(crate) trait BoundResource: Send + Sync {
    fn is_void(&self) -> bool;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Per-context store of bound holders and transaction synchronizations
#[derive(Default)]
pub struct ResourceRegistry {
    resources: HashMap<DataSourceId, Arc<dyn BoundResource>>,
    synchronizations: Option<Vec<Arc<dyn TransactionSynchronization>>>,
    current_transaction_name: Option<String>,
    current_transaction_read_only: bool,
    actual_transaction_active: bool,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The holder bound for `id`, if any
    ///
    /// Void holders are treated as absent.
    pub fn lookup<C: Connection>(&self, id: DataSourceId) -> Option<Arc<ResourceHolder<C>>> {
        let entry = self.resources.get(&id)?;
        if entry.is_void() {
            return None;
        }
        Arc::clone(entry)
            .into_any()
            .downcast::<ResourceHolder<C>>()
            .ok()
    }

    pub fn has_binding(&self, id: DataSourceId) -> bool {
        self.resources
            .get(&id)
            .map(|entry| !entry.is_void())
            .unwrap_or(false)
    }

    /// Check whether `holder` is the holder currently bound for `id`
    pub fn is_bound_to<C: Connection>(&self, id: DataSourceId, holder: &Arc<ResourceHolder<C>>) -> bool {
        self.lookup::<C>(id)
            .map(|bound| Arc::ptr_eq(&bound, holder))
            .unwrap_or(false)
    }

    /// Bind `holder` to `id` in this context
    ///
    /// # Errors
    ///
    /// `DuplicateBinding` if a holder is already bound for `id`.
    pub fn bind<C: Connection>(&mut self, id: DataSourceId, holder: Arc<ResourceHolder<C>>) -> Result<()> {
        if self.has_binding(id) {
            return Err(TransactionError::DuplicateBinding(id));
        }
        debug!(data_source = %id, "binding resource holder");
        self.resources.insert(id, holder);
        Ok(())
    }

    /// Remove and return the holder bound for `id`
    ///
    /// # Errors
    ///
    /// `NotBound` if nothing is bound for `id`. `IllegalState` if the bound
    /// holder wraps a different connection type; the binding is left in place.
    pub fn unbind<C: Connection>(&mut self, id: DataSourceId) -> Result<Arc<ResourceHolder<C>>> {
        let entry = self.resources.get(&id).ok_or(TransactionError::NotBound(id))?;
        if entry.is_void() {
            self.resources.remove(&id);
            return Err(TransactionError::NotBound(id));
        }
        let holder = Arc::clone(entry)
            .into_any()
            .downcast::<ResourceHolder<C>>()
            .map_err(|_| {
                TransactionError::illegal_state(format!(
                    "Resource bound for data source {} has a different connection type",
                    id
                ))
            })?;
        debug!(data_source = %id, "unbinding resource holder");
        self.resources.remove(&id);
        Ok(holder)
    }

    /// Remove the holder bound for `id` if there is one
    ///
    /// # Errors
    ///
    /// `IllegalState` if the bound holder wraps a different connection type.
    pub fn unbind_if_bound<C: Connection>(
        &mut self,
        id: DataSourceId,
    ) -> Result<Option<Arc<ResourceHolder<C>>>> {
        if self.has_binding(id) {
            self.unbind(id).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Number of live bindings in this context
    pub fn binding_count(&self) -> usize {
        self.resources.values().filter(|entry| !entry.is_void()).count()
    }

    pub fn is_synchronization_active(&self) -> bool {
        self.synchronizations.is_some()
    }

    /// Start collecting synchronization callbacks for a new transaction
    pub fn init_synchronization(&mut self) -> Result<()> {
        if self.synchronizations.is_some() {
            return Err(TransactionError::illegal_state(
                "Cannot activate transaction synchronization - already active",
            ));
        }
        debug!("initializing transaction synchronization");
        self.synchronizations = Some(Vec::new());
        Ok(())
    }

    /// Register a callback for the running transaction
    ///
    /// # Errors
    ///
    /// `IllegalState` if synchronization is not active.
    pub fn register_synchronization(&mut self, synchronization: Arc<dyn TransactionSynchronization>) -> Result<()> {
        match self.synchronizations.as_mut() {
            Some(list) => {
                list.push(synchronization);
                Ok(())
            }
            None => Err(TransactionError::illegal_state(
                "Transaction synchronization is not active",
            )),
        }
    }

    /// Snapshot of the registered callbacks, in registration order
    pub fn synchronizations(&self) -> Result<Vec<Arc<dyn TransactionSynchronization>>> {
        self.synchronizations.clone().ok_or_else(|| {
            TransactionError::illegal_state("Transaction synchronization is not active")
        })
    }

    /// Stop synchronization and drop the registered callbacks
    pub fn clear_synchronization(&mut self) -> Result<()> {
        if self.synchronizations.take().is_none() {
            return Err(TransactionError::illegal_state(
                "Cannot deactivate transaction synchronization - not active",
            ));
        }
        debug!("clearing transaction synchronization");
        Ok(())
    }

    pub fn current_transaction_name(&self) -> Option<&str> {
        self.current_transaction_name.as_deref()
    }

    pub fn set_current_transaction_name(&mut self, name: Option<String>) {
        self.current_transaction_name = name;
    }

    pub fn is_current_transaction_read_only(&self) -> bool {
        self.current_transaction_read_only
    }

    pub fn set_current_transaction_read_only(&mut self, read_only: bool) {
        self.current_transaction_read_only = read_only;
    }

    /// True while a real transaction (not just synchronization) is running
    pub fn is_actual_transaction_active(&self) -> bool {
        self.actual_transaction_active
    }

    pub fn set_actual_transaction_active(&mut self, active: bool) {
        self.actual_transaction_active = active;
    }

    /// Reset all per-transaction state; bindings are left alone
    pub fn clear(&mut self) {
        self.synchronizations = None;
        self.current_transaction_name = None;
        self.current_transaction_read_only = false;
        self.actual_transaction_active = false;
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("bindings", &self.binding_count())
            .field(
                "synchronizations",
                &self.synchronizations.as_ref().map(Vec::len),
            )
            .field("current_transaction_name", &self.current_transaction_name)
            .field("actual_transaction_active", &self.actual_transaction_active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{MemoryConnection, MemoryConnectionFactory, MemoryStore};
    use crate::core::connection::DataSource;
    use crate::core::error::DatabaseResult;
    use async_trait::async_trait;

    struct OtherConnection;

    #[async_trait]
    impl Connection for OtherConnection {
        async fn commit(&self) -> DatabaseResult<()> {
            Ok(())
        }

        async fn rollback(&self) -> DatabaseResult<()> {
            Ok(())
        }

        async fn close(&self) -> DatabaseResult<()> {
            Ok(())
        }

        fn is_closed(&self) -> bool {
            false
        }
    }

    fn data_source() -> DataSource<MemoryConnectionFactory> {
        DataSource::new(MemoryConnectionFactory::new(MemoryStore::new()))
    }

    #[test]
    fn test_bind_lookup_unbind() {
        let ds = data_source();
        let mut registry = ResourceRegistry::new();
        let holder = Arc::new(ResourceHolder::<MemoryConnection>::empty());

        assert!(registry.lookup::<MemoryConnection>(ds.id()).is_none());
        registry.bind(ds.id(), Arc::clone(&holder)).unwrap();

        assert!(registry.has_binding(ds.id()));
        let found = registry.lookup::<MemoryConnection>(ds.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &holder));
        assert!(registry.is_bound_to(ds.id(), &holder));

        let removed = registry.unbind::<MemoryConnection>(ds.id()).unwrap();
        assert!(Arc::ptr_eq(&removed, &holder));
        assert!(!registry.has_binding(ds.id()));
    }

    #[test]
    fn test_duplicate_binding_is_rejected() {
        let ds = data_source();
        let mut registry = ResourceRegistry::new();
        registry
            .bind(ds.id(), Arc::new(ResourceHolder::<MemoryConnection>::empty()))
            .unwrap();

        let err = registry
            .bind(ds.id(), Arc::new(ResourceHolder::<MemoryConnection>::empty()))
            .unwrap_err();
        assert!(matches!(err, TransactionError::DuplicateBinding(id) if id == ds.id()));
    }

    #[test]
    fn test_unbind_absent_is_rejected() {
        let ds = data_source();
        let mut registry = ResourceRegistry::new();
        let err = registry.unbind::<MemoryConnection>(ds.id()).unwrap_err();
        assert!(matches!(err, TransactionError::NotBound(id) if id == ds.id()));
        assert!(registry
            .unbind_if_bound::<MemoryConnection>(ds.id())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_void_holders_are_invisible() {
        let ds = data_source();
        let mut registry = ResourceRegistry::new();
        let holder = Arc::new(ResourceHolder::<MemoryConnection>::empty());
        registry.bind(ds.id(), Arc::clone(&holder)).unwrap();

        holder.mark_void();
        assert!(!registry.has_binding(ds.id()));
        assert_eq!(registry.binding_count(), 0);

        // a void entry can be replaced
        registry
            .bind(ds.id(), Arc::new(ResourceHolder::<MemoryConnection>::empty()))
            .unwrap();
        assert_eq!(registry.binding_count(), 1);
    }

    #[test]
    fn test_unbind_with_wrong_type_keeps_binding() {
        let ds = data_source();
        let mut registry = ResourceRegistry::new();
        let holder = Arc::new(ResourceHolder::<MemoryConnection>::empty());
        registry.bind(ds.id(), Arc::clone(&holder)).unwrap();

        let err = registry.unbind_if_bound::<OtherConnection>(ds.id()).unwrap_err();
        assert!(matches!(err, TransactionError::IllegalState(_)));
        assert!(registry.unbind::<OtherConnection>(ds.id()).is_err());
        assert!(registry.is_bound_to(ds.id(), &holder));

        let removed = registry.unbind_if_bound::<MemoryConnection>(ds.id()).unwrap();
        assert!(Arc::ptr_eq(&removed.unwrap(), &holder));
    }

    #[test]
    fn test_registries_are_independent() {
        let ds = data_source();
        let mut first = ResourceRegistry::new();
        let second = ResourceRegistry::new();
        first
            .bind(ds.id(), Arc::new(ResourceHolder::<MemoryConnection>::empty()))
            .unwrap();

        assert!(first.has_binding(ds.id()));
        assert!(!second.has_binding(ds.id()));
    }

    #[test]
    fn test_synchronization_lifecycle() {
        let mut registry = ResourceRegistry::new();
        assert!(!registry.is_synchronization_active());
        assert!(registry.synchronizations().is_err());
        assert!(registry.clear_synchronization().is_err());

        registry.init_synchronization().unwrap();
        assert!(registry.is_synchronization_active());
        assert!(registry.init_synchronization().is_err());
        assert!(registry.synchronizations().unwrap().is_empty());

        registry.clear_synchronization().unwrap();
        assert!(!registry.is_synchronization_active());
    }

    #[test]
    fn test_clear_resets_transaction_metadata() {
        let mut registry = ResourceRegistry::new();
        registry.init_synchronization().unwrap();
        registry.set_current_transaction_name(Some("batch".to_string()));
        registry.set_current_transaction_read_only(true);
        registry.set_actual_transaction_active(true);

        registry.clear();
        assert!(!registry.is_synchronization_active());
        assert!(registry.current_transaction_name().is_none());
        assert!(!registry.is_current_transaction_read_only());
        assert!(!registry.is_actual_transaction_active());
    }
}
