//! Transaction object, status and suspension state
//!
//! [`TransactionObject`] is what the manager's hooks operate on: the holder
//! of the transaction (if any) and whether this transaction created it.
//! [`TransactionStatus`] is the handle returned to callers by
//! `begin_transaction` and passed back to `commit` / `rollback`.

use super::connection::Connection;
use super::holder::ResourceHolder;
use super::synchronization::TransactionSynchronization;
use std::sync::Arc;

/// The holder a transaction runs on
pub struct TransactionObject<C> {
    holder: Option<Arc<ResourceHolder<C>>>,
    new_holder: bool,
}

impl<C: Connection> TransactionObject<C> {
    pub fn new(holder: Option<Arc<ResourceHolder<C>>>, new_holder: bool) -> Self {
        Self { holder, new_holder }
    }

    /// An object with no holder, used for non-transactional scopes
    pub fn empty() -> Self {
        Self::new(None, false)
    }

    pub fn holder(&self) -> Option<&Arc<ResourceHolder<C>>> {
        self.holder.as_ref()
    }

    pub fn set_holder(&mut self, holder: Arc<ResourceHolder<C>>, new_holder: bool) {
        self.holder = Some(holder);
        self.new_holder = new_holder;
    }

    /// Detach the holder from this object
    pub fn take_holder(&mut self) -> Option<Arc<ResourceHolder<C>>> {
        self.new_holder = false;
        self.holder.take()
    }

    /// True if this transaction created (and so owns) its holder
    pub fn is_new_holder(&self) -> bool {
        self.new_holder
    }

    pub fn has_transaction(&self) -> bool {
        self.holder.is_some()
    }

    /// Rollback-only flag of the holder, shared by all participants
    pub fn is_rollback_only(&self) -> bool {
        self.holder
            .as_ref()
            .map(|holder| holder.is_rollback_only())
            .unwrap_or(false)
    }
}

impl<C> std::fmt::Debug for TransactionObject<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionObject")
            .field("holder", &self.holder)
            .field("new_holder", &self.new_holder)
            .finish()
    }
}

/// Opaque token returned by `do_suspend` and consumed by `do_resume`
pub struct SuspendedResources<C> {
    pub(crate) holder: Arc<ResourceHolder<C>>,
}

impl<C: Connection> SuspendedResources<C> {
    /// The holder that was bound when the transaction was suspended
    pub fn holder(&self) -> &Arc<ResourceHolder<C>> {
        &self.holder
    }
}

/// Everything needed to resume an outer transaction
pub struct SuspendedTransaction<C> {
    pub(crate) resources: Option<SuspendedResources<C>>,
    pub(crate) synchronizations: Option<Vec<Arc<dyn TransactionSynchronization>>>,
    pub(crate) name: Option<String>,
    pub(crate) read_only: bool,
    pub(crate) was_active: bool,
}

impl<C> SuspendedTransaction<C> {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn has_resources(&self) -> bool {
        self.resources.is_some()
    }
}

/// Handle on a transaction started by `begin_transaction`
///
/// A status completes exactly once, through `commit` or `rollback`.
pub struct TransactionStatus<C> {
    pub(crate) transaction: TransactionObject<C>,
    new_transaction: bool,
    new_synchronization: bool,
    read_only: bool,
    name: Option<String>,
    local_rollback_only: bool,
    completed: bool,
    suspended: Option<SuspendedTransaction<C>>,
}

impl<C: Connection> TransactionStatus<C> {
    pub(crate) fn new(
        transaction: TransactionObject<C>,
        new_transaction: bool,
        new_synchronization: bool,
        read_only: bool,
        name: Option<String>,
        suspended: Option<SuspendedTransaction<C>>,
    ) -> Self {
        Self {
            transaction,
            new_transaction,
            new_synchronization,
            read_only,
            name,
            local_rollback_only: false,
            completed: false,
            suspended,
        }
    }

    pub fn transaction(&self) -> &TransactionObject<C> {
        &self.transaction
    }

    /// True if this status started the transaction, false if it participates
    pub fn is_new_transaction(&self) -> bool {
        self.new_transaction && self.transaction.has_transaction()
    }

    pub fn has_transaction(&self) -> bool {
        self.transaction.has_transaction()
    }

    /// True if this status activated synchronization for its scope
    pub fn is_new_synchronization(&self) -> bool {
        self.new_synchronization
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn set_local_rollback_only(&mut self) {
        self.local_rollback_only = true;
    }

    pub fn is_local_rollback_only(&self) -> bool {
        self.local_rollback_only
    }

    /// Rollback-only as seen by every participant of the transaction
    pub fn is_global_rollback_only(&self) -> bool {
        self.transaction.is_rollback_only()
    }

    pub fn is_rollback_only(&self) -> bool {
        self.is_local_rollback_only() || self.is_global_rollback_only()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub(crate) fn set_completed(&mut self) {
        self.completed = true;
    }

    pub fn has_suspended_transaction(&self) -> bool {
        self.suspended.is_some()
    }

    pub(crate) fn take_suspended(&mut self) -> Option<SuspendedTransaction<C>> {
        self.suspended.take()
    }
}

impl<C> std::fmt::Debug for TransactionStatus<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStatus")
            .field("transaction", &self.transaction)
            .field("new_transaction", &self.new_transaction)
            .field("new_synchronization", &self.new_synchronization)
            .field("read_only", &self.read_only)
            .field("name", &self.name)
            .field("local_rollback_only", &self.local_rollback_only)
            .field("completed", &self.completed)
            .field("suspended", &self.suspended.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryConnection;

    #[test]
    fn test_empty_object_has_no_transaction() {
        let tx = TransactionObject::<MemoryConnection>::empty();
        assert!(!tx.has_transaction());
        assert!(!tx.is_new_holder());
        assert!(!tx.is_rollback_only());
    }

    #[test]
    fn test_take_holder_detaches() {
        let holder = Arc::new(ResourceHolder::<MemoryConnection>::empty());
        let mut tx = TransactionObject::new(Some(Arc::clone(&holder)), true);
        assert!(tx.is_new_holder());

        let taken = tx.take_holder().unwrap();
        assert!(Arc::ptr_eq(&taken, &holder));
        assert!(!tx.has_transaction());
        assert!(!tx.is_new_holder());
    }

    #[test]
    fn test_status_rollback_only_flags() {
        let holder = Arc::new(ResourceHolder::<MemoryConnection>::empty());
        let tx = TransactionObject::new(Some(Arc::clone(&holder)), true);
        let mut status = TransactionStatus::new(tx, true, true, false, None, None);
        assert!(status.is_new_transaction());
        assert!(!status.is_rollback_only());

        status.set_local_rollback_only();
        assert!(status.is_local_rollback_only());
        assert!(!status.is_global_rollback_only());

        holder.mark_rollback_only();
        assert!(status.is_global_rollback_only());
    }

    #[test]
    fn test_status_without_holder_is_never_new() {
        let status = TransactionStatus::new(
            TransactionObject::<MemoryConnection>::empty(),
            true,
            false,
            true,
            Some("reporting".to_string()),
            None,
        );
        assert!(!status.is_new_transaction());
        assert!(status.is_read_only());
        assert_eq!(status.name(), Some("reporting"));
    }
}
