//! Transaction synchronization callbacks
//!
//! The transaction manager fires [`TransactionSynchronization`] callbacks at
//! fixed points of a transaction's life: suspend, resume, before commit,
//! before completion and after completion. [`CompletionSynchronization`] is
//! the callback registered for every holder bound on behalf of a
//! transaction; it detaches the holder from the context and gets its
//! connection closed exactly once.

use super::connection::{Connection, DataSourceId};
use super::error::{Result, TransactionError};
use super::holder::ResourceHolder;
use super::registry::ResourceRegistry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Outcome reported to `after_completion`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Committed,
    RolledBack,
    /// Commit or rollback failed part-way; the outcome is not known
    Unknown,
}

/// Callbacks fired by the transaction manager
///
/// All methods default to no-ops. Errors from `before_commit` abort the
/// commit; errors from the completion callbacks are reported to the caller
/// after the outcome of the transaction has been decided.
#[async_trait]
pub trait TransactionSynchronization: Send + Sync {
    /// The transaction is being suspended
    fn suspend(&self, _registry: &mut ResourceRegistry) -> Result<()> {
        Ok(())
    }

    /// The transaction is being resumed
    fn resume(&self, _registry: &mut ResourceRegistry) -> Result<()> {
        Ok(())
    }

    /// Invoked before the engine commit
    fn before_commit(&self, _registry: &mut ResourceRegistry, _read_only: bool) -> Result<()> {
        Ok(())
    }

    /// Invoked before the engine commit or rollback
    async fn before_completion(&self, _registry: &mut ResourceRegistry) -> Result<()> {
        Ok(())
    }

    /// Invoked after the engine commit or rollback
    async fn after_completion(
        &self,
        _registry: &mut ResourceRegistry,
        _status: CompletionStatus,
    ) -> Result<()> {
        Ok(())
    }
}

/// Lifecycle of a [`CompletionSynchronization`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Active,
    Suspended,
    Completed,
}

/// Releases a transaction-bound holder when its transaction completes
///
/// By default a holder whose last lease was returned before completion is
/// released early, in `before_completion`. Holders the transaction manager
/// still commits or rolls back on must opt out with
/// [`without_early_release`](Self::without_early_release).
pub struct CompletionSynchronization<C> {
    holder: Arc<ResourceHolder<C>>,
    data_source: DataSourceId,
    early_release: bool,
    state: Mutex<SyncState>,
}

impl<C: Connection> CompletionSynchronization<C> {
    pub fn new(holder: Arc<ResourceHolder<C>>, data_source: DataSourceId) -> Self {
        Self {
            holder,
            data_source,
            early_release: true,
            state: Mutex::new(SyncState::Active),
        }
    }

    /// Keep the holder until `after_completion`
    pub fn without_early_release(mut self) -> Self {
        self.early_release = false;
        self
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    pub fn holder(&self) -> &Arc<ResourceHolder<C>> {
        &self.holder
    }

    /// Detach the holder, drop the transaction's claim and dispose if unused
    async fn complete(&self, registry: &mut ResourceRegistry) -> Result<()> {
        if registry.is_bound_to(self.data_source, &self.holder) {
            registry.unbind::<C>(self.data_source)?;
        }
        self.holder.set_synchronized_with_transaction(false);
        self.holder.mark_void();

        let closed = self
            .holder
            .dispose_if_unreferenced()
            .await
            .map_err(TransactionError::Database)?;
        if !closed && self.holder.has_connection() {
            debug!(
                data_source = %self.data_source,
                references = self.holder.reference_count(),
                "connection still referenced; closing on last release"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<C: Connection> TransactionSynchronization for CompletionSynchronization<C> {
    fn suspend(&self, registry: &mut ResourceRegistry) -> Result<()> {
        let mut state = self.state.lock();
        if *state != SyncState::Active {
            return Ok(());
        }
        debug!(data_source = %self.data_source, "suspending holder");
        if registry.is_bound_to(self.data_source, &self.holder) {
            registry.unbind::<C>(self.data_source)?;
        }
        *state = SyncState::Suspended;
        Ok(())
    }

    fn resume(&self, registry: &mut ResourceRegistry) -> Result<()> {
        let mut state = self.state.lock();
        if *state != SyncState::Suspended {
            return Ok(());
        }
        debug!(data_source = %self.data_source, "resuming holder");
        // the manager may already have re-bound the holder
        if !registry.is_bound_to(self.data_source, &self.holder) {
            registry.bind(self.data_source, Arc::clone(&self.holder))?;
        }
        *state = SyncState::Active;
        Ok(())
    }

    fn before_commit(&self, _registry: &mut ResourceRegistry, read_only: bool) -> Result<()> {
        debug!(data_source = %self.data_source, read_only, "before commit: nothing to flush");
        Ok(())
    }

    async fn before_completion(&self, registry: &mut ResourceRegistry) -> Result<()> {
        let release_early = {
            let mut state = self.state.lock();
            if !self.early_release || *state == SyncState::Completed || self.holder.is_open() {
                false
            } else {
                *state = SyncState::Completed;
                true
            }
        };
        if release_early {
            debug!(data_source = %self.data_source, "holder unused before completion; releasing early");
            self.complete(registry).await?;
        }
        Ok(())
    }

    async fn after_completion(
        &self,
        registry: &mut ResourceRegistry,
        status: CompletionStatus,
    ) -> Result<()> {
        let release = {
            let mut state = self.state.lock();
            if *state == SyncState::Completed {
                false
            } else {
                *state = SyncState::Completed;
                true
            }
        };
        if release {
            debug!(data_source = %self.data_source, ?status, "releasing holder after completion");
            self.complete(registry).await?;
        }
        Ok(())
    }
}
