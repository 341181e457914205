//! Transaction manager for a single data source
//!
//! [`TransactionManager`] has two layers:
//!
//! - the `do_*` hooks, which bind, suspend, resume, commit and roll back the
//!   holder of one data source in one [`ResourceRegistry`];
//! - the template methods `begin_transaction`, `commit`, `rollback` and
//!   `execute_in_transaction`, which drive those hooks according to the
//!   propagation behaviour of a [`TransactionDefinition`] and fire the
//!   registered synchronizations in a fixed order.
//!
//! # Example
//!
//! ```no_run
//! use txbind::prelude::*;
//! use txbind::backends::memory::{MemoryConnectionFactory, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let store = MemoryStore::new();
//!     let data_source = DataSource::new(MemoryConnectionFactory::new(store.clone()));
//!     let manager = TransactionManager::new(data_source.clone());
//!     let mut registry = ResourceRegistry::new();
//!
//!     let mut status = manager
//!         .begin_transaction(&mut registry, &TransactionDefinition::default())
//!         .await?;
//!     let lease = acquire_connection(&mut registry, &data_source).await?;
//!     lease.put("greeting", "hello")?;
//!     release_connection(Some(lease)).await?;
//!     manager.commit(&mut registry, &mut status).await?;
//!
//!     assert!(store.get("greeting").is_some());
//!     Ok(())
//! }
//! ```

use super::access::bind_transactional_holder;
use super::connection::{Connection, ConnectionFactory, DataSource};
use super::definition::{Propagation, TransactionDefinition};
use super::error::{Result, TransactionError};
use super::holder::ResourceHolder;
use super::registry::ResourceRegistry;
use super::synchronization::{CompletionStatus, TransactionSynchronization};
use super::transaction::{
    SuspendedResources, SuspendedTransaction, TransactionObject, TransactionStatus,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Boxed future returned by the body of [`TransactionManager::execute_in_transaction`]
pub type TransactionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Transaction manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionManagerConfig {
    /// Timeout applied when a definition does not set one
    pub default_timeout_seconds: Option<u64>,
    /// Roll back when the engine commit fails
    pub rollback_on_commit_failure: bool,
    /// Report `UnexpectedRollback` from participating commits as well
    pub fail_early_on_global_rollback_only: bool,
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: None,
            rollback_on_commit_failure: false,
            fail_early_on_global_rollback_only: false,
        }
    }
}

impl TransactionManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout used when a definition has none
    pub fn with_default_timeout(mut self, seconds: u64) -> Self {
        self.default_timeout_seconds = Some(seconds);
        self
    }

    pub fn with_rollback_on_commit_failure(mut self, enabled: bool) -> Self {
        self.rollback_on_commit_failure = enabled;
        self
    }

    pub fn with_fail_early_on_global_rollback_only(mut self, enabled: bool) -> Self {
        self.fail_early_on_global_rollback_only = enabled;
        self
    }

    /// Load a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            TransactionError::configuration(format!("Invalid transaction manager config: {}", e))
        })?;
        if config.default_timeout_seconds == Some(0) {
            return Err(TransactionError::configuration(
                "default_timeout_seconds must be at least one second",
            ));
        }
        Ok(config)
    }
}

/// Keep the first error seen while completing a transaction
fn keep_first(slot: &mut Option<TransactionError>, result: Result<()>) {
    if let Err(e) = result {
        if slot.is_none() {
            *slot = Some(e);
        } else {
            warn!(error = %e, "further error during transaction completion");
        }
    }
}

/// Transaction manager for one data source
pub struct TransactionManager<F> {
    data_source: DataSource<F>,
    config: TransactionManagerConfig,
}

impl<F> Clone for TransactionManager<F> {
    fn clone(&self) -> Self {
        Self {
            data_source: self.data_source.clone(),
            config: self.config.clone(),
        }
    }
}

impl<F> std::fmt::Debug for TransactionManager<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("data_source", &self.data_source)
            .field("config", &self.config)
            .finish()
    }
}

impl<F: ConnectionFactory> TransactionManager<F> {
    pub fn new(data_source: DataSource<F>) -> Self {
        Self::with_config(data_source, TransactionManagerConfig::default())
    }

    pub fn with_config(data_source: DataSource<F>, config: TransactionManagerConfig) -> Self {
        Self {
            data_source,
            config,
        }
    }

    pub fn data_source(&self) -> &DataSource<F> {
        &self.data_source
    }

    pub fn config(&self) -> &TransactionManagerConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Hooks
    // ---------------------------------------------------------------------

    /// Wrap whatever holder is bound for the data source
    pub fn do_get_transaction(
        &self,
        registry: &ResourceRegistry,
    ) -> TransactionObject<F::Connection> {
        TransactionObject::new(registry.lookup(self.data_source.id()), false)
    }

    pub fn is_existing_transaction(&self, transaction: &TransactionObject<F::Connection>) -> bool {
        transaction.has_transaction()
    }

    /// Start a transaction on `transaction`
    ///
    /// No connection is opened here; the holder bound by this call opens one
    /// on first use.
    ///
    /// # Errors
    ///
    /// `UnsupportedIsolation` for any isolation level other than the default,
    /// before anything is created. Any other failure is returned as
    /// `CannotCreateTransaction` wrapping the cause.
    pub fn do_begin(
        &self,
        registry: &mut ResourceRegistry,
        transaction: &mut TransactionObject<F::Connection>,
        definition: &TransactionDefinition,
    ) -> Result<()> {
        if !definition.isolation.is_default() {
            return Err(TransactionError::UnsupportedIsolation(definition.isolation));
        }

        self.bind_new_holder(registry, transaction, definition)
            .map_err(|e| {
                TransactionError::cannot_create_with_source(
                    format!(
                        "Could not bind resource holder for data source {}",
                        self.data_source.id()
                    ),
                    e,
                )
            })
    }

    fn bind_new_holder(
        &self,
        registry: &mut ResourceRegistry,
        transaction: &mut TransactionObject<F::Connection>,
        definition: &TransactionDefinition,
    ) -> Result<()> {
        let timeout_seconds = definition
            .timeout_seconds
            .or(self.config.default_timeout_seconds);

        if let Some(holder) = transaction.holder() {
            // holder handed in by the caller; claim it for this transaction
            let holder = Arc::clone(holder);
            if let Some(seconds) = timeout_seconds {
                holder.set_timeout_in_seconds(seconds)?;
            }
            if registry.is_bound_to(self.data_source.id(), &holder) {
                holder.set_synchronized_with_transaction(true);
                return Ok(());
            }
            return bind_transactional_holder(registry, self.data_source.id(), holder);
        }

        let holder = Arc::new(ResourceHolder::empty());
        if let Some(seconds) = timeout_seconds {
            holder.set_timeout_in_seconds(seconds)?;
        }
        bind_transactional_holder(registry, self.data_source.id(), Arc::clone(&holder))?;
        debug!(
            data_source = %self.data_source.id(),
            timeout = ?holder.deadline(),
            "bound new holder for transaction"
        );
        transaction.set_holder(holder, true);
        Ok(())
    }

    /// Detach the transaction's holder from the context
    pub fn do_suspend(
        &self,
        registry: &mut ResourceRegistry,
        transaction: &mut TransactionObject<F::Connection>,
    ) -> Result<SuspendedResources<F::Connection>> {
        let detached = transaction.take_holder();
        let bound = registry.unbind_if_bound::<F::Connection>(self.data_source.id())?;
        let holder = bound.or(detached).ok_or_else(|| {
            TransactionError::illegal_state(format!(
                "No transaction holder to suspend for data source {}",
                self.data_source.id()
            ))
        })?;
        debug!(data_source = %self.data_source.id(), "suspended transaction holder");
        Ok(SuspendedResources { holder })
    }

    /// Re-bind a holder detached by [`do_suspend`](Self::do_suspend)
    pub fn do_resume(
        &self,
        registry: &mut ResourceRegistry,
        transaction: Option<&mut TransactionObject<F::Connection>>,
        resources: SuspendedResources<F::Connection>,
    ) -> Result<()> {
        let holder = resources.holder;
        if let Some(stale) = registry.unbind_if_bound::<F::Connection>(self.data_source.id())? {
            warn!(
                data_source = %self.data_source.id(),
                references = stale.reference_count(),
                "replacing stale binding on resume"
            );
        }
        registry.bind(self.data_source.id(), Arc::clone(&holder))?;
        if let Some(transaction) = transaction {
            transaction.set_holder(holder, false);
        }
        debug!(data_source = %self.data_source.id(), "resumed transaction holder");
        Ok(())
    }

    /// Commit on the holder's connection; a holder never used has nothing to commit
    pub async fn do_commit(&self, status: &TransactionStatus<F::Connection>) -> Result<()> {
        let Some(connection) = status.transaction().holder().and_then(|h| h.connection()) else {
            debug!("transaction never opened a connection; nothing to commit");
            return Ok(());
        };
        debug!(data_source = %self.data_source.id(), "committing transaction");
        connection
            .commit()
            .await
            .map_err(|e| TransactionError::system("Could not commit transaction", e))
    }

    /// Roll back on the holder's connection
    pub async fn do_rollback(&self, status: &TransactionStatus<F::Connection>) -> Result<()> {
        let Some(connection) = status.transaction().holder().and_then(|h| h.connection()) else {
            debug!("transaction never opened a connection; nothing to roll back");
            return Ok(());
        };
        debug!(data_source = %self.data_source.id(), "rolling back transaction");
        connection
            .rollback()
            .await
            .map_err(|e| TransactionError::system("Could not roll back transaction", e))
    }

    /// Mark the holder rollback-only for every participant
    pub fn do_set_rollback_only(&self, status: &TransactionStatus<F::Connection>) {
        if let Some(holder) = status.transaction().holder() {
            debug!(data_source = %self.data_source.id(), "marking transaction rollback-only");
            holder.mark_rollback_only();
        }
    }

    /// Release the holder a new transaction created
    pub async fn do_cleanup_after_completion(
        &self,
        registry: &mut ResourceRegistry,
        transaction: &TransactionObject<F::Connection>,
    ) -> Result<()> {
        let Some(holder) = transaction.holder() else {
            return Ok(());
        };
        if !transaction.is_new_holder() {
            return Ok(());
        }
        if registry.is_bound_to(self.data_source.id(), holder) {
            registry.unbind::<F::Connection>(self.data_source.id())?;
        }
        holder.set_synchronized_with_transaction(false);
        holder.dispose_if_unreferenced().await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Template
    // ---------------------------------------------------------------------

    /// Start or join a transaction according to `definition.propagation`
    pub async fn begin_transaction(
        &self,
        registry: &mut ResourceRegistry,
        definition: &TransactionDefinition,
    ) -> Result<TransactionStatus<F::Connection>> {
        let transaction = self.do_get_transaction(registry);

        if self.is_existing_transaction(&transaction) {
            return self.handle_existing_transaction(registry, definition, transaction);
        }

        match definition.propagation {
            Propagation::Mandatory => Err(TransactionError::illegal_transaction_state(
                "No existing transaction found for transaction marked with propagation 'mandatory'",
            )),
            Propagation::Required | Propagation::RequiresNew | Propagation::Nested => {
                let suspended = self.suspend(registry, None)?;
                debug!(
                    name = ?definition.name,
                    propagation = %definition.propagation,
                    "creating new transaction"
                );
                self.start_transaction(registry, definition, transaction, suspended)
            }
            Propagation::Supports | Propagation::NotSupported | Propagation::Never => {
                debug!(
                    propagation = %definition.propagation,
                    "running without a transaction"
                );
                Ok(TransactionStatus::new(
                    TransactionObject::empty(),
                    false,
                    false,
                    definition.read_only,
                    definition.name.clone(),
                    None,
                ))
            }
        }
    }

    fn handle_existing_transaction(
        &self,
        registry: &mut ResourceRegistry,
        definition: &TransactionDefinition,
        mut transaction: TransactionObject<F::Connection>,
    ) -> Result<TransactionStatus<F::Connection>> {
        match definition.propagation {
            Propagation::Never => Err(TransactionError::illegal_transaction_state(
                "Existing transaction found for transaction marked with propagation 'never'",
            )),
            Propagation::Nested => Err(TransactionError::illegal_transaction_state(
                "Nested transactions are not supported",
            )),
            Propagation::NotSupported => {
                debug!("suspending current transaction");
                let suspended = self.suspend(registry, Some(&mut transaction))?;
                Ok(TransactionStatus::new(
                    TransactionObject::empty(),
                    false,
                    false,
                    definition.read_only,
                    definition.name.clone(),
                    suspended,
                ))
            }
            Propagation::RequiresNew => {
                debug!(name = ?definition.name, "suspending current transaction, creating new transaction");
                let suspended = self.suspend(registry, Some(&mut transaction))?;
                self.start_transaction(registry, definition, transaction, suspended)
            }
            Propagation::Required | Propagation::Supports | Propagation::Mandatory => {
                debug!("participating in existing transaction");
                Ok(TransactionStatus::new(
                    transaction,
                    false,
                    false,
                    definition.read_only,
                    definition.name.clone(),
                    None,
                ))
            }
        }
    }

    fn start_transaction(
        &self,
        registry: &mut ResourceRegistry,
        definition: &TransactionDefinition,
        mut transaction: TransactionObject<F::Connection>,
        suspended: Option<SuspendedTransaction<F::Connection>>,
    ) -> Result<TransactionStatus<F::Connection>> {
        registry.init_synchronization()?;
        registry.set_actual_transaction_active(true);
        registry.set_current_transaction_name(definition.name.clone());
        registry.set_current_transaction_read_only(definition.read_only);

        if let Err(e) = self.do_begin(registry, &mut transaction, definition) {
            registry.clear();
            if let Err(resume_error) = self.resume(registry, suspended) {
                error!(error = %resume_error, "failed to resume outer transaction after begin failure");
            }
            return Err(e);
        }

        Ok(TransactionStatus::new(
            transaction,
            true,
            true,
            definition.read_only,
            definition.name.clone(),
            suspended,
        ))
    }

    /// Suspend the running transaction and its synchronizations
    fn suspend(
        &self,
        registry: &mut ResourceRegistry,
        transaction: Option<&mut TransactionObject<F::Connection>>,
    ) -> Result<Option<SuspendedTransaction<F::Connection>>> {
        let resources = match transaction {
            Some(transaction) if transaction.has_transaction() => {
                Some(self.do_suspend(registry, transaction)?)
            }
            _ => None,
        };

        if !registry.is_synchronization_active() {
            return Ok(resources.map(|resources| SuspendedTransaction {
                resources: Some(resources),
                synchronizations: None,
                name: None,
                read_only: false,
                was_active: false,
            }));
        }

        let synchronizations = registry.synchronizations()?;
        for synchronization in &synchronizations {
            synchronization.suspend(registry)?;
        }
        let suspended = SuspendedTransaction {
            resources,
            synchronizations: Some(synchronizations),
            name: registry.current_transaction_name().map(str::to_string),
            read_only: registry.is_current_transaction_read_only(),
            was_active: registry.is_actual_transaction_active(),
        };
        registry.clear();
        Ok(Some(suspended))
    }

    /// Restore a transaction captured by `suspend`
    fn resume(
        &self,
        registry: &mut ResourceRegistry,
        suspended: Option<SuspendedTransaction<F::Connection>>,
    ) -> Result<()> {
        let Some(suspended) = suspended else {
            return Ok(());
        };
        if let Some(resources) = suspended.resources {
            self.do_resume(registry, None, resources)?;
        }
        if let Some(synchronizations) = suspended.synchronizations {
            registry.set_actual_transaction_active(suspended.was_active);
            registry.set_current_transaction_name(suspended.name);
            registry.set_current_transaction_read_only(suspended.read_only);
            registry.init_synchronization()?;
            for synchronization in synchronizations {
                synchronization.resume(registry)?;
                registry.register_synchronization(synchronization)?;
            }
        }
        Ok(())
    }

    /// Commit the transaction behind `status`
    ///
    /// Rolls back instead if the status or the transaction is rollback-only.
    ///
    /// # Errors
    ///
    /// - `IllegalTransactionState` if the status has already completed
    /// - `UnexpectedRollback` if a rollback-only transaction was rolled back
    /// - `TransactionSystem` if the engine commit failed
    /// - errors from synchronizations, after the outcome has been decided
    pub async fn commit(
        &self,
        registry: &mut ResourceRegistry,
        status: &mut TransactionStatus<F::Connection>,
    ) -> Result<()> {
        if status.is_completed() {
            return Err(TransactionError::illegal_transaction_state(
                "Transaction is already completed - do not call commit or rollback more than once per transaction",
            ));
        }

        if status.is_local_rollback_only() {
            debug!("transactional code has requested rollback");
            return self.process_rollback(registry, status, false).await;
        }
        if status.is_global_rollback_only() {
            debug!("global transaction is marked as rollback-only but commit was requested");
            return self.process_rollback(registry, status, true).await;
        }

        self.process_commit(registry, status).await
    }

    /// Roll back the transaction behind `status`
    ///
    /// A participating status marks the shared transaction rollback-only
    /// instead of rolling back.
    pub async fn rollback(
        &self,
        registry: &mut ResourceRegistry,
        status: &mut TransactionStatus<F::Connection>,
    ) -> Result<()> {
        if status.is_completed() {
            return Err(TransactionError::illegal_transaction_state(
                "Transaction is already completed - do not call commit or rollback more than once per transaction",
            ));
        }
        self.process_rollback(registry, status, false).await
    }

    /// Mark `status` and its transaction rollback-only
    pub fn set_rollback_only(&self, status: &mut TransactionStatus<F::Connection>) {
        status.set_local_rollback_only();
        self.do_set_rollback_only(status);
    }

    /// Run `body` in a transaction
    ///
    /// Commits when `body` returns `Ok`, rolls back when it returns `Err`. A
    /// failing rollback takes precedence over the error of `body`, which is
    /// logged.
    pub async fn execute_in_transaction<T, B>(
        &self,
        registry: &mut ResourceRegistry,
        definition: &TransactionDefinition,
        body: B,
    ) -> Result<T>
    where
        T: Send,
        B: for<'a> FnOnce(&'a mut ResourceRegistry) -> TransactionFuture<'a, T> + Send,
    {
        let mut status = self.begin_transaction(registry, definition).await?;

        match body(registry).await {
            Ok(value) => {
                self.commit(registry, &mut status).await?;
                Ok(value)
            }
            Err(app_error) => {
                debug!(error = %app_error, "rolling back transaction on application error");
                if let Err(rollback_error) = self.rollback(registry, &mut status).await {
                    error!(
                        error = %app_error,
                        "application error overridden by rollback error"
                    );
                    return Err(rollback_error);
                }
                Err(app_error)
            }
        }
    }

    async fn process_commit(
        &self,
        registry: &mut ResourceRegistry,
        status: &mut TransactionStatus<F::Connection>,
    ) -> Result<()> {
        if let Err(e) = self.trigger_before_commit(registry, status) {
            let mut deferred = None;
            keep_first(&mut deferred, self.trigger_before_completion(registry, status).await);
            return Err(self
                .fail_commit(registry, status, e, true, deferred)
                .await);
        }

        let mut deferred = None;
        keep_first(&mut deferred, self.trigger_before_completion(registry, status).await);

        if status.is_new_transaction() {
            if let Err(e) = self.do_commit(status).await {
                let roll_back = self.config.rollback_on_commit_failure;
                return Err(self
                    .fail_commit(registry, status, e, roll_back, deferred)
                    .await);
            }
        }

        keep_first(
            &mut deferred,
            self.trigger_after_completion(registry, status, CompletionStatus::Committed)
                .await,
        );
        keep_first(&mut deferred, self.cleanup_after_completion(registry, status).await);

        match deferred {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Finish a commit that failed; returns the error to report
    async fn fail_commit(
        &self,
        registry: &mut ResourceRegistry,
        status: &mut TransactionStatus<F::Connection>,
        cause: TransactionError,
        roll_back: bool,
        deferred: Option<TransactionError>,
    ) -> TransactionError {
        error!(error = %cause, "transaction commit failed");
        if let Some(e) = deferred {
            warn!(error = %e, "synchronization error superseded by commit failure");
        }

        let completion = if !roll_back {
            CompletionStatus::Unknown
        } else if status.is_new_transaction() {
            match self.do_rollback(status).await {
                Ok(()) => CompletionStatus::RolledBack,
                Err(rollback_error) => {
                    error!(error = %rollback_error, "rollback after commit failure failed");
                    CompletionStatus::Unknown
                }
            }
        } else {
            self.do_set_rollback_only(status);
            CompletionStatus::RolledBack
        };

        if let Err(e) = self.trigger_after_completion(registry, status, completion).await {
            warn!(error = %e, "synchronization error after commit failure");
        }
        if let Err(e) = self.cleanup_after_completion(registry, status).await {
            warn!(error = %e, "cleanup error after commit failure");
        }
        cause
    }

    async fn process_rollback(
        &self,
        registry: &mut ResourceRegistry,
        status: &mut TransactionStatus<F::Connection>,
        unexpected: bool,
    ) -> Result<()> {
        let mut deferred = None;
        keep_first(&mut deferred, self.trigger_before_completion(registry, status).await);

        let outcome = if status.is_new_transaction() {
            debug!("initiating transaction rollback");
            self.do_rollback(status).await
        } else if status.has_transaction() {
            debug!("participating transaction failed - marking existing transaction as rollback-only");
            self.do_set_rollback_only(status);
            Ok(())
        } else {
            debug!("should roll back transaction but cannot - no transaction available");
            Ok(())
        };

        let completion = match outcome {
            Ok(()) => CompletionStatus::RolledBack,
            Err(_) => CompletionStatus::Unknown,
        };
        keep_first(
            &mut deferred,
            self.trigger_after_completion(registry, status, completion).await,
        );
        keep_first(&mut deferred, self.cleanup_after_completion(registry, status).await);

        if let Err(e) = outcome {
            if let Some(d) = deferred {
                warn!(error = %d, "synchronization error superseded by rollback failure");
            }
            return Err(e);
        }

        if unexpected
            && (status.is_new_transaction() || self.config.fail_early_on_global_rollback_only)
        {
            return Err(TransactionError::UnexpectedRollback(
                "Transaction rolled back because it has been marked as rollback-only".to_string(),
            ));
        }

        match deferred {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn synchronizations_of(
        &self,
        registry: &ResourceRegistry,
        status: &TransactionStatus<F::Connection>,
    ) -> Vec<Arc<dyn TransactionSynchronization>> {
        if !status.is_new_synchronization() {
            return Vec::new();
        }
        registry.synchronizations().unwrap_or_default()
    }

    fn trigger_before_commit(
        &self,
        registry: &mut ResourceRegistry,
        status: &TransactionStatus<F::Connection>,
    ) -> Result<()> {
        for synchronization in self.synchronizations_of(registry, status) {
            synchronization.before_commit(registry, status.is_read_only())?;
        }
        Ok(())
    }

    async fn trigger_before_completion(
        &self,
        registry: &mut ResourceRegistry,
        status: &TransactionStatus<F::Connection>,
    ) -> Result<()> {
        let mut first = None;
        for synchronization in self.synchronizations_of(registry, status) {
            if let Err(e) = synchronization.before_completion(registry).await {
                error!(error = %e, "before-completion synchronization failed");
                keep_first(&mut first, Err(e));
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn trigger_after_completion(
        &self,
        registry: &mut ResourceRegistry,
        status: &TransactionStatus<F::Connection>,
        completion: CompletionStatus,
    ) -> Result<()> {
        let mut first = None;
        for synchronization in self.synchronizations_of(registry, status) {
            if let Err(e) = synchronization.after_completion(registry, completion).await {
                error!(error = %e, ?completion, "after-completion synchronization failed");
                keep_first(&mut first, Err(e));
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn cleanup_after_completion(
        &self,
        registry: &mut ResourceRegistry,
        status: &mut TransactionStatus<F::Connection>,
    ) -> Result<()> {
        status.set_completed();
        if status.is_new_synchronization() {
            registry.clear();
        }

        let mut first = None;
        if status.is_new_transaction() {
            keep_first(
                &mut first,
                self.do_cleanup_after_completion(registry, status.transaction())
                    .await,
            );
        }
        if let Some(suspended) = status.take_suspended() {
            debug!("resuming suspended transaction after completion of inner transaction");
            keep_first(&mut first, self.resume(registry, Some(suspended)));
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
