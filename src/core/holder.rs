//! Reference-counted connection holder
//!
//! A [`ResourceHolder`] is the single owner of one connection for as long as
//! a transaction or a chain of operations needs it. Acquire/release are
//! borrow/return operations on a counter; the connection is closed by
//! [`ResourceHolder::dispose_if_unreferenced`] once nothing references it
//! and no transaction claims it any more.

use super::connection::Connection;
use super::error::{DatabaseResult, Result, TransactionError};
use super::registry::BoundResource;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

struct HolderState<C> {
    connection: Option<Arc<C>>,
    reference_count: usize,
    synchronized_with_transaction: bool,
    rollback_only: bool,
    deadline: Option<DateTime<Utc>>,
    void: bool,
}

/// Reference-counted owner of one connection
pub struct ResourceHolder<C> {
    state: Mutex<HolderState<C>>,
}

impl<C: Connection> ResourceHolder<C> {
    /// Create a holder owning an already open connection
    pub fn new(connection: C) -> Self {
        Self::with_state(Some(Arc::new(connection)))
    }

    /// Create a holder around a connection the caller also keeps a handle to
    pub fn from_shared(connection: Arc<C>) -> Self {
        Self::with_state(Some(connection))
    }

    /// Create a holder whose connection is opened on first use
    pub fn empty() -> Self {
        Self::with_state(None)
    }

    fn with_state(connection: Option<Arc<C>>) -> Self {
        Self {
            state: Mutex::new(HolderState {
                connection,
                reference_count: 0,
                synchronized_with_transaction: false,
                rollback_only: false,
                deadline: None,
                void: false,
            }),
        }
    }

    /// The held connection, if it has been opened
    pub fn connection(&self) -> Option<Arc<C>> {
        self.state.lock().connection.clone()
    }

    pub fn has_connection(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    /// Store the lazily opened connection
    ///
    /// A connection is never replaced once set.
    pub(crate) fn set_connection(&self, connection: Arc<C>) -> Result<()> {
        let mut state = self.state.lock();
        if state.connection.is_some() {
            return Err(TransactionError::illegal_state(
                "Holder already owns a connection",
            ));
        }
        state.connection = Some(connection);
        Ok(())
    }

    /// Register one more user of the connection
    pub fn acquire(&self) -> usize {
        let mut state = self.state.lock();
        state.reference_count += 1;
        state.void = false;
        state.reference_count
    }

    /// Return one use of the connection
    pub fn release(&self) -> Result<usize> {
        let mut state = self.state.lock();
        if state.reference_count == 0 {
            return Err(TransactionError::illegal_state(
                "Holder released more often than it was acquired",
            ));
        }
        state.reference_count -= 1;
        Ok(state.reference_count)
    }

    pub fn reference_count(&self) -> usize {
        self.state.lock().reference_count
    }

    /// True while at least one user holds the connection
    pub fn is_open(&self) -> bool {
        self.state.lock().reference_count > 0
    }

    /// Mark the holder rollback-only; this cannot be undone
    pub fn mark_rollback_only(&self) {
        self.state.lock().rollback_only = true;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.state.lock().rollback_only
    }

    pub fn is_synchronized_with_transaction(&self) -> bool {
        self.state.lock().synchronized_with_transaction
    }

    /// Claim or release the holder on behalf of a transaction
    ///
    /// A claimed holder is never disposed.
    pub fn set_synchronized_with_transaction(&self, synchronized: bool) {
        self.state.lock().synchronized_with_transaction = synchronized;
    }

    pub fn is_void(&self) -> bool {
        self.state.lock().void
    }

    /// Mark the holder as no longer valid for lookups until re-acquired
    pub fn mark_void(&self) {
        self.state.lock().void = true;
    }

    /// Set the transaction deadline to `seconds` from now
    ///
    /// Rejected once the connection is open: the engine transaction has
    /// already started and can no longer honour a deadline.
    pub fn set_timeout_in_seconds(&self, seconds: u64) -> Result<()> {
        if seconds == 0 {
            return Err(TransactionError::configuration(
                "Transaction timeout must be at least one second",
            ));
        }
        let delta = i64::try_from(seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| {
                TransactionError::configuration(format!("Timeout of {}s is out of range", seconds))
            })?;
        let deadline = Utc::now().checked_add_signed(delta).ok_or_else(|| {
            TransactionError::configuration(format!("Timeout of {}s is out of range", seconds))
        })?;

        let mut state = self.state.lock();
        if state.connection.is_some() {
            return Err(TransactionError::configuration(
                "Cannot set a timeout after the connection has been opened",
            ));
        }
        state.deadline = Some(deadline);
        Ok(())
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.state.lock().deadline
    }

    pub fn has_timeout(&self) -> bool {
        self.state.lock().deadline.is_some()
    }

    /// Time left before the deadline
    ///
    /// Once the deadline has passed the holder is marked rollback-only and
    /// `TransactionTimedOut` is returned.
    pub fn time_to_live(&self) -> Result<Option<Duration>> {
        let mut state = self.state.lock();
        let Some(deadline) = state.deadline else {
            return Ok(None);
        };
        let remaining = deadline.signed_duration_since(Utc::now());
        if remaining <= chrono::Duration::zero() {
            state.rollback_only = true;
            return Err(TransactionError::TransactionTimedOut { deadline });
        }
        Ok(Some(remaining.to_std().unwrap_or(Duration::ZERO)))
    }

    /// Time left before the deadline, rounded up to whole seconds
    pub fn time_to_live_in_seconds(&self) -> Result<Option<u64>> {
        Ok(self.time_to_live()?.map(|ttl| {
            let secs = ttl.as_secs();
            if ttl.subsec_nanos() > 0 {
                secs + 1
            } else {
                secs
            }
        }))
    }

    /// Close the connection if nothing references it any more
    ///
    /// Closes only when the counter is zero and no transaction claims the
    /// holder. The connection is taken out before closing, so it is closed
    /// at most once no matter how often this is called.
    pub async fn dispose_if_unreferenced(&self) -> DatabaseResult<bool> {
        let connection = {
            let mut state = self.state.lock();
            if state.reference_count > 0 || state.synchronized_with_transaction {
                return Ok(false);
            }
            state.connection.take()
        };

        match connection {
            Some(connection) => {
                debug!("closing connection released by its holder");
                connection.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl<C: Connection> BoundResource for ResourceHolder<C> {
    fn is_void(&self) -> bool {
        ResourceHolder::is_void(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<C> std::fmt::Debug for ResourceHolder<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ResourceHolder")
            .field("has_connection", &state.connection.is_some())
            .field("reference_count", &state.reference_count)
            .field("synchronized_with_transaction", &state.synchronized_with_transaction)
            .field("rollback_only", &state.rollback_only)
            .field("deadline", &state.deadline)
            .field("void", &state.void)
            .finish()
    }
}
