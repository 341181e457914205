//! In-memory key/value backend
//!
//! A [`MemoryStore`] is a shared image of committed data. Every
//! [`MemoryConnection`] opened against it runs in an implicit transaction:
//! writes go to a private pending set that `commit` applies to the image and
//! `rollback` discards. Closing a connection commits whatever is pending.
//!
//! The store counts opened and closed connections, which makes it the
//! backend of choice for checking connection lifecycles.

use crate::core::connection::{Connection, ConnectionFactory};
use crate::core::error::{DatabaseError, DatabaseResult};
use crate::core::value::Value;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Default)]
struct StoreInner {
    data: RwLock<BTreeMap<String, Value>>,
    open: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

/// Connection lifecycle counters of a [`MemoryStore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Connections opened so far
    pub opened: usize,
    /// Connections closed so far
    pub closed: usize,
    /// Connections currently open
    pub open: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

/// Shared in-memory image; clones refer to the same image
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed value for `key`
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.data.read().get(key).cloned()
    }

    /// Committed keys in order
    pub fn keys(&self) -> Vec<String> {
        self.inner.data.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.read().is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            opened: self.inner.opened.load(Ordering::SeqCst),
            closed: self.inner.closed.load(Ordering::SeqCst),
            open: self.inner.open.load(Ordering::SeqCst),
            commits: self.inner.commits.load(Ordering::SeqCst),
            rollbacks: self.inner.rollbacks.load(Ordering::SeqCst),
        }
    }

    fn apply(&self, pending: BTreeMap<String, Option<Value>>) {
        if pending.is_empty() {
            return;
        }
        let mut data = self.inner.data.write();
        for (key, value) in pending {
            match value {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Connection to a [`MemoryStore`]
pub struct MemoryConnection {
    store: MemoryStore,
    /// `None` marks a pending delete
    pending: Mutex<BTreeMap<String, Option<Value>>>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn open(store: MemoryStore) -> Self {
        store.inner.opened.fetch_add(1, Ordering::SeqCst);
        store.inner.open.fetch_add(1, Ordering::SeqCst);
        Self {
            store,
            pending: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> DatabaseResult<()> {
        if self.is_closed() {
            return Err(DatabaseError::ConnectionClosed);
        }
        Ok(())
    }

    /// Read `key`, seeing this connection's own uncommitted writes
    pub fn get(&self, key: &str) -> DatabaseResult<Option<Value>> {
        self.ensure_open()?;
        if let Some(pending) = self.pending.lock().get(key) {
            return Ok(pending.clone());
        }
        Ok(self.store.get(key))
    }

    /// Write `key` in the current transaction
    pub fn put(&self, key: impl Into<String>, value: impl Into<Value>) -> DatabaseResult<()> {
        self.ensure_open()?;
        let key = key.into();
        if key.is_empty() {
            return Err(DatabaseError::not_storable("empty key"));
        }
        trace!(key = %key, "pending put");
        self.pending.lock().insert(key, Some(value.into()));
        Ok(())
    }

    /// Delete `key` in the current transaction
    ///
    /// Returns whether the key was visible before the delete.
    pub fn delete(&self, key: &str) -> DatabaseResult<bool> {
        let existed = self.get(key)?.is_some();
        self.pending.lock().insert(key.to_string(), None);
        Ok(existed)
    }

    /// True if the current transaction has uncommitted writes
    pub fn is_dirty(&self) -> bool {
        !self.pending.lock().is_empty()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn commit(&self) -> DatabaseResult<()> {
        self.ensure_open()?;
        let pending = std::mem::take(&mut *self.pending.lock());
        debug!(writes = pending.len(), "memory commit");
        self.store.apply(pending);
        self.store.inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> DatabaseResult<()> {
        self.ensure_open()?;
        let discarded = std::mem::take(&mut *self.pending.lock());
        debug!(writes = discarded.len(), "memory rollback");
        self.store.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> DatabaseResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DatabaseError::ConnectionClosed);
        }
        let pending = std::mem::take(&mut *self.pending.lock());
        self.store.apply(pending);
        self.store.inner.open.fetch_sub(1, Ordering::SeqCst);
        self.store.inner.closed.fetch_add(1, Ordering::SeqCst);
        debug!("memory connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        // dropped without close: pending writes are lost, like a dead client
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.store.inner.open.fetch_sub(1, Ordering::SeqCst);
            debug!("memory connection dropped without close");
        }
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("pending", &self.pending.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Opens [`MemoryConnection`]s against one store
#[derive(Debug, Clone)]
pub struct MemoryConnectionFactory {
    store: MemoryStore,
    exclusive: bool,
}

impl MemoryConnectionFactory {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            exclusive: false,
        }
    }

    /// A factory that refuses to open while any connection to the store is open
    pub fn exclusive(store: MemoryStore) -> Self {
        Self {
            store,
            exclusive: true,
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    type Connection = MemoryConnection;

    async fn create_connection(&self) -> DatabaseResult<MemoryConnection> {
        if self.exclusive && self.store.inner.open.load(Ordering::SeqCst) > 0 {
            return Err(DatabaseError::locked(
                "memory store is opened exclusively by another connection",
            ));
        }
        Ok(MemoryConnection::open(self.store.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_publishes_pending_writes() {
        let store = MemoryStore::new();
        let factory = MemoryConnectionFactory::new(store.clone());
        let conn = factory.create_connection().await.unwrap();

        conn.put("a", 1i64).unwrap();
        assert_eq!(conn.get("a").unwrap(), Some(Value::Integer(1)));
        assert!(store.get("a").is_none());

        conn.commit().await.unwrap();
        assert_eq!(store.get("a"), Some(Value::Integer(1)));
        assert!(!conn.is_dirty());
    }

    #[tokio::test]
    async fn test_rollback_discards_and_begins_anew() {
        let store = MemoryStore::new();
        let conn = MemoryConnectionFactory::new(store.clone())
            .create_connection()
            .await
            .unwrap();

        conn.put("a", "x").unwrap();
        conn.rollback().await.unwrap();
        assert!(conn.get("a").unwrap().is_none());

        conn.put("b", "y").unwrap();
        conn.commit().await.unwrap();
        assert_eq!(store.keys(), vec!["b".to_string()]);
        assert_eq!(store.stats().rollbacks, 1);
        assert_eq!(store.stats().commits, 1);
    }

    #[tokio::test]
    async fn test_close_commits_pending_and_only_once() {
        let store = MemoryStore::new();
        let conn = MemoryConnectionFactory::new(store.clone())
            .create_connection()
            .await
            .unwrap();
        conn.put("k", true).unwrap();

        conn.close().await.unwrap();
        assert_eq!(store.get("k"), Some(Value::Boolean(true)));
        assert!(matches!(
            conn.close().await,
            Err(DatabaseError::ConnectionClosed)
        ));
        assert!(matches!(conn.get("k"), Err(DatabaseError::ConnectionClosed)));

        let stats = store.stats();
        assert_eq!((stats.opened, stats.closed, stats.open), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_empty_key_is_not_storable() {
        let conn = MemoryConnectionFactory::new(MemoryStore::new())
            .create_connection()
            .await
            .unwrap();
        assert!(matches!(conn.put("", 1i64), Err(DatabaseError::NotStorable(_))));
    }

    #[tokio::test]
    async fn test_delete_is_transactional() {
        let store = MemoryStore::new();
        let factory = MemoryConnectionFactory::new(store.clone());
        let conn = factory.create_connection().await.unwrap();
        conn.put("k", 1i64).unwrap();
        conn.commit().await.unwrap();

        assert!(conn.delete("k").unwrap());
        assert!(conn.get("k").unwrap().is_none());
        assert!(store.get("k").is_some());
        conn.commit().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_exclusive_factory_reports_lock() {
        let store = MemoryStore::new();
        let factory = MemoryConnectionFactory::exclusive(store.clone());

        let first = factory.create_connection().await.unwrap();
        assert!(matches!(
            factory.create_connection().await,
            Err(DatabaseError::DatabaseLocked(_))
        ));

        first.close().await.unwrap();
        assert!(factory.create_connection().await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_connection_releases_exclusive_store() {
        let store = MemoryStore::new();
        let factory = MemoryConnectionFactory::exclusive(store.clone());

        let conn = factory.create_connection().await.unwrap();
        conn.put("lost", 1i64).unwrap();
        drop(conn);

        let stats = store.stats();
        assert_eq!((stats.opened, stats.closed, stats.open), (1, 0, 0));
        assert!(store.is_empty());
        assert!(factory.create_connection().await.is_ok());
    }
}
