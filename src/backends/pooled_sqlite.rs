//! Embedded-client SQLite backend
//!
//! Connections are clients drawn from one shared deadpool-sqlite pool over a
//! database file. Opening a [`PooledSqliteConnection`] checks a client out
//! and begins a transaction on it; closing commits what is pending and hands
//! the client back to the pool.

use super::sqlite::{end_transaction, execute_raw, query_raw, DEFAULT_BUSY_TIMEOUT};
use crate::core::connection::{Connection, ConnectionFactory};
use crate::core::error::{DatabaseError, DatabaseResult};
use crate::core::value::{Row, Value};
use async_trait::async_trait;
use deadpool_sqlite::{Config, Object, Pool, Runtime};
use rusqlite::Connection as RawConnection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Default timeout for database operations (30 seconds)
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the shared embedded pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PooledSqliteConfig {
    /// Database file shared by every client
    pub path: PathBuf,
    /// Maximum number of clients in the pool
    pub max_size: usize,
    /// Timeout for database operations, in milliseconds
    pub operation_timeout_ms: u64,
    /// Busy timeout every client starts with, in milliseconds
    pub busy_timeout_ms: u64,
}

impl Default for PooledSqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            max_size: 16,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT.as_millis() as u64,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT.as_millis() as u64,
        }
    }
}

impl PooledSqliteConfig {
    /// Create a new pool configuration
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set database operation timeout
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the busy timeout applied on every checkout
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of clients in the pool
    pub size: usize,
    /// Number of idle clients
    pub available: usize,
    /// Number of requests waiting for a client
    pub waiting: usize,
}

/// A pooled client running in an implicit transaction
pub struct PooledSqliteConnection {
    client: Mutex<Option<Object>>,
    closed: AtomicBool,
    operation_timeout: Duration,
}

impl PooledSqliteConnection {
    async fn interact<T, Func>(&self, f: Func) -> DatabaseResult<T>
    where
        T: Send + 'static,
        Func: FnOnce(&RawConnection) -> DatabaseResult<T> + Send + 'static,
    {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(DatabaseError::ConnectionClosed)?;

        tokio::time::timeout(self.operation_timeout, client.interact(move |conn| f(conn)))
            .await
            .map_err(|_| DatabaseError::query_timeout(self.operation_timeout.as_millis() as u64))?
            .map_err(|e| DatabaseError::pool(format!("Interact error: {}", e)))?
    }

    /// Execute a statement in the current transaction
    pub async fn execute(&self, sql: &str, params: &[Value]) -> DatabaseResult<u64> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.interact(move |conn| execute_raw(conn, &sql, &params))
            .await
    }

    /// Run a query in the current transaction
    pub async fn query(&self, sql: &str, params: &[Value]) -> DatabaseResult<Vec<Row>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.interact(move |conn| query_raw(conn, &sql, &params))
            .await
    }

    /// Execute several statements without parameters
    pub async fn execute_batch(&self, sql: &str) -> DatabaseResult<()> {
        let sql = sql.to_string();
        self.interact(move |conn| Ok(conn.execute_batch(&sql)?))
            .await
    }
}

#[async_trait]
impl Connection for PooledSqliteConnection {
    async fn commit(&self) -> DatabaseResult<()> {
        debug!("pooled sqlite commit");
        self.interact(|conn| end_transaction(conn, true)).await
    }

    async fn rollback(&self) -> DatabaseResult<()> {
        debug!("pooled sqlite rollback");
        self.interact(|conn| end_transaction(conn, false)).await
    }

    async fn close(&self) -> DatabaseResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DatabaseError::ConnectionClosed);
        }
        let result = self
            .interact(|conn| {
                if !conn.is_autocommit() {
                    conn.execute_batch("COMMIT")?;
                }
                Ok(())
            })
            .await;

        // the client goes back to the pool either way
        let client = self.client.lock().await.take();
        drop(client);
        debug!("pooled sqlite client returned to pool");
        result
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn apply_timeout(&self, time_to_live: Duration) -> DatabaseResult<()> {
        self.interact(move |conn| Ok(conn.busy_timeout(time_to_live)?))
            .await
    }
}

impl std::fmt::Debug for PooledSqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSqliteConnection")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Draws [`PooledSqliteConnection`]s from one shared embedded pool
#[derive(Clone)]
pub struct PooledSqliteFactory {
    pool: Pool,
    config: PooledSqliteConfig,
}

impl PooledSqliteFactory {
    /// Create the shared pool
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or pool creation fails
    pub fn new(config: PooledSqliteConfig) -> DatabaseResult<Self> {
        if config.max_size == 0 {
            return Err(DatabaseError::pool("Pool max_size must be at least 1"));
        }
        let mut pool_config = Config::new(config.path.clone());
        pool_config.pool = Some(deadpool_sqlite::PoolConfig::new(config.max_size));

        let pool = pool_config
            .create_pool(Runtime::Tokio1)
            .map_err(|e| DatabaseError::connection(format!("Failed to create pool: {}", e)))?;
        debug!(path = %config.path.display(), max_size = config.max_size, "created embedded sqlite pool");

        Ok(Self { pool, config })
    }

    pub fn config(&self) -> &PooledSqliteConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let status = self.pool.status();
        PoolStats {
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }
}

impl std::fmt::Debug for PooledSqliteFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSqliteFactory")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[async_trait]
impl ConnectionFactory for PooledSqliteFactory {
    type Connection = PooledSqliteConnection;

    async fn create_connection(&self) -> DatabaseResult<PooledSqliteConnection> {
        let client = self.pool.get().await.map_err(|e| {
            DatabaseError::pool(format!("Failed to acquire client: {}", e))
        })?;

        let connection = PooledSqliteConnection {
            client: Mutex::new(Some(client)),
            closed: AtomicBool::new(false),
            operation_timeout: self.config.operation_timeout(),
        };
        let busy_timeout = self.config.busy_timeout();
        connection
            .interact(move |conn| {
                conn.execute_batch("PRAGMA foreign_keys = ON")?;
                // the previous checkout may have shortened it to a transaction deadline
                conn.busy_timeout(busy_timeout)?;
                // a client can come back from the pool mid-transaction
                if !conn.is_autocommit() {
                    conn.execute_batch("ROLLBACK")?;
                }
                conn.execute_batch("BEGIN")?;
                Ok(())
            })
            .await?;
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn factory(dir: &TempDir, max_size: usize) -> PooledSqliteFactory {
        let factory =
            PooledSqliteFactory::new(PooledSqliteConfig::new(dir.path().join("pool.db")).with_max_size(max_size))
                .unwrap();
        let setup = factory.create_connection().await.unwrap();
        setup
            .execute_batch("CREATE TABLE kv (k TEXT PRIMARY KEY, v INTEGER)")
            .await
            .unwrap();
        setup.close().await.unwrap();
        factory
    }

    #[tokio::test]
    async fn test_client_returns_to_pool_on_close() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir, 2).await;

        let conn = factory.create_connection().await.unwrap();
        assert_eq!(factory.stats().available, 0);
        conn.execute("INSERT INTO kv VALUES (?1, ?2)", &[Value::from("a"), Value::from(1i64)])
            .await
            .unwrap();
        conn.close().await.unwrap();
        assert_eq!(factory.stats().available, 1);

        let reader = factory.create_connection().await.unwrap();
        let rows = reader.query("SELECT v FROM kv WHERE k = 'a'", &[]).await.unwrap();
        assert_eq!(rows[0].get("v"), Some(&Value::Integer(1)));
        reader.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_discards_client_work() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir, 1).await;

        let conn = factory.create_connection().await.unwrap();
        conn.execute("INSERT INTO kv VALUES ('b', 2)", &[]).await.unwrap();
        conn.rollback().await.unwrap();
        let rows = conn.query("SELECT * FROM kv", &[]).await.unwrap();
        assert!(rows.is_empty());
        conn.close().await.unwrap();
        assert!(matches!(conn.commit().await, Err(DatabaseError::ConnectionClosed)));
    }

    #[test]
    fn test_zero_sized_pool_is_rejected() {
        let err = PooledSqliteFactory::new(PooledSqliteConfig::new("unused.db").with_max_size(0))
            .unwrap_err();
        assert!(matches!(err, DatabaseError::PoolError(_)));
    }

    #[test]
    fn test_config_from_json() {
        let config: PooledSqliteConfig =
            serde_json::from_str(r#"{"path": "app.db", "max_size": 4}"#).unwrap();
        assert_eq!(config.max_size, 4);
        assert_eq!(config.operation_timeout(), DEFAULT_OPERATION_TIMEOUT);
        assert_eq!(config.busy_timeout(), DEFAULT_BUSY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_transaction_deadline_does_not_outlive_checkout() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir, 1).await;

        let conn = factory.create_connection().await.unwrap();
        conn.apply_timeout(Duration::from_secs(1)).await.unwrap();
        let rows = conn.query("PRAGMA busy_timeout", &[]).await.unwrap();
        assert_eq!(rows[0].get_index(0), Some(&Value::Integer(1000)));
        conn.close().await.unwrap();

        let next = factory.create_connection().await.unwrap();
        let rows = next.query("PRAGMA busy_timeout", &[]).await.unwrap();
        assert_eq!(
            rows[0].get_index(0),
            Some(&Value::Integer(DEFAULT_BUSY_TIMEOUT.as_millis() as i64))
        );
        next.close().await.unwrap();
    }
}
