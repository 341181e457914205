//! SQLite backend
//!
//! Every [`SqliteConnection`] runs inside an explicit `BEGIN` from the moment
//! it is opened: `commit` and `rollback` finish the running transaction and
//! start the next one, `close` commits whatever is pending. Blocking rusqlite
//! calls are offloaded to the blocking thread pool with an operation timeout.

use crate::core::connection::{Connection, ConnectionFactory};
use crate::core::error::{DatabaseError, DatabaseResult};
use crate::core::value::{Row, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use rusqlite::{params_from_iter, Connection as RawConnection};

/// Default timeout for database operations (30 seconds)
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time to wait on a locked database
pub(crate) const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a SQLite connection opens its database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqliteTarget {
    /// A database file, shared by every connection opened on it
    File(PathBuf),
    /// A private in-memory database per connection
    Memory,
}

impl SqliteTarget {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        SqliteTarget::File(path.into())
    }

    fn open(&self) -> rusqlite::Result<RawConnection> {
        match self {
            SqliteTarget::File(path) => RawConnection::open(path),
            SqliteTarget::Memory => RawConnection::open_in_memory(),
        }
    }
}

impl std::fmt::Display for SqliteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqliteTarget::File(path) => write!(f, "{}", path.display()),
            SqliteTarget::Memory => write!(f, ":memory:"),
        }
    }
}

pub(crate) fn value_to_param(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Boolean(v) => rusqlite::types::Value::Integer(i64::from(*v)),
        Value::Integer(v) => rusqlite::types::Value::Integer(*v),
        Value::Real(v) => rusqlite::types::Value::Real(*v),
        Value::Text(v) => rusqlite::types::Value::Text(v.clone()),
        Value::Blob(v) => rusqlite::types::Value::Blob(v.clone()),
    }
}

pub(crate) fn convert_row(row: &rusqlite::Row) -> rusqlite::Result<Row> {
    let statement = row.as_ref();
    let mut out = Row::new();
    for i in 0..statement.column_count() {
        let name = statement.column_name(i)?.to_string();
        let value = match row.get_ref(i)? {
            rusqlite::types::ValueRef::Null => Value::Null,
            rusqlite::types::ValueRef::Integer(v) => Value::Integer(v),
            rusqlite::types::ValueRef::Real(v) => Value::Real(v),
            rusqlite::types::ValueRef::Text(v) => {
                Value::Text(String::from_utf8_lossy(v).to_string())
            }
            rusqlite::types::ValueRef::Blob(v) => Value::Blob(v.to_vec()),
        };
        out.push(name, value);
    }
    Ok(out)
}

/// Run a statement with parameters on a raw connection
pub(crate) fn execute_raw(conn: &RawConnection, sql: &str, params: &[Value]) -> DatabaseResult<u64> {
    let params: Vec<rusqlite::types::Value> = params.iter().map(value_to_param).collect();
    let mut statement = conn.prepare(sql)?;
    let affected = statement.execute(params_from_iter(params.iter()))?;
    Ok(affected as u64)
}

/// Run a query with parameters on a raw connection
pub(crate) fn query_raw(conn: &RawConnection, sql: &str, params: &[Value]) -> DatabaseResult<Vec<Row>> {
    let params: Vec<rusqlite::types::Value> = params.iter().map(value_to_param).collect();
    let mut statement = conn.prepare(sql)?;
    let rows = statement.query_map(params_from_iter(params.iter()), convert_row)?;
    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

/// Finish the running transaction and begin the next one
pub(crate) fn end_transaction(conn: &RawConnection, commit: bool) -> DatabaseResult<()> {
    // a failed statement can make SQLite roll back on its own
    if !conn.is_autocommit() {
        conn.execute_batch(if commit { "COMMIT" } else { "ROLLBACK" })?;
    }
    conn.execute_batch("BEGIN")?;
    Ok(())
}

/// Connection to a SQLite database
pub struct SqliteConnection {
    connection: Arc<Mutex<Option<RawConnection>>>,
    closed: AtomicBool,
    operation_timeout: Duration,
}

impl SqliteConnection {
    /// Run `f` on the raw connection in the blocking pool
    async fn run_blocking<T, Func>(&self, f: Func) -> DatabaseResult<T>
    where
        T: Send + 'static,
        Func: FnOnce(&RawConnection) -> DatabaseResult<T> + Send + 'static,
    {
        let connection_arc = Arc::clone(&self.connection);
        let mut task = tokio::task::spawn_blocking(move || -> DatabaseResult<T> {
            let connection = connection_arc.blocking_lock();
            let conn = connection.as_ref().ok_or(DatabaseError::ConnectionClosed)?;
            f(conn)
        });

        // abort on timeout so the task does not outlive the caller
        tokio::select! {
            result = &mut task => {
                result.map_err(|e| DatabaseError::other(format!("Task join error: {}", e)))?
            }
            _ = tokio::time::sleep(self.operation_timeout) => {
                task.abort();
                Err(DatabaseError::query_timeout(self.operation_timeout.as_millis() as u64))
            }
        }
    }

    /// Execute a statement in the current transaction
    pub async fn execute(&self, sql: &str, params: &[Value]) -> DatabaseResult<u64> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.run_blocking(move |conn| execute_raw(conn, &sql, &params))
            .await
    }

    /// Run a query in the current transaction
    pub async fn query(&self, sql: &str, params: &[Value]) -> DatabaseResult<Vec<Row>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.run_blocking(move |conn| query_raw(conn, &sql, &params))
            .await
    }

    /// Execute several statements without parameters
    pub async fn execute_batch(&self, sql: &str) -> DatabaseResult<()> {
        let sql = sql.to_string();
        self.run_blocking(move |conn| Ok(conn.execute_batch(&sql)?))
            .await
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn commit(&self) -> DatabaseResult<()> {
        debug!("sqlite commit");
        self.run_blocking(|conn| end_transaction(conn, true)).await
    }

    async fn rollback(&self) -> DatabaseResult<()> {
        debug!("sqlite rollback");
        self.run_blocking(|conn| end_transaction(conn, false)).await
    }

    async fn close(&self) -> DatabaseResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DatabaseError::ConnectionClosed);
        }
        let connection_arc = Arc::clone(&self.connection);
        let task = tokio::task::spawn_blocking(move || -> DatabaseResult<()> {
            let Some(conn) = connection_arc.blocking_lock().take() else {
                return Err(DatabaseError::ConnectionClosed);
            };
            if !conn.is_autocommit() {
                conn.execute_batch("COMMIT")?;
            }
            conn.close().map_err(|(_, e)| DatabaseError::from(e))
        });
        task.await
            .map_err(|e| DatabaseError::other(format!("Task join error: {}", e)))??;
        debug!("sqlite connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn apply_timeout(&self, time_to_live: Duration) -> DatabaseResult<()> {
        debug!(?time_to_live, "bounding sqlite busy timeout by transaction deadline");
        self.run_blocking(move |conn| Ok(conn.busy_timeout(time_to_live)?))
            .await
    }
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Opens [`SqliteConnection`]s on a file or in memory
#[derive(Debug, Clone)]
pub struct SqliteConnectionFactory {
    target: SqliteTarget,
    busy_timeout: Duration,
    operation_timeout: Duration,
}

impl SqliteConnectionFactory {
    pub fn new(target: SqliteTarget) -> Self {
        Self {
            target,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Open connections on a database file
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(SqliteTarget::file(path))
    }

    /// Open connections on private in-memory databases
    pub fn memory() -> Self {
        Self::new(SqliteTarget::Memory)
    }

    /// Set how long a statement waits on a locked database
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Set database operation timeout
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn target(&self) -> &SqliteTarget {
        &self.target
    }
}

#[async_trait]
impl ConnectionFactory for SqliteConnectionFactory {
    type Connection = SqliteConnection;

    async fn create_connection(&self) -> DatabaseResult<SqliteConnection> {
        let target = self.target.clone();
        let busy_timeout = self.busy_timeout;
        debug!(sqlite_target = %target, "opening sqlite connection");

        let mut task = tokio::task::spawn_blocking(move || -> DatabaseResult<RawConnection> {
            let conn = target.open()?;
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch("PRAGMA foreign_keys = ON; BEGIN")?;
            Ok(conn)
        });

        let conn = tokio::select! {
            result = &mut task => {
                result.map_err(|e| DatabaseError::other(format!("Task join error: {}", e)))??
            }
            _ = tokio::time::sleep(self.operation_timeout) => {
                task.abort();
                warn!(sqlite_target = %self.target, "timed out opening sqlite connection");
                return Err(DatabaseError::connection(format!(
                    "Timed out opening {} after {}ms",
                    self.target,
                    self.operation_timeout.as_millis()
                )));
            }
        };

        Ok(SqliteConnection {
            connection: Arc::new(Mutex::new(Some(conn))),
            closed: AtomicBool::new(false),
            operation_timeout: self.operation_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn file_factory(dir: &TempDir) -> SqliteConnectionFactory {
        let factory = SqliteConnectionFactory::file(dir.path().join("test.db"))
            .with_busy_timeout(Duration::from_millis(50));
        let setup = factory.create_connection().await.unwrap();
        setup
            .execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .await
            .unwrap();
        setup.close().await.unwrap();
        factory
    }

    async fn count(factory: &SqliteConnectionFactory) -> i64 {
        let conn = factory.create_connection().await.unwrap();
        let rows = conn.query("SELECT COUNT(*) AS n FROM items", &[]).await.unwrap();
        conn.close().await.unwrap();
        rows[0].get("n").and_then(Value::as_i64).unwrap()
    }

    #[tokio::test]
    async fn test_commit_and_rollback_begin_anew() {
        let dir = TempDir::new().unwrap();
        let factory = file_factory(&dir).await;
        let conn = factory.create_connection().await.unwrap();

        conn.execute("INSERT INTO items (name) VALUES (?1)", &[Value::from("a")])
            .await
            .unwrap();
        conn.rollback().await.unwrap();
        conn.execute("INSERT INTO items (name) VALUES (?1)", &[Value::from("b")])
            .await
            .unwrap();
        conn.commit().await.unwrap();

        let rows = conn.query("SELECT name FROM items", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name").and_then(Value::as_str), Some("b"));
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_commits_pending_work() {
        let dir = TempDir::new().unwrap();
        let factory = file_factory(&dir).await;
        let conn = factory.create_connection().await.unwrap();
        conn.execute("INSERT INTO items (name) VALUES ('kept')", &[])
            .await
            .unwrap();

        conn.close().await.unwrap();
        assert!(conn.is_closed());
        assert!(matches!(conn.close().await, Err(DatabaseError::ConnectionClosed)));
        assert_eq!(count(&factory).await, 1);
    }

    #[tokio::test]
    async fn test_uncommitted_work_is_invisible_to_others() {
        let dir = TempDir::new().unwrap();
        let factory = file_factory(&dir).await;
        let writer = factory.create_connection().await.unwrap();
        writer
            .execute("INSERT INTO items (name) VALUES ('pending')", &[])
            .await
            .unwrap();

        let reader = factory.create_connection().await.unwrap();
        let rows = reader.query("SELECT * FROM items", &[]).await.unwrap();
        assert!(rows.is_empty());

        writer.rollback().await.unwrap();
        writer.close().await.unwrap();
        reader.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_writer_sees_busy() {
        let dir = TempDir::new().unwrap();
        let factory = file_factory(&dir).await;
        let first = factory.create_connection().await.unwrap();
        let second = factory.create_connection().await.unwrap();

        first
            .execute("INSERT INTO items (name) VALUES ('one')", &[])
            .await
            .unwrap();
        let err = second
            .execute("INSERT INTO items (name) VALUES ('two')", &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::SqliteError(rusqlite::Error::SqliteFailure(ref failure, _))
                if failure.code == rusqlite::ErrorCode::DatabaseBusy
        ));

        second.rollback().await.unwrap();
        second.close().await.unwrap();
        first.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_target() {
        let factory = SqliteConnectionFactory::memory();
        let conn = factory.create_connection().await.unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER)").await.unwrap();
        conn.execute("INSERT INTO t VALUES (?1)", &[Value::Integer(3)])
            .await
            .unwrap();
        let rows = conn.query("SELECT v FROM t", &[]).await.unwrap();
        assert_eq!(rows[0].get("v"), Some(&Value::Integer(3)));
        conn.close().await.unwrap();
    }

    #[test]
    fn test_target_from_json() {
        let target: SqliteTarget = serde_json::from_str(r#"{"file": "/tmp/app.db"}"#).unwrap();
        assert_eq!(target, SqliteTarget::file("/tmp/app.db"));
        let target: SqliteTarget = serde_json::from_str(r#""memory""#).unwrap();
        assert_eq!(target, SqliteTarget::Memory);
    }
}
