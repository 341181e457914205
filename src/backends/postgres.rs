//! PostgreSQL backend (remote client)
//!
//! A [`PostgresConnection`] is a tokio-postgres client connected to a remote
//! server. Like every backend here it is always inside a transaction: it
//! issues `BEGIN` on connect, `commit` and `rollback` start the next
//! transaction straight away, and `close` commits what is pending before
//! disconnecting.

use crate::core::connection::{Connection, ConnectionFactory};
use crate::core::error::{DatabaseError, DatabaseResult};
use crate::core::value::{Row, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error};

/// Default timeout for database operations (30 seconds)
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Where and as whom a remote client connects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConnectionParameters {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    /// Extra `key=value` options passed through to the server
    pub options: BTreeMap<String, String>,
}

impl Default for RemoteConnectionParameters {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            username: None,
            password: None,
            database: None,
            options: BTreeMap::new(),
        }
    }
}

impl RemoteConnectionParameters {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Set the username
    pub fn username<S: Into<String>>(mut self, username: S) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the password
    pub fn password<S: Into<String>>(mut self, password: S) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the database name
    pub fn database<S: Into<String>>(mut self, database: S) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Add a custom option
    pub fn option<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Build the libpq-style connection string
    pub fn build_connection_string(&self) -> String {
        let mut parts = vec![format!("host={}", self.host), format!("port={}", self.port)];
        if let Some(database) = &self.database {
            parts.push(format!("dbname={}", database));
        }
        if let Some(username) = &self.username {
            parts.push(format!("user={}", username));
        }
        if let Some(password) = &self.password {
            parts.push(format!("password={}", password));
        }
        for (key, value) in &self.options {
            parts.push(format!("{}={}", key, value));
        }
        parts.join(" ")
    }
}

/// Convert a tokio_postgres Row to a Row
fn convert_row(row: &tokio_postgres::Row) -> Row {
    let mut out = Row::new();

    for (idx, column) in row.columns().iter().enumerate() {
        let value = match column.type_().name() {
            "bool" => row.get::<_, Option<bool>>(idx).map(Value::Boolean),
            "int2" => row.get::<_, Option<i16>>(idx).map(|v| Value::Integer(v.into())),
            "int4" => row.get::<_, Option<i32>>(idx).map(|v| Value::Integer(v.into())),
            "int8" => row.get::<_, Option<i64>>(idx).map(Value::Integer),
            "float4" => row.get::<_, Option<f32>>(idx).map(|v| Value::Real(v.into())),
            "float8" => row.get::<_, Option<f64>>(idx).map(Value::Real),
            "bytea" => row.get::<_, Option<Vec<u8>>>(idx).map(Value::Blob),
            // Try to get as string for everything else
            _ => row
                .try_get::<_, Option<String>>(idx)
                .ok()
                .flatten()
                .map(Value::Text),
        };
        out.push(column.name(), value.unwrap_or(Value::Null));
    }

    out
}

/// Convert a Value to a postgres parameter
fn value_to_param(value: &Value) -> Box<dyn ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(None::<i64>),
        Value::Boolean(v) => Box::new(*v),
        Value::Integer(v) => Box::new(*v),
        Value::Real(v) => Box::new(*v),
        Value::Text(v) => Box::new(v.clone()),
        Value::Blob(v) => Box::new(v.clone()),
    }
}

/// Remote client running in an implicit transaction
pub struct PostgresConnection {
    client: Mutex<Option<Client>>,
    closed: AtomicBool,
    operation_timeout: Duration,
}

impl PostgresConnection {
    async fn batch(&self, sql: &str) -> DatabaseResult<()> {
        let client = self.client.lock().await;
        let client = client.as_ref().ok_or(DatabaseError::ConnectionClosed)?;
        tokio::time::timeout(self.operation_timeout, client.batch_execute(sql))
            .await
            .map_err(|_| DatabaseError::query_timeout(self.operation_timeout.as_millis() as u64))?
            .map_err(DatabaseError::from)
    }

    /// Execute a statement in the current transaction
    pub async fn execute(&self, sql: &str, params: &[Value]) -> DatabaseResult<u64> {
        let client = self.client.lock().await;
        let client = client.as_ref().ok_or(DatabaseError::ConnectionClosed)?;

        let params: Vec<Box<dyn ToSql + Sync + Send>> = params.iter().map(value_to_param).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        tokio::time::timeout(self.operation_timeout, client.execute(sql, &refs))
            .await
            .map_err(|_| DatabaseError::query_timeout(self.operation_timeout.as_millis() as u64))?
            .map_err(DatabaseError::from)
    }

    /// Run a query in the current transaction
    pub async fn query(&self, sql: &str, params: &[Value]) -> DatabaseResult<Vec<Row>> {
        let client = self.client.lock().await;
        let client = client.as_ref().ok_or(DatabaseError::ConnectionClosed)?;

        let params: Vec<Box<dyn ToSql + Sync + Send>> = params.iter().map(value_to_param).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let rows = tokio::time::timeout(self.operation_timeout, client.query(sql, &refs))
            .await
            .map_err(|_| DatabaseError::query_timeout(self.operation_timeout.as_millis() as u64))?
            .map_err(DatabaseError::from)?;
        Ok(rows.iter().map(convert_row).collect())
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn commit(&self) -> DatabaseResult<()> {
        debug!("postgres commit");
        self.batch("COMMIT; BEGIN").await
    }

    async fn rollback(&self) -> DatabaseResult<()> {
        debug!("postgres rollback");
        self.batch("ROLLBACK; BEGIN").await
    }

    async fn close(&self) -> DatabaseResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DatabaseError::ConnectionClosed);
        }
        let result = self.batch("COMMIT").await;
        // dropping the client ends the background connection task
        self.client.lock().await.take();
        debug!("postgres connection closed");
        result
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn apply_timeout(&self, time_to_live: Duration) -> DatabaseResult<()> {
        self.batch(&format!(
            "SET LOCAL statement_timeout = {}",
            time_to_live.as_millis().max(1)
        ))
        .await
    }
}

impl std::fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnection")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Opens [`PostgresConnection`]s with fixed connection parameters
#[derive(Debug, Clone)]
pub struct PostgresConnectionFactory {
    parameters: RemoteConnectionParameters,
    operation_timeout: Duration,
}

impl PostgresConnectionFactory {
    pub fn new(parameters: RemoteConnectionParameters) -> Self {
        Self {
            parameters,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Set database operation timeout
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn parameters(&self) -> &RemoteConnectionParameters {
        &self.parameters
    }
}

#[async_trait]
impl ConnectionFactory for PostgresConnectionFactory {
    type Connection = PostgresConnection;

    async fn create_connection(&self) -> DatabaseResult<PostgresConnection> {
        let connection_string = self.parameters.build_connection_string();
        debug!(host = %self.parameters.host, port = self.parameters.port, "connecting to postgres");

        let connect = async move {
            let (client, connection) = tokio_postgres::connect(&connection_string, NoTls)
                .await
                .map_err(|e| DatabaseError::connection(e.to_string()))?;

            // Spawn the connection handler in the background
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!(error = %e, "postgres connection error");
                }
            });
            Ok::<Client, DatabaseError>(client)
        };

        let client = tokio::time::timeout(self.operation_timeout, connect)
            .await
            .map_err(|_| {
                DatabaseError::connection(format!(
                    "Timed out connecting after {}ms",
                    self.operation_timeout.as_millis()
                ))
            })??;

        let connection = PostgresConnection {
            client: Mutex::new(Some(client)),
            closed: AtomicBool::new(false),
            operation_timeout: self.operation_timeout,
        };
        connection.batch("BEGIN").await?;
        Ok(connection)
    }
}
