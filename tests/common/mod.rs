//! Scripted connection backend shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use txbind::core::{Connection, ConnectionFactory, DataSource, DatabaseError, DatabaseResult};

#[derive(Default)]
struct ScriptInner {
    created: AtomicUsize,
    closed: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    fail_create: AtomicBool,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
    fail_timeout: AtomicBool,
}

/// Counters and failure switches shared by a factory and its connections
#[derive(Clone, Default)]
pub struct Script {
    inner: Arc<ScriptInner>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }

    pub fn fail_create(&self, fail: bool) {
        self.inner.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, fail: bool) {
        self.inner.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_rollback(&self, fail: bool) {
        self.inner.fail_rollback.store(fail, Ordering::SeqCst);
    }

    pub fn fail_timeout(&self, fail: bool) {
        self.inner.fail_timeout.store(fail, Ordering::SeqCst);
    }
}

pub struct ScriptedConnection {
    id: usize,
    script: Script,
    closed: AtomicBool,
}

impl ScriptedConnection {
    /// Creation order of this connection, starting at 1
    pub fn id(&self) -> usize {
        self.id
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn commit(&self) -> DatabaseResult<()> {
        if self.script.inner.fail_commit.load(Ordering::SeqCst) {
            return Err(DatabaseError::query("commit refused by engine"));
        }
        self.script.inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> DatabaseResult<()> {
        if self.script.inner.fail_rollback.load(Ordering::SeqCst) {
            return Err(DatabaseError::connection("connection reset during rollback"));
        }
        self.script.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> DatabaseResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DatabaseError::ConnectionClosed);
        }
        self.script.inner.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn apply_timeout(&self, _time_to_live: Duration) -> DatabaseResult<()> {
        if self.script.inner.fail_timeout.load(Ordering::SeqCst) {
            return Err(DatabaseError::query("statement timeout rejected"));
        }
        Ok(())
    }
}

pub struct ScriptedFactory {
    script: Script,
}

#[async_trait]
impl ConnectionFactory for ScriptedFactory {
    type Connection = ScriptedConnection;

    async fn create_connection(&self) -> DatabaseResult<ScriptedConnection> {
        if self.script.inner.fail_create.load(Ordering::SeqCst) {
            return Err(DatabaseError::connection("connection refused"));
        }
        let id = self.script.inner.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ScriptedConnection {
            id,
            script: self.script.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

/// A data source backed by a fresh script
pub fn scripted_data_source() -> (Script, DataSource<ScriptedFactory>) {
    let script = Script::new();
    let data_source = DataSource::new(ScriptedFactory {
        script: script.clone(),
    });
    (script, data_source)
}
