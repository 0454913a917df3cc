use parking_lot::Mutex;
use rusqlite::Connection;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::db;

#[derive(Debug)]
pub struct PoolError(pub String);

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PoolError {}

struct PoolInner {
    db_path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

/// Bounded set of SQLite connections. Connections are opened lazily and
/// returned to the idle list when their guard drops.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Pool {
    pub fn new(db_path: impl Into<PathBuf>, size: usize, acquire_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                db_path: db_path.into(),
                idle: Mutex::new(Vec::with_capacity(size)),
                permits: Arc::new(Semaphore::new(size.max(1))),
                acquire_timeout,
            }),
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub async fn get(&self) -> Result<PooledConnection, PoolError> {
        let permit = timeout(
            self.inner.acquire_timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        .map_err(|_| PoolError("timed out waiting for a database connection".to_string()))?
        .map_err(|e| PoolError(e.to_string()))?;

        let cached = self.inner.idle.lock().pop();
        let conn = match cached {
            Some(c) => c,
            None => {
                let path = self.inner.db_path.clone();
                tokio::task::spawn_blocking(move || db::open_connection(&path))
                    .await
                    .map_err(|e| PoolError(e.to_string()))?
                    .map_err(|e| PoolError(format!("failed to open database: {e:#}")))?
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Runs `f` against a pooled connection on the blocking thread pool.
    pub async fn run<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<PoolError> + Send + 'static,
    {
        let conn = self.get().await?;
        tokio::task::spawn_blocking(move || f(&*conn))
            .await
            .map_err(|e| E::from(PoolError(format!("database task failed: {e}"))))?
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("connection taken before drop"))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // A connection left inside an open transaction is not reusable.
            if conn.is_autocommit() {
                self.pool.idle.lock().push(conn);
            }
        }
    }
}
