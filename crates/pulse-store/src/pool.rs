//! Bounded connection pool over SQLite
//!
//! The pool is the sole surface through which the pipeline reaches the
//! database. Connections are created lazily up to `max_size`; waiters are
//! served in FIFO order by a fair semaphore. `drain` stops new
//! acquisitions and waits for outstanding handles before closing.

use pulse_common::{Error, Result};
use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// SQLite database path. Note that `:memory:` databases are private to
    /// a single connection, so they only make sense with `max_size == 1`.
    pub path: String,
    pub max_size: usize,
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            max_size: 8,
            acquire_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

struct PoolShared {
    path: String,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
    created: AtomicUsize,
    in_use: AtomicUsize,
    draining: AtomicBool,
    acquired_total: AtomicU64,
    timeouts_total: AtomicU64,
}

/// Fixed-size database connection pool
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let shared = Arc::new(PoolShared {
            path: config.path.clone(),
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            created: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            acquired_total: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
        });
        ConnectionPool { shared, config }
    }

    /// Acquire a handle with the configured default timeout
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_timeout(self.config.acquire_timeout).await
    }

    /// Acquire a handle, waiting at most `timeout`
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        if self.shared.draining.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let permit = match tokio::time::timeout(
            timeout,
            self.shared.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Err(_) => {
                self.shared.timeouts_total.fetch_add(1, Ordering::SeqCst);
                return Err(Error::PoolTimeout(format!(
                    "no database handle available within {:?}",
                    timeout
                )));
            }
            // The semaphore only errors once `drain` has closed it.
            Ok(Err(_)) => return Err(Error::ShuttingDown),
            Ok(Ok(permit)) => permit,
        };

        if self.shared.draining.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let pooled = {
            let mut idle = lock_idle(&self.shared)?;
            idle.pop()
        };
        let conn = match pooled {
            Some(conn) => conn,
            None => self.open_connection()?,
        };

        self.shared.acquired_total.fetch_add(1, Ordering::SeqCst);
        self.shared.in_use.fetch_add(1, Ordering::SeqCst);

        Ok(PooledConnection {
            conn: Some(conn),
            shared: self.shared.clone(),
            _permit: permit,
        })
    }

    /// Acquire a handle and run `f` on it
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut handle = self.acquire().await?;
        f(&mut handle)
    }

    /// Execute a trivial query on a borrowed handle
    pub async fn health_check(&self) -> Result<()> {
        self.with_conn(|conn| {
            let one: i64 = conn
                .query_row("SELECT 1", [], |row| row.get(0))
                .map_err(|e| Error::Storage(format!("health query failed: {}", e)))?;
            if one == 1 {
                Ok(())
            } else {
                Err(Error::Storage("health query returned unexpected value".into()))
            }
        })
        .await
    }

    /// Stop accepting acquisitions, wait for outstanding handles (up to
    /// `deadline`), then close all pooled connections.
    pub async fn drain(&self, deadline: Duration) -> Result<()> {
        info!("draining connection pool ({})", self.shared.path);
        self.shared.draining.store(true, Ordering::SeqCst);
        self.shared.semaphore.close();

        let started = Instant::now();
        loop {
            let outstanding = self.shared.in_use.load(Ordering::SeqCst);
            if outstanding == 0 {
                break;
            }
            if started.elapsed() >= deadline {
                warn!(
                    "pool drain deadline elapsed with {} handle(s) outstanding",
                    outstanding
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let drained = {
            let mut idle = lock_idle(&self.shared)?;
            let count = idle.len();
            idle.clear();
            count
        };
        debug!("closed {} pooled connection(s)", drained);
        Ok(())
    }

    /// Snapshot of pool counters
    pub fn stats(&self) -> PoolStats {
        let idle = self
            .shared
            .idle
            .lock()
            .map(|idle| idle.len())
            .unwrap_or(0);
        PoolStats {
            max_size: self.config.max_size,
            created: self.shared.created.load(Ordering::SeqCst),
            idle,
            in_use: self.shared.in_use.load(Ordering::SeqCst),
            acquired_total: self.shared.acquired_total.load(Ordering::SeqCst),
            timeouts_total: self.shared.timeouts_total.load(Ordering::SeqCst),
            draining: self.shared.draining.load(Ordering::SeqCst),
        }
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.shared.path)
            .map_err(|e| Error::Storage(format!("failed to open database: {}", e)))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| Error::Storage(format!("failed to set busy timeout: {}", e)))?;
        // WAL lets readers proceed during writes; in-memory databases
        // silently keep their default journal mode.
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        debug!(
            "opened database connection {}/{}",
            self.shared.created.load(Ordering::SeqCst),
            self.config.max_size
        );
        Ok(conn)
    }
}

fn lock_idle(shared: &PoolShared) -> Result<std::sync::MutexGuard<'_, Vec<Connection>>> {
    shared
        .idle
        .lock()
        .map_err(|_| Error::Internal("pool idle list lock poisoned".into()))
}

/// RAII handle returned by [`ConnectionPool::acquire`]; the connection is
/// returned to the pool on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.shared.in_use.fetch_sub(1, Ordering::SeqCst);
        if let Some(conn) = self.conn.take() {
            if self.shared.draining.load(Ordering::SeqCst) {
                // Discard instead of pooling so drain can finish.
                self.shared.created.fetch_sub(1, Ordering::SeqCst);
            } else if let Ok(mut idle) = self.shared.idle.lock() {
                idle.push(conn);
            } else {
                self.shared.created.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

/// Pool counters exposed for monitoring
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub max_size: usize,
    pub created: usize,
    pub idle: usize,
    pub in_use: usize,
    pub acquired_total: u64,
    pub timeouts_total: u64,
    pub draining: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_pool(max_size: usize) -> (tempfile::TempDir, ConnectionPool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db");
        let pool = ConnectionPool::new(
            PoolConfig::new(path.to_string_lossy().to_string())
                .with_max_size(max_size)
                .with_acquire_timeout(Duration::from_millis(200)),
        );
        (dir, pool)
    }

    #[tokio::test]
    async fn acquire_and_release_cycles() {
        let (_dir, pool) = temp_pool(2);
        {
            let conn = pool.acquire().await.unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.acquired_total, 1);

        // The released connection is reused, not recreated.
        let _conn = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out_after_full_wait() {
        let (_dir, pool) = temp_pool(1);
        let held = pool.acquire().await.unwrap();

        let started = Instant::now();
        let result = pool.acquire_timeout(Duration::from_millis(100)).await;
        let waited = started.elapsed();

        match result {
            Err(Error::PoolTimeout(_)) => {}
            other => panic!("expected pool timeout, got {:?}", other.map(|_| ())),
        }
        assert!(waited >= Duration::from_millis(100));
        assert_eq!(pool.stats().timeouts_total, 1);
        drop(held);
    }

    #[tokio::test]
    async fn waiter_is_served_when_handle_returns() {
        let (_dir, pool) = temp_pool(1);
        let held = pool.acquire().await.unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(held);
        });
        let conn = pool.acquire_timeout(Duration::from_millis(500)).await;
        assert!(conn.is_ok());
        release.await.unwrap();
    }

    #[tokio::test]
    async fn drain_rejects_new_acquisitions() {
        let (_dir, pool) = temp_pool(2);
        let _ = pool.acquire().await.unwrap();
        pool.drain(Duration::from_millis(100)).await.unwrap();
        match pool.acquire().await {
            Err(Error::ShuttingDown) => {}
            other => panic!("expected shutting down, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn drain_waits_for_outstanding_handles() {
        let (_dir, pool) = temp_pool(1);
        let held = pool.acquire().await.unwrap();
        let shared_pool = std::sync::Arc::new(pool);
        let p = shared_pool.clone();
        let drainer = tokio::spawn(async move { p.drain(Duration::from_secs(1)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
        drainer.await.unwrap().unwrap();
        assert_eq!(shared_pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn health_check_runs_trivial_query() {
        let (_dir, pool) = temp_pool(1);
        pool.health_check().await.unwrap();
    }
}
