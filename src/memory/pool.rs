//! Fixed-size SQLite connection pool
//!
//! Bounded pool with a fair waiter queue. On exhaustion past the wait
//! deadline a temporary connection is opened (logged and counted) rather
//! than failing the caller.

use crate::core::error::{SocError, SocResult};
use parking_lot::{Condvar, Mutex};
use rusqlite::{Connection, OpenFlags};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

struct PoolInner {
    idle: Mutex<Vec<Connection>>,
    available: Condvar,
    path: String,
    busy_timeout: Duration,
    temp_connections: AtomicU64,
}

impl PoolInner {
    fn open_connection(&self) -> SocResult<Connection> {
        let conn = if self.path.starts_with("file:") {
            Connection::open_with_flags(
                &self.path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )?
        } else {
            Connection::open(&self.path)?
        };
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }
}

/// Bounded pool of SQLite connections.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    size: usize,
}

impl ConnectionPool {
    pub fn new(path: &str, size: usize, busy_timeout: Duration) -> SocResult<Self> {
        let inner = Arc::new(PoolInner {
            idle: Mutex::new(Vec::with_capacity(size)),
            available: Condvar::new(),
            path: path.to_string(),
            busy_timeout,
            temp_connections: AtomicU64::new(0),
        });

        {
            let mut idle = inner.idle.lock();
            for _ in 0..size {
                idle.push(inner.open_connection()?);
            }
        }
        info!("[Pool] opened {} connections to {}", size, path);

        Ok(ConnectionPool { inner, size })
    }

    /// Check a connection out, waiting up to the busy timeout before the
    /// temporary-connection fallback kicks in.
    pub fn checkout(&self) -> SocResult<PooledConnection> {
        {
            let mut idle = self.inner.idle.lock();
            if let Some(conn) = idle.pop() {
                return Ok(PooledConnection {
                    conn: Some(conn),
                    inner: self.inner.clone(),
                    temporary: false,
                });
            }
            // Fair wait: Condvar wakes waiters in order.
            let deadline = self.inner.busy_timeout;
            if !self
                .inner
                .available
                .wait_for(&mut idle, deadline)
                .timed_out()
            {
                if let Some(conn) = idle.pop() {
                    return Ok(PooledConnection {
                        conn: Some(conn),
                        inner: self.inner.clone(),
                        temporary: false,
                    });
                }
            }
        }

        let count = self.inner.temp_connections.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            "[Pool] exhausted ({} in flight); opening temporary connection #{}",
            self.size, count
        );
        let conn = self.inner.open_connection()?;
        Ok(PooledConnection {
            conn: Some(conn),
            inner: self.inner.clone(),
            temporary: true,
        })
    }

    /// How many temporary connections were opened due to exhaustion.
    pub fn temp_connection_count(&self) -> u64 {
        self.inner.temp_connections.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// RAII guard over a checked-out connection.
pub struct PooledConnection {
    conn: Option<Connection>,
    inner: Arc<PoolInner>,
    temporary: bool,
}

impl Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.temporary {
                self.inner.idle.lock().push(conn);
                self.inner.available.notify_one();
            }
            // Temporary connections close on drop.
        }
    }
}

/// Map a rusqlite failure into the transient/permanent split used by the
/// retry loop.
pub fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// Retry a database operation with exponential backoff: 3 attempts, 100 ms base.
pub fn with_retry<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> SocResult<T> {
    let mut delay = Duration::from_millis(100);
    let mut last_err: Option<rusqlite::Error> = None;
    for attempt in 0..3 {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                warn!("[Memory] transient db error (attempt {}): {}", attempt + 1, err);
                last_err = Some(err);
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(err) => return Err(SocError::from(err)),
        }
    }
    Err(SocError::Database(
        last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "retries exhausted".to_string()),
    ))
}
