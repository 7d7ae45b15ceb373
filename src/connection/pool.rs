use super::config::StoreConfig;
use crate::core::{Result, TdmError};
use rusqlite::{Connection, OpenFlags};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Connection pool
///
/// Hands out SQLite connections to the store file. Every connection is
/// initialised with WAL journaling, a busy timeout and case-sensitive `LIKE`.
pub struct ConnectionPool {
    /// Pool configuration
    config: StoreConfig,
    /// Available connections
    available: Arc<Mutex<VecDeque<PooledConnection>>>,
    /// Total number of connections created
    total_connections: Arc<AtomicUsize>,
}

/// A connection from the pool
struct PooledConnection {
    connection: Connection,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    fn new(connection: Connection) -> Self {
        let now = Instant::now();
        Self {
            connection,
            created_at: now,
            last_used: now,
        }
    }

    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        if let Some(lifetime) = max_lifetime {
            self.created_at.elapsed() > lifetime
        } else {
            false
        }
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        if let Some(timeout) = idle_timeout {
            self.last_used.elapsed() > timeout
        } else {
            false
        }
    }
}

impl ConnectionPool {
    pub async fn new(config: StoreConfig) -> Result<Self> {
        config.validate().map_err(TdmError::Validation)?;

        let pool = Self {
            config,
            available: Arc::new(Mutex::new(VecDeque::new())),
            total_connections: Arc::new(AtomicUsize::new(0)),
        };

        pool.ensure_min_connections()?;

        Ok(pool)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Get a connection from the pool
    pub async fn get_connection(&self) -> Result<PoolGuard> {
        let start = Instant::now();

        loop {
            if let Some(pooled) = self.try_get_available()? {
                return Ok(self.guard(pooled.connection, pooled.created_at));
            }

            if let Some(conn) = self.try_create_connection()? {
                return Ok(self.guard(conn, Instant::now()));
            }

            if start.elapsed() > self.config.connect_timeout {
                return Err(TdmError::Persistence(
                    "Connection pool timeout: no connections available".into(),
                ));
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn guard(&self, connection: Connection, created_at: Instant) -> PoolGuard {
        PoolGuard {
            connection: Some(connection),
            created_at,
            pool: self.available.clone(),
            total_connections: self.total_connections.clone(),
        }
    }

    fn try_get_available(&self) -> Result<Option<PooledConnection>> {
        let mut available = self.available.lock()?;

        let mut kept = VecDeque::with_capacity(available.len());
        let mut removed = 0usize;
        while let Some(pooled) = available.pop_front() {
            if pooled.is_expired(self.config.max_lifetime)
                || pooled.is_idle_too_long(self.config.idle_timeout)
            {
                removed += 1;
            } else {
                kept.push_back(pooled);
            }
        }
        *available = kept;

        if removed > 0 {
            debug!(removed, "closed expired pooled connections");
            self.total_connections.fetch_sub(removed, Ordering::SeqCst);
        }

        Ok(available.pop_front())
    }

    fn try_create_connection(&self) -> Result<Option<Connection>> {
        let total = self.total_connections.load(Ordering::SeqCst);
        if total >= self.config.max_connections {
            return Ok(None);
        }

        let connection = open_connection(&self.config)?;
        self.total_connections.fetch_add(1, Ordering::SeqCst);

        Ok(Some(connection))
    }

    fn ensure_min_connections(&self) -> Result<()> {
        let mut available = self.available.lock()?;

        while self.total_connections.load(Ordering::SeqCst) < self.config.min_connections {
            let connection = open_connection(&self.config)?;
            available.push_back(PooledConnection::new(connection));
            self.total_connections.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Get pool statistics
    /// Check out a connection and run `f` with it on the blocking thread
    /// pool, so a busy store file never stalls the async workers.
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = self.get_connection().await?;
        tokio::task::spawn_blocking(move || f(&mut conn))
            .await
            .map_err(|e| TdmError::Persistence(format!("store task failed: {}", e)))?
    }

    pub fn stats(&self) -> Result<PoolStats> {
        let available = self.available.lock()?;
        let total = self.total_connections.load(Ordering::SeqCst);

        Ok(PoolStats {
            total_connections: total,
            available_connections: available.len(),
            active_connections: total.saturating_sub(available.len()),
            max_connections: self.config.max_connections,
        })
    }
}

fn open_connection(config: &StoreConfig) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
        | OpenFlags::SQLITE_OPEN_URI;
    let conn = Connection::open_with_flags(&config.database_path, flags)?;

    conn.busy_timeout(config.busy_timeout)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "case_sensitive_like", "ON")?;

    Ok(conn)
}

/// Connection pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, max {}",
            self.active_connections,
            self.total_connections,
            self.available_connections,
            self.max_connections
        )
    }
}

/// RAII guard for pooled connections
///
/// Returns the connection to the pool when dropped
pub struct PoolGuard {
    connection: Option<Connection>,
    created_at: Instant,
    pool: Arc<Mutex<VecDeque<PooledConnection>>>,
    total_connections: Arc<AtomicUsize>,
}

impl Deref for PoolGuard {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection
            .as_ref()
            .expect("connection is present until the guard is dropped")
    }
}

impl DerefMut for PoolGuard {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection
            .as_mut()
            .expect("connection is present until the guard is dropped")
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            // A guard dropped mid-transaction would hand a dirty connection to the next caller.
            if !connection.is_autocommit() {
                warn!("pooled connection dropped inside a transaction; closing it");
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
                return;
            }

            match self.pool.lock() {
                Ok(mut pool) => pool.push_back(PooledConnection {
                    connection,
                    created_at: self.created_at,
                    last_used: Instant::now(),
                }),
                Err(_) => {
                    self.total_connections.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }
}
