//! Cluster-wide named mutex.
//!
//! Every schema- or lease-mutating operation runs inside
//! [`DistributedLock::with_lock`]. With [`DatabaseLockProvider`] the lease
//! lives in the shared store file, so processes opening the same database
//! exclude each other. While the body runs, a heartbeat task extends the
//! lease every third of its ttl; a lease whose holder stopped renewing it
//! can be taken over once it expires.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::ConnectionPool;
use crate::core::types::format_timestamp;
use crate::core::{Result, TdmError};

pub fn table_key(table: &str) -> String {
    format!("table:{}", table)
}

pub fn title_key(project_id: Uuid, title: &str) -> String {
    format!("title:{}:{}", project_id, title)
}

#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Take the lease if it is free or expired. Returns false when held by someone else.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Extend a lease held by `owner`. Returns false when the lease was lost.
    async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    async fn release(&self, key: &str, owner: &str) -> Result<()>;
}

/// Leases stored in the `tdm_locks` table.
pub struct DatabaseLockProvider {
    pool: Arc<ConnectionPool>,
}

impl DatabaseLockProvider {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockProvider for DatabaseLockProvider {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let conn = self.pool.get_connection().await?;
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let expires_at = now_ms + ttl.as_millis() as i64;

        let changed = conn.execute(
            "INSERT INTO tdm_locks (lock_key, owner, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(lock_key) DO UPDATE SET
                owner = excluded.owner,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
             WHERE tdm_locks.expires_at < ?5",
            params![key, owner, format_timestamp(now), expires_at, now_ms],
        )?;

        Ok(changed == 1)
    }

    async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let conn = self.pool.get_connection().await?;
        let expires_at = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        let changed = conn.execute(
            "UPDATE tdm_locks SET expires_at = ?1 WHERE lock_key = ?2 AND owner = ?3",
            params![expires_at, key, owner],
        )?;
        Ok(changed == 1)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        let conn = self.pool.get_connection().await?;
        conn.execute(
            "DELETE FROM tdm_locks WHERE lock_key = ?1 AND owner = ?2",
            params![key, owner],
        )?;
        Ok(())
    }
}

/// In-process leases.
#[derive(Default)]
pub struct LocalLockProvider {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl LocalLockProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockProvider for LocalLockProvider {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock()?;
        let now = Instant::now();
        match leases.get(key) {
            Some((_, expires)) if *expires > now => Ok(false),
            _ => {
                leases.insert(key.to_string(), (owner.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock()?;
        match leases.get_mut(key) {
            Some((holder, expires)) if *holder == owner => {
                *expires = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        let mut leases = self.leases.lock()?;
        if leases.get(key).is_some_and(|(holder, _)| holder == owner) {
            leases.remove(key);
        }
        Ok(())
    }
}

pub struct DistributedLock {
    provider: Arc<dyn LockProvider>,
    ttl: Duration,
    acquire_timeout: Duration,
    poll_interval: Duration,
}

impl DistributedLock {
    pub fn new(provider: Arc<dyn LockProvider>, ttl: Duration, acquire_timeout: Duration) -> Self {
        Self {
            provider,
            ttl,
            acquire_timeout,
            poll_interval: Duration::from_millis(25),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run `body` while holding the lease on `key`. The lease is renewed
    /// until the body finishes and released whether it succeeds or fails.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let owner = self.acquire(key).await?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let heartbeat = tokio::spawn(heartbeat(
            self.provider.clone(),
            key.to_string(),
            owner.clone(),
            self.ttl,
            stop_rx,
        ));

        let result = body().await;

        let _ = stop_tx.send(());
        if let Err(err) = heartbeat.await {
            warn!(key, error = %err, "lock heartbeat task failed");
        }
        if let Err(err) = self.provider.release(key, &owner).await {
            warn!(key, error = %err, "failed to release lock; it will expire after its ttl");
        }
        result
    }

    async fn acquire(&self, key: &str) -> Result<String> {
        let owner = Uuid::new_v4().to_string();
        let start = Instant::now();

        loop {
            if self.provider.try_acquire(key, &owner, self.ttl).await? {
                debug!(key, "lock acquired");
                return Ok(owner);
            }

            if start.elapsed() > self.acquire_timeout {
                return Err(TdmError::Lock(format!(
                    "timed out after {:?} waiting for lock '{}'",
                    self.acquire_timeout, key
                )));
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Extend the lease every third of its ttl until `stop` fires.
async fn heartbeat(
    provider: Arc<dyn LockProvider>,
    key: String,
    owner: String,
    ttl: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    let period = (ttl / 3).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => match provider.renew(&key, &owner, ttl).await {
                Ok(true) => debug!(key = key.as_str(), "lock renewed"),
                Ok(false) => {
                    warn!(key = key.as_str(), "lock lease was lost before the body finished");
                    break;
                }
                Err(err) => warn!(key = key.as_str(), error = %err, "failed to renew lock"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::StoreConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_local_lock_excludes_concurrent_holders() {
        let lock = Arc::new(DistributedLock::new(
            Arc::new(LocalLockProvider::new()),
            Duration::from_secs(10),
            Duration::from_secs(5),
        ));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                lock.with_lock("table:t_1", || async {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    async fn max_holders(lock: Arc<DistributedLock>, body: Duration) -> usize {
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let lock = lock.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                lock.with_lock("table:t_1", || async {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(body).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        max_inside.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_local_lease_is_renewed_while_body_runs() {
        let lock = Arc::new(DistributedLock::new(
            Arc::new(LocalLockProvider::new()),
            Duration::from_millis(100),
            Duration::from_secs(5),
        ));
        assert_eq!(max_holders(lock, Duration::from_millis(400)).await, 1);
    }

    #[tokio::test]
    async fn test_database_lease_is_renewed_while_body_runs() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(
            ConnectionPool::new(StoreConfig::new(dir.path().join("locks.db")))
                .await
                .unwrap(),
        );
        crate::storage::migrate(&*pool.get_connection().await.unwrap()).unwrap();
        let lock = Arc::new(DistributedLock::new(
            Arc::new(DatabaseLockProvider::new(pool)),
            Duration::from_millis(150),
            Duration::from_secs(5),
        ));
        assert_eq!(max_holders(lock, Duration::from_millis(500)).await, 1);
    }

    #[tokio::test]
    async fn test_renew_requires_ownership() {
        let provider = LocalLockProvider::new();
        assert!(provider.try_acquire("k", "a", Duration::from_secs(60)).await.unwrap());
        assert!(provider.renew("k", "a", Duration::from_secs(60)).await.unwrap());
        assert!(!provider.renew("k", "b", Duration::from_secs(60)).await.unwrap());
        provider.release("k", "a").await.unwrap();
        assert!(!provider.renew("k", "a", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let provider = Arc::new(LocalLockProvider::new());
        assert!(
            provider
                .try_acquire("k", "someone-else", Duration::from_secs(60))
                .await
                .unwrap()
        );

        let lock = DistributedLock::new(provider, Duration::from_secs(1), Duration::from_millis(50));
        let result = lock.with_lock("k", || async { Ok(()) }).await;
        assert!(matches!(result, Err(TdmError::Lock(_))));
    }

    #[tokio::test]
    async fn test_database_lease_expiry_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(
            ConnectionPool::new(StoreConfig::new(dir.path().join("locks.db")))
                .await
                .unwrap(),
        );
        crate::storage::migrate(&*pool.get_connection().await.unwrap()).unwrap();
        let provider = DatabaseLockProvider::new(pool);

        assert!(provider.try_acquire("k", "a", Duration::from_secs(60)).await.unwrap());
        assert!(!provider.try_acquire("k", "b", Duration::from_secs(60)).await.unwrap());

        provider.release("k", "b").await.unwrap();
        assert!(!provider.try_acquire("k", "b", Duration::from_secs(60)).await.unwrap());

        provider.release("k", "a").await.unwrap();
        assert!(provider.try_acquire("k", "b", Duration::ZERO).await.unwrap());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(provider.try_acquire("k", "c", Duration::from_secs(60)).await.unwrap());
    }
}
