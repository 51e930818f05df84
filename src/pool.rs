//! Per-mount connection pool
//!
//! Bounds concurrent backend connections with a semaphore and parks healthy
//! connections for reuse. Each mount owns its own pool, so a slow or broken
//! backend can never starve another mount's slots.
//!
//! A checked-out connection is exclusive for the duration of the guard.
//! Dropping the guard parks the connection unless it was evicted; eviction
//! closes the underlying protocol connection by dropping the handle.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use crate::backend::{Driver, Handle};
use crate::config::{MountId, MountLimits};
use crate::error::{Result, StorageError};

struct IdleConn {
    handle: Box<dyn Handle>,
    parked_at: Instant,
}

struct PoolInner {
    mount: MountId,
    driver: Arc<dyn Driver>,
    limits: MountLimits,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConn>>,
}

/// Connection pool for a single mount.
pub struct MountPool {
    inner: Arc<PoolInner>,
}

impl MountPool {
    pub fn new(mount: MountId, driver: Arc<dyn Driver>, limits: MountLimits) -> Self {
        let slots = Arc::new(Semaphore::new(limits.max_connections));
        Self {
            inner: Arc::new(PoolInner {
                mount,
                driver,
                limits,
                slots,
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Check out a connection, reusing a parked one when available.
    ///
    /// Waits up to the configured acquire timeout for a free slot; a mount
    /// at its connection limit answers with `PoolExhausted` rather than
    /// queueing forever.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let started = Instant::now();
        let permit = tokio::time::timeout(
            self.inner.limits.acquire_timeout,
            Arc::clone(&self.inner.slots).acquire_owned(),
        )
        .await
        .map_err(|_| StorageError::PoolExhausted {
            mount: self.inner.mount.to_string(),
            waited: started.elapsed(),
        })?
        .map_err(|_| StorageError::PoolExhausted {
            // the semaphore is never closed while the pool is alive
            mount: self.inner.mount.to_string(),
            waited: started.elapsed(),
        })?;

        self.sweep_idle();

        let handle = match self.pop_idle() {
            Some(handle) => {
                trace!(mount = %self.inner.mount, "reusing parked connection");
                handle
            }
            None => {
                debug!(mount = %self.inner.mount, "opening new connection");
                self.inner.driver.connect().await?
            }
        };

        Ok(PooledConnection {
            handle: Some(handle),
            inner: Arc::clone(&self.inner),
            _permit: permit,
            healthy: true,
        })
    }

    /// Drop every parked connection. Called after a credential refresh or a
    /// backend outage so stale sessions are not handed out again.
    pub fn clear_idle(&self) {
        let drained = {
            let mut idle = self.inner.idle.lock();
            std::mem::take(&mut *idle)
        };
        if !drained.is_empty() {
            debug!(
                mount = %self.inner.mount,
                count = drained.len(),
                "discarding parked connections"
            );
        }
    }

    /// Number of parked connections, for diagnostics and tests.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    fn pop_idle(&self) -> Option<Box<dyn Handle>> {
        self.inner.idle.lock().pop().map(|c| c.handle)
    }

    fn sweep_idle(&self) {
        let ttl = self.inner.limits.idle_ttl;
        let mut idle = self.inner.idle.lock();
        let before = idle.len();
        idle.retain(|c| c.parked_at.elapsed() < ttl);
        let expired = before - idle.len();
        if expired > 0 {
            trace!(mount = %self.inner.mount, expired, "closed idle connections");
        }
    }
}

/// An exclusively checked-out backend connection.
pub struct PooledConnection {
    handle: Option<Box<dyn Handle>>,
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
    healthy: bool,
}

impl PooledConnection {
    pub fn handle_mut(&mut self) -> &mut dyn Handle {
        // the slot is only None after Drop has taken it
        match self.handle.as_mut() {
            Some(h) => h.as_mut(),
            None => unreachable!("connection used after drop"),
        }
    }

    /// Mark the connection as broken; it will be closed instead of parked.
    pub fn evict(&mut self) {
        self.healthy = false;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if self.healthy {
                self.inner.idle.lock().push(IdleConn {
                    handle,
                    parked_at: Instant::now(),
                });
            } else {
                warn!(mount = %self.inner.mount, "closing evicted connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DirEntry, Metadata};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingDriver {
        connects: AtomicUsize,
    }

    struct NullHandle;

    #[async_trait]
    impl Handle for NullHandle {
        async fn stat(&mut self, _path: &str) -> Result<Metadata> {
            Ok(Metadata::directory(std::time::SystemTime::now()))
        }
        async fn read(&mut self, _path: &str, _offset: u64, _size: u32) -> Result<Bytes> {
            Ok(Bytes::new())
        }
        async fn write(&mut self, _path: &str, data: &[u8]) -> Result<u64> {
            Ok(data.len() as u64)
        }
        async fn list(&mut self, _path: &str) -> Result<Vec<DirEntry>> {
            Ok(Vec::new())
        }
        async fn delete(&mut self, _path: &str) -> Result<()> {
            Ok(())
        }
        async fn mkdir(&mut self, _path: &str) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Driver for CountingDriver {
        async fn connect(&self) -> Result<Box<dyn Handle>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullHandle))
        }
    }

    fn pool_with_limits(limits: MountLimits) -> (MountPool, Arc<CountingDriver>) {
        let driver = Arc::new(CountingDriver {
            connects: AtomicUsize::new(0),
        });
        let pool = MountPool::new(
            MountId::from("test"),
            Arc::clone(&driver) as Arc<dyn Driver>,
            limits,
        );
        (pool, driver)
    }

    #[tokio::test]
    async fn test_connection_reuse() {
        let (pool, driver) = pool_with_limits(MountLimits::default());

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        assert_eq!(pool.idle_count(), 1);

        let _conn = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(driver.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_evicted_connection_not_reused() {
        let (pool, driver) = pool_with_limits(MountLimits::default());

        let mut conn = pool.acquire().await.unwrap();
        conn.evict();
        drop(conn);
        assert_eq!(pool.idle_count(), 0);

        let _conn = pool.acquire().await.unwrap();
        assert_eq!(driver.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pool_exhausted() {
        let limits = MountLimits {
            max_connections: 1,
            acquire_timeout: Duration::from_millis(50),
            ..MountLimits::default()
        };
        let (pool, _) = pool_with_limits(limits);

        let held = pool.acquire().await.unwrap();
        let err = match pool.acquire().await {
            Ok(_) => panic!("second acquire should not get a slot"),
            Err(e) => e,
        };
        match err {
            StorageError::PoolExhausted { mount, waited } => {
                assert_eq!(mount, "test");
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("expected PoolExhausted, got {:?}", other),
        }

        // releasing the held slot unblocks the next caller
        drop(held);
        pool.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_ttl_sweep() {
        let limits = MountLimits {
            idle_ttl: Duration::from_millis(20),
            ..MountLimits::default()
        };
        let (pool, driver) = pool_with_limits(limits);

        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let _conn = pool.acquire().await.unwrap();
        // the parked connection expired, so a fresh one was opened
        assert_eq!(driver.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_clear_idle() {
        let (pool, driver) = pool_with_limits(MountLimits::default());
        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.idle_count(), 1);

        pool.clear_idle();
        assert_eq!(pool.idle_count(), 0);

        let _conn = pool.acquire().await.unwrap();
        assert_eq!(driver.connects.load(Ordering::SeqCst), 2);
    }
}
