//! Backend connection pool
//!
//! A fixed-size set of reusable backend handles shared by the write-back
//! workers and foreground callers. Handles are created once, when the pool
//! is built, and handed out exclusively through [`PooledConnection`]
//! guards which put them back when dropped.

use atomio_common::{Error, Result, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Creates backend connections
///
/// Called only while a pool is being built; a session never reconnects.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Connection handle type
    type Connection: Send + 'static;

    /// Open one connection to the backend
    async fn connect(&self) -> std::result::Result<Self::Connection, StoreError>;
}

/// Pool of backend connections
pub struct ConnectionPool<C> {
    /// Handles not currently checked out
    idle: Mutex<Vec<C>>,
    /// One permit per idle handle
    available: Semaphore,
    /// Number of handles the pool was built with
    capacity: usize,
}

impl<C: Send + 'static> ConnectionPool<C> {
    /// Build a pool by opening `capacity` connections through `factory`
    ///
    /// # Errors
    /// Returns [`Error::PoolExhausted`] for a zero capacity and
    /// [`Error::Store`] if the factory fails to open a connection.
    pub async fn connect<F>(factory: &F, capacity: usize) -> Result<Self>
    where
        F: ConnectionFactory<Connection = C> + ?Sized,
    {
        if capacity == 0 {
            return Err(Error::PoolExhausted { requested: 0 });
        }

        let mut connections = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let conn = factory.connect().await?;
            debug!("Opened pool connection {}/{}", i + 1, capacity);
            connections.push(conn);
        }

        info!("Connection pool ready with {} connections", capacity);
        Self::from_connections(connections)
    }

    /// Build a pool from already-open connections
    ///
    /// # Errors
    /// Returns [`Error::PoolExhausted`] if `connections` is empty.
    pub fn from_connections(connections: Vec<C>) -> Result<Self> {
        let capacity = connections.len();
        if capacity == 0 {
            return Err(Error::PoolExhausted { requested: 0 });
        }

        Ok(Self {
            idle: Mutex::new(connections),
            available: Semaphore::new(capacity),
            capacity,
        })
    }

    /// Check out a connection, waiting until one is free
    ///
    /// There is no pool-side timeout; wrap the call if one is needed.
    ///
    /// # Errors
    /// Returns [`Error::Closed`] once the pool has been closed.
    pub async fn acquire(&self) -> Result<PooledConnection<'_, C>> {
        let permit = self.available.acquire().await.map_err(|_| Error::Closed)?;
        permit.forget();
        self.checkout()
    }

    /// Check out a connection if one is free right now
    pub fn try_acquire(&self) -> Option<PooledConnection<'_, C>> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        self.checkout().ok()
    }

    fn checkout(&self) -> Result<PooledConnection<'_, C>> {
        // Handles are pushed back before their permit is returned, so a
        // held permit always has an idle handle behind it.
        let Some(conn) = self.idle.lock().pop() else {
            self.available.add_permits(1);
            return Err(Error::internal("pool permit acquired with no idle connection"));
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self,
        })
    }

    /// Return a connection to the pool
    ///
    /// Equivalent to dropping the guard.
    pub fn release(&self, conn: PooledConnection<'_, C>) {
        debug_assert!(std::ptr::eq(conn.pool, self));
        drop(conn);
    }

    fn put_back(&self, conn: C) {
        self.idle.lock().push(conn);
        self.available.add_permits(1);
    }

    /// Number of connections currently available
    ///
    /// Diagnostic only: the value can be stale by the time it is read.
    pub fn size(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of connections the pool was built with
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the pool has been closed
    pub fn is_closed(&self) -> bool {
        self.available.is_closed()
    }

    /// Refuse further checkouts and hand back the idle connections
    ///
    /// Callers blocked in [`acquire`](Self::acquire) fail with
    /// [`Error::Closed`]. Connections still checked out come back to the
    /// idle list when their guards drop and are destroyed with the pool.
    pub fn close(&self) -> Vec<C> {
        self.available.close();
        let drained = std::mem::take(&mut *self.idle.lock());
        info!(
            "Connection pool closed, {} of {} connections returned",
            drained.len(),
            self.capacity
        );
        drained
    }
}

impl<C> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("available", &self.available.available_permits())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Exclusive checkout of a pooled connection
///
/// Dereferences to the connection. The connection goes back to the pool
/// when the guard is dropped, on every exit path.
pub struct PooledConnection<'a, C: Send + 'static> {
    conn: Option<C>,
    pool: &'a ConnectionPool<C>,
}

impl<C: Send + 'static> Deref for PooledConnection<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<C: Send + 'static> DerefMut for PooledConnection<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<C: Send + 'static> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingFactory {
        opened: AtomicUsize,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl ConnectionFactory for CountingFactory {
        type Connection = usize;

        async fn connect(&self) -> std::result::Result<usize, StoreError> {
            let n = self.opened.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.is_some_and(|limit| n >= limit) {
                return Err(StoreError::ConnectionFailed("refused".into()));
            }
            Ok(n)
        }
    }

    fn factory() -> CountingFactory {
        CountingFactory {
            opened: AtomicUsize::new(0),
            fail_after: None,
        }
    }

    #[tokio::test]
    async fn test_connect_opens_capacity_connections() {
        let factory = factory();
        let pool = ConnectionPool::connect(&factory, 3).await.unwrap();
        assert_eq!(factory.opened.load(Ordering::SeqCst), 3);
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.capacity(), 3);
    }

    #[tokio::test]
    async fn test_zero_capacity_rejected() {
        let err = ConnectionPool::connect(&factory(), 0).await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { requested: 0 }));
        assert!(ConnectionPool::<u8>::from_connections(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_factory_failure_propagates() {
        let factory = CountingFactory {
            opened: AtomicUsize::new(0),
            fail_after: Some(1),
        };
        let err = ConnectionPool::connect(&factory, 2).await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_guard_returns_connection() {
        let pool = ConnectionPool::from_connections(vec![1u32, 2]).unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.size(), 0);
        assert!(pool.try_acquire().is_none());
        assert_ne!(*a, *b);

        pool.release(a);
        assert_eq!(pool.size(), 1);
        drop(b);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let pool = Arc::new(ConnectionPool::from_connections(vec![String::from("only")]).unwrap());
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut conn = pool.acquire().await.unwrap();
                conn.push_str("-reused");
                conn.clone()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let seen = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, "only-reused");
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_returns_idle() {
        let pool = Arc::new(ConnectionPool::from_connections(vec![7u8]).unwrap());
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| *c) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(pool.close().is_empty());
        assert!(matches!(waiter.await.unwrap(), Err(Error::Closed)));

        drop(held);
        assert!(pool.is_closed());
        assert!(pool.try_acquire().is_none());
    }
}
