//! Atom storage facade
//!
//! [`AtomStorage`] owns one session with a backend: the connection pool,
//! the write-back queue feeding it, and the counters for the report.
//! Stores and removes are queued and return at once; failures come back
//! from the next [`barrier`](AtomStorage::barrier), [`flush`](AtomStorage::flush),
//! [`store_and_wait`](AtomStorage::store_and_wait) or
//! [`close`](AtomStorage::close).

use crate::atom::Atom;
use crate::backend::{AtomBackend, AtomWrite, BackendAdapter};
use atomio_common::{Error, Result, StorageConfig, StoreError, Watermarks};
use atomio_writeback::{ConnectionPool, Enqueued, QueueStats, WriteBackQueue};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

#[derive(Debug)]
struct StorageCounters {
    store_count: AtomicU64,
    value_stores: AtomicU64,
    atom_removes: AtomicU64,
    since: Mutex<DateTime<Utc>>,
}

impl StorageCounters {
    fn new() -> Self {
        Self {
            store_count: AtomicU64::new(0),
            value_stores: AtomicU64::new(0),
            atom_removes: AtomicU64::new(0),
            since: Mutex::new(Utc::now()),
        }
    }

    fn clear(&self) {
        *self.since.lock() = Utc::now();
        self.store_count.store(0, Ordering::Relaxed);
        self.value_stores.store(0, Ordering::Relaxed);
        self.atom_removes.store(0, Ordering::Relaxed);
    }
}

/// Storage statistics report
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub name: String,
    /// Start of the stats window
    pub since: DateTime<Utc>,
    pub queue: QueueStats,
    /// Atom stores requested
    pub store_count: u64,
    /// Value updates requested
    pub value_stores: u64,
    /// Atom removals requested
    pub atom_removes: u64,
    pub pool_available: usize,
    pub pool_capacity: usize,
}

impl fmt::Display for StorageStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} stats since {}",
            self.name,
            self.since.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        writeln!(f)?;
        writeln!(
            f,
            "store_count={} value_stores={} atom_removes={}",
            self.store_count, self.value_stores, self.atom_removes
        )?;
        writeln!(f)?;
        writeln!(f, "{}", self.queue)
    }
}

/// A storage session over an [`AtomBackend`]
pub struct AtomStorage<B: AtomBackend> {
    name: String,
    backend: Arc<B>,
    queue: WriteBackQueue<AtomWrite, BackendAdapter<B>>,
    counters: StorageCounters,
}

impl<B: AtomBackend> AtomStorage<B> {
    /// Open a session
    ///
    /// Opens `foreground_connections + worker_count` connections, runs the
    /// backend's initialization on one of them and starts the workers.
    ///
    /// # Errors
    /// Returns [`Error::Config`] for an invalid configuration and
    /// [`Error::Store`] if the backend cannot connect or initialize.
    pub async fn open(backend: B, config: StorageConfig) -> Result<Self> {
        config.validate()?;

        let backend = Arc::new(backend);
        let adapter = BackendAdapter::new(backend.clone());
        let pool = Arc::new(ConnectionPool::connect(&adapter, config.pool_size()).await?);

        {
            let mut conn = pool.acquire().await?;
            backend.initialize(&mut *conn).await?;
        }

        let queue = WriteBackQueue::start(adapter, pool, &config.write_back)?;
        info!(
            "Storage session {} open: {} connections, {} write-back workers",
            config.name,
            config.pool_size(),
            config.write_back.worker_count
        );

        Ok(Self {
            name: config.name,
            backend,
            queue,
            counters: StorageCounters::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The write-back queue behind this session
    pub const fn queue(&self) -> &WriteBackQueue<AtomWrite, BackendAdapter<B>> {
        &self.queue
    }

    /// Queue a store of the atom and its values
    ///
    /// # Errors
    /// Returns [`Error::Closed`] after [`close`](Self::close).
    pub async fn store_atom(&self, atom: &Arc<Atom>) -> Result<Enqueued> {
        self.counters.store_count.fetch_add(1, Ordering::Relaxed);
        self.queue.enqueue(AtomWrite::store(atom.clone())).await
    }

    /// Queue a write of one of the atom's values
    ///
    /// The atom document carries all of its values, so this queues the
    /// whole atom.
    ///
    /// # Errors
    /// Returns [`Error::Closed`] after [`close`](Self::close).
    pub async fn store_value(&self, atom: &Arc<Atom>, key: &str) -> Result<Enqueued> {
        self.counters.value_stores.fetch_add(1, Ordering::Relaxed);
        if atom.value(key).is_none() {
            debug!("Storing atom {} without a value at {}", atom.id(), key);
        }
        self.queue.enqueue(AtomWrite::store(atom.clone())).await
    }

    /// Queue removal of the atom
    ///
    /// A store of the same atom still pending is replaced by the removal.
    ///
    /// # Errors
    /// Returns [`Error::Closed`] after [`close`](Self::close).
    pub async fn remove_atom(&self, atom: &Arc<Atom>) -> Result<Enqueued> {
        self.counters.atom_removes.fetch_add(1, Ordering::Relaxed);
        self.queue.enqueue(AtomWrite::remove(atom.clone())).await
    }

    /// Store the atom and wait for the queue to drain through it
    ///
    /// # Errors
    /// Returns whatever the barrier returns, which may be a failure of an
    /// earlier write.
    pub async fn store_and_wait(&self, atom: &Arc<Atom>) -> Result<()> {
        self.store_atom(atom).await?;
        self.barrier().await
    }

    /// Wait for everything queued so far
    ///
    /// # Errors
    /// Returns [`Error::BarrierPropagated`] with the oldest unreported
    /// write failure.
    pub async fn barrier(&self) -> Result<()> {
        self.queue.barrier().await
    }

    /// Same as [`barrier`](Self::barrier)
    ///
    /// # Errors
    /// See [`barrier`](Self::barrier).
    pub async fn flush(&self) -> Result<()> {
        self.barrier().await
    }

    /// Flush, stop the workers and release every connection
    ///
    /// # Errors
    /// Returns the final flush's deferred failure.
    pub async fn close(&self) -> Result<()> {
        let result = self.queue.close().await;
        info!("Storage session {} closed", self.name);
        result
    }

    /// Set the write-back backpressure thresholds
    ///
    /// # Errors
    /// Returns [`Error::Config`] unless `high >= 1` and `low <= high`.
    pub fn set_hilo_watermarks(&self, high: usize, low: usize) -> Result<()> {
        self.queue.set_watermarks(high, low)
    }

    pub fn watermarks(&self) -> Watermarks {
        self.queue.watermarks()
    }

    /// Enable or disable stalling writers above the high watermark
    pub fn set_stall_writers(&self, stall: bool) {
        self.queue.stall(stall);
    }

    /// Whether the session is open and the backend reports healthy
    pub fn connected(&self) -> bool {
        !self.queue.is_closed() && self.backend.is_healthy()
    }

    pub fn stats(&self) -> StorageStats {
        let queue = self.queue.stats();
        StorageStats {
            name: self.name.clone(),
            since: *self.counters.since.lock(),
            store_count: self.counters.store_count.load(Ordering::Relaxed),
            value_stores: self.counters.value_stores.load(Ordering::Relaxed),
            atom_removes: self.counters.atom_removes.load(Ordering::Relaxed),
            pool_available: queue.gauges.pool_available,
            pool_capacity: queue.gauges.pool_capacity,
            queue,
        }
    }

    pub fn clear_stats(&self) {
        self.counters.clear();
        self.queue.clear_stats();
    }

    /// Run `f` on a pooled connection, bypassing the queue
    ///
    /// Waits for a free connection like any worker. Nothing orders the call
    /// against queued writes; fence first if that matters.
    ///
    /// # Errors
    /// Returns [`Error::Closed`] after [`close`](Self::close) and
    /// [`Error::Store`] if `f` fails.
    pub async fn with_connection<R, F>(&self, f: F) -> Result<R>
    where
        F: for<'c> FnOnce(&'c B, &'c mut B::Connection) -> BoxFuture<'c, std::result::Result<R, StoreError>>,
    {
        if self.queue.is_closed() {
            return Err(Error::Closed);
        }
        let mut conn = self.queue.pool().acquire().await?;
        Ok(f(&self.backend, &mut *conn).await?)
    }

    /// Value deletion is not supported
    ///
    /// # Errors
    /// Always returns [`Error::NotImplemented`].
    pub fn delete_value(&self, _atom: &Atom, key: &str) -> Result<()> {
        Err(Error::not_implemented(format!("delete_value({key})")))
    }

    /// Reading values back from storage is not supported
    ///
    /// # Errors
    /// Always returns [`Error::NotImplemented`].
    pub fn get_value(&self, _atom: &Atom, key: &str) -> Result<Value> {
        Err(Error::not_implemented(format!("get_value({key})")))
    }
}

impl<B: AtomBackend> fmt::Debug for AtomStorage<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomStorage")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::WriteKind;
    use crate::memory::MemoryBackend;
    use atomio_common::WriteBackConfig;
    use serde_json::json;

    fn config(workers: usize) -> StorageConfig {
        StorageConfig {
            name: "test".to_string(),
            foreground_connections: 1,
            write_back: WriteBackConfig {
                worker_count: workers,
                ..Default::default()
            },
        }
    }

    async fn open(workers: usize) -> AtomStorage<MemoryBackend> {
        AtomStorage::open(MemoryBackend::new(), config(workers)).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_builds_pool_and_initializes() {
        let storage = open(3).await;

        assert_eq!(storage.backend().connections_opened(), 4);
        assert!(storage.backend().is_initialized());
        assert!(storage.connected());
        assert_eq!(storage.stats().pool_capacity, 4);

        storage.close().await.unwrap();
        assert!(!storage.connected());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_open() {
        let err = AtomStorage::open(MemoryBackend::new(), config(0)).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_repeated_stores_coalesce() {
        let storage = open(1).await;
        let atom = Arc::new(Atom::node("ConceptNode", "cat"));

        for i in 0..5 {
            atom.set_value("count", json!(i));
            storage.store_atom(&atom).await.unwrap();
        }
        storage.flush().await.unwrap();

        assert_eq!(storage.backend().store_calls(atom.id()), 1);
        let doc = storage.backend().document(atom.id()).unwrap();
        assert_eq!(doc.values["count"], json!(4));

        let stats = storage.stats();
        assert_eq!(stats.store_count, 5);
        assert_eq!(stats.queue.duplicates, 4);
    }

    #[tokio::test]
    async fn test_values_read_when_write_drains() {
        let storage = open(1).await;
        let atom = Arc::new(Atom::node("ConceptNode", "dog"));

        storage.store_atom(&atom).await.unwrap();
        atom.set_value("tv", json!([0.8, 0.9]));
        storage.store_value(&atom, "tv").await.unwrap();
        storage.flush().await.unwrap();

        let doc = storage.backend().document(atom.id()).unwrap();
        assert_eq!(doc.values["tv"], json!([0.8, 0.9]));
        assert_eq!(storage.stats().value_stores, 1);
    }

    #[tokio::test]
    async fn test_remove_replaces_pending_store() {
        let storage = open(1).await;
        let atom = Arc::new(Atom::node("ConceptNode", "gone"));

        storage.store_atom(&atom).await.unwrap();
        storage.remove_atom(&atom).await.unwrap();
        storage.flush().await.unwrap();

        assert_eq!(storage.backend().dispatch_log(), vec![(atom.id(), WriteKind::Remove)]);
        assert!(storage.backend().document(atom.id()).is_none());
        assert_eq!(storage.stats().atom_removes, 1);
    }

    #[tokio::test]
    async fn test_store_and_wait_surfaces_failure_once() {
        let storage = open(2).await;
        let bad = Arc::new(Atom::node("ConceptNode", "bad"));
        storage.backend().fail_atom(bad.id());

        let err = storage.store_and_wait(&bad).await.unwrap_err();
        assert!(err.is_deferred());
        assert!(matches!(err.store_error(), Some(StoreError::Backend(_))));
        storage.flush().await.unwrap();

        let good = Arc::new(Atom::node("ConceptNode", "good"));
        storage.store_and_wait(&good).await.unwrap();
        assert!(storage.backend().document(good.id()).is_some());
    }

    #[tokio::test]
    async fn test_report_and_clear_stats() {
        let storage = open(2).await;
        for name in ["a", "b", "c"] {
            storage.store_atom(&Arc::new(Atom::node("ConceptNode", name))).await.unwrap();
        }
        storage.flush().await.unwrap();

        let report = storage.stats().to_string();
        assert!(report.starts_with("test stats since "));
        assert!(report.contains("store_count=3 value_stores=0 atom_removes=0"));
        assert!(report.contains("write items=3 dup=0"));
        assert!(report.contains("current conn_pool free=3 of 3"));

        storage.clear_stats();
        let stats = storage.stats();
        assert_eq!((stats.store_count, stats.queue.items, stats.queue.drained), (0, 0, 0));
        assert_eq!(stats.pool_capacity, 3);
    }

    #[tokio::test]
    async fn test_runtime_reconfiguration() {
        let storage = open(1).await;

        assert!(matches!(storage.set_hilo_watermarks(5, 10), Err(Error::Config(_))));
        storage.set_hilo_watermarks(64, 16).unwrap();
        assert_eq!(storage.watermarks(), Watermarks { high: 64, low: 16 });

        storage.set_stall_writers(false);
        assert!(!storage.queue().stalling());
    }

    #[tokio::test]
    async fn test_with_connection_runs_on_pool() {
        let storage = open(1).await;
        let atom = Arc::new(Atom::node("ConceptNode", "direct"));

        let stored = atom.clone();
        storage
            .with_connection(move |backend, conn| {
                Box::pin(async move { backend.store_atom(&stored, conn).await })
            })
            .await
            .unwrap();
        assert!(storage.backend().document(atom.id()).is_some());

        storage.backend().fail_atom(atom.id());
        let failing = atom.clone();
        let err = storage
            .with_connection(move |backend, conn| {
                Box::pin(async move { backend.store_atom(&failing, conn).await })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Backend(_))));
        assert_eq!(storage.queue().pool().size(), 2);
    }

    #[tokio::test]
    async fn test_value_queries_not_implemented() {
        let storage = open(1).await;
        let atom = Atom::node("ConceptNode", "v");

        assert!(matches!(storage.delete_value(&atom, "tv"), Err(Error::NotImplemented(_))));
        assert!(matches!(storage.get_value(&atom, "tv"), Err(Error::NotImplemented(_))));
    }

    #[tokio::test]
    async fn test_close_flushes_and_refuses_writes() {
        let storage = open(2).await;
        let atom = Arc::new(Atom::node("ConceptNode", "last"));

        storage.store_atom(&atom).await.unwrap();
        storage.close().await.unwrap();

        assert!(storage.backend().document(atom.id()).is_some());
        assert!(matches!(storage.store_atom(&atom).await, Err(Error::Closed)));
        assert!(matches!(
            storage.with_connection(|_, _| Box::pin(async { Ok(()) })).await,
            Err(Error::Closed)
        ));
        storage.close().await.unwrap();
    }
}
