//! Write-back queue
//!
//! Callers hand items to [`WriteBackQueue::enqueue`] and continue; a fixed
//! set of worker tasks drains the queue by calling a [`StorePrimitive`]
//! with a connection checked out of the shared [`ConnectionPool`].
//!
//! # Entry lifecycle
//!
//! ```text
//! enqueue ──► Pending ──claim──► InFlight ──store ok──► Done
//!               ▲  │                       └─store err─► Failed
//!   coalesce ───┘  └── same identity enqueued while InFlight:
//!                      new Pending entry, claimed after the first returns
//! ```
//!
//! # Ordering
//!
//! Entries are claimed oldest first by the sequence of their first
//! enqueue; a coalesced payload keeps the position of the entry it was
//! folded into. This is a local dispatch order only. Workers run
//! concurrently and the backend may commit their requests in any order,
//! so callers that need one write visible before another must put a
//! [`barrier`](WriteBackQueue::barrier) between them.
//!
//! # Failures
//!
//! A failed store never stops a worker. The oldest failure not yet
//! reported is held and returned by the next fence; later failures are
//! counted and logged. A caller that never fences may never see a
//! failure.

use crate::dedup::{Claimed, DedupBuffer, Inserted};
use crate::pool::ConnectionPool;
use crate::stats::{QueueGauges, QueueStats, WriteBackStats};
use atomio_common::{EntryState, Error, Result, Sequence, StoreError, Watermarks, WriteBackConfig};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Unit of deferred work
pub trait QueueItem: Send + Sync + 'static {
    /// Identity used to coalesce writes of the same object
    type Key: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
}

/// Backend operation that persists one item
///
/// The item is read at drain time, not when it was enqueued. Must be safe
/// to repeat: coalescing can deliver a payload again after an earlier
/// store of the same identity.
#[async_trait]
pub trait StorePrimitive<T>: Send + Sync + 'static {
    /// Connection handle the pool hands out
    type Connection: Send + 'static;

    async fn store(
        &self,
        item: &T,
        conn: &mut Self::Connection,
    ) -> std::result::Result<(), StoreError>;
}

/// Receipt for an enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// Sequence of the entry now carrying the payload
    pub sequence: Sequence,
    /// Whether the payload was folded into an already pending entry
    pub coalesced: bool,
    /// Outstanding depth right after the insert
    pub depth: usize,
}

struct DeferredFailure {
    key: String,
    sequence: Sequence,
    error: StoreError,
}

struct Control {
    watermarks: Watermarks,
    stall: bool,
}

enum Next<K, T> {
    Entry(Claimed<K, T>),
    Idle,
    Shutdown,
}

struct Shared<T: QueueItem, C: Send + 'static> {
    buffer: Mutex<DedupBuffer<T::Key, T>>,
    control: Mutex<Control>,
    stats: WriteBackStats,
    deferred: Mutex<Option<DeferredFailure>>,
    pool: Arc<ConnectionPool<C>>,
    /// Signalled when an entry becomes claimable or on shutdown
    work: Notify,
    /// Signalled whenever an entry reaches a terminal state
    drained: Notify,
    closed: AtomicBool,
    workers: usize,
}

impl<T: QueueItem, C: Send + 'static> Shared<T, C> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the queue closed, returning whether this call closed it
    ///
    /// Taken under the buffer lock so no insert lands after a worker has
    /// seen the queue closed and empty.
    fn shut_down(&self) -> bool {
        let _buffer = self.buffer.lock();
        !self.closed.swap(true, Ordering::AcqRel)
    }

    fn backpressure(&self) -> (Watermarks, bool) {
        let control = self.control.lock();
        (control.watermarks, control.stall)
    }

    fn next_entry(&self) -> Next<T::Key, T> {
        let mut buffer = self.buffer.lock();
        if let Some(claimed) = buffer.claim() {
            return Next::Entry(claimed);
        }
        if self.is_closed() && buffer.pending_len() == 0 {
            Next::Shutdown
        } else {
            Next::Idle
        }
    }

    /// Wait until `ready` holds, re-checking after every drain
    async fn wait_drained(&self, mut ready: impl FnMut(&Self) -> bool) {
        loop {
            let mut notified = pin!(self.drained.notified());
            notified.as_mut().enable();
            if ready(self) {
                return;
            }
            notified.await;
        }
    }

    fn defer(&self, key: &T::Key, sequence: Sequence, error: StoreError) {
        let mut deferred = self.deferred.lock();
        if let Some(held) = deferred.as_ref() {
            warn!(
                "Store of {:?} ({}) failed while failure of {} is still unreported: {}",
                key, sequence, held.key, error
            );
            return;
        }
        *deferred = Some(DeferredFailure {
            key: format!("{key:?}"),
            sequence,
            error,
        });
    }

    fn take_deferred(&self) -> Result<()> {
        match self.deferred.lock().take() {
            Some(failure) => Err(Error::BarrierPropagated {
                key: failure.key,
                sequence: failure.sequence,
                source: failure.error,
            }),
            None => Ok(()),
        }
    }

    async fn drain<P>(&self, worker: usize, entry: Claimed<T::Key, T>, primitive: &P)
    where
        P: StorePrimitive<T, Connection = C>,
    {
        self.stats.begin_drain();
        let started = Instant::now();

        let result = match self.pool.acquire().await {
            Ok(mut conn) => AssertUnwindSafe(primitive.store(&entry.item, &mut *conn))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let message = panic_message(panic.as_ref());
                    error!(
                        "Worker {} caught panic storing {:?}: {}",
                        worker, entry.key, message
                    );
                    Err(StoreError::Panicked(message))
                }),
            Err(e) => Err(StoreError::ConnectionFailed(e.to_string())),
        };

        let elapsed = started.elapsed();
        self.stats.end_drain(elapsed, result.is_ok());

        match result {
            Ok(()) => debug!(
                "Worker {} stored {:?} ({}) in {:?}, {} coalesced, queued {:?}",
                worker,
                entry.key,
                entry.sequence,
                elapsed,
                entry.replaced,
                started.duration_since(entry.enqueued_at)
            ),
            Err(e) => {
                warn!(
                    "Worker {} failed to store {:?} ({}): {}",
                    worker, entry.key, entry.sequence, e
                );
                // Held before the entry retires so a barrier woken by the
                // retirement sees it.
                self.defer(&entry.key, entry.sequence, e);
            }
        }

        let claimable = self.buffer.lock().complete(&entry.key, entry.sequence);
        if claimable {
            self.work.notify_one();
        }
        if self.is_closed() {
            // Idle workers may be waiting on entries that have now drained
            self.work.notify_waiters();
        }
        self.drained.notify_waiters();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn run_worker<T, P>(worker: usize, shared: Arc<Shared<T, P::Connection>>, primitive: Arc<P>)
where
    T: QueueItem,
    P: StorePrimitive<T>,
{
    debug!("Write-back worker {} started", worker);
    loop {
        let mut notified = pin!(shared.work.notified());
        notified.as_mut().enable();

        match shared.next_entry() {
            Next::Entry(entry) => shared.drain(worker, entry, primitive.as_ref()).await,
            Next::Idle => notified.await,
            Next::Shutdown => break,
        }
    }
    debug!("Write-back worker {} stopped", worker);
}

/// Bounded write-back queue drained by a fixed worker pool
pub struct WriteBackQueue<T: QueueItem, P: StorePrimitive<T>> {
    shared: Arc<Shared<T, P::Connection>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: QueueItem, P: StorePrimitive<T>> WriteBackQueue<T, P> {
    /// Start the queue and its workers on the current tokio runtime
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the configuration is invalid.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn start(
        primitive: P,
        pool: Arc<ConnectionPool<P::Connection>>,
        config: &WriteBackConfig,
    ) -> Result<Self> {
        config.validate()?;
        if pool.capacity() < config.worker_count {
            warn!(
                "Connection pool of {} is smaller than {} workers; drains will wait on the pool",
                pool.capacity(),
                config.worker_count
            );
        }

        let shared = Arc::new(Shared {
            buffer: Mutex::new(DedupBuffer::new()),
            control: Mutex::new(Control {
                watermarks: config.watermarks,
                stall: config.stall,
            }),
            stats: WriteBackStats::new(),
            deferred: Mutex::new(None),
            pool,
            work: Notify::new(),
            drained: Notify::new(),
            closed: AtomicBool::new(false),
            workers: config.worker_count,
        });

        let primitive = Arc::new(primitive);
        let handles = (0..config.worker_count)
            .map(|worker| tokio::spawn(run_worker(worker, shared.clone(), primitive.clone())))
            .collect();

        info!(
            "Write-back queue started with {} workers, {}, stalling={}",
            config.worker_count, config.watermarks, config.stall
        );

        Ok(Self {
            shared,
            handles: Mutex::new(handles),
        })
    }

    /// Queue an item for storage
    ///
    /// Coalesces into a pending entry of the same identity. When stalling
    /// is enabled and the outstanding depth found on arrival is at or above
    /// the high watermark, waits until the depth has fallen to the low
    /// watermark. This holds for coalescing enqueues too.
    ///
    /// # Errors
    /// Returns [`Error::Closed`] after [`close`](Self::close).
    pub async fn enqueue(&self, item: T) -> Result<Enqueued> {
        let (enqueued, arrived_at) = self.insert(item, None)?;

        let (watermarks, stall) = self.shared.backpressure();
        if stall && watermarks.is_over(arrived_at) {
            self.shared.stats.record_stall();
            debug!(
                "Write-back depth {} at high watermark {}, stalling producer",
                arrived_at, watermarks.high
            );
            self.shared
                .wait_drained(|shared| {
                    let (watermarks, stall) = shared.backpressure();
                    !stall || shared.is_closed() || watermarks.is_released(shared.buffer.lock().depth())
                })
                .await;
        }

        Ok(enqueued)
    }

    /// Queue an item without waiting
    ///
    /// # Errors
    /// Returns [`Error::QueueFull`] instead of stalling when a new entry
    /// would take the depth past the high watermark, and [`Error::Closed`]
    /// after [`close`](Self::close). Coalescing enqueues are never refused.
    pub fn try_enqueue(&self, item: T) -> Result<Enqueued> {
        let (watermarks, _) = self.shared.backpressure();
        self.insert(item, Some(watermarks.high))
            .map(|(enqueued, _)| enqueued)
    }

    /// Insert under the buffer lock, returning the receipt and the depth
    /// found before the insert
    fn insert(&self, item: T, limit: Option<usize>) -> Result<(Enqueued, usize)> {
        let key = item.key();
        let (inserted, arrived_at, depth) = {
            let mut buffer = self.shared.buffer.lock();
            // Checked under the lock that workers use to decide on shutdown
            if self.shared.is_closed() {
                return Err(Error::Closed);
            }
            let depth = buffer.depth();
            if let Some(high) = limit
                && depth >= high
                && !buffer.is_pending(&key)
            {
                drop(buffer);
                self.shared.stats.record_rejected();
                return Err(Error::QueueFull { depth, high });
            }
            let inserted = buffer.insert(key, item);
            (inserted, depth, buffer.depth())
        };

        self.shared.stats.record_enqueue(inserted.is_coalesced());
        if let Inserted::New(_) = inserted {
            self.shared.work.notify_one();
        }

        let enqueued = Enqueued {
            sequence: inserted.sequence(),
            coalesced: inserted.is_coalesced(),
            depth,
        };
        Ok((enqueued, arrived_at))
    }

    /// Wait until everything enqueued before this call has drained
    ///
    /// Entries enqueued while the barrier waits may or may not be drained
    /// when it returns.
    ///
    /// # Errors
    /// Returns [`Error::BarrierPropagated`] carrying the oldest store
    /// failure not yet reported. The failure is cleared: the next fence
    /// does not see it again.
    pub async fn barrier(&self) -> Result<()> {
        let target = self.shared.buffer.lock().last_assigned();
        self.shared.stats.record_flush();
        debug!("Barrier waiting for entries through {}", target);

        self.shared
            .wait_drained(|shared| shared.buffer.lock().is_drained_through(target))
            .await;

        self.shared.take_deferred()
    }

    /// Drain, stop the workers and close the connection pool
    ///
    /// Idle connections are destroyed. Calling `close` again is a no-op.
    ///
    /// Enqueues that race `close` either fail with [`Error::Closed`] or are
    /// drained before the workers exit.
    ///
    /// # Errors
    /// Returns the final barrier's deferred failure, after teardown. A
    /// failure of an entry that slipped in behind the barrier is returned
    /// when the barrier itself was clean.
    pub async fn close(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Ok(());
        }

        let flushed = self.barrier().await;

        self.shared.shut_down();
        self.shared.work.notify_waiters();
        self.shared.drained.notify_waiters();

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Write-back worker exited abnormally: {}", e);
            }
        }

        let destroyed = self.shared.pool.close();
        info!(
            "Write-back queue closed, {} connections destroyed",
            destroyed.len()
        );
        drop(destroyed);

        flushed.and_then(|()| self.shared.take_deferred())
    }

    /// Replace the backpressure thresholds
    ///
    /// Applies to subsequent checks; stalled producers re-evaluate at the
    /// next drain.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the thresholds are unusable.
    pub fn set_watermarks(&self, high: usize, low: usize) -> Result<()> {
        let watermarks = Watermarks::new(high, low)?;
        self.shared.control.lock().watermarks = watermarks;
        debug!("Write-back watermarks set to {}", watermarks);
        Ok(())
    }

    /// Enable or disable stalling producers above the high watermark
    pub fn stall(&self, stall: bool) {
        self.shared.control.lock().stall = stall;
    }

    pub fn watermarks(&self) -> Watermarks {
        self.shared.backpressure().0
    }

    pub fn stalling(&self) -> bool {
        self.shared.backpressure().1
    }

    /// Outstanding entries, pending plus in flight
    pub fn depth(&self) -> usize {
        self.shared.buffer.lock().depth()
    }

    /// Live state of an identity, `None` once its work has drained
    pub fn state_of(&self, key: &T::Key) -> Option<EntryState> {
        self.shared.buffer.lock().state_of(key)
    }

    pub fn busy_workers(&self) -> usize {
        self.shared.stats.busy_workers()
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// The pool shared with the workers
    pub fn pool(&self) -> &Arc<ConnectionPool<P::Connection>> {
        &self.shared.pool
    }

    pub fn stats(&self) -> QueueStats {
        let (depth, pending, in_flight) = {
            let buffer = self.shared.buffer.lock();
            (buffer.depth(), buffer.pending_len(), buffer.in_flight_len())
        };
        let (watermarks, stalling) = self.shared.backpressure();

        self.shared.stats.snapshot(QueueGauges {
            depth,
            pending,
            in_flight,
            watermarks,
            stalling,
            workers: self.shared.workers,
            pool_available: self.shared.pool.size(),
            pool_capacity: self.shared.pool.capacity(),
        })
    }

    pub fn clear_stats(&self) {
        self.shared.stats.clear();
    }
}

impl<T: QueueItem, P: StorePrimitive<T>> Drop for WriteBackQueue<T, P> {
    fn drop(&mut self) {
        // Workers finish whatever is still queued, then exit.
        if self.shared.shut_down() {
            self.shared.work.notify_waiters();
            self.shared.drained.notify_waiters();
        }
    }
}

impl<T: QueueItem, P: StorePrimitive<T>> fmt::Debug for WriteBackQueue<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBackQueue")
            .field("workers", &self.shared.workers)
            .field("depth", &self.depth())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
