//! Write-back queue statistics
//!
//! Counters are plain atomics bumped by producers and workers without
//! taking the queue lock. A [`QueueStats`] snapshot reads them one by one,
//! so a snapshot taken while the queue is busy is eventually accurate
//! rather than transactional.

use atomio_common::Watermarks;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Bucket upper bounds in microseconds
///
/// Drains are backend round trips, so the range starts at 100us and the
/// last bucket catches everything over 10s.
pub const DRAIN_BUCKET_BOUNDARIES_US: [u64; 12] = [
    100,        // 0: up to and including 100us
    500,        // 1: 100-500us
    1_000,      // 2: 500us-1ms
    5_000,      // 3: 1-5ms
    10_000,     // 4: 5-10ms
    50_000,     // 5: 10-50ms
    100_000,    // 6: 50-100ms
    500_000,    // 7: 100-500ms
    1_000_000,  // 8: 500ms-1s
    5_000_000,  // 9: 1-5s
    10_000_000, // 10: 5-10s
    u64::MAX,   // 11: 10s+
];

const BUCKETS: usize = DRAIN_BUCKET_BOUNDARIES_US.len();

/// Histogram of drain durations
#[derive(Debug)]
pub struct DrainHistogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl DrainHistogram {
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Record a drain duration in microseconds
    pub fn record(&self, micros: u64) {
        let idx = DRAIN_BUCKET_BOUNDARIES_US
            .iter()
            .position(|&boundary| micros <= boundary)
            .unwrap_or(BUCKETS - 1);

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(micros, Ordering::Relaxed);
        self.min.fetch_min(micros, Ordering::Relaxed);
        self.max.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn min(&self) -> u64 {
        let min = self.min.load(Ordering::Relaxed);
        if min == u64::MAX { 0 } else { min }
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    /// Upper bound of the bucket holding the given percentile (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn percentile(&self, percentile: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }

        let target = ((total as f64) * percentile).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return DRAIN_BUCKET_BOUNDARIES_US[i];
            }
        }
        DRAIN_BUCKET_BOUNDARIES_US[BUCKETS - 1]
    }

    /// (upper bound, count) pairs, not cumulative
    pub fn bucket_counts(&self) -> Vec<(u64, u64)> {
        DRAIN_BUCKET_BOUNDARIES_US
            .iter()
            .zip(self.buckets.iter())
            .map(|(&boundary, count)| (boundary, count.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
    }
}

impl Default for DrainHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain duration summary, microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainLatency {
    pub avg: u64,
    pub min: u64,
    pub max: u64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
}

impl DrainLatency {
    pub fn from_histogram(histogram: &DrainHistogram) -> Self {
        let count = histogram.count();
        Self {
            avg: if count == 0 { 0 } else { histogram.sum() / count },
            min: histogram.min(),
            max: histogram.max(),
            p50: histogram.percentile(0.50),
            p90: histogram.percentile(0.90),
            p99: histogram.percentile(0.99),
        }
    }
}

/// Live counters for one write-back queue
#[derive(Debug)]
pub struct WriteBackStats {
    /// Every enqueue call, coalesced or not
    items: AtomicU64,
    /// Enqueues folded into an already pending entry
    duplicates: AtomicU64,
    /// Barrier calls
    flushes: AtomicU64,
    /// Entries whose store primitive returned, either way
    drained: AtomicU64,
    /// Entries whose store primitive failed or panicked
    failed: AtomicU64,
    /// Enqueues that waited on the low watermark
    stalls: AtomicU64,
    /// Non-blocking enqueues refused at the high watermark
    rejected: AtomicU64,
    /// Sum over drains of the other workers busy when the drain started
    drain_concurrent: AtomicU64,
    /// Workers currently inside the store primitive
    busy: AtomicUsize,
    drain_time: DrainHistogram,
    since: Mutex<DateTime<Utc>>,
}

impl WriteBackStats {
    pub fn new() -> Self {
        Self {
            items: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            drained: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            stalls: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            drain_concurrent: AtomicU64::new(0),
            busy: AtomicUsize::new(0),
            drain_time: DrainHistogram::new(),
            since: Mutex::new(Utc::now()),
        }
    }

    pub fn record_enqueue(&self, coalesced: bool) {
        self.items.fetch_add(1, Ordering::Relaxed);
        if coalesced {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a worker busy; returns how many others already were
    pub fn begin_drain(&self) -> usize {
        let others = self.busy.fetch_add(1, Ordering::AcqRel);
        self.drain_concurrent
            .fetch_add(others as u64, Ordering::Relaxed);
        others
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn end_drain(&self, elapsed: Duration, ok: bool) {
        self.drain_time.record(elapsed.as_micros() as u64);
        self.drained.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.busy.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn busy_workers(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    /// Reset counters and restart the stats window
    ///
    /// The busy-worker gauge tracks live state and is left alone.
    pub fn clear(&self) {
        *self.since.lock() = Utc::now();
        self.items.store(0, Ordering::Relaxed);
        self.duplicates.store(0, Ordering::Relaxed);
        self.flushes.store(0, Ordering::Relaxed);
        self.drained.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.stalls.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.drain_concurrent.store(0, Ordering::Relaxed);
        self.drain_time.reset();
    }

    /// Take a snapshot, combining counters with the queue's live gauges
    pub fn snapshot(&self, gauges: QueueGauges) -> QueueStats {
        QueueStats {
            since: *self.since.lock(),
            items: self.items.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            drain_concurrent: self.drain_concurrent.load(Ordering::Relaxed),
            drain_latency: DrainLatency::from_histogram(&self.drain_time),
            drain_buckets: self.drain_time.bucket_counts(),
            drain_time_us: self.drain_time.sum(),
            busy_workers: self.busy_workers(),
            gauges,
        }
    }
}

impl Default for WriteBackStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time queue state captured alongside the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueGauges {
    /// Outstanding entries, pending plus in flight
    pub depth: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub watermarks: Watermarks,
    pub stalling: bool,
    pub workers: usize,
    pub pool_available: usize,
    pub pool_capacity: usize,
}

/// Immutable statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Start of the stats window
    pub since: DateTime<Utc>,
    pub items: u64,
    pub duplicates: u64,
    pub flushes: u64,
    pub drained: u64,
    pub failed: u64,
    pub stalls: u64,
    pub rejected: u64,
    pub drain_concurrent: u64,
    pub drain_latency: DrainLatency,
    pub drain_buckets: Vec<(u64, u64)>,
    pub drain_time_us: u64,
    pub busy_workers: usize,
    pub gauges: QueueGauges,
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl QueueStats {
    /// Logical entries created (enqueues minus coalesced duplicates)
    pub const fn enqueued(&self) -> u64 {
        self.items.saturating_sub(self.duplicates)
    }

    /// Entries that drained successfully
    pub const fn succeeded(&self) -> u64 {
        self.drained.saturating_sub(self.failed)
    }

    /// Duplicates per logical entry
    pub fn duplicate_fraction(&self) -> f64 {
        ratio(self.duplicates, self.enqueued())
    }

    /// Logical entries per barrier
    pub fn flush_ratio(&self) -> f64 {
        ratio(self.enqueued(), self.flushes)
    }

    /// Logical entries per completed drain; above 1.0 while a backlog remains
    pub fn fill_fraction(&self) -> f64 {
        ratio(self.enqueued(), self.drained)
    }

    /// Average number of workers busy during a drain, including itself
    pub fn concurrency(&self) -> f64 {
        ratio(self.drained + self.drain_concurrent, self.drained)
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn avg_drain_secs(&self) -> f64 {
        ratio(self.drain_time_us, self.drained) / 1_000_000.0
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn slowest_drain_secs(&self) -> f64 {
        self.drain_latency.max as f64 / 1_000_000.0
    }
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = &self.gauges;
        writeln!(f, "{} stalling={}", g.watermarks, g.stalling)?;
        writeln!(
            f,
            "write items={} dup={} dupe_frac={:.6} flushes={} flush_ratio={:.6}",
            self.items,
            self.duplicates,
            self.duplicate_fraction(),
            self.flushes,
            self.flush_ratio()
        )?;
        writeln!(
            f,
            "drains={} failed={} fill_fraction={:.6} concurrency={:.6}",
            self.drained,
            self.failed,
            self.fill_fraction(),
            self.concurrency()
        )?;
        writeln!(
            f,
            "avg drain time={:.6} seconds; longest drain time={:.6}; p99 <= {}us",
            self.avg_drain_secs(),
            self.slowest_drain_secs(),
            self.drain_latency.p99
        )?;
        writeln!(
            f,
            "stalls={} rejected={}",
            self.stalls, self.rejected
        )?;
        writeln!(
            f,
            "currently busy={} of {} workers; depth={} (pending={} in_flight={})",
            self.busy_workers, g.workers, g.depth, g.pending, g.in_flight
        )?;
        write!(
            f,
            "current conn_pool free={} of {}",
            g.pool_available, g.pool_capacity
        )
    }
}
