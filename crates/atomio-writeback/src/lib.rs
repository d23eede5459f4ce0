#![allow(clippy::result_large_err)]
//! Atomio Write-Back
//!
//! Deferred, coalescing writes to a slow backend. Producers enqueue and
//! return at once; a fixed set of workers drains the queue through a
//! shared connection pool.
//!
//! # Features
//!
//! - **Coalescing**: repeated writes of one identity collapse into a single store
//! - **Backpressure**: producers stall between a high and a low watermark
//! - **Barriers**: wait for everything enqueued so far, then surface failures
//! - **Statistics**: counters, drain latency histogram and Prometheus export
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Producers    │  enqueue / barrier
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │ WriteBackQueue  │
//! │  - DedupBuffer  │
//! │  - Watermarks   │
//! │  - Stats        │
//! └────────┬────────┘
//!          │ N workers
//! ┌────────▼────────┐
//! │ ConnectionPool  │──► StorePrimitive ──► backend
//! └─────────────────┘
//! ```

pub mod dedup;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod stats;

pub use dedup::{Claimed, DedupBuffer, Inserted};
pub use metrics::PrometheusExporter;
pub use pool::{ConnectionFactory, ConnectionPool, PooledConnection};
pub use queue::{Enqueued, QueueItem, StorePrimitive, WriteBackQueue};
pub use stats::{DrainHistogram, DrainLatency, QueueGauges, QueueStats, WriteBackStats};
