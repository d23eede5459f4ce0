//! Prometheus exporter for write-back queue statistics
//!
//! # Prometheus Metrics
//!
//! ## Counters
//! - `atomio_writeback_items_total` - Enqueue calls, coalesced ones included
//! - `atomio_writeback_duplicates_total` - Enqueues folded into a pending entry
//! - `atomio_writeback_flushes_total` - Barriers issued
//! - `atomio_writeback_drains_total` - Store attempts made by workers
//! - `atomio_writeback_failures_total` - Store attempts that failed
//! - `atomio_writeback_stalls_total` - Producers stalled on the high watermark
//! - `atomio_writeback_rejected_total` - Non-blocking enqueues refused
//!
//! ## Gauges
//! - `atomio_writeback_depth` - Outstanding entries
//! - `atomio_writeback_busy_workers` - Workers currently storing
//! - `atomio_writeback_high_watermark` / `atomio_writeback_low_watermark`
//! - `atomio_pool_available_connections` / `atomio_pool_capacity`
//!
//! ## Histograms
//! - `atomio_writeback_drain_seconds` - Time per store attempt

use std::fmt::Write;

use crate::stats::QueueStats;

/// Prometheus text format exporter
#[derive(Debug)]
pub struct PrometheusExporter {
    /// Metrics prefix (e.g., "atomio")
    prefix: String,
    /// Labels attached to every sample
    labels: Vec<(String, String)>,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter with the given prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            labels: Vec::new(),
        }
    }

    /// Attach a label to every exported sample
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    /// Export a stats snapshot in Prometheus text format
    pub fn export(&self, stats: &QueueStats) -> String {
        let mut output = String::with_capacity(4 * 1024);

        self.export_counters(&mut output, stats);
        self.export_gauges(&mut output, stats);
        self.export_drain_histogram(&mut output, stats);

        output
    }

    #[allow(clippy::cast_precision_loss)]
    fn export_counters(&self, output: &mut String, stats: &QueueStats) {
        let counters = [
            ("writeback_items_total", "Total enqueue calls", stats.items),
            (
                "writeback_duplicates_total",
                "Enqueues coalesced into a pending entry",
                stats.duplicates,
            ),
            ("writeback_flushes_total", "Total barriers issued", stats.flushes),
            ("writeback_drains_total", "Total store attempts", stats.drained),
            ("writeback_failures_total", "Failed store attempts", stats.failed),
            (
                "writeback_stalls_total",
                "Producers stalled above the high watermark",
                stats.stalls,
            ),
            (
                "writeback_rejected_total",
                "Non-blocking enqueues refused at the high watermark",
                stats.rejected,
            ),
        ];

        for (name, help, value) in counters {
            self.write_help(output, name, help);
            self.write_type(output, name, "counter");
            self.write_metric(output, name, value as f64);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn export_gauges(&self, output: &mut String, stats: &QueueStats) {
        let gauges = &stats.gauges;
        let values = [
            ("writeback_depth", "Outstanding entries, pending plus in flight", gauges.depth),
            ("writeback_pending", "Entries waiting for a worker", gauges.pending),
            ("writeback_in_flight", "Entries being stored", gauges.in_flight),
            ("writeback_busy_workers", "Workers currently storing", stats.busy_workers),
            ("writeback_workers", "Configured workers", gauges.workers),
            ("writeback_high_watermark", "Depth above which producers stall", gauges.watermarks.high),
            ("writeback_low_watermark", "Depth at which stalled producers resume", gauges.watermarks.low),
            ("pool_available_connections", "Idle pooled connections", gauges.pool_available),
            ("pool_capacity", "Pooled connections", gauges.pool_capacity),
        ];

        for (name, help, value) in values {
            self.write_help(output, name, help);
            self.write_type(output, name, "gauge");
            self.write_metric(output, name, value as f64);
        }

        self.write_help(output, "writeback_stalling", "Whether producers stall (1) or not (0)");
        self.write_type(output, "writeback_stalling", "gauge");
        self.write_metric(
            output,
            "writeback_stalling",
            if gauges.stalling { 1.0 } else { 0.0 },
        );
    }

    #[allow(clippy::cast_precision_loss)]
    fn export_drain_histogram(&self, output: &mut String, stats: &QueueStats) {
        let name = "writeback_drain_seconds";
        self.write_help(output, name, "Store attempt latency");
        self.write_type(output, name, "histogram");

        let mut cumulative = 0u64;
        for (boundary_us, count) in &stats.drain_buckets {
            cumulative += count;
            if *boundary_us == u64::MAX {
                continue;
            }
            let boundary_secs = *boundary_us as f64 / 1_000_000.0;
            self.write_sample(
                output,
                &format!("{name}_bucket"),
                cumulative as f64,
                Some(boundary_secs.to_string().as_str()),
            );
        }
        // Buckets, not the drain counter, so +Inf never trails a finite bucket
        self.write_sample(output, &format!("{name}_bucket"), cumulative as f64, Some("+Inf"));
        self.write_metric(output, &format!("{name}_sum"), stats.drain_time_us as f64 / 1_000_000.0);
        self.write_metric(output, &format!("{name}_count"), cumulative as f64);
    }

    fn write_help(&self, output: &mut String, name: &str, help: &str) {
        let _ = writeln!(output, "# HELP {}_{} {}", self.prefix, name, help);
    }

    fn write_type(&self, output: &mut String, name: &str, metric_type: &str) {
        let _ = writeln!(output, "# TYPE {}_{} {}", self.prefix, name, metric_type);
    }

    fn write_metric(&self, output: &mut String, name: &str, value: f64) {
        self.write_sample(output, name, value, None);
    }

    fn write_sample(&self, output: &mut String, name: &str, value: f64, le: Option<&str>) {
        let mut labels: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect();
        if let Some(le) = le {
            labels.push(format!("le=\"{le}\""));
        }

        if labels.is_empty() {
            let _ = writeln!(output, "{}_{} {}", self.prefix, name, value);
        } else {
            let _ = writeln!(
                output,
                "{}_{}{{{}}} {}",
                self.prefix,
                name,
                labels.join(","),
                value
            );
        }
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new("atomio")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{QueueGauges, WriteBackStats};
    use atomio_common::Watermarks;
    use std::time::Duration;

    fn snapshot() -> QueueStats {
        let stats = WriteBackStats::new();
        stats.record_enqueue(false);
        stats.record_enqueue(true);
        stats.record_enqueue(false);
        stats.record_flush();

        stats.begin_drain();
        stats.end_drain(Duration::from_micros(300), true);
        stats.begin_drain();
        stats.end_drain(Duration::from_millis(20), false);

        stats.snapshot(QueueGauges {
            depth: 0,
            pending: 0,
            in_flight: 0,
            watermarks: Watermarks::new(10, 5).unwrap(),
            stalling: true,
            workers: 2,
            pool_available: 3,
            pool_capacity: 4,
        })
    }

    #[test]
    fn test_prometheus_export() {
        let output = PrometheusExporter::default().export(&snapshot());

        assert!(output.contains("# TYPE atomio_writeback_items_total counter"));
        assert!(output.contains("atomio_writeback_items_total 3\n"));
        assert!(output.contains("atomio_writeback_duplicates_total 1\n"));
        assert!(output.contains("atomio_writeback_failures_total 1\n"));
        assert!(output.contains("atomio_writeback_high_watermark 10\n"));
        assert!(output.contains("atomio_writeback_stalling 1\n"));
        assert!(output.contains("atomio_pool_available_connections 3\n"));
    }

    #[test]
    fn test_histogram_is_cumulative() {
        let output = PrometheusExporter::default().export(&snapshot());

        assert!(output.contains("# TYPE atomio_writeback_drain_seconds histogram"));
        assert!(output.contains("atomio_writeback_drain_seconds_bucket{le=\"0.0001\"} 0\n"));
        assert!(output.contains("atomio_writeback_drain_seconds_bucket{le=\"0.0005\"} 1\n"));
        assert!(output.contains("atomio_writeback_drain_seconds_bucket{le=\"0.05\"} 2\n"));
        assert!(output.contains("atomio_writeback_drain_seconds_bucket{le=\"+Inf\"} 2\n"));
        assert!(output.contains("atomio_writeback_drain_seconds_count 2\n"));
        assert!(!output.contains(&u64::MAX.to_string()));
    }

    #[test]
    fn test_inf_bucket_follows_histogram() {
        let mut stats = snapshot();
        // Counter read after a drain finished but before its latency landed
        stats.drained = 1;
        let output = PrometheusExporter::default().export(&stats);

        assert!(output.contains("atomio_writeback_drain_seconds_bucket{le=\"0.05\"} 2\n"));
        assert!(output.contains("atomio_writeback_drain_seconds_bucket{le=\"+Inf\"} 2\n"));
        assert!(output.contains("atomio_writeback_drain_seconds_count 2\n"));
    }

    #[test]
    fn test_labels_on_every_sample() {
        let output = PrometheusExporter::new("bench")
            .with_label("session", "s1")
            .export(&snapshot());

        assert!(output.contains("bench_writeback_depth{session=\"s1\"} 0\n"));
        assert!(output.contains("bench_writeback_drain_seconds_bucket{session=\"s1\",le=\"+Inf\"} 2\n"));
        for line in output.lines().filter(|l| !l.starts_with('#')) {
            assert!(line.contains("session=\"s1\""), "unlabelled sample: {line}");
        }
    }
}
