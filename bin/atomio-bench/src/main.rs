//! Atomio Bench - write-back load generator
//!
//! Opens a storage session over the in-memory backend, pushes rounds of
//! atom and value stores through it from several producer tasks, and
//! prints the session report.

use anyhow::Result;
use atomio_common::{StorageConfig, Watermarks};
use atomio_storage::{Atom, AtomStorage, MemoryBackend};
use atomio_writeback::PrometheusExporter;
use clap::Parser;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "atomio-bench")]
#[command(about = "Atomio write-back load generator")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "atomio-bench.toml")]
    config: String,

    /// Write-back worker count
    #[arg(short, long)]
    workers: Option<usize>,

    /// Connections reserved for foreground callers
    #[arg(long)]
    foreground: Option<usize>,

    /// High watermark
    #[arg(long)]
    high: Option<usize>,

    /// Low watermark
    #[arg(long)]
    low: Option<usize>,

    /// Never stall producers above the high watermark
    #[arg(long)]
    no_stall: bool,

    /// Distinct atoms written per round
    #[arg(long)]
    atoms: Option<usize>,

    /// Number of rounds
    #[arg(long)]
    rounds: Option<usize>,

    /// Concurrent producer tasks
    #[arg(long)]
    producers: Option<usize>,

    /// Simulated backend latency per request
    #[arg(long)]
    latency_ms: Option<u64>,

    /// Fail every Nth backend request (0 disables)
    #[arg(long)]
    fail_every: Option<u64>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print Prometheus metrics after the report
    #[arg(long)]
    prometheus: bool,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default)]
    bench: BenchConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct BenchConfig {
    #[serde(default = "default_atoms")]
    atoms: usize,
    #[serde(default = "default_rounds")]
    rounds: usize,
    #[serde(default = "default_producers")]
    producers: usize,
    #[serde(default)]
    latency_ms: u64,
    #[serde(default)]
    fail_every: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            atoms: default_atoms(),
            rounds: default_rounds(),
            producers: default_producers(),
            latency_ms: 0,
            fail_every: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_atoms() -> usize {
    10_000
}

fn default_rounds() -> usize {
    4
}

fn default_producers() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

struct Workload {
    atoms: usize,
    rounds: usize,
    producers: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load config file if it exists
    let config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {e}");
            Config::default()
        })
    } else {
        Config::default()
    };

    // Merge CLI args with config file (CLI takes precedence)
    let mut storage_config = config.storage;
    let write_back = &mut storage_config.write_back;
    if let Some(workers) = args.workers {
        write_back.worker_count = workers;
    }
    if args.high.is_some() || args.low.is_some() {
        write_back.watermarks = Watermarks {
            high: args.high.unwrap_or(write_back.watermarks.high),
            low: args.low.unwrap_or(write_back.watermarks.low),
        };
    }
    if args.no_stall {
        write_back.stall = false;
    }
    if let Some(foreground) = args.foreground {
        storage_config.foreground_connections = foreground;
    }
    let workload = Workload {
        atoms: args.atoms.unwrap_or(config.bench.atoms),
        rounds: args.rounds.unwrap_or(config.bench.rounds),
        producers: args.producers.unwrap_or(config.bench.producers).max(1),
    };
    let latency_ms = args.latency_ms.unwrap_or(config.bench.latency_ms);
    let fail_every = args.fail_every.unwrap_or(config.bench.fail_every);
    let log_level = if args.log_level != "info" {
        args.log_level
    } else {
        config.logging.level
    };

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Atomio bench");
    info!("Config file: {}", args.config);
    info!(
        "Workload: {} atoms x {} rounds from {} producers",
        workload.atoms, workload.rounds, workload.producers
    );

    let backend = MemoryBackend::new();
    if latency_ms > 0 {
        backend.set_latency(Some(Duration::from_millis(latency_ms)));
    }
    backend.fail_every(fail_every);

    let storage = match AtomStorage::open(backend, storage_config).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Failed to open storage: {}", e);
            std::process::exit(1);
        }
    };

    let atoms: Arc<Vec<Arc<Atom>>> = Arc::new(
        (0..workload.atoms)
            .map(|i| Arc::new(Atom::node("ConceptNode", format!("atom-{i}"))))
            .collect(),
    );

    let started = Instant::now();
    let mut failed_rounds = 0usize;
    for round in 0..workload.rounds {
        let round_started = Instant::now();
        run_round(&storage, &atoms, round, workload.producers).await?;

        match storage.flush().await {
            Ok(()) => info!("Round {} flushed in {:?}", round, round_started.elapsed()),
            Err(e) => {
                failed_rounds += 1;
                warn!("Round {} flushed with failure: {}", round, e);
            }
        }
    }
    let elapsed = started.elapsed();

    let stats = storage.stats();
    println!("{stats}");
    #[allow(clippy::cast_precision_loss)]
    let rate = stats.queue.items as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "elapsed={:.3}s enqueue_rate={:.0}/s rounds_with_failures={}",
        elapsed.as_secs_f64(),
        rate,
        failed_rounds
    );

    if args.prometheus {
        let exporter = PrometheusExporter::default().with_label("session", storage.name());
        print!("{}", exporter.export(&stats.queue));
    }

    if let Err(e) = storage.close().await {
        warn!("Close reported failure: {}", e);
    }
    info!("Atomio bench finished");
    Ok(())
}

/// Push one round of writes split across `producers` tasks
async fn run_round(
    storage: &Arc<AtomStorage<MemoryBackend>>,
    atoms: &Arc<Vec<Arc<Atom>>>,
    round: usize,
    producers: usize,
) -> Result<()> {
    let handles: Vec<_> = (0..producers)
        .map(|producer| {
            let storage = storage.clone();
            let atoms = atoms.clone();
            tokio::spawn(async move {
                for atom in atoms.iter().skip(producer).step_by(producers) {
                    let (strength, value_first) = {
                        let mut rng = rand::thread_rng();
                        (rng.gen_range(0.0..1.0f64), rng.gen_bool(0.25))
                    };
                    atom.set_value("tv", json!([strength, round]));
                    // A value store right before the atom store coalesces with it
                    if value_first {
                        storage.store_value(atom, "tv").await?;
                    }
                    storage.store_atom(atom).await?;
                }
                Ok::<_, atomio_common::Error>(())
            })
        })
        .collect();

    for handle in handles {
        handle.await??;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_logs_at_info() {
        assert_eq!(Config::default().logging.level, "info");

        let config: Config = toml::from_str("[bench]\natoms = 10\n").unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.bench.atoms, 10);
        assert_eq!(config.bench.rounds, default_rounds());
    }
}
