//! kvbdev bench - Block layer load generator
//!
//! Builds in-memory key-value devices, brings the block module up on top
//! of them and runs one write/read/verify worker per simulated core.

mod config;
mod workload;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Parser;
use kvbdev_block::{KvBdevModule, KvEngine, MemKvEngine, PrometheusExporter};
use kvbdev_common::DeviceHandle;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{BenchConfig, LogFormat};
use crate::workload::{WorkerCore, WorkerReport, run_worker};

/// First handle given to simulated devices
const HANDLE_BASE: u64 = 0x1000;

#[derive(Parser, Debug)]
#[command(name = "kvbdev-bench")]
#[command(about = "Drive the kvbdev block layer over in-memory key-value devices")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of simulated devices
    #[arg(long)]
    devices: Option<usize>,

    /// Sector size of the simulated devices
    #[arg(long)]
    sector_size: Option<u32>,

    /// Sectors per simulated device
    #[arg(long)]
    sector_count: Option<u64>,

    /// Worker threads, one simulated core each
    #[arg(long)]
    cores: Option<u32>,

    /// Write/read pairs per worker
    #[arg(long)]
    ios: Option<u64>,

    /// Request size in bytes
    #[arg(long)]
    io_size: Option<u64>,

    /// Print the module configuration dump
    #[arg(long)]
    dump_config: bool,

    /// Print Prometheus metrics when done
    #[arg(long)]
    metrics: bool,

    /// Log level
    #[arg(long, env = "KVBDEV_LOG")]
    log_level: Option<String>,

    /// Log line format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = BenchConfig::load(args.config.as_deref())?;

    // CLI takes precedence over the file
    let workload = &mut config.workload;
    workload.devices = args.devices.unwrap_or(workload.devices);
    workload.sector_size = args.sector_size.unwrap_or(workload.sector_size);
    workload.sector_count = args.sector_count.unwrap_or(workload.sector_count);
    workload.cores = args.cores.unwrap_or(workload.cores);
    workload.ios = args.ios.unwrap_or(workload.ios);
    workload.io_size = args.io_size.unwrap_or(workload.io_size);
    let log_level = args.log_level.unwrap_or_else(|| config.logging.level.clone());
    let log_format = args.log_format.unwrap_or(config.logging.format);

    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_new(&log_level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    );
    match log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    config.workload.validate()?;
    let workload = Arc::new(config.workload.clone());

    info!("Starting kvbdev bench");
    info!(
        "{} device(s) of {} x {} bytes, {} core(s), {} I/Os of {} bytes per core",
        workload.devices,
        workload.sector_count,
        workload.sector_size,
        workload.cores,
        workload.ios,
        workload.io_size
    );

    let engine = Arc::new(MemKvEngine::new());
    for i in 0..workload.devices as u64 {
        engine.add_device(
            DeviceHandle::new(HANDLE_BASE + i),
            workload.sector_size,
            workload.sector_count,
        );
    }

    let module = Arc::new(
        KvBdevModule::init(
            config.module.clone(),
            Arc::clone(&engine) as Arc<dyn KvEngine>,
            &*engine,
            Arc::new(WorkerCore),
        )
        .context("Failed to initialize block module")?,
    );

    if args.dump_config {
        println!("{}", module.write_config_json()?);
    }

    let bdev_names: Vec<String> = module
        .bdevs()
        .iter()
        .map(|b| b.name().to_string())
        .collect();
    if bdev_names.is_empty() {
        bail!("No block devices registered");
    }

    let started = Instant::now();
    let mut workers = Vec::new();
    for core in 0..workload.cores {
        let module = Arc::clone(&module);
        let workload = Arc::clone(&workload);
        let device = core as usize % bdev_names.len();
        let region = u64::from(core) / workload.devices as u64;
        let bdev_name = bdev_names[device].clone();
        workers.push(tokio::task::spawn_blocking(move || {
            run_worker(&module, &bdev_name, core, region, &workload)
        }));
    }

    let mut total = WorkerReport::default();
    for worker in workers {
        match worker.await.context("Worker panicked")? {
            Ok(report) => {
                total.writes += report.writes;
                total.reads += report.reads;
                total.unmaps += report.unmaps;
                total.flushes += report.flushes;
                total.failed += report.failed;
                total.mismatches += report.mismatches;
            }
            Err(e) => error!("Worker failed: {:#}", e),
        }
    }
    let elapsed = started.elapsed();

    #[allow(clippy::cast_precision_loss)]
    let iops = (total.writes + total.reads + total.unmaps) as f64 / elapsed.as_secs_f64().max(1e-9);
    info!(
        "Done in {:.2?}: {} writes, {} reads, {} unmaps, {} flushes, {:.0} IOPS",
        elapsed, total.writes, total.reads, total.unmaps, total.flushes, iops
    );

    for bdev in module.bdevs() {
        let read = bdev.stats().read().latency();
        let write = bdev.stats().write().latency();
        info!(
            "{}: read avg {}us p99 <{}us, write avg {}us p99 <{}us",
            bdev.name(),
            read.avg_us(),
            read.quantile_us(0.99),
            write.avg_us(),
            write.quantile_us(0.99)
        );
    }

    if args.metrics {
        print!("{}", module.prometheus_metrics(&PrometheusExporter::default()));
    }

    let leaked = module.dma_pool().stats().outstanding_buffers;
    module.fini();

    if total.failed > 0 || total.mismatches > 0 || leaked > 0 {
        bail!(
            "{} failed requests, {} mismatched reads, {} leaked buffers",
            total.failed,
            total.mismatches,
            leaked
        );
    }
    Ok(())
}
