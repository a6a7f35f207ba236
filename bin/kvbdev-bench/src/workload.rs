//! Per-core worker
//!
//! Each worker pins itself to a simulated core, opens its own channel and
//! runs write, read-back, verify and unmap against a block range no other
//! worker touches.

use std::cell::Cell;
use std::sync::mpsc;

use anyhow::{Context, Result};
use kvbdev_block::{BdevIo, CoreIdSource, IoStatus, KvBdevModule, UnmapDescriptor};
use rand::Rng;
use tracing::{debug, warn};

use crate::config::WorkloadConfig;

thread_local! {
    static WORKER_CORE: Cell<Option<u32>> = const { Cell::new(None) };
}

/// Reports the core a worker thread claimed with [`WorkerCore::pin`]
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerCore;

impl WorkerCore {
    /// Claim `core` for the calling thread
    pub fn pin(core: u32) {
        WORKER_CORE.with(|c| c.set(Some(core)));
    }
}

impl CoreIdSource for WorkerCore {
    fn current_core(&self) -> Option<u32> {
        WORKER_CORE.with(Cell::get)
    }
}

/// Outcome of one worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub core: u32,
    pub writes: u64,
    pub reads: u64,
    pub unmaps: u64,
    pub flushes: u64,
    pub failed: u64,
    pub mismatches: u64,
}

type Completion = (Vec<u8>, IoStatus);

/// Submit one request and poll until it completes
fn run_one(
    channel: &kvbdev_block::IoChannel,
    make: impl FnOnce(Box<dyn FnOnce(BdevIo, IoStatus) + Send>) -> BdevIo,
) -> Completion {
    let (tx, rx) = mpsc::channel::<Completion>();
    channel.submit(make(Box::new(move |io, status| {
        let _ = tx.send((io.data(), status));
    })));
    loop {
        if let Ok(done) = rx.try_recv() {
            return done;
        }
        channel.poll();
    }
}

/// Run the workload for one core against `bdev_name`
pub fn run_worker(
    module: &KvBdevModule,
    bdev_name: &str,
    core: u32,
    region: u64,
    workload: &WorkloadConfig,
) -> Result<WorkerReport> {
    WorkerCore::pin(core);
    let channel = module
        .open_channel(bdev_name)
        .with_context(|| format!("Failed to open channel to {bdev_name}"))?;

    let sector_size = u64::from(workload.sector_size);
    let blocks_per_io = workload.io_size / sector_size;
    let region_blocks = workload.region_blocks();
    let first_lba = region * region_blocks;
    let slots = (region_blocks / blocks_per_io).max(1);
    let io_len = usize::try_from(workload.io_size).context("io_size too large")?;

    let mut rng = rand::thread_rng();
    let mut report = WorkerReport {
        core,
        ..WorkerReport::default()
    };
    let mut payload = vec![0u8; io_len];

    for i in 0..workload.ios {
        let lba = first_lba + rng.gen_range(0..slots) * blocks_per_io;
        let offset = lba * sector_size;
        rng.fill(&mut payload[..]);

        let (_, status) = run_one(&channel, |done| BdevIo::write(offset, &payload, done));
        report.writes += 1;
        if !status.is_success() {
            report.failed += 1;
            continue;
        }

        let (data, status) = run_one(&channel, |done| {
            BdevIo::read(offset, workload.io_size, done)
        });
        report.reads += 1;
        if !status.is_success() {
            report.failed += 1;
        } else if data != payload {
            warn!("Core {} read back different data at lba {}", core, lba);
            report.mismatches += 1;
        }

        if workload.unmap_every != 0 && (i + 1) % workload.unmap_every == 0 {
            let (_, status) = run_one(&channel, |done| {
                BdevIo::unmap(vec![UnmapDescriptor::new(lba, 1)], done)
            });
            report.unmaps += 1;
            if !status.is_success() {
                report.failed += 1;
            }
        }
    }

    let (_, status) = run_one(&channel, |done| BdevIo::flush(0, 0, done));
    report.flushes += 1;
    if !status.is_success() {
        report.failed += 1;
    }

    debug!("Core {} finished: {:?}", core, report);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvbdev_block::{KvEngine, MemKvEngine};
    use kvbdev_common::{DeviceHandle, ModuleConfig};
    use std::sync::Arc;

    #[test]
    fn test_worker_core_is_per_thread() {
        WorkerCore::pin(3);
        assert_eq!(WorkerCore.current_core(), Some(3));
        let other = std::thread::spawn(|| WorkerCore.current_core()).join().unwrap();
        assert_eq!(other, None);
    }

    #[test]
    fn test_worker_round_trips() {
        let workload = WorkloadConfig {
            sector_count: 4096,
            ios: 32,
            unmap_every: 4,
            ..WorkloadConfig::default()
        };
        let engine = Arc::new(MemKvEngine::new().with_device(
            DeviceHandle::new(1),
            workload.sector_size,
            workload.sector_count,
        ));
        let module = KvBdevModule::init(
            ModuleConfig::default(),
            Arc::clone(&engine) as Arc<dyn KvEngine>,
            &*engine,
            Arc::new(WorkerCore),
        )
        .unwrap();

        let report = run_worker(&module, "unvme_bdev0n1", 1, 1, &workload).unwrap();
        assert_eq!(report.writes, 32);
        assert_eq!(report.reads, 32);
        assert_eq!(report.unmaps, 8);
        assert_eq!(report.flushes, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.mismatches, 0);
        assert_eq!(module.dma_pool().stats().outstanding_buffers, 0);
    }
}
