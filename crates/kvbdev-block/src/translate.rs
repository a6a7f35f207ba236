//! Block request translation
//!
//! Turns one host block request into one key-value command:
//!
//! ```text
//! read/write  offset, length  → key(lba(offset)), value[length]  → retrieve/store
//! unmap       {lba, count}    → key(lba), no value, ss * count   → delete
//! flush                       → completed here, nothing submitted
//! reset                       → refused
//! ```
//!
//! Validation happens before any buffer is allocated. A request that fails
//! validation, allocation or submission is handed back inside a
//! [`RejectedIo`] with every buffer already released; [`submit_request`]
//! then completes it as failed.

use std::sync::Arc;

use kvbdev_common::{DeviceHandle, Lba, QueueId};
use tracing::{debug, error};

use crate::completion::InFlightIo;
use crate::core_id::{CoreIdSource, resolve_core};
use crate::dma::{DmaBuf, DmaPool};
use crate::engine::{KvCommand, KvEngine, KvOp, Rejected};
use crate::error::{BlockError, BlockResult};
use crate::io::{BdevIo, IoStatus, IoType};
use crate::key::{KEY_WIDTH, offset_to_lba, unmap_descriptor_to_lba, write_key};
use crate::registry::KvBdev;

/// Everything the hot path needs, shared by all channels of a module
pub struct IoContext {
    engine: Arc<dyn KvEngine>,
    pool: DmaPool,
    cores: Arc<dyn CoreIdSource>,
    fallback_core: u32,
}

impl IoContext {
    pub fn new(
        engine: Arc<dyn KvEngine>,
        pool: DmaPool,
        cores: Arc<dyn CoreIdSource>,
        fallback_core: u32,
    ) -> Self {
        Self {
            engine,
            pool,
            cores,
            fallback_core,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn KvEngine> {
        &self.engine
    }

    #[must_use]
    pub const fn pool(&self) -> &DmaPool {
        &self.pool
    }

    /// Core the caller runs on, or the fallback core
    #[must_use]
    pub fn current_core(&self) -> u32 {
        resolve_core(self.cores.as_ref(), self.fallback_core)
    }

    /// Queue owned by the caller's core
    #[must_use]
    pub fn queue(&self) -> QueueId {
        QueueId::for_core(self.current_core())
    }
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("pool", &self.pool)
            .field("fallback_core", &self.fallback_core)
            .finish_non_exhaustive()
    }
}

/// A request refused before it reached the device
#[derive(Debug)]
pub struct RejectedIo {
    pub error: BlockError,
    pub io: BdevIo,
}

type Result<T> = std::result::Result<T, RejectedIo>;

/// I/O types a key-value block device accepts
#[must_use]
pub const fn io_type_supported(io_type: IoType) -> bool {
    matches!(
        io_type,
        IoType::Read | IoType::Write | IoType::Unmap | IoType::Flush
    )
}

fn check_range(bdev: &KvBdev, offset: u64, length: u64) -> BlockResult<()> {
    let size = bdev.size_bytes();
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok(()),
        _ => Err(BlockError::OutOfBounds {
            offset,
            length,
            size,
        }),
    }
}

/// Allocate a key buffer holding the key for `lba`
fn allocate_key(pool: &DmaPool, lba: Lba) -> BlockResult<DmaBuf> {
    let mut key = pool.allocate(KEY_WIDTH)?;
    let slot: &mut [u8; KEY_WIDTH] = key
        .as_mut_slice()
        .try_into()
        .map_err(|_| BlockError::AllocationFailure { size: KEY_WIDTH })?;
    write_key(lba, slot);
    Ok(key)
}

/// Validate a read or write, supply a read's host buffer and allocate the
/// key and value buffers
fn build_rw(pool: &DmaPool, bdev: &KvBdev, io: &mut BdevIo) -> BlockResult<(DmaBuf, DmaBuf)> {
    let sector_size = bdev.sector_size();
    let ss = u64::from(sector_size);
    let (offset, length) = (io.offset(), io.length());

    if length == 0 {
        return Err(BlockError::InvalidArgument(
            "zero-length request".to_string(),
        ));
    }
    if length % ss != 0 {
        return Err(BlockError::Alignment {
            field: "length",
            value: length,
            sector_size,
        });
    }
    if offset % ss != 0 {
        return Err(BlockError::Alignment {
            field: "offset",
            value: offset,
            sector_size,
        });
    }
    check_range(bdev, offset, length)?;
    let value_size =
        usize::try_from(length).map_err(|_| BlockError::AllocationFailure { size: usize::MAX })?;
    io.supply_read_buffer(value_size);
    if io.iov_len() < length {
        return Err(BlockError::InvalidArgument(format!(
            "scatter list holds {} bytes, request needs {length}",
            io.iov_len()
        )));
    }

    let key = allocate_key(pool, offset_to_lba(offset, sector_size))?;

    let mut value = pool.allocate(value_size)?;
    if io.io_type() == IoType::Write {
        io.gather_into(value.as_mut_slice());
    }
    Ok((key, value))
}

/// Validate an unmap and allocate its key buffer; returns the value length.
/// A zero-block descriptor is still sent as a delete of length 0.
fn build_unmap(pool: &DmaPool, bdev: &KvBdev, io: &BdevIo) -> BlockResult<(DmaBuf, u64)> {
    let descriptors = io.unmap_descriptors();
    let [descriptor] = descriptors else {
        if descriptors.is_empty() {
            return Err(BlockError::InvalidArgument(
                "unmap without descriptors".to_string(),
            ));
        }
        return Err(BlockError::UnsupportedBatch {
            count: descriptors.len(),
            max: bdev.max_unmap_descriptors(),
        });
    };

    let lba = unmap_descriptor_to_lba(descriptor);
    let ss = u64::from(bdev.sector_size());
    let value_len = ss * u64::from(descriptor.block_count());
    check_range(bdev, lba.saturating_mul(ss), value_len)?;

    Ok((allocate_key(pool, lba)?, value_len))
}

/// Hand a command to the engine on the caller's queue
fn submit(ctx: &IoContext, handle: DeviceHandle, command: KvCommand) -> Result<()> {
    let queue = ctx.queue();
    let submitted = match command.op() {
        KvOp::Read => ctx.engine.submit_read(handle, queue, command),
        KvOp::Write => ctx.engine.submit_write(handle, queue, command),
        KvOp::Delete => ctx.engine.submit_delete(handle, queue, command),
    };
    submitted.map_err(|Rejected { rc, command }| RejectedIo {
        error: BlockError::Submission { rc },
        io: command.abandon(),
    })
}

/// Translate and submit a read or write
///
/// # Errors
///
/// Returns the request with an alignment, bounds, allocation or
/// submission error. No buffer is left allocated.
pub fn queue_rw(ctx: &IoContext, bdev: &Arc<KvBdev>, mut io: BdevIo) -> Result<()> {
    let (key, value) = match build_rw(&ctx.pool, bdev, &mut io) {
        Ok(buffers) => buffers,
        Err(error) => return Err(RejectedIo { error, io }),
    };
    let op = if io.io_type() == IoType::Read {
        KvOp::Read
    } else {
        KvOp::Write
    };
    let command = KvCommand {
        op,
        key,
        value_len: io.length(),
        value: Some(value),
        request: InFlightIo::new(io, Arc::clone(bdev)),
    };
    submit(ctx, bdev.handle(), command)
}

/// Translate and submit an unmap as a key delete
///
/// # Errors
///
/// Returns the request with a batch, bounds, allocation or submission
/// error. No buffer is left allocated.
pub fn unmap(ctx: &IoContext, bdev: &Arc<KvBdev>, io: BdevIo) -> Result<()> {
    let (key, value_len) = match build_unmap(&ctx.pool, bdev, &io) {
        Ok(built) => built,
        Err(error) => return Err(RejectedIo { error, io }),
    };
    let command = KvCommand {
        op: KvOp::Delete,
        key,
        value: None,
        value_len,
        request: InFlightIo::new(io, Arc::clone(bdev)),
    };
    submit(ctx, bdev.handle(), command)
}

/// Complete a flush. Writes are durable once completed, so there is
/// nothing to submit.
pub fn flush(bdev: &KvBdev, io: BdevIo) {
    bdev.stats().record(IoType::Flush, 0, 0, true);
    io.complete(IoStatus::Success);
}

/// Entry point for every host request on a channel. Synchronous failures
/// are completed right away as failed.
pub fn submit_request(ctx: &IoContext, bdev: &Arc<KvBdev>, io: BdevIo) {
    debug!(
        "{} {} bytes with offset {:#x} on {}",
        io.io_type(),
        io.length(),
        io.offset(),
        bdev.name()
    );

    let result = match io.io_type() {
        IoType::Read | IoType::Write => queue_rw(ctx, bdev, io),
        IoType::Unmap => unmap(ctx, bdev, io),
        IoType::Flush => {
            flush(bdev, io);
            Ok(())
        }
        IoType::Reset => Err(RejectedIo {
            error: BlockError::UnsupportedIoType(IoType::Reset),
            io,
        }),
    };

    if let Err(RejectedIo { error, io }) = result {
        error!("{} on {} failed: {}", io.io_type(), bdev.name(), error);
        bdev.stats().record_rejected();
        io.complete(IoStatus::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_id::FixedCore;
    use crate::key::{UnmapDescriptor, encode_key};
    use crate::memkv::MemKvEngine;
    use bytes::BytesMut;
    use kvbdev_common::NvmeStatus;
    use std::sync::mpsc;

    const HANDLE: DeviceHandle = DeviceHandle::new(0x42);

    fn setup() -> (Arc<MemKvEngine>, IoContext, Arc<KvBdev>) {
        let engine = Arc::new(MemKvEngine::new().with_device(HANDLE, 512, 64));
        let ctx = IoContext::new(
            Arc::clone(&engine) as Arc<dyn KvEngine>,
            DmaPool::default(),
            Arc::new(FixedCore(Some(0))),
            0,
        );
        let bdev = Arc::new(KvBdev::new(
            "unvme_bdev0n1".to_string(),
            "NVMe disk".to_string(),
            HANDLE,
            "unvme_bdev0".to_string(),
            512,
            64,
        ));
        (engine, ctx, bdev)
    }

    fn expect_rejected(result: Result<()>) -> BlockError {
        match result {
            Err(rejected) => rejected.error,
            Ok(()) => panic!("request was accepted"),
        }
    }

    #[test]
    fn test_supported_types() {
        assert!(io_type_supported(IoType::Read));
        assert!(io_type_supported(IoType::Write));
        assert!(io_type_supported(IoType::Unmap));
        assert!(io_type_supported(IoType::Flush));
        assert!(!io_type_supported(IoType::Reset));
    }

    #[test]
    fn test_write_builds_store_command() {
        let (engine, ctx, bdev) = setup();
        queue_rw(&ctx, &bdev, BdevIo::write(0x3000, &[7; 1024], |_, _| {})).unwrap();

        let submitted = engine.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].op, KvOp::Write);
        assert_eq!(submitted[0].key, encode_key(24).to_vec());
        assert_eq!(submitted[0].value_len, 1024);
        assert!(submitted[0].has_value);
        assert_eq!(submitted[0].queue, QueueId::for_core(0));
        assert_eq!(ctx.pool().stats().outstanding_buffers, 2);
    }

    #[test]
    fn test_unaligned_length_allocates_nothing() {
        let (engine, ctx, bdev) = setup();
        let error = expect_rejected(queue_rw(
            &ctx,
            &bdev,
            BdevIo::write(0, &[0; 100], |_, _| {}),
        ));
        assert!(matches!(
            error,
            BlockError::Alignment {
                field: "length",
                value: 100,
                sector_size: 512
            }
        ));
        assert_eq!(ctx.pool().stats().allocations, 0);
        assert!(engine.submitted().is_empty());
    }

    #[test]
    fn test_unaligned_offset_rejected() {
        let (_, ctx, bdev) = setup();
        let error = expect_rejected(queue_rw(&ctx, &bdev, BdevIo::read(100, 512, |_, _| {})));
        assert!(matches!(error, BlockError::Alignment { field: "offset", .. }));
    }

    #[test]
    fn test_zero_length_and_out_of_range() {
        let (_, ctx, bdev) = setup();
        let error = expect_rejected(queue_rw(&ctx, &bdev, BdevIo::read(0, 0, |_, _| {})));
        assert!(matches!(error, BlockError::InvalidArgument(_)));

        let error = expect_rejected(queue_rw(
            &ctx,
            &bdev,
            BdevIo::read(63 * 512, 1024, |_, _| {}),
        ));
        assert!(matches!(error, BlockError::OutOfBounds { .. }));
        assert_eq!(ctx.pool().stats().allocations, 0);
    }

    #[test]
    fn test_oversized_read_rejected_before_buffering() {
        let (engine, ctx, bdev) = setup();
        let rejected = queue_rw(&ctx, &bdev, BdevIo::read(0, u64::MAX - 511, |_, _| {}))
            .expect_err("past device end");
        assert!(matches!(rejected.error, BlockError::OutOfBounds { .. }));
        assert!(rejected.io.iovs().is_empty());
        assert_eq!(ctx.pool().stats().allocations, 0);
        assert!(engine.submitted().is_empty());
    }

    #[test]
    fn test_read_gets_host_buffer_on_admission() {
        let (engine, ctx, bdev) = setup();
        engine.fail_next_submit(-16);
        let rejected = queue_rw(&ctx, &bdev, BdevIo::read(512, 1024, |_, _| {}))
            .expect_err("engine refused");
        assert_eq!(rejected.io.iov_len(), 1024);
        assert_eq!(rejected.io.iovs().len(), 1);
    }

    #[test]
    fn test_readv_spans_iovs() {
        let (engine, ctx, bdev) = setup();
        let io = BdevIo::readv(
            1024,
            vec![BytesMut::zeroed(256), BytesMut::zeroed(768)],
            |_, _| {},
        );
        queue_rw(&ctx, &bdev, io).unwrap();
        assert_eq!(engine.submitted()[0].value_len, 1024);
        assert_eq!(engine.submitted()[0].key, encode_key(2).to_vec());
    }

    #[test]
    fn test_value_allocation_failure_releases_key() {
        let (engine, _, bdev) = setup();
        let ctx = IoContext::new(
            engine as Arc<dyn KvEngine>,
            DmaPool::new(0, Some(512)),
            Arc::new(FixedCore(Some(0))),
            0,
        );
        let error = expect_rejected(queue_rw(
            &ctx,
            &bdev,
            BdevIo::write(0, &[1; 1024], |_, _| {}),
        ));
        assert!(matches!(error, BlockError::AllocationFailure { size: 1024 }));

        let stats = ctx.pool().stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.outstanding_buffers, 0);
    }

    #[test]
    fn test_submission_failure_releases_buffers() {
        let (engine, ctx, bdev) = setup();
        engine.fail_next_submit(-16);
        let rejected = queue_rw(&ctx, &bdev, BdevIo::write(0, &[1; 512], |_, _| {}))
            .expect_err("engine refused");
        assert!(matches!(rejected.error, BlockError::Submission { rc: -16 }));
        assert_eq!(rejected.io.data(), vec![1; 512]);
        assert_eq!(ctx.pool().stats().outstanding_buffers, 0);
        assert_eq!(ctx.pool().stats().releases, 2);
    }

    #[test]
    fn test_unmap_builds_delete() {
        let (engine, ctx, bdev) = setup();
        unmap(
            &ctx,
            &bdev,
            BdevIo::unmap(vec![UnmapDescriptor::new(5, 2)], |_, _| {}),
        )
        .unwrap();

        let submitted = engine.submitted();
        assert_eq!(submitted[0].op, KvOp::Delete);
        assert_eq!(submitted[0].key, encode_key(5).to_vec());
        assert_eq!(submitted[0].value_len, 1024);
        assert!(!submitted[0].has_value);
        assert_eq!(ctx.pool().stats().outstanding_buffers, 1);
    }

    #[test]
    fn test_unmap_batch_rejected() {
        let (engine, ctx, bdev) = setup();
        let descriptors = vec![UnmapDescriptor::new(1, 1), UnmapDescriptor::new(2, 1)];
        let error = expect_rejected(unmap(&ctx, &bdev, BdevIo::unmap(descriptors, |_, _| {})));
        assert!(matches!(
            error,
            BlockError::UnsupportedBatch { count: 2, max: 1 }
        ));
        assert_eq!(ctx.pool().stats().allocations, 0);
        assert!(engine.submitted().is_empty());

        let error = expect_rejected(unmap(&ctx, &bdev, BdevIo::unmap(Vec::new(), |_, _| {})));
        assert!(matches!(error, BlockError::InvalidArgument(_)));
    }

    #[test]
    fn test_zero_block_unmap_submitted() {
        let (engine, ctx, bdev) = setup();
        let (tx, rx) = mpsc::channel();
        submit_request(
            &ctx,
            &bdev,
            BdevIo::unmap(vec![UnmapDescriptor::new(5, 0)], move |_, status| {
                tx.send(status).unwrap();
            }),
        );

        let submitted = engine.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].op, KvOp::Delete);
        assert_eq!(submitted[0].key, encode_key(5).to_vec());
        assert_eq!(submitted[0].value_len, 0);
        assert!(rx.try_recv().is_err());

        assert_eq!(engine.drain_completions(HANDLE, ctx.queue()), 1);
        assert!(rx.recv().unwrap().is_success());
        assert_eq!(ctx.pool().stats().outstanding_buffers, 0);
        assert_eq!(bdev.stats().rejected(), 0);
    }

    #[test]
    fn test_unmap_submission_failure_releases_key() {
        let (engine, ctx, bdev) = setup();
        engine.fail_next_submit(-16);
        let rejected = unmap(
            &ctx,
            &bdev,
            BdevIo::unmap(vec![UnmapDescriptor::new(5, 2)], |_, _| {}),
        )
        .expect_err("engine refused");
        assert!(matches!(rejected.error, BlockError::Submission { rc: -16 }));

        let stats = ctx.pool().stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.outstanding_buffers, 0);
    }

    #[test]
    fn test_refused_unmap_completed_failed_once() {
        let (engine, ctx, bdev) = setup();
        engine.fail_next_submit(-11);
        let (tx, rx) = mpsc::channel();
        submit_request(
            &ctx,
            &bdev,
            BdevIo::unmap(vec![UnmapDescriptor::new(7, 1)], move |_, status| {
                tx.send(status).unwrap();
            }),
        );

        assert_eq!(rx.recv().unwrap(), IoStatus::Failed);
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.pending(HANDLE, QueueId::for_core(0)), 0);
        assert_eq!(engine.drain_completions(HANDLE, ctx.queue()), 0);
        assert!(rx.try_recv().is_err());

        let stats = ctx.pool().stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.outstanding_buffers, 0);
        assert_eq!(bdev.stats().rejected(), 1);
    }

    #[test]
    fn test_flush_completes_without_device() {
        let (engine, ctx, bdev) = setup();
        let (tx, rx) = mpsc::channel();
        submit_request(
            &ctx,
            &bdev,
            BdevIo::flush(0, 4096, move |_, status| tx.send(status).unwrap()),
        );
        assert_eq!(rx.recv().unwrap(), IoStatus::Success);
        assert_eq!(ctx.pool().stats().allocations, 0);
        assert!(engine.submitted().is_empty());
        assert_eq!(bdev.stats().flush().ops(), 1);
    }

    #[test]
    fn test_reset_fails() {
        let (_, ctx, bdev) = setup();
        let (tx, rx) = mpsc::channel();
        submit_request(
            &ctx,
            &bdev,
            BdevIo::reset(move |_, status| tx.send(status).unwrap()),
        );
        assert_eq!(rx.recv().unwrap(), IoStatus::Failed);
        assert_eq!(bdev.stats().rejected(), 1);
    }

    #[test]
    fn test_rejected_request_completed_once() {
        let (_, ctx, bdev) = setup();
        let (tx, rx) = mpsc::channel();
        submit_request(
            &ctx,
            &bdev,
            BdevIo::write(0, &[0; 100], move |_, status| tx.send(status).unwrap()),
        );
        assert_eq!(rx.recv().unwrap(), IoStatus::Failed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fallback_queue_when_core_unknown() {
        let engine = Arc::new(MemKvEngine::new().with_device(HANDLE, 512, 64));
        let ctx = IoContext::new(
            Arc::clone(&engine) as Arc<dyn KvEngine>,
            DmaPool::default(),
            Arc::new(FixedCore(None)),
            0,
        );
        let (_, _, bdev) = setup();
        let (tx, rx) = mpsc::channel();
        submit_request(
            &ctx,
            &bdev,
            BdevIo::write(0, &[3; 512], move |_, status| tx.send(status).unwrap()),
        );
        assert_eq!(engine.pending(HANDLE, QueueId::for_core(0)), 1);
        engine.drain_completions(HANDLE, ctx.queue());
        assert_eq!(
            rx.recv().unwrap(),
            IoStatus::Nvme(NvmeStatus::SUCCESS)
        );
    }
}
