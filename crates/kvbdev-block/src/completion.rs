//! Completion path
//!
//! Runs once per finished key-value command, from the poller of the core
//! that submitted it. For reads the value is copied into the host's scatter
//! buffers. Then the value and key buffers are released and the device
//! status is handed to the host unchanged.

use std::sync::Arc;
use std::time::Instant;

use kvbdev_common::NvmeStatus;
use tracing::debug;

use crate::engine::KvCommand;
use crate::io::{BdevIo, IoStatus, IoType};
use crate::registry::KvBdev;

/// Bookkeeping for one block request between submission and completion
#[derive(Debug)]
pub struct InFlightIo {
    io: BdevIo,
    bdev: Arc<KvBdev>,
    submitted_at: Instant,
}

impl InFlightIo {
    pub(crate) fn new(io: BdevIo, bdev: Arc<KvBdev>) -> Self {
        Self {
            io,
            bdev,
            submitted_at: Instant::now(),
        }
    }

    /// Direction of the block request
    #[must_use]
    pub const fn io_type(&self) -> IoType {
        self.io.io_type()
    }

    /// Block device the request targets
    #[must_use]
    pub fn bdev(&self) -> &Arc<KvBdev> {
        &self.bdev
    }

    pub(crate) fn into_io(self) -> BdevIo {
        self.io
    }
}

/// Bytes of per-request context the module needs from the host
#[must_use]
pub const fn in_flight_ctx_size() -> usize {
    std::mem::size_of::<InFlightIo>()
}

pub(crate) fn complete(command: KvCommand, status: NvmeStatus) {
    let KvCommand {
        op,
        key,
        value,
        value_len,
        request,
    } = command;
    let InFlightIo {
        mut io,
        bdev,
        submitted_at,
    } = request;

    if io.io_type() == IoType::Read
        && let Some(value) = &value
    {
        io.scatter_from(value.as_slice());
    }
    drop(value);
    drop(key);

    let latency_us = u64::try_from(submitted_at.elapsed().as_micros()).unwrap_or(u64::MAX);
    bdev.stats()
        .record(io.io_type(), value_len, latency_us, status.is_success());

    if !status.is_success() {
        debug!(
            "{} on {} at offset {:#x} completed with {}",
            op,
            bdev.name(),
            io.offset(),
            status
        );
    }

    io.complete(IoStatus::Nvme(status));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaPool;
    use crate::engine::KvOp;
    use crate::key::{KEY_WIDTH, write_key};
    use bytes::BytesMut;
    use kvbdev_common::DeviceHandle;
    use std::sync::mpsc;

    fn bdev() -> Arc<KvBdev> {
        Arc::new(KvBdev::new(
            "unvme_bdev0n1".to_string(),
            "NVMe disk".to_string(),
            DeviceHandle::new(1),
            "unvme_bdev0".to_string(),
            512,
            1024,
        ))
    }

    #[test]
    fn test_read_completion_copies_and_releases() {
        let pool = DmaPool::default();
        let bdev = bdev();
        let (tx, rx) = mpsc::channel();
        let io = BdevIo::readv(0, vec![BytesMut::zeroed(512)], move |io, status| {
            tx.send((io.data(), status)).unwrap();
        });

        let mut key = pool.allocate(KEY_WIDTH).unwrap();
        write_key(0, key.as_mut_slice().try_into().unwrap());
        let mut value = pool.allocate(512).unwrap();
        value.as_mut_slice().fill(0x5a);

        let command = KvCommand {
            op: KvOp::Read,
            key,
            value: Some(value),
            value_len: 512,
            request: InFlightIo::new(io, Arc::clone(&bdev)),
        };
        command.complete(NvmeStatus::SUCCESS);

        let (data, status) = rx.recv().unwrap();
        assert_eq!(data, vec![0x5a; 512]);
        assert_eq!(status, IoStatus::Nvme(NvmeStatus::SUCCESS));
        assert_eq!(pool.stats().outstanding_buffers, 0);
        assert_eq!(pool.stats().releases, 2);
        assert_eq!(bdev.stats().read().bytes(), 512);
    }

    #[test]
    fn test_status_passed_through() {
        let pool = DmaPool::default();
        let bdev = bdev();
        let (tx, rx) = mpsc::channel();
        let io = BdevIo::write(0, &[1; 512], move |_, status| {
            tx.send(status).unwrap();
        });

        let command = KvCommand {
            op: KvOp::Write,
            key: pool.allocate(KEY_WIDTH).unwrap(),
            value: Some(pool.allocate(512).unwrap()),
            value_len: 512,
            request: InFlightIo::new(io, Arc::clone(&bdev)),
        };
        command.complete(NvmeStatus::new(0x1, 0x85));

        assert_eq!(
            rx.recv().unwrap(),
            IoStatus::Nvme(NvmeStatus::new(0x1, 0x85))
        );
        assert_eq!(pool.stats().outstanding_buffers, 0);
        assert_eq!(bdev.stats().write().errors(), 1);
    }

    #[test]
    fn test_ctx_size_nonzero() {
        assert!(in_flight_ctx_size() > 0);
    }
}
