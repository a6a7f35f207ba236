//! Host block I/O requests.
//!
//! A [`BdevIo`] is what the host block layer hands to a channel: the
//! request type, its byte range, the caller's scatter buffers and a
//! completion callback. The callback runs exactly once, either right away
//! when the request is rejected or finished synchronously, or later from
//! the poller when the key-value command completes.

use bytes::BytesMut;
use kvbdev_common::NvmeStatus;

use crate::key::UnmapDescriptor;

/// Block I/O request type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoType {
    Read,
    Write,
    Unmap,
    Flush,
    Reset,
}

impl std::fmt::Display for IoType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Unmap => "unmap",
            Self::Flush => "flush",
            Self::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Terminal status of a block I/O request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Finished without touching the device (flush)
    Success,
    /// Rejected before reaching the device
    Failed,
    /// Status pair reported by the engine, passed through untouched
    Nvme(NvmeStatus),
}

impl IoStatus {
    /// Check if the request succeeded
    #[must_use]
    pub const fn is_success(&self) -> bool {
        match self {
            Self::Success => true,
            Self::Failed => false,
            Self::Nvme(status) => status.is_success(),
        }
    }
}

/// Completion callback. Receives the request back so read data and the
/// caller's buffers are returned to their owner.
pub type IoCallback = Box<dyn FnOnce(BdevIo, IoStatus) + Send>;

/// One block I/O request from the host
pub struct BdevIo {
    io_type: IoType,
    offset: u64,
    length: u64,
    iovs: Vec<BytesMut>,
    unmap: Vec<UnmapDescriptor>,
    callback: Option<IoCallback>,
}

impl BdevIo {
    fn new(io_type: IoType, offset: u64, length: u64, callback: IoCallback) -> Self {
        Self {
            io_type,
            offset,
            length,
            iovs: Vec::new(),
            unmap: Vec::new(),
            callback: Some(callback),
        }
    }

    /// Read `length` bytes at `offset`. The host buffer is supplied once
    /// the request has been admitted.
    pub fn read<F>(offset: u64, length: u64, done: F) -> Self
    where
        F: FnOnce(Self, IoStatus) + Send + 'static,
    {
        Self::new(IoType::Read, offset, length, Box::new(done))
    }

    /// Read into caller-provided scatter buffers; the length is their total
    pub fn readv<F>(offset: u64, iovs: Vec<BytesMut>, done: F) -> Self
    where
        F: FnOnce(Self, IoStatus) + Send + 'static,
    {
        let length = iovs.iter().map(|iov| iov.len() as u64).sum();
        let mut io = Self::new(IoType::Read, offset, length, Box::new(done));
        io.iovs = iovs;
        io
    }

    /// Write `data` at `offset`
    pub fn write<F>(offset: u64, data: &[u8], done: F) -> Self
    where
        F: FnOnce(Self, IoStatus) + Send + 'static,
    {
        Self::writev(offset, vec![BytesMut::from(data)], done)
    }

    /// Write the concatenation of `iovs` at `offset`
    pub fn writev<F>(offset: u64, iovs: Vec<BytesMut>, done: F) -> Self
    where
        F: FnOnce(Self, IoStatus) + Send + 'static,
    {
        let length = iovs.iter().map(|iov| iov.len() as u64).sum();
        let mut io = Self::new(IoType::Write, offset, length, Box::new(done));
        io.iovs = iovs;
        io
    }

    /// Unmap the block ranges named by `descriptors`
    pub fn unmap<F>(descriptors: Vec<UnmapDescriptor>, done: F) -> Self
    where
        F: FnOnce(Self, IoStatus) + Send + 'static,
    {
        let mut io = Self::new(IoType::Unmap, 0, 0, Box::new(done));
        io.unmap = descriptors;
        io
    }

    /// Flush the byte range
    pub fn flush<F>(offset: u64, length: u64, done: F) -> Self
    where
        F: FnOnce(Self, IoStatus) + Send + 'static,
    {
        Self::new(IoType::Flush, offset, length, Box::new(done))
    }

    /// Reset the device
    pub fn reset<F>(done: F) -> Self
    where
        F: FnOnce(Self, IoStatus) + Send + 'static,
    {
        Self::new(IoType::Reset, 0, 0, Box::new(done))
    }

    /// Request type
    #[must_use]
    pub const fn io_type(&self) -> IoType {
        self.io_type
    }

    /// Byte offset
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Byte length
    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    /// Scatter buffers
    #[must_use]
    pub fn iovs(&self) -> &[BytesMut] {
        &self.iovs
    }

    /// Take the scatter buffers out of the request
    #[must_use]
    pub fn into_iovs(self) -> Vec<BytesMut> {
        self.iovs
    }

    /// Scatter buffers joined into one contiguous vector
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.iovs.iter().flat_map(|iov| iov.iter().copied()).collect()
    }

    /// Total capacity of the scatter buffers
    #[must_use]
    pub fn iov_len(&self) -> u64 {
        self.iovs.iter().map(|iov| iov.len() as u64).sum()
    }

    /// Unmap descriptors
    #[must_use]
    pub fn unmap_descriptors(&self) -> &[UnmapDescriptor] {
        &self.unmap
    }

    /// Give a read without scatter buffers a zeroed host buffer of `len` bytes
    pub(crate) fn supply_read_buffer(&mut self, len: usize) {
        if self.io_type == IoType::Read && self.iovs.is_empty() {
            self.iovs.push(BytesMut::zeroed(len));
        }
    }

    /// Copy the scatter buffers, in order, into `dst` until it is full
    pub(crate) fn gather_into(&self, dst: &mut [u8]) {
        let mut filled = 0;
        for iov in &self.iovs {
            if filled == dst.len() {
                break;
            }
            let n = iov.len().min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&iov[..n]);
            filled += n;
        }
    }

    /// Copy `src` across the scatter buffers, in order
    pub(crate) fn scatter_from(&mut self, src: &[u8]) {
        let mut copied = 0;
        for iov in &mut self.iovs {
            if copied == src.len() {
                break;
            }
            let n = iov.len().min(src.len() - copied);
            iov[..n].copy_from_slice(&src[copied..copied + n]);
            copied += n;
        }
    }

    /// Report the terminal status to the host
    pub fn complete(mut self, status: IoStatus) {
        if let Some(callback) = self.callback.take() {
            callback(self, status);
        }
    }
}

impl std::fmt::Debug for BdevIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BdevIo")
            .field("io_type", &self.io_type)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("iovcnt", &self.iovs.len())
            .field("unmap", &self.unmap)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_read_buffer_supplied_on_admission() {
        let mut io = BdevIo::read(4096, 1024, |_, _| {});
        assert_eq!(io.io_type(), IoType::Read);
        assert_eq!(io.length(), 1024);
        assert!(io.iovs().is_empty());

        io.supply_read_buffer(1024);
        assert_eq!(io.iov_len(), 1024);
        io.supply_read_buffer(1024);
        assert_eq!(io.iovs().len(), 1);
    }

    #[test]
    fn test_huge_read_allocates_nothing() {
        let io = BdevIo::read(0, u64::MAX, |_, _| {});
        assert_eq!(io.length(), u64::MAX);
        assert_eq!(io.iov_len(), 0);
    }

    #[test]
    fn test_caller_buffers_kept() {
        let mut io = BdevIo::readv(0, vec![BytesMut::zeroed(512)], |_, _| {});
        io.supply_read_buffer(4096);
        assert_eq!(io.iov_len(), 512);

        let mut io = BdevIo::write(0, &[1; 512], |_, _| {});
        io.supply_read_buffer(4096);
        assert_eq!(io.iov_len(), 512);
    }

    #[test]
    fn test_writev_length_is_total() {
        let io = BdevIo::writev(
            0,
            vec![BytesMut::from(&[1u8; 256][..]), BytesMut::from(&[2u8; 256][..])],
            |_, _| {},
        );
        assert_eq!(io.length(), 512);
        assert_eq!(io.io_type().to_string(), "write");
    }

    #[test]
    fn test_gather_and_scatter_cross_iovs() {
        let io = BdevIo::writev(
            0,
            vec![BytesMut::from(&[1u8; 3][..]), BytesMut::from(&[2u8; 5][..])],
            |_, _| {},
        );
        let mut flat = [0u8; 8];
        io.gather_into(&mut flat);
        assert_eq!(flat, [1, 1, 1, 2, 2, 2, 2, 2]);

        let mut io = BdevIo::readv(
            0,
            vec![BytesMut::zeroed(2), BytesMut::zeroed(6)],
            |_, _| {},
        );
        io.scatter_from(&[9, 8, 7, 6, 5, 4, 3, 2]);
        assert_eq!(io.data(), vec![9, 8, 7, 6, 5, 4, 3, 2]);
        assert_eq!(&io.iovs()[0][..], &[9, 8]);
    }

    #[test]
    fn test_complete_hands_request_back() {
        let (tx, rx) = mpsc::channel();
        let io = BdevIo::write(512, &[0xab; 512], move |io, status| {
            tx.send((io.offset(), io.data(), status)).unwrap();
        });
        io.complete(IoStatus::Success);

        let (offset, data, status) = rx.recv().unwrap();
        assert_eq!(offset, 512);
        assert_eq!(data, vec![0xab; 512]);
        assert!(status.is_success());
    }

    #[test]
    fn test_status_success() {
        assert!(IoStatus::Success.is_success());
        assert!(!IoStatus::Failed.is_success());
        assert!(IoStatus::Nvme(NvmeStatus::SUCCESS).is_success());
        assert!(!IoStatus::Nvme(NvmeStatus::new(1, 0x87)).is_success());
    }
}
