//! DMA-capable buffer allocation.
//!
//! Every buffer handed to the key-value engine comes from a [`DmaPool`].
//! A [`DmaBuf`] owns its memory and gives it back to the pool when dropped,
//! so a buffer is released exactly once on every path: failed
//! construction, failed submission, or completion.
//!
//! # Example
//!
//! ```
//! use kvbdev_block::DmaPool;
//!
//! let pool = DmaPool::new(64, None);
//! let mut key = pool.allocate(16).unwrap();
//! key.as_mut_slice()[0] = 24;
//! assert_eq!(pool.stats().outstanding_buffers, 1);
//!
//! pool.release(key);
//! assert_eq!(pool.stats().outstanding_buffers, 0);
//! ```

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{BlockError, BlockResult};

/// Point-in-time view of pool usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaPoolStats {
    /// Buffers allocated and not yet released
    pub outstanding_buffers: u64,
    /// Bytes allocated and not yet released
    pub outstanding_bytes: u64,
    /// Total successful allocations
    pub allocations: u64,
    /// Total releases
    pub releases: u64,
    /// Allocations refused for lack of memory
    pub failures: u64,
}

#[derive(Debug)]
struct PoolInner {
    align: usize,
    capacity_bytes: Option<u64>,
    outstanding_buffers: AtomicU64,
    outstanding_bytes: AtomicU64,
    allocations: AtomicU64,
    releases: AtomicU64,
    failures: AtomicU64,
}

impl PoolInner {
    /// Reserve `size` bytes against the capacity cap
    fn reserve(&self, size: u64) -> bool {
        let Some(capacity) = self.capacity_bytes else {
            self.outstanding_bytes.fetch_add(size, Ordering::AcqRel);
            return true;
        };

        loop {
            let current = self.outstanding_bytes.load(Ordering::Acquire);
            let Some(next) = current.checked_add(size).filter(|&n| n <= capacity) else {
                return false;
            };
            if self
                .outstanding_bytes
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn unreserve(&self, size: u64) {
        self.outstanding_bytes.fetch_sub(size, Ordering::AcqRel);
    }
}

/// Allocator for DMA-capable buffers.
///
/// Cheap to clone; clones share counters and the capacity cap.
#[derive(Debug, Clone)]
pub struct DmaPool {
    inner: Arc<PoolInner>,
}

impl DmaPool {
    /// Create a pool.
    ///
    /// # Arguments
    ///
    /// * `align` - Buffer alignment, a power of two (0 for cache line)
    /// * `capacity_bytes` - Cap on outstanding bytes (None = allocator limit only)
    #[must_use]
    pub fn new(align: usize, capacity_bytes: Option<u64>) -> Self {
        let align = if align == 0 { 64 } else { align };
        Self {
            inner: Arc::new(PoolInner {
                align,
                capacity_bytes,
                outstanding_buffers: AtomicU64::new(0),
                outstanding_bytes: AtomicU64::new(0),
                allocations: AtomicU64::new(0),
                releases: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    /// Allocate a zeroed buffer of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::InvalidArgument`] for a zero size and
    /// [`BlockError::AllocationFailure`] if the cap is reached or the
    /// allocator is out of memory.
    pub fn allocate(&self, size: usize) -> BlockResult<DmaBuf> {
        if size == 0 {
            return Err(BlockError::InvalidArgument("size must be > 0".to_string()));
        }

        let layout = Layout::from_size_align(size, self.inner.align)
            .map_err(|_| BlockError::AllocationFailure { size })?;

        let bytes = size as u64;
        if !self.inner.reserve(bytes) {
            self.inner.failures.fetch_add(1, Ordering::Relaxed);
            return Err(BlockError::AllocationFailure { size });
        }

        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            self.inner.unreserve(bytes);
            self.inner.failures.fetch_add(1, Ordering::Relaxed);
            return Err(BlockError::AllocationFailure { size });
        };

        self.inner.outstanding_buffers.fetch_add(1, Ordering::AcqRel);
        self.inner.allocations.fetch_add(1, Ordering::Relaxed);

        Ok(DmaBuf {
            ptr,
            layout,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Give a buffer back to the pool
    pub fn release(&self, buf: DmaBuf) {
        drop(buf);
    }

    /// Buffer alignment in bytes
    #[must_use]
    pub fn align(&self) -> usize {
        self.inner.align
    }

    /// Snapshot the pool counters
    #[must_use]
    pub fn stats(&self) -> DmaPoolStats {
        DmaPoolStats {
            outstanding_buffers: self.inner.outstanding_buffers.load(Ordering::Acquire),
            outstanding_bytes: self.inner.outstanding_bytes.load(Ordering::Acquire),
            allocations: self.inner.allocations.load(Ordering::Relaxed),
            releases: self.inner.releases.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for DmaPool {
    fn default() -> Self {
        Self::new(0, None)
    }
}

/// A DMA-capable memory buffer owned by one in-flight command.
///
/// `Send` but not `Sync`: a buffer moves with its command from the
/// submitting core into the engine and back to the completion path.
pub struct DmaBuf {
    ptr: NonNull<u8>,
    layout: Layout,
    pool: Arc<PoolInner>,
}

// SAFETY: the buffer exclusively owns its allocation.
unsafe impl Send for DmaBuf {}

impl DmaBuf {
    /// Buffer length in bytes
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.layout.size()
    }

    /// Always false; zero-length buffers cannot be allocated
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Alignment the buffer was allocated with
    #[inline]
    #[must_use]
    pub const fn align(&self) -> usize {
        self.layout.align()
    }

    /// Immutable view of the buffer
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialized bytes while self lives.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    /// Mutable view of the buffer
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        self.pool.unreserve(self.layout.size() as u64);
        self.pool.outstanding_buffers.fetch_sub(1, Ordering::AcqRel);
        self.pool.releases.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuf")
            .field("ptr", &self.ptr)
            .field("len", &self.len())
            .finish()
    }
}

impl AsRef<[u8]> for DmaBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for DmaBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_size_fails() {
        let pool = DmaPool::default();
        assert!(matches!(
            pool.allocate(0),
            Err(BlockError::InvalidArgument(_))
        ));
        assert_eq!(pool.stats().allocations, 0);
    }

    #[test]
    fn test_allocate_is_zeroed_and_aligned() {
        let pool = DmaPool::new(4096, None);
        let buf = pool.allocate(8192).unwrap();
        assert_eq!(buf.len(), 8192);
        assert_eq!(buf.align(), 4096);
        assert_eq!(buf.as_slice().as_ptr() as usize % 4096, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_release_updates_counters() {
        let pool = DmaPool::default();
        let a = pool.allocate(16).unwrap();
        let b = pool.allocate(512).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.outstanding_buffers, 2);
        assert_eq!(stats.outstanding_bytes, 528);

        pool.release(a);
        drop(b);

        let stats = pool.stats();
        assert_eq!(stats.outstanding_buffers, 0);
        assert_eq!(stats.outstanding_bytes, 0);
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.releases, 2);
    }

    #[test]
    fn test_capacity_exhaustion() {
        let pool = DmaPool::new(0, Some(1024));
        let held = pool.allocate(1000).unwrap();

        assert!(matches!(
            pool.allocate(100),
            Err(BlockError::AllocationFailure { size: 100 })
        ));
        assert_eq!(pool.stats().failures, 1);
        assert_eq!(pool.stats().outstanding_bytes, 1000);

        drop(held);
        assert!(pool.allocate(1024).is_ok());
    }

    #[test]
    fn test_clones_share_counters() {
        let pool = DmaPool::default();
        let clone = pool.clone();
        let buf = clone.allocate(64).unwrap();
        assert_eq!(pool.stats().outstanding_buffers, 1);
        drop(buf);
        assert_eq!(pool.stats().releases, 1);
    }
}
