//! Per-device I/O statistics
//!
//! Every block device keeps an [`IoStats`] that the completion path feeds.
//! Counters are plain atomics so any core can record without locking.
//!
//! Latency is measured from submission to the engine's completion and
//! bucketed in a power-of-two [`LatencyHistogram`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::io::IoType;

/// Number of latency buckets. Bucket `i` holds samples below `2^i` us; the
/// last bucket is open-ended.
pub const LATENCY_BUCKETS: usize = 24;

/// Upper bound of latency bucket `index` in microseconds
#[must_use]
pub const fn bucket_upper_bound_us(index: usize) -> u64 {
    if index + 1 >= LATENCY_BUCKETS {
        u64::MAX
    } else {
        1u64 << index
    }
}

/// Lock-free latency histogram
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS],
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyHistogram {
    /// Create an empty histogram
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }

    fn bucket_index(latency_us: u64) -> usize {
        // Samples below 2^i land in bucket i.
        let bits = (u64::BITS - latency_us.leading_zeros()) as usize;
        bits.min(LATENCY_BUCKETS - 1)
    }

    /// Record one sample
    pub fn record(&self, latency_us: u64) {
        self.buckets[Self::bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.max_us.fetch_max(latency_us, Ordering::Relaxed);
    }

    /// Number of samples
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all samples in microseconds
    pub fn sum_us(&self) -> u64 {
        self.sum_us.load(Ordering::Relaxed)
    }

    /// Largest sample in microseconds
    pub fn max_us(&self) -> u64 {
        self.max_us.load(Ordering::Relaxed)
    }

    /// Mean latency in microseconds
    pub fn avg_us(&self) -> u64 {
        self.sum_us().checked_div(self.count()).unwrap_or(0)
    }

    /// Upper bound of the bucket holding the given quantile (0.0 to 1.0)
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn quantile_us(&self, quantile: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }
        let target = ((total as f64) * quantile.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (i, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return bucket_upper_bound_us(i);
            }
        }
        bucket_upper_bound_us(LATENCY_BUCKETS - 1)
    }

    /// `(upper_bound_us, count)` per bucket, non-cumulative
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, b)| (bucket_upper_bound_us(i), b.load(Ordering::Relaxed)))
            .collect()
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for one I/O type
#[derive(Debug, Default)]
pub struct OpStats {
    ops: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    latency: LatencyHistogram,
}

impl OpStats {
    /// Completed requests, successful or not
    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    /// Bytes moved by successful requests
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Requests that completed with a non-success device status
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Submission-to-completion latency
    pub const fn latency(&self) -> &LatencyHistogram {
        &self.latency
    }
}

/// Point-in-time copy of a device's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStatsSnapshot {
    pub read_ops: u64,
    pub read_bytes: u64,
    pub write_ops: u64,
    pub write_bytes: u64,
    pub unmap_ops: u64,
    pub flush_ops: u64,
    pub errors: u64,
    pub rejected: u64,
}

/// I/O statistics for one block device
#[derive(Debug, Default)]
pub struct IoStats {
    read: OpStats,
    write: OpStats,
    unmap: OpStats,
    flush: OpStats,
    rejected: AtomicU64,
}

impl IoStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for `io_type`. Reset has none; it never reaches the device.
    #[must_use]
    pub const fn op(&self, io_type: IoType) -> Option<&OpStats> {
        match io_type {
            IoType::Read => Some(&self.read),
            IoType::Write => Some(&self.write),
            IoType::Unmap => Some(&self.unmap),
            IoType::Flush => Some(&self.flush),
            IoType::Reset => None,
        }
    }

    /// Record a request that reached completion
    pub fn record(&self, io_type: IoType, bytes: u64, latency_us: u64, success: bool) {
        let Some(op) = self.op(io_type) else {
            return;
        };
        op.ops.fetch_add(1, Ordering::Relaxed);
        if success {
            op.bytes.fetch_add(bytes, Ordering::Relaxed);
        } else {
            op.errors.fetch_add(1, Ordering::Relaxed);
        }
        op.latency.record(latency_us);
    }

    /// Record a request refused before reaching the engine
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests refused before reaching the engine
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub const fn read(&self) -> &OpStats {
        &self.read
    }

    pub const fn write(&self) -> &OpStats {
        &self.write
    }

    pub const fn unmap(&self) -> &OpStats {
        &self.unmap
    }

    pub const fn flush(&self) -> &OpStats {
        &self.flush
    }

    /// Copy all counters
    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            read_ops: self.read.ops(),
            read_bytes: self.read.bytes(),
            write_ops: self.write.ops(),
            write_bytes: self.write.bytes(),
            unmap_ops: self.unmap.ops(),
            flush_ops: self.flush.ops(),
            errors: self.read.errors()
                + self.write.errors()
                + self.unmap.errors()
                + self.flush.errors(),
            rejected: self.rejected(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_bounds() {
        assert_eq!(LatencyHistogram::bucket_index(0), 0);
        assert_eq!(LatencyHistogram::bucket_index(1), 1);
        assert_eq!(LatencyHistogram::bucket_index(3), 2);
        assert_eq!(LatencyHistogram::bucket_index(4), 3);
        assert_eq!(LatencyHistogram::bucket_index(u64::MAX), LATENCY_BUCKETS - 1);
        assert_eq!(bucket_upper_bound_us(3), 8);
        assert_eq!(bucket_upper_bound_us(LATENCY_BUCKETS - 1), u64::MAX);
    }

    #[test]
    fn test_histogram_quantiles() {
        let h = LatencyHistogram::new();
        for _ in 0..90 {
            h.record(5); // below 8
        }
        for _ in 0..10 {
            h.record(1000); // below 1024
        }
        assert_eq!(h.count(), 100);
        assert_eq!(h.max_us(), 1000);
        assert_eq!(h.avg_us(), (90 * 5 + 10 * 1000) / 100);
        assert_eq!(h.quantile_us(0.5), 8);
        assert_eq!(h.quantile_us(0.9), 8);
        assert_eq!(h.quantile_us(0.99), 1024);
        assert_eq!(LatencyHistogram::new().quantile_us(0.5), 0);
    }

    #[test]
    fn test_record_by_type() {
        let stats = IoStats::new();
        stats.record(IoType::Read, 4096, 10, true);
        stats.record(IoType::Read, 4096, 10, false);
        stats.record(IoType::Write, 512, 20, true);
        stats.record(IoType::Unmap, 1024, 5, true);
        stats.record(IoType::Reset, 0, 0, false);
        stats.record_rejected();

        let snap = stats.snapshot();
        assert_eq!(snap.read_ops, 2);
        assert_eq!(snap.read_bytes, 4096);
        assert_eq!(snap.write_bytes, 512);
        assert_eq!(snap.unmap_ops, 1);
        assert_eq!(snap.flush_ops, 0);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.rejected, 1);
        assert!(stats.op(IoType::Reset).is_none());
        assert_eq!(stats.read().latency().count(), 2);
    }
}
