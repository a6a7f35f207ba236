//! Core type definitions for kvbdev
//!
//! Identifiers handed out by the key-value engine and the status pair it
//! reports when a command completes.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical block address: `byte_offset / sector_size`
pub type Lba = u64;

/// Opaque handle of a key-value NVMe device, as reported by discovery
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    /// Wrap a raw engine handle
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw engine handle
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceHandle({:#x})", self.0)
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Submission/completion queue index. The engine keeps one queue per core.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
)]
pub struct QueueId(u32);

impl QueueId {
    /// Queue used for a given core
    #[must_use]
    pub const fn for_core(core: u32) -> Self {
        Self(core)
    }

    /// Get the queue index
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// NVMe completion status: status code type and status code.
///
/// Passed through to the block layer exactly as the engine reported it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NvmeStatus {
    /// Status code type
    pub sct: u8,
    /// Status code
    pub sc: u8,
}

impl NvmeStatus {
    /// Successful completion
    pub const SUCCESS: Self = Self { sct: 0, sc: 0 };

    /// Generic command status: internal error
    pub const INTERNAL_ERROR: Self = Self { sct: 0, sc: 0x06 };

    /// Create a status pair
    #[must_use]
    pub const fn new(sct: u8, sc: u8) -> Self {
        Self { sct, sc }
    }

    /// Check if the status reports success
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.sct == 0 && self.sc == 0
    }
}

impl fmt::Display for NvmeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sct={:#x} sc={:#x}", self.sct, self.sc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_handle_display() {
        let handle = DeviceHandle::new(0x1f);
        assert_eq!(handle.to_string(), "0x1f");
        assert_eq!(format!("{handle:?}"), "DeviceHandle(0x1f)");
        assert_eq!(u64::from(handle), 0x1f);
    }

    #[test]
    fn test_queue_for_core() {
        assert_eq!(QueueId::for_core(3).index(), 3);
        assert_eq!(QueueId::for_core(0).to_string(), "q0");
    }

    #[test]
    fn test_nvme_status() {
        assert!(NvmeStatus::SUCCESS.is_success());
        assert!(NvmeStatus::default().is_success());
        assert!(!NvmeStatus::INTERNAL_ERROR.is_success());
        assert!(!NvmeStatus::new(1, 0).is_success());
        assert_eq!(NvmeStatus::new(1, 0x87).to_string(), "sct=0x1 sc=0x87");
    }
}
