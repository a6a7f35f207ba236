//! Block layer error types

use kvbdev_common::{ConfigError, DeviceHandle};
use thiserror::Error;

use crate::io::IoType;

/// Block layer error
#[derive(Error, Debug)]
pub enum BlockError {
    /// Request offset or length is not a multiple of the sector size
    #[error("Unaligned I/O request {field} {value} (sector size {sector_size})")]
    Alignment {
        field: &'static str,
        value: u64,
        sector_size: u32,
    },

    /// No DMA-capable memory for a buffer of this size
    #[error("DMA allocation of {size} bytes failed")]
    AllocationFailure { size: usize },

    /// Unmap carried more descriptors than the device accepts
    #[error("Unmap with {count} descriptors not supported (max {max})")]
    UnsupportedBatch { count: usize, max: usize },

    /// Engine refused the command synchronously
    #[error("Command submission failed: rc={rc}")]
    Submission { rc: i32 },

    /// I/O type not handled by this device
    #[error("I/O type {0:?} not supported")]
    UnsupportedIoType(IoType),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Offset out of bounds
    #[error("Offset {offset} + length {length} exceeds device size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    /// Block device not found
    #[error("Block device not found: {0}")]
    DeviceNotFound(String),

    /// Controller not found
    #[error("Controller not found: {0}")]
    ControllerNotFound(DeviceHandle),

    /// Controller registered twice
    #[error("Controller already registered: {0}")]
    ControllerExists(DeviceHandle),

    /// Controller still has a block device on top of it
    #[error("Controller {0} still backs block device {1}")]
    ControllerBusy(DeviceHandle, String),

    /// Channel requested on a controller whose channel pair is unregistered
    #[error("I/O channel unavailable for controller {0}")]
    ChannelUnavailable(DeviceHandle),

    /// Discovery could not be completed
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// Bad module configuration
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Config dump serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for block operations
pub type BlockResult<T> = Result<T, BlockError>;
