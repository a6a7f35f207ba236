//! Key-value engine interface
//!
//! The engine submits key-value commands to the SSD and later drains their
//! completions per queue. A submitted [`KvCommand`] owns its key and value
//! buffers together with the [`InFlightIo`] it belongs to; the engine hands
//! the command back through [`KvCommand::complete`] once the device
//! answers. That call runs the completion path, which releases both
//! buffers and reports to the host.

use std::fmt;

use kvbdev_common::{DeviceHandle, NvmeStatus, QueueId};

use crate::completion::{self, InFlightIo};
use crate::dma::DmaBuf;
use crate::io::BdevIo;

/// Key-value command opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KvOp {
    /// Retrieve the value stored under a key
    Read,
    /// Store a value under a key
    Write,
    /// Remove a key
    Delete,
}

impl fmt::Display for KvOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("retrieve"),
            Self::Write => f.write_str("store"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// One key-value command and the block request waiting on it
pub struct KvCommand {
    pub(crate) op: KvOp,
    pub(crate) key: DmaBuf,
    pub(crate) value: Option<DmaBuf>,
    pub(crate) value_len: u64,
    pub(crate) request: InFlightIo,
}

impl KvCommand {
    /// Opcode
    #[must_use]
    pub const fn op(&self) -> KvOp {
        self.op
    }

    /// Fixed-width key
    #[must_use]
    pub fn key(&self) -> &[u8] {
        self.key.as_slice()
    }

    /// Value buffer; `None` for deletes
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_ref().map(DmaBuf::as_slice)
    }

    /// Mutable value buffer, for the engine to fill on retrieve
    pub fn value_mut(&mut self) -> Option<&mut [u8]> {
        self.value.as_mut().map(DmaBuf::as_mut_slice)
    }

    /// Value length. For deletes this is the byte span being removed.
    #[must_use]
    pub const fn value_len(&self) -> u64 {
        self.value_len
    }

    /// Finish the command with the status reported by the device
    pub fn complete(self, status: NvmeStatus) {
        completion::complete(self, status);
    }

    /// Release both buffers and recover the block request without
    /// completing it
    pub(crate) fn abandon(self) -> BdevIo {
        let Self {
            key,
            value,
            request,
            ..
        } = self;
        drop(value);
        drop(key);
        request.into_io()
    }
}

impl fmt::Debug for KvCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvCommand")
            .field("op", &self.op)
            .field("key", &self.key.as_slice())
            .field("has_value", &self.value.is_some())
            .field("value_len", &self.value_len)
            .finish_non_exhaustive()
    }
}

/// Synchronous submission refusal. The engine returns the command so its
/// buffers and request are not lost.
#[derive(Debug)]
pub struct Rejected {
    /// Engine return code
    pub rc: i32,
    /// The command that was not queued
    pub command: KvCommand,
}

/// Key-value SSD command engine
pub trait KvEngine: Send + Sync {
    /// Queue a retrieve on `queue`
    ///
    /// # Errors
    ///
    /// Returns the command back if it could not be queued.
    fn submit_read(
        &self,
        handle: DeviceHandle,
        queue: QueueId,
        command: KvCommand,
    ) -> Result<(), Rejected>;

    /// Queue a store on `queue`
    ///
    /// # Errors
    ///
    /// Returns the command back if it could not be queued.
    fn submit_write(
        &self,
        handle: DeviceHandle,
        queue: QueueId,
        command: KvCommand,
    ) -> Result<(), Rejected>;

    /// Queue a delete on `queue`
    ///
    /// # Errors
    ///
    /// Returns the command back if it could not be queued.
    fn submit_delete(
        &self,
        handle: DeviceHandle,
        queue: QueueId,
        command: KvCommand,
    ) -> Result<(), Rejected>;

    /// Complete every command finished on `queue`; returns how many
    fn drain_completions(&self, handle: DeviceHandle, queue: QueueId) -> usize;

    /// Sector size of the device in bytes
    fn sector_size(&self, handle: DeviceHandle) -> u32;

    /// Device capacity in sectors
    fn sector_count(&self, handle: DeviceHandle) -> u64;
}

/// Enumerates the raw device handles present in the system
pub trait DeviceDiscovery {
    fn device_handles(&self) -> Vec<DeviceHandle>;
}
