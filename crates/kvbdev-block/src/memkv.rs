//! In-memory key-value engine
//!
//! Keeps values in a map per device and queues completions per
//! (device, queue) pair until someone drains that queue, the same way a
//! hardware submission/completion queue pair behaves. Used by the bench
//! tool and the tests.

use std::collections::{HashMap, VecDeque};

use kvbdev_common::{DeviceHandle, NvmeStatus, QueueId};
use parking_lot::Mutex;
use tracing::trace;

use crate::engine::{DeviceDiscovery, KvCommand, KvEngine, KvOp, Rejected};

/// Command-specific status code type
pub const SCT_COMMAND_SPECIFIC: u8 = 0x1;

/// Key-value "key does not exist" status code
pub const SC_KEY_NOT_EXIST: u8 = 0x87;

/// Return code for a command aimed at an unknown device
pub const RC_NO_DEVICE: i32 = -libc::ENODEV;

/// What a submitted command looked like, recorded for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedCommand {
    pub handle: DeviceHandle,
    pub queue: QueueId,
    pub op: KvOp,
    pub key: Vec<u8>,
    pub value_len: u64,
    pub has_value: bool,
}

#[derive(Debug)]
struct MemDevice {
    sector_size: u32,
    sector_count: u64,
    store: HashMap<Vec<u8>, Vec<u8>>,
    queues: HashMap<QueueId, VecDeque<KvCommand>>,
}

#[derive(Debug, Default)]
struct State {
    devices: HashMap<DeviceHandle, MemDevice>,
    order: Vec<DeviceHandle>,
    fail_next: Option<i32>,
    submitted: Vec<SubmittedCommand>,
}

/// Key-value engine backed by process memory
#[derive(Debug, Default)]
pub struct MemKvEngine {
    state: Mutex<State>,
}

impl MemKvEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device with the given geometry
    #[must_use]
    pub fn with_device(self, handle: DeviceHandle, sector_size: u32, sector_count: u64) -> Self {
        self.add_device(handle, sector_size, sector_count);
        self
    }

    /// Add a device with the given geometry
    pub fn add_device(&self, handle: DeviceHandle, sector_size: u32, sector_count: u64) {
        let mut state = self.state.lock();
        if !state.devices.contains_key(&handle) {
            state.order.push(handle);
        }
        state.devices.insert(
            handle,
            MemDevice {
                sector_size,
                sector_count,
                store: HashMap::new(),
                queues: HashMap::new(),
            },
        );
    }

    /// Refuse the next submission with `rc`
    pub fn fail_next_submit(&self, rc: i32) {
        self.state.lock().fail_next = Some(rc);
    }

    /// Commands queued on (handle, queue) and not yet drained
    #[must_use]
    pub fn pending(&self, handle: DeviceHandle, queue: QueueId) -> usize {
        self.state
            .lock()
            .devices
            .get(&handle)
            .and_then(|d| d.queues.get(&queue))
            .map_or(0, VecDeque::len)
    }

    /// Check if a key holds a value
    #[must_use]
    pub fn contains(&self, handle: DeviceHandle, key: &[u8]) -> bool {
        self.state
            .lock()
            .devices
            .get(&handle)
            .is_some_and(|d| d.store.contains_key(key))
    }

    /// Length of the value stored under a key
    #[must_use]
    pub fn stored_len(&self, handle: DeviceHandle, key: &[u8]) -> Option<usize> {
        self.state
            .lock()
            .devices
            .get(&handle)
            .and_then(|d| d.store.get(key))
            .map(Vec::len)
    }

    /// Every command accepted so far, in submission order
    #[must_use]
    pub fn submitted(&self) -> Vec<SubmittedCommand> {
        self.state.lock().submitted.clone()
    }

    fn enqueue(
        &self,
        handle: DeviceHandle,
        queue: QueueId,
        command: KvCommand,
    ) -> Result<(), Rejected> {
        let mut state = self.state.lock();
        if let Some(rc) = state.fail_next.take() {
            return Err(Rejected { rc, command });
        }
        let record = SubmittedCommand {
            handle,
            queue,
            op: command.op(),
            key: command.key().to_vec(),
            value_len: command.value_len(),
            has_value: command.value().is_some(),
        };
        let Some(device) = state.devices.get_mut(&handle) else {
            return Err(Rejected {
                rc: RC_NO_DEVICE,
                command,
            });
        };
        device.queues.entry(queue).or_default().push_back(command);
        state.submitted.push(record);
        Ok(())
    }

    /// Apply a command to the store and produce its status
    fn execute(&self, handle: DeviceHandle, command: &mut KvCommand) -> NvmeStatus {
        let mut state = self.state.lock();
        let Some(device) = state.devices.get_mut(&handle) else {
            return NvmeStatus::INTERNAL_ERROR;
        };
        let key = command.key().to_vec();
        match command.op() {
            KvOp::Write => {
                let value = command.value().map(<[u8]>::to_vec).unwrap_or_default();
                device.store.insert(key, value);
                NvmeStatus::SUCCESS
            }
            KvOp::Read => match device.store.get(&key) {
                Some(stored) => {
                    if let Some(dst) = command.value_mut() {
                        let n = dst.len().min(stored.len());
                        dst[..n].copy_from_slice(&stored[..n]);
                    }
                    NvmeStatus::SUCCESS
                }
                None => NvmeStatus::new(SCT_COMMAND_SPECIFIC, SC_KEY_NOT_EXIST),
            },
            KvOp::Delete => {
                device.store.remove(&key);
                NvmeStatus::SUCCESS
            }
        }
    }
}

impl KvEngine for MemKvEngine {
    fn submit_read(
        &self,
        handle: DeviceHandle,
        queue: QueueId,
        command: KvCommand,
    ) -> Result<(), Rejected> {
        self.enqueue(handle, queue, command)
    }

    fn submit_write(
        &self,
        handle: DeviceHandle,
        queue: QueueId,
        command: KvCommand,
    ) -> Result<(), Rejected> {
        self.enqueue(handle, queue, command)
    }

    fn submit_delete(
        &self,
        handle: DeviceHandle,
        queue: QueueId,
        command: KvCommand,
    ) -> Result<(), Rejected> {
        self.enqueue(handle, queue, command)
    }

    fn drain_completions(&self, handle: DeviceHandle, queue: QueueId) -> usize {
        // Completion callbacks may submit again; run them without the lock.
        let ready = {
            let mut state = self.state.lock();
            state
                .devices
                .get_mut(&handle)
                .and_then(|d| d.queues.get_mut(&queue))
                .map(std::mem::take)
                .unwrap_or_default()
        };

        let count = ready.len();
        for mut command in ready {
            let status = self.execute(handle, &mut command);
            trace!("{} on {} {} -> {}", command.op(), handle, queue, status);
            command.complete(status);
        }
        count
    }

    fn sector_size(&self, handle: DeviceHandle) -> u32 {
        self.state
            .lock()
            .devices
            .get(&handle)
            .map_or(0, |d| d.sector_size)
    }

    fn sector_count(&self, handle: DeviceHandle) -> u64 {
        self.state
            .lock()
            .devices
            .get(&handle)
            .map_or(0, |d| d.sector_count)
    }
}

impl DeviceDiscovery for MemKvEngine {
    fn device_handles(&self) -> Vec<DeviceHandle> {
        self.state.lock().order.clone()
    }
}
