//! Controller and block device registry
//!
//! One controller record per discovered device handle, and at most one
//! block device on top of each controller. Records are kept in discovery
//! order. The registry is mutated only at module init and teardown.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use kvbdev_common::DeviceHandle;
use serde::Serialize;

use crate::error::{BlockError, BlockResult};
use crate::stats::IoStats;

/// Unmap descriptors accepted per request
pub const MAX_UNMAP_DESCRIPTORS: usize = 1;

/// A key-value controller found at discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Controller {
    /// Raw engine handle
    pub handle: DeviceHandle,
    /// Controller name, `<prefix><slot>`
    pub name: String,
    /// Discovery index
    pub slot: usize,
    /// Whether its channel pair is registered with the host
    pub io_device_registered: bool,
}

/// A block device exposed on top of a controller
#[derive(Debug)]
pub struct KvBdev {
    name: String,
    product_name: String,
    handle: DeviceHandle,
    controller_name: String,
    sector_size: u32,
    sector_count: u64,
    stats: IoStats,
}

impl KvBdev {
    pub(crate) fn new(
        name: String,
        product_name: String,
        handle: DeviceHandle,
        controller_name: String,
        sector_size: u32,
        sector_count: u64,
    ) -> Self {
        Self {
            name,
            product_name,
            handle,
            controller_name,
            sector_size,
            sector_count,
            stats: IoStats::new(),
        }
    }

    /// Block device name, `<controller>n1`
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    /// Handle of the backing controller
    #[must_use]
    pub const fn handle(&self) -> DeviceHandle {
        self.handle
    }

    #[must_use]
    pub fn controller_name(&self) -> &str {
        &self.controller_name
    }

    /// Block size in bytes
    #[must_use]
    pub const fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Capacity in blocks
    #[must_use]
    pub const fn sector_count(&self) -> u64 {
        self.sector_count
    }

    /// Capacity in bytes
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.sector_count.saturating_mul(self.sector_size as u64)
    }

    #[must_use]
    pub const fn max_unmap_descriptors(&self) -> usize {
        MAX_UNMAP_DESCRIPTORS
    }

    /// Volatile write cache; the device has none
    #[must_use]
    pub const fn write_cache(&self) -> bool {
        false
    }

    #[must_use]
    pub const fn stats(&self) -> &IoStats {
        &self.stats
    }
}

/// Serializable description of a block device, used by the config dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BdevInfo {
    pub name: String,
    pub product_name: String,
    pub controller: String,
    pub handle: DeviceHandle,
    pub block_size: u32,
    pub num_blocks: u64,
    pub max_unmap_bdesc_count: usize,
    pub write_cache: bool,
}

impl From<&KvBdev> for BdevInfo {
    fn from(bdev: &KvBdev) -> Self {
        Self {
            name: bdev.name.clone(),
            product_name: bdev.product_name.clone(),
            controller: bdev.controller_name.clone(),
            handle: bdev.handle,
            block_size: bdev.sector_size,
            num_blocks: bdev.sector_count,
            max_unmap_bdesc_count: MAX_UNMAP_DESCRIPTORS,
            write_cache: false,
        }
    }
}

#[derive(Debug)]
struct Entry {
    controller: Controller,
    bdev: Option<Arc<KvBdev>>,
}

/// Controllers and their block devices
#[derive(Debug, Default)]
pub struct Registry {
    /// Entries keyed by discovery slot
    entries: BTreeMap<usize, Entry>,
    /// Handle to slot
    by_handle: HashMap<DeviceHandle, usize>,
    /// Block device name to slot
    by_bdev_name: HashMap<String, usize>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with room for `count` controllers
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::Discovery`] if the tables cannot be allocated.
    pub fn try_with_capacity(count: usize) -> BlockResult<Self> {
        let mut registry = Self::new();
        registry
            .by_handle
            .try_reserve(count)
            .and_then(|()| registry.by_bdev_name.try_reserve(count))
            .map_err(|e| BlockError::Discovery(format!("controller table for {count}: {e}")))?;
        Ok(registry)
    }

    fn slot(&self, handle: DeviceHandle) -> BlockResult<usize> {
        self.by_handle
            .get(&handle)
            .copied()
            .ok_or(BlockError::ControllerNotFound(handle))
    }

    fn entry_mut(&mut self, handle: DeviceHandle) -> BlockResult<&mut Entry> {
        let slot = self.slot(handle)?;
        self.entries
            .get_mut(&slot)
            .ok_or(BlockError::ControllerNotFound(handle))
    }

    /// Record a controller
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::ControllerExists`] if the handle or slot is taken.
    pub fn add_controller(
        &mut self,
        handle: DeviceHandle,
        name: String,
        slot: usize,
    ) -> BlockResult<&Controller> {
        if self.by_handle.contains_key(&handle) || self.entries.contains_key(&slot) {
            return Err(BlockError::ControllerExists(handle));
        }
        self.by_handle.insert(handle, slot);
        let entry = self.entries.entry(slot).or_insert(Entry {
            controller: Controller {
                handle,
                name,
                slot,
                io_device_registered: false,
            },
            bdev: None,
        });
        Ok(&entry.controller)
    }

    /// Mark the controller's channel pair as registered
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::ControllerNotFound`] for an unknown handle.
    pub fn register_io_device(&mut self, handle: DeviceHandle) -> BlockResult<()> {
        self.entry_mut(handle)?.controller.io_device_registered = true;
        Ok(())
    }

    /// Mark the controller's channel pair as unregistered
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::ControllerNotFound`] for an unknown handle.
    pub fn unregister_io_device(&mut self, handle: DeviceHandle) -> BlockResult<()> {
        self.entry_mut(handle)?.controller.io_device_registered = false;
        Ok(())
    }

    /// Put a block device on top of its controller
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::ControllerNotFound`] if the controller is
    /// unknown and [`BlockError::InvalidArgument`] if it already has a
    /// block device or the name is taken.
    pub fn add_bdev(&mut self, bdev: KvBdev) -> BlockResult<Arc<KvBdev>> {
        if self.by_bdev_name.contains_key(bdev.name()) {
            return Err(BlockError::InvalidArgument(format!(
                "block device {} already exists",
                bdev.name()
            )));
        }
        let slot = self.slot(bdev.handle())?;
        let entry = self
            .entries
            .get_mut(&slot)
            .ok_or(BlockError::ControllerNotFound(bdev.handle()))?;
        if let Some(existing) = &entry.bdev {
            return Err(BlockError::InvalidArgument(format!(
                "controller {} already backs {}",
                entry.controller.name,
                existing.name()
            )));
        }

        let bdev = Arc::new(bdev);
        self.by_bdev_name.insert(bdev.name().to_string(), slot);
        entry.bdev = Some(Arc::clone(&bdev));
        Ok(bdev)
    }

    /// Remove a block device by name
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::DeviceNotFound`] for an unknown name.
    pub fn remove_bdev(&mut self, name: &str) -> BlockResult<Arc<KvBdev>> {
        let slot = self
            .by_bdev_name
            .remove(name)
            .ok_or_else(|| BlockError::DeviceNotFound(name.to_string()))?;
        self.entries
            .get_mut(&slot)
            .and_then(|entry| entry.bdev.take())
            .ok_or_else(|| BlockError::DeviceNotFound(name.to_string()))
    }

    /// Remove a controller
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::ControllerNotFound`] for an unknown handle and
    /// [`BlockError::ControllerBusy`] while a block device sits on it.
    pub fn remove_controller(&mut self, handle: DeviceHandle) -> BlockResult<Controller> {
        let slot = self.slot(handle)?;
        if let Some(bdev) = self.entries.get(&slot).and_then(|e| e.bdev.as_ref()) {
            return Err(BlockError::ControllerBusy(handle, bdev.name().to_string()));
        }
        self.by_handle.remove(&handle);
        self.entries
            .remove(&slot)
            .map(|entry| entry.controller)
            .ok_or(BlockError::ControllerNotFound(handle))
    }

    /// Look up a block device by name
    #[must_use]
    pub fn bdev(&self, name: &str) -> Option<Arc<KvBdev>> {
        let slot = self.by_bdev_name.get(name)?;
        self.entries.get(slot)?.bdev.clone()
    }

    /// Look up a controller by handle
    #[must_use]
    pub fn controller(&self, handle: DeviceHandle) -> Option<&Controller> {
        let slot = self.by_handle.get(&handle)?;
        self.entries.get(slot).map(|e| &e.controller)
    }

    /// Look up the block device on top of a controller
    #[must_use]
    pub fn bdev_by_handle(&self, handle: DeviceHandle) -> Option<Arc<KvBdev>> {
        let slot = self.by_handle.get(&handle)?;
        self.entries.get(slot)?.bdev.clone()
    }

    /// Controllers in discovery order
    pub fn controllers(&self) -> impl Iterator<Item = &Controller> {
        self.entries.values().map(|e| &e.controller)
    }

    /// Block devices in discovery order
    pub fn bdevs(&self) -> impl Iterator<Item = &Arc<KvBdev>> {
        self.entries.values().filter_map(|e| e.bdev.as_ref())
    }

    #[must_use]
    pub fn controller_count(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn bdev_count(&self) -> usize {
        self.by_bdev_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
