//! Module lifecycle
//!
//! [`KvBdevModule::init`] discovers the key-value devices, creates one
//! controller and one block device per handle and registers each
//! controller's channel pair. [`KvBdevModule::fini`] tears everything down
//! in reverse. Both run while no I/O is in flight; the per-core hot path
//! only reads the registry when a channel is opened.

use std::sync::Arc;

use kvbdev_common::{DeviceHandle, ModuleConfig};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::channel::IoChannel;
use crate::completion;
use crate::core_id::CoreIdSource;
use crate::dma::DmaPool;
use crate::engine::{DeviceDiscovery, KvEngine};
use crate::error::{BlockError, BlockResult};
use crate::metrics::PrometheusExporter;
use crate::registry::{BdevInfo, Controller, KvBdev, Registry};
use crate::translate::IoContext;

/// Configuration dump written by [`KvBdevModule::write_config_json`]
#[derive(Debug, Serialize)]
struct ConfigDump<'a> {
    module: &'a ModuleConfig,
    bdevs: Vec<BdevInfo>,
}

/// Key-value block device module
#[derive(Debug)]
pub struct KvBdevModule {
    config: ModuleConfig,
    ctx: Arc<IoContext>,
    registry: RwLock<Registry>,
}

impl KvBdevModule {
    /// Discover devices and register their controllers and block devices.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration, when discovery reports more
    /// devices than `max_devices`, or when a device reports a zero sector
    /// size. Nothing stays registered after a failure.
    pub fn init(
        config: ModuleConfig,
        engine: Arc<dyn KvEngine>,
        discovery: &dyn DeviceDiscovery,
        cores: Arc<dyn CoreIdSource>,
    ) -> BlockResult<Self> {
        config.validate()?;

        let pool = DmaPool::new(config.effective_dma_align(), config.dma_capacity_bytes);
        let ctx = Arc::new(IoContext::new(
            Arc::clone(&engine),
            pool,
            cores,
            config.fallback_core,
        ));

        let handles = discovery.device_handles();
        if handles.len() > config.max_devices {
            return Err(BlockError::Discovery(format!(
                "{} devices found, at most {} supported",
                handles.len(),
                config.max_devices
            )));
        }

        let mut registry = Registry::try_with_capacity(handles.len())?;
        for (slot, handle) in handles.into_iter().enumerate() {
            Self::attach(&config, engine.as_ref(), &mut registry, slot, handle)?;
        }

        if registry.is_empty() {
            warn!("No key-value devices discovered");
        } else {
            info!(
                "Key-value block module ready with {} device(s)",
                registry.bdev_count()
            );
        }

        Ok(Self {
            config,
            ctx,
            registry: RwLock::new(registry),
        })
    }

    fn attach(
        config: &ModuleConfig,
        engine: &dyn KvEngine,
        registry: &mut Registry,
        slot: usize,
        handle: DeviceHandle,
    ) -> BlockResult<()> {
        let sector_size = engine.sector_size(handle);
        if sector_size == 0 {
            return Err(BlockError::Discovery(format!(
                "device {handle} reports a zero sector size"
            )));
        }
        let sector_count = engine.sector_count(handle);

        let controller_name = config.controller_name(slot);
        registry.add_controller(handle, controller_name.clone(), slot)?;
        registry.register_io_device(handle)?;

        let bdev = registry.add_bdev(KvBdev::new(
            format!("{controller_name}n1"),
            config.product_name.clone(),
            handle,
            controller_name,
            sector_size,
            sector_count,
        ))?;
        info!(
            "Created {} on controller {} ({} blocks of {} bytes)",
            bdev.name(),
            bdev.controller_name(),
            sector_count,
            sector_size
        );
        Ok(())
    }

    /// Tear down one block device and the controller under it
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::DeviceNotFound`] for an unknown name.
    pub fn destruct_bdev(&self, name: &str) -> BlockResult<()> {
        let mut registry = self.registry.write();
        let bdev = registry.remove_bdev(name)?;
        registry.unregister_io_device(bdev.handle())?;
        let controller = registry.remove_controller(bdev.handle())?;
        debug!("Destroyed {} and controller {}", name, controller.name);
        Ok(())
    }

    /// Tear down every block device and controller
    pub fn fini(&self) {
        let names: Vec<String> = self
            .registry
            .read()
            .bdevs()
            .map(|b| b.name().to_string())
            .collect();
        for name in names {
            if let Err(e) = self.destruct_bdev(&name) {
                warn!("Failed to destroy {}: {}", name, e);
            }
        }

        let mut registry = self.registry.write();
        let leftover: Vec<DeviceHandle> = registry.controllers().map(|c| c.handle).collect();
        for handle in leftover {
            if let Err(e) = registry.unregister_io_device(handle) {
                warn!("Failed to unregister channels of controller {}: {}", handle, e);
            }
            if let Err(e) = registry.remove_controller(handle) {
                warn!("Failed to remove controller {}: {}", handle, e);
            }
        }
        info!("Key-value block module stopped");
    }

    /// Open an I/O channel to a block device on the calling core. Opening
    /// again on the same core returns the same channel.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::DeviceNotFound`] for an unknown name and
    /// [`BlockError::ChannelUnavailable`] if the controller's channel pair
    /// is not registered.
    pub fn open_channel(&self, name: &str) -> BlockResult<IoChannel> {
        let registry = self.registry.read();
        let bdev = registry
            .bdev(name)
            .ok_or_else(|| BlockError::DeviceNotFound(name.to_string()))?;
        let registered = registry
            .controller(bdev.handle())
            .is_some_and(|c| c.io_device_registered);
        if !registered {
            return Err(BlockError::ChannelUnavailable(bdev.handle()));
        }
        Ok(IoChannel::open(bdev, Arc::clone(&self.ctx)))
    }

    /// Look up a block device by name
    #[must_use]
    pub fn bdev(&self, name: &str) -> Option<Arc<KvBdev>> {
        self.registry.read().bdev(name)
    }

    /// Look up the block device backed by a device handle
    #[must_use]
    pub fn bdev_by_handle(&self, handle: DeviceHandle) -> Option<Arc<KvBdev>> {
        self.registry.read().bdev_by_handle(handle)
    }

    /// Block devices in discovery order
    #[must_use]
    pub fn bdevs(&self) -> Vec<Arc<KvBdev>> {
        self.registry.read().bdevs().cloned().collect()
    }

    /// Controllers in discovery order
    #[must_use]
    pub fn controllers(&self) -> Vec<Controller> {
        self.registry.read().controllers().cloned().collect()
    }

    #[must_use]
    pub fn dma_pool(&self) -> &DmaPool {
        self.ctx.pool()
    }

    #[must_use]
    pub const fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// Per-request context size the host must reserve
    #[must_use]
    pub const fn in_flight_ctx_size(&self) -> usize {
        completion::in_flight_ctx_size()
    }

    /// Dump the module configuration and its block devices as JSON
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::Serialization`] if encoding fails.
    pub fn write_config_json(&self) -> BlockResult<String> {
        let dump = ConfigDump {
            module: &self.config,
            bdevs: self
                .registry
                .read()
                .bdevs()
                .map(|b| BdevInfo::from(b.as_ref()))
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&dump)?)
    }

    /// Render statistics in Prometheus text format
    #[must_use]
    pub fn prometheus_metrics(&self, exporter: &PrometheusExporter) -> String {
        exporter.export(&self.bdevs(), &self.dma_pool().stats())
    }
}
