//! Configuration types for kvbdev
//!
//! This module defines the configuration of the block-device module that
//! sits on top of the key-value engine.

use serde::{Deserialize, Serialize};

/// Default maximum number of devices accepted from discovery
pub const DEFAULT_MAX_DEVICES: usize = 64;

/// Default DMA buffer alignment in bytes (one cache line)
pub const DEFAULT_DMA_ALIGN: usize = 64;

/// Configuration validation error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("name prefix cannot be empty")]
    EmptyNamePrefix,
    #[error("max_devices must be at least 1")]
    NoDevicesAllowed,
    #[error("dma_align must be zero or a power of two, got {0}")]
    BadAlignment(usize),
}

/// Block-device module configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Controller name prefix; controllers are named `<prefix><index>`
    pub name_prefix: String,
    /// Product name reported by every block device
    pub product_name: String,
    /// Core (and therefore queue) used when the current core cannot be determined
    pub fallback_core: u32,
    /// Upper bound on devices accepted from discovery
    pub max_devices: usize,
    /// DMA buffer alignment (0 = cache line)
    pub dma_align: usize,
    /// Cap on outstanding DMA bytes (None = limited only by the allocator)
    pub dma_capacity_bytes: Option<u64>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            name_prefix: "unvme_bdev".to_string(),
            product_name: "NVMe disk".to_string(),
            fallback_core: 0,
            max_devices: DEFAULT_MAX_DEVICES,
            dma_align: 0,
            dma_capacity_bytes: None,
        }
    }
}

impl ModuleConfig {
    /// Check the configuration for values the module cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name_prefix.is_empty() {
            return Err(ConfigError::EmptyNamePrefix);
        }
        if self.max_devices == 0 {
            return Err(ConfigError::NoDevicesAllowed);
        }
        if self.dma_align != 0 && !self.dma_align.is_power_of_two() {
            return Err(ConfigError::BadAlignment(self.dma_align));
        }
        Ok(())
    }

    /// Alignment actually used for DMA buffers
    #[must_use]
    pub const fn effective_dma_align(&self) -> usize {
        if self.dma_align == 0 {
            DEFAULT_DMA_ALIGN
        } else {
            self.dma_align
        }
    }

    /// Controller name for the discovery index `index`
    #[must_use]
    pub fn controller_name(&self, index: usize) -> String {
        format!("{}{}", self.name_prefix, index)
    }
}
