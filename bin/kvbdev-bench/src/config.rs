//! Bench configuration file
//!
//! ```toml
//! [module]
//! name_prefix = "unvme_bdev"
//! dma_capacity_bytes = 67108864
//!
//! [workload]
//! devices = 2
//! cores = 4
//! ios = 10000
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use kvbdev_common::ModuleConfig;
use serde::Deserialize;

/// Whole configuration file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub module: ModuleConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Simulated devices and the I/O mix run against them
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// In-memory devices to create
    pub devices: usize,
    /// Sector size of every device
    pub sector_size: u32,
    /// Sectors per device
    pub sector_count: u64,
    /// Worker threads, one simulated core each
    pub cores: u32,
    /// Write/read pairs per worker
    pub ios: u64,
    /// Request size in bytes
    pub io_size: u64,
    /// Unmap every n-th written block (0 = never)
    pub unmap_every: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            sector_size: 512,
            sector_count: 1 << 20,
            cores: 2,
            ios: 1000,
            io_size: 4096,
            unmap_every: 8,
        }
    }
}

impl WorkloadConfig {
    /// Reject workloads the devices cannot hold
    pub fn validate(&self) -> Result<()> {
        if self.devices == 0 || self.cores == 0 {
            bail!("devices and cores must be at least 1");
        }
        if self.sector_size == 0 || self.io_size == 0 {
            bail!("sector_size and io_size must be non-zero");
        }
        if self.io_size % u64::from(self.sector_size) != 0 {
            bail!(
                "io_size {} is not a multiple of sector_size {}",
                self.io_size,
                self.sector_size
            );
        }
        let blocks_per_io = self.io_size / u64::from(self.sector_size);
        if self.region_blocks() < blocks_per_io {
            bail!("device too small for {} workers per device", self.workers_per_device());
        }
        Ok(())
    }

    /// Workers sharing one device
    #[must_use]
    pub fn workers_per_device(&self) -> u64 {
        u64::from(self.cores).div_ceil(self.devices as u64)
    }

    /// Blocks of a device owned by one worker
    #[must_use]
    pub fn region_blocks(&self) -> u64 {
        self.sector_count / self.workers_per_device().max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl BenchConfig {
    /// Load from a TOML file, or defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let config = BenchConfig::load(None).unwrap();
        assert_eq!(config.workload, WorkloadConfig::default());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.module.name_prefix, "unvme_bdev");
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[module]\nproduct_name = \"KV disk\"\n\n[workload]\ncores = 4\nio_size = 8192\n\n[logging]\nlevel = \"debug\"\nformat = \"json\""
        )
        .unwrap();

        let config = BenchConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.module.product_name, "KV disk");
        assert_eq!(config.module.name_prefix, "unvme_bdev");
        assert_eq!(config.workload.cores, 4);
        assert_eq!(config.workload.io_size, 8192);
        assert_eq!(config.workload.sector_size, 512);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = BenchConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[workload\ncores = ").unwrap();
        assert!(BenchConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_workload_validation() {
        assert!(WorkloadConfig::default().validate().is_ok());

        let unaligned = WorkloadConfig {
            io_size: 1000,
            ..WorkloadConfig::default()
        };
        assert!(unaligned.validate().is_err());

        let crowded = WorkloadConfig {
            sector_count: 4,
            cores: 8,
            ..WorkloadConfig::default()
        };
        assert!(crowded.validate().is_err());
    }

    #[test]
    fn test_regions_split_device() {
        let workload = WorkloadConfig {
            devices: 2,
            cores: 4,
            sector_count: 1000,
            ..WorkloadConfig::default()
        };
        assert_eq!(workload.workers_per_device(), 2);
        assert_eq!(workload.region_blocks(), 500);
    }
}
