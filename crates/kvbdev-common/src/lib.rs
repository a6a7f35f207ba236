//! kvbdev Common - Shared types and configuration
//!
//! This crate provides the plain identifier types and the module
//! configuration shared by the block layer and the binaries built on it.

pub mod config;
pub mod types;

pub use config::{ConfigError, ModuleConfig};
pub use types::*;
