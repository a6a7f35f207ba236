#![allow(clippy::result_large_err)]
//! kvbdev Block Layer
//!
//! Exposes key-value NVMe SSDs as ordinary block devices. Every block
//! request becomes one key-value command whose 16-byte key carries the
//! logical block address of the request.
//!
//! # Features
//!
//! - **Key synthesis**: byte offset to LBA to fixed-width key
//! - **Owned DMA buffers**: released exactly once on every path
//! - **Per-core queues**: each core submits to and drains its own queue
//! - **Typed completions**: every command carries its in-flight request back
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Host block I/O │  read / write / unmap / flush
//! └────────┬────────┘
//!          │ IoChannel::submit (per core)
//! ┌────────▼────────┐
//! │   Translator    │  validate, key + value buffers, InFlightIo
//! └────────┬────────┘
//!          │ KvEngine::submit_* on the core's queue
//! ┌────────▼────────┐
//! │  Key-value SSD  │
//! └────────┬────────┘
//!          │ Poller::tick → drain_completions
//! ┌────────▼────────┐
//! │   Completion    │  copy read data, release buffers, report status
//! └─────────────────┘
//! ```

pub mod channel;
pub mod completion;
pub mod core_id;
pub mod dma;
pub mod engine;
pub mod error;
pub mod io;
pub mod key;
pub mod memkv;
pub mod metrics;
pub mod module;
pub mod poller;
pub mod registry;
pub mod stats;
pub mod translate;

pub use channel::IoChannel;
pub use completion::{InFlightIo, in_flight_ctx_size};
pub use core_id::{CoreIdSource, FixedCore, SchedCore};
pub use dma::{DmaBuf, DmaPool, DmaPoolStats};
pub use engine::{DeviceDiscovery, KvCommand, KvEngine, KvOp, Rejected};
pub use error::{BlockError, BlockResult};
pub use io::{BdevIo, IoCallback, IoStatus, IoType};
pub use key::{KEY_WIDTH, UnmapDescriptor, encode_key, offset_to_lba, unmap_descriptor_to_lba};
pub use memkv::MemKvEngine;
pub use metrics::PrometheusExporter;
pub use module::KvBdevModule;
pub use poller::{Poller, PollerState};
pub use registry::{BdevInfo, Controller, KvBdev, Registry};
pub use stats::{IoStats, IoStatsSnapshot, LatencyHistogram};
pub use translate::{IoContext, RejectedIo, io_type_supported};
