//! Prometheus text exporter for block device statistics
//!
//! # Metrics
//!
//! - `kvbdev_bdev_size_bytes` - Device capacity
//! - `kvbdev_bdev_ops_total{op}` - Completed requests per I/O type
//! - `kvbdev_bdev_bytes_total{op}` - Bytes moved by successful requests
//! - `kvbdev_bdev_errors_total{op}` - Requests completed with a device error
//! - `kvbdev_bdev_rejected_total` - Requests refused before submission
//! - `kvbdev_bdev_latency_seconds{op}` - Submission to completion latency
//! - `kvbdev_dma_outstanding_buffers` / `kvbdev_dma_outstanding_bytes`
//! - `kvbdev_dma_allocations_total` / `kvbdev_dma_failures_total`

use std::fmt::Write;
use std::sync::Arc;

use crate::dma::DmaPoolStats;
use crate::io::IoType;
use crate::registry::KvBdev;
use crate::stats::{LatencyHistogram, OpStats};

const EXPORTED_OPS: [IoType; 4] = [IoType::Read, IoType::Write, IoType::Unmap, IoType::Flush];

/// Renders block device and DMA pool counters in Prometheus text format
#[derive(Debug, Clone)]
pub struct PrometheusExporter {
    prefix: String,
}

impl PrometheusExporter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Render every metric
    #[must_use]
    pub fn export(&self, bdevs: &[Arc<KvBdev>], pool: &DmaPoolStats) -> String {
        let mut output = String::with_capacity(4 * 1024);
        self.export_bdevs(&mut output, bdevs);
        self.export_pool(&mut output, pool);
        output
    }

    #[allow(clippy::cast_precision_loss)]
    fn export_bdevs(&self, output: &mut String, bdevs: &[Arc<KvBdev>]) {
        if bdevs.is_empty() {
            return;
        }

        self.write_header(output, "bdev_size_bytes", "Block device capacity in bytes", "gauge");
        for bdev in bdevs {
            self.write_sample(
                output,
                "bdev_size_bytes",
                &[("bdev", bdev.name())],
                bdev.size_bytes() as f64,
            );
        }

        let counters: [(&str, &str, fn(&OpStats) -> u64); 3] = [
            ("bdev_ops_total", "Completed block requests", OpStats::ops),
            ("bdev_bytes_total", "Bytes moved by successful requests", OpStats::bytes),
            ("bdev_errors_total", "Requests completed with a device error", OpStats::errors),
        ];
        for (name, help, value) in counters {
            self.write_header(output, name, help, "counter");
            for bdev in bdevs {
                for io_type in EXPORTED_OPS {
                    if let Some(op) = bdev.stats().op(io_type) {
                        let kind = io_type.to_string();
                        self.write_sample(
                            output,
                            name,
                            &[("bdev", bdev.name()), ("op", &kind)],
                            value(op) as f64,
                        );
                    }
                }
            }
        }

        self.write_header(
            output,
            "bdev_rejected_total",
            "Requests refused before submission",
            "counter",
        );
        for bdev in bdevs {
            self.write_sample(
                output,
                "bdev_rejected_total",
                &[("bdev", bdev.name())],
                bdev.stats().rejected() as f64,
            );
        }

        self.write_header(
            output,
            "bdev_latency_seconds",
            "Submission to completion latency",
            "histogram",
        );
        for bdev in bdevs {
            for io_type in [IoType::Read, IoType::Write, IoType::Unmap] {
                if let Some(op) = bdev.stats().op(io_type) {
                    let kind = io_type.to_string();
                    self.write_histogram(
                        output,
                        "bdev_latency_seconds",
                        &[("bdev", bdev.name()), ("op", &kind)],
                        op.latency(),
                    );
                }
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn export_pool(&self, output: &mut String, pool: &DmaPoolStats) {
        let gauges = [
            (
                "dma_outstanding_buffers",
                "DMA buffers held by in-flight commands",
                "gauge",
                pool.outstanding_buffers,
            ),
            (
                "dma_outstanding_bytes",
                "DMA bytes held by in-flight commands",
                "gauge",
                pool.outstanding_bytes,
            ),
            (
                "dma_allocations_total",
                "DMA buffer allocations",
                "counter",
                pool.allocations,
            ),
            (
                "dma_failures_total",
                "DMA allocations refused",
                "counter",
                pool.failures,
            ),
        ];
        for (name, help, kind, value) in gauges {
            self.write_header(output, name, help, kind);
            let _ = writeln!(output, "{}_{} {}", self.prefix, name, value as f64);
        }
    }

    fn write_header(&self, output: &mut String, name: &str, help: &str, kind: &str) {
        let _ = writeln!(output, "# HELP {}_{} {}", self.prefix, name, help);
        let _ = writeln!(output, "# TYPE {}_{} {}", self.prefix, name, kind);
    }

    fn write_sample(&self, output: &mut String, name: &str, labels: &[(&str, &str)], value: f64) {
        let _ = writeln!(
            output,
            "{}_{}{{{}}} {}",
            self.prefix,
            name,
            format_labels(labels),
            value
        );
    }

    #[allow(clippy::cast_precision_loss)]
    fn write_histogram(
        &self,
        output: &mut String,
        name: &str,
        labels: &[(&str, &str)],
        histogram: &LatencyHistogram,
    ) {
        let labels = format_labels(labels);
        let mut cumulative = 0u64;
        for (bound_us, count) in histogram.buckets() {
            cumulative += count;
            if bound_us == u64::MAX {
                continue;
            }
            let le = bound_us as f64 / 1_000_000.0;
            let _ = writeln!(
                output,
                "{}_{}_bucket{{{},le=\"{}\"}} {}",
                self.prefix, name, labels, le, cumulative
            );
        }
        let _ = writeln!(
            output,
            "{}_{}_bucket{{{},le=\"+Inf\"}} {}",
            self.prefix,
            name,
            labels,
            histogram.count()
        );
        let _ = writeln!(
            output,
            "{}_{}_sum{{{}}} {}",
            self.prefix,
            name,
            labels,
            histogram.sum_us() as f64 / 1_000_000.0
        );
        let _ = writeln!(
            output,
            "{}_{}_count{{{}}} {}",
            self.prefix,
            name,
            labels,
            histogram.count()
        );
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new("kvbdev")
    }
}

fn format_labels(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(",")
}
