//! Gauges published by the metrics sampler.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::monitor::{CpuSnapshot, ResourceSnapshot};

pub const PARENT_MEMORY_BYTES: &str = "process_parent_memory_bytes";
pub const WORKERS_MEMORY_BYTES: &str = "process_workers_memory_bytes";
pub const WORKER_COUNT: &str = "process_worker_count";
pub const PER_WORKER_MEMORY_BYTES: &str = "process_per_worker_memory_bytes";
pub const TOTAL_MEMORY_BYTES: &str = "process_total_memory_bytes";
pub const PARENT_CPU_PERCENT: &str = "process_parent_cpu_percent";
pub const WORKERS_CPU_PERCENT: &str = "process_workers_cpu_percent";
pub const TOTAL_CPU_PERCENT: &str = "process_total_cpu_percent";

/// Every gauge name, in publication order.
pub const GAUGE_NAMES: [&str; 8] = [
    PARENT_MEMORY_BYTES,
    WORKERS_MEMORY_BYTES,
    WORKER_COUNT,
    PER_WORKER_MEMORY_BYTES,
    TOTAL_MEMORY_BYTES,
    PARENT_CPU_PERCENT,
    WORKERS_CPU_PERCENT,
    TOTAL_CPU_PERCENT,
];

/// One reading of the resource monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Sample {
    pub memory: ResourceSnapshot,
    pub cpu: CpuSnapshot,
}

impl Sample {
    /// Gauge values keyed by name, in [`GAUGE_NAMES`] order.
    pub fn gauges(&self) -> [(&'static str, f64); 8] {
        [
            (PARENT_MEMORY_BYTES, self.memory.parent_rss as f64),
            (WORKERS_MEMORY_BYTES, self.memory.workers_rss_sum as f64),
            (WORKER_COUNT, self.memory.worker_count as f64),
            (PER_WORKER_MEMORY_BYTES, self.memory.per_worker_avg as f64),
            (TOTAL_MEMORY_BYTES, self.memory.total() as f64),
            (PARENT_CPU_PERCENT, f64::from(self.cpu.parent)),
            (WORKERS_CPU_PERCENT, f64::from(self.cpu.workers)),
            (TOTAL_CPU_PERCENT, f64::from(self.cpu.total)),
        ]
    }
}

/// Destination for sampled gauges.
pub trait GaugeSink: Send + Sync {
    fn publish(&self, sample: &Sample) -> Result<()>;
}

/// Latest gauge values held in memory, readable from any thread.
#[derive(Debug, Default)]
pub struct PoolGauges {
    values: [AtomicU64; 8],
}

impl PoolGauges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        let idx = GAUGE_NAMES.iter().position(|gauge| *gauge == name)?;
        Some(f64::from_bits(self.values[idx].load(Ordering::Relaxed)))
    }

    pub fn snapshot(&self) -> Vec<(&'static str, f64)> {
        GAUGE_NAMES
            .iter()
            .zip(&self.values)
            .map(|(name, value)| (*name, f64::from_bits(value.load(Ordering::Relaxed))))
            .collect()
    }
}

impl GaugeSink for PoolGauges {
    fn publish(&self, sample: &Sample) -> Result<()> {
        for ((_, value), slot) in sample.gauges().iter().zip(&self.values) {
            slot.store(value.to_bits(), Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Emits one structured log event per sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl GaugeSink for LogSink {
    fn publish(&self, sample: &Sample) -> Result<()> {
        info!(
            parent_memory_bytes = sample.memory.parent_rss,
            workers_memory_bytes = sample.memory.workers_rss_sum,
            worker_count = sample.memory.worker_count,
            per_worker_memory_bytes = sample.memory.per_worker_avg,
            total_memory_bytes = sample.memory.total(),
            parent_cpu_percent = sample.cpu.parent,
            workers_cpu_percent = sample.cpu.workers,
            total_cpu_percent = sample.cpu.total,
            "Resource sample"
        );
        Ok(())
    }
}
