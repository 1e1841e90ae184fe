//! Allocator profiling.
//!
//! Operation counts, byte volumes, and latencies are recorded into a private
//! prometheus registry while the profiling flag is on. Nothing is recorded
//! (and no clock is read) while it is off.

use std::sync::Arc;

use prometheus::{
    Encoder, HistogramOpts, HistogramTimer, HistogramVec, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use thiserror::Error;

use crate::config::RuntimeFlags;

#[derive(Error, Debug)]
pub enum ProfilerError {
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Metrics output is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// A profiled allocator operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Allocate,
    Free,
    /// Allocation satisfied from the cache.
    CacheHit,
    DriverAlloc,
    DriverFree,
    EmptyCache,
    /// Host/device or device/device copy.
    Memcpy,
    Memset,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Allocate => "allocate",
            Op::Free => "free",
            Op::CacheHit => "cache_hit",
            Op::DriverAlloc => "driver_alloc",
            Op::DriverFree => "driver_free",
            Op::EmptyCache => "empty_cache",
            Op::Memcpy => "memcpy",
            Op::Memset => "memset",
        }
    }
}

/// Latency buckets in seconds. Bookkeeping operations are expected to take
/// well under a millisecond.
const LATENCY_BUCKETS: &[f64] = &[1e-6, 5e-6, 1e-5, 5e-5, 1e-4, 5e-4, 1e-3, 1e-2];

pub struct Profiler {
    flags: Arc<RuntimeFlags>,
    registry: Registry,
    ops: IntCounterVec,
    bytes: IntCounterVec,
    latency: HistogramVec,
}

impl Profiler {
    pub fn new(flags: Arc<RuntimeFlags>) -> Result<Self, ProfilerError> {
        let registry = Registry::new_custom(Some("rdna".to_string()), None)?;

        let ops = IntCounterVec::new(
            Opts::new("allocator_ops_total", "Allocator operations by kind and device"),
            &["op", "device"],
        )?;
        let bytes = IntCounterVec::new(
            Opts::new("allocator_bytes_total", "Bytes moved by allocator operations"),
            &["op", "device"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new("allocator_op_seconds", "Allocator operation latency")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["op"],
        )?;

        registry.register(Box::new(ops.clone()))?;
        registry.register(Box::new(bytes.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            flags,
            registry,
            ops,
            bytes,
            latency,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.flags.profiling()
    }

    /// Start timing `op`. The latency is observed when the timer is dropped.
    pub fn start(&self, op: Op) -> Option<HistogramTimer> {
        self.is_enabled()
            .then(|| self.latency.with_label_values(&[op.as_str()]).start_timer())
    }

    /// Count one `op` on `device` moving `bytes`.
    pub fn record(&self, op: Op, device: usize, bytes: u64) {
        if !self.is_enabled() {
            return;
        }
        let device = device.to_string();
        let labels = [op.as_str(), device.as_str()];
        self.ops.with_label_values(&labels).inc();
        self.bytes.with_label_values(&labels).inc_by(bytes);
    }

    /// Number of `op` recorded on `device`.
    pub fn op_count(&self, op: Op, device: usize) -> u64 {
        let device = device.to_string();
        self.ops.with_label_values(&[op.as_str(), device.as_str()]).get()
    }

    /// Bytes recorded for `op` on `device`.
    pub fn op_bytes(&self, op: Op, device: usize) -> u64 {
        let device = device.to_string();
        self.bytes.with_label_values(&[op.as_str(), device.as_str()]).get()
    }

    /// Drop everything recorded so far.
    pub fn clear(&self) {
        self.ops.reset();
        self.bytes.reset();
        self.latency.reset();
    }

    /// Prometheus text exposition of everything recorded.
    pub fn render(&self) -> Result<String, ProfilerError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

impl std::fmt::Debug for Profiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profiler")
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}
