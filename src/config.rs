//! Runtime configuration for rdna-stack.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Device visibility, allocator tuning, and the debug/profiling switches live here.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gpu::driver::{rx6800xt_info, RawDeviceInfo};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "rdna-stack", about = "RDNA device and memory diagnostics")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "rdna.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the full diagnostics report (default).
    Diagnostics,

    /// Print library, driver, and device information.
    SystemInfo,

    /// Print allocator statistics for one device (default: all devices).
    MemoryInfo {
        #[arg(short, long)]
        device: Option<usize>,
    },

    /// Allocate and free a few blocks, then print the memory summary.
    Exercise {
        /// Device string, e.g. "rdna:0" or "/device:RDNA:1".
        #[arg(short, long, default_value = "rdna:0")]
        device: String,

        /// Size of each allocation in bytes.
        #[arg(short, long, default_value_t = 1 << 20)]
        bytes: u64,

        /// Number of allocations.
        #[arg(short = 'n', long, default_value_t = 4)]
        count: usize,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device discovery settings.
    pub devices: DeviceConfig,

    /// Caching allocator tuning.
    pub allocator: AllocatorConfig,

    /// Logging switches.
    pub logging: LoggingConfig,

    /// Profiling switches.
    pub profiling: ProfilingConfig,
}

/// Device discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Physical ordinals to expose, in order. `None` exposes every device.
    pub visible: Option<Vec<usize>>,

    /// Devices reported by the simulated driver.
    pub simulated: Vec<SimulatedDeviceConfig>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            visible: None,
            simulated: vec![SimulatedDeviceConfig::default()],
        }
    }
}

/// One device exposed by the simulated driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedDeviceConfig {
    pub name: String,

    /// GCN architecture name, e.g. "gfx1030".
    pub arch: String,

    /// Numeric architecture code (the gfx number, e.g. 1030).
    pub arch_code: u32,

    /// Device memory in bytes.
    pub total_memory: u64,

    pub compute_units: u32,
    pub max_workgroup_size: u32,
    pub wavefront_size: u32,
}

impl Default for SimulatedDeviceConfig {
    fn default() -> Self {
        let info = rx6800xt_info();
        Self {
            name: info.name,
            arch: info.gcn_arch_name,
            arch_code: info.arch_code,
            total_memory: info.total_global_mem,
            compute_units: info.multi_processor_count,
            max_workgroup_size: info.max_threads_per_block,
            wavefront_size: info.warp_size,
        }
    }
}

impl SimulatedDeviceConfig {
    /// Convert to the driver's raw form. The ordinal is assigned by the driver.
    pub fn to_raw(&self) -> RawDeviceInfo {
        RawDeviceInfo {
            ordinal: 0,
            name: self.name.clone(),
            gcn_arch_name: self.arch.clone(),
            arch_code: self.arch_code,
            total_global_mem: self.total_memory,
            multi_processor_count: self.compute_units,
            max_threads_per_block: self.max_workgroup_size,
            warp_size: self.wavefront_size,
            ..rx6800xt_info()
        }
    }
}

/// Caching allocator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Every request is rounded up to a multiple of this (power of two).
    pub alignment: u64,

    /// A reused free block is only split when the remainder is at least this large.
    pub min_split_bytes: u64,

    /// Per-device cap on cached (free but retained) bytes.
    pub cache_size_limit: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            alignment: 256,
            min_split_bytes: 512,
            cache_size_limit: 1024 * 1024 * 1024, // 1 GB
        }
    }
}

/// Logging switches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit per-allocation debug events.
    pub debug: bool,
}

/// Profiling switches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilingConfig {
    /// Record allocator operation counters and latencies.
    pub enabled: bool,
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let config: Config =
                serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let align = self.allocator.alignment;
        if align == 0 || !align.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "allocator.alignment must be a non-zero power of two, got {align}"
            )));
        }
        if let Some(visible) = &self.devices.visible {
            let mut seen = std::collections::HashSet::new();
            if let Some(dup) = visible.iter().find(|&&i| !seen.insert(i)) {
                return Err(ConfigError::Invalid(format!(
                    "devices.visible lists device {dup} more than once"
                )));
            }
        }
        Ok(())
    }
}

/// Process-wide switches that can be flipped while the runtime is live.
#[derive(Debug, Default)]
pub struct RuntimeFlags {
    debug_logging: AtomicBool,
    profiling: AtomicBool,
}

impl RuntimeFlags {
    pub fn from_config(config: &Config) -> Self {
        Self {
            debug_logging: AtomicBool::new(config.logging.debug),
            profiling: AtomicBool::new(config.profiling.enabled),
        }
    }

    pub fn debug_logging(&self) -> bool {
        self.debug_logging.load(Ordering::Relaxed)
    }

    pub fn set_debug_logging(&self, enabled: bool) {
        self.debug_logging.store(enabled, Ordering::Relaxed);
    }

    pub fn profiling(&self) -> bool {
        self.profiling.load(Ordering::Relaxed)
    }

    pub fn set_profiling(&self, enabled: bool) {
        self.profiling.store(enabled, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.allocator.alignment, 256);
        assert_eq!(cfg.allocator.cache_size_limit, 1 << 30);
        assert_eq!(cfg.devices.simulated.len(), 1);
        assert!(cfg.devices.visible.is_none());
        assert!(!cfg.logging.debug);
        assert!(!cfg.profiling.enabled);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{ "allocator": { "alignment": 512 } }"#).unwrap();
        assert_eq!(cfg.allocator.alignment, 512);
        assert_eq!(cfg.allocator.min_split_bytes, 512);
        assert_eq!(cfg.devices.simulated[0].arch, "gfx1030");
    }

    #[test]
    fn test_validate_rejects_bad_alignment() {
        let mut cfg = Config::default();
        cfg.allocator.alignment = 300;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_visible() {
        let mut cfg = Config::default();
        cfg.devices.visible = Some(vec![1, 0, 1]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_flags_follow_config() {
        let mut cfg = Config::default();
        cfg.profiling.enabled = true;
        let flags = RuntimeFlags::from_config(&cfg);
        assert!(flags.profiling());
        assert!(!flags.debug_logging());

        flags.set_debug_logging(true);
        flags.set_profiling(false);
        assert!(flags.debug_logging());
        assert!(!flags.profiling());
    }

    #[test]
    fn test_simulated_to_raw() {
        let sim = SimulatedDeviceConfig {
            name: "AMD Radeon RX 7900 XTX".to_string(),
            arch: "gfx1100".to_string(),
            arch_code: 1100,
            total_memory: 24 << 30,
            compute_units: 96,
            ..Default::default()
        };
        let raw = sim.to_raw();
        assert_eq!(raw.gcn_arch_name, "gfx1100");
        assert_eq!(raw.total_global_mem, 24 << 30);
        assert_eq!(raw.multi_processor_count, 96);
    }
}
