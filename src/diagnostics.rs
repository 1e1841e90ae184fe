//! Diagnostics reporter.
//!
//! Read-only views over a [`Runtime`]: library and device information,
//! per-device allocator statistics, and a combined report. Nothing here
//! fails; errors raised while gathering information become report lines.

use std::fmt::Write as _;
use std::io;

use serde::Serialize;
use tracing::warn;

use crate::gpu::allocator::{format_bytes, AllocatorStats};
use crate::gpu::device::{Capability, DeviceDescriptor};
use crate::gpu::driver::MemInfo;
use crate::runtime::Runtime;

/// Cargo profile the library was built with.
pub const BUILD_PROFILE: &str = env!("RDNA_BUILD_PROFILE");

const REPORT_HEADER: &str = "=== RDNA Stack Diagnostics ===";
const REPORT_FOOTER: &str = "=== Diagnostics Complete ===";

/// Machine-readable form of the report.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    pub library_version: String,
    pub build_profile: String,
    pub driver: String,
    pub runtime_version: Option<String>,
    pub driver_version: Option<String>,
    pub current_device: Option<usize>,
    pub debug_logging: bool,
    pub profiling: bool,
    pub devices: Vec<DeviceSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub descriptor: DeviceDescriptor,
    pub compatible: bool,
    pub stats: Option<AllocatorStats>,
    pub mem_info: Option<MemInfo>,
}

pub struct Diagnostics<'a> {
    runtime: &'a Runtime,
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}

impl<'a> Diagnostics<'a> {
    pub fn new(runtime: &'a Runtime) -> Self {
        Self { runtime }
    }

    /// Library, driver, and per-device information.
    pub fn system_info(&self) -> String {
        let rt = self.runtime;
        let driver = rt.driver();
        let mut out = String::new();

        let _ = writeln!(out, "RDNA Stack System Information:");
        let _ = writeln!(out, "  Library Version: {}", crate::VERSION);
        let _ = writeln!(out, "  Build Profile: {BUILD_PROFILE}");
        let _ = writeln!(out, "  Driver: {}", driver.name());
        match driver.runtime_version() {
            Ok(v) => {
                let _ = writeln!(out, "  Runtime Version: {v}");
            }
            Err(e) => {
                let _ = writeln!(out, "  Runtime Version: Error - {e}");
            }
        }
        match driver.driver_version() {
            Ok(v) => {
                let _ = writeln!(out, "  Driver Version: {v}");
            }
            Err(e) => {
                let _ = writeln!(out, "  Driver Version: Error - {e}");
            }
        }
        let _ = writeln!(out, "  RDNA Supported: {}", yes_no(rt.is_available()));
        let _ = writeln!(out, "  Device Count: {}", rt.device_count());
        match rt.current_device() {
            Ok(d) => {
                let _ = writeln!(out, "  Current Device: {d}");
            }
            Err(_) => {
                let _ = writeln!(out, "  Current Device: none");
            }
        }
        let _ = writeln!(
            out,
            "  Debug Logging: {}, Profiling: {}",
            yes_no(rt.flags().debug_logging()),
            yes_no(rt.flags().profiling())
        );

        for index in 0..rt.device_count() {
            match rt.get_device_properties(index) {
                Ok(d) => write_device(&mut out, d),
                Err(e) => {
                    let _ = writeln!(out, "  Device {index}: Error - {e}");
                }
            }
        }
        out
    }

    /// Allocator statistics and driver memory for one device, or all devices.
    pub fn memory_info(&self, device: Option<usize>) -> String {
        let rt = self.runtime;
        let targets: Vec<usize> = match device {
            Some(d) => vec![d],
            None => (0..rt.device_count()).collect(),
        };

        let mut out = String::new();
        if targets.is_empty() {
            let _ = writeln!(out, "No devices available.");
        }
        for (i, d) in targets.into_iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let _ = writeln!(out, "Memory Information for Device {d}:");
            match rt.memory_stats(Some(d)) {
                Ok(stats) => write_stats(&mut out, &stats),
                Err(e) => {
                    let _ = writeln!(out, "  Error - {e}");
                    continue;
                }
            }
            let _ = writeln!(
                out,
                "  Cache Limit: {}",
                format_bytes(rt.memory_cache_limit())
            );
            match rt.mem_info(d) {
                Ok(info) => {
                    let _ = writeln!(out, "  Total Device Memory: {}", format_bytes(info.total));
                    let _ = writeln!(out, "  Free Device Memory: {}", format_bytes(info.free));
                    let _ = writeln!(out, "  Used Device Memory: {}", format_bytes(info.used()));
                }
                Err(e) => {
                    let _ = writeln!(out, "  Device Memory: Error - {e}");
                }
            }
        }
        out
    }

    /// System information followed by memory information for every device,
    /// plus profiler output when profiling is on.
    pub fn report(&self) -> String {
        let rt = self.runtime;
        let mut out = String::new();
        let _ = writeln!(out, "{REPORT_HEADER}");
        out.push_str(&self.system_info());
        out.push('\n');

        for d in 0..rt.device_count() {
            out.push_str(&self.memory_info(Some(d)));
            out.push('\n');
        }

        if rt.profiler().is_enabled() {
            let _ = writeln!(out, "Profiler:");
            match rt.profiler().render() {
                Ok(text) if text.is_empty() => {
                    let _ = writeln!(out, "  (no samples)");
                }
                Ok(text) => out.push_str(&text),
                Err(e) => {
                    let _ = writeln!(out, "  Error - {e}");
                }
            }
            out.push('\n');
        }

        let _ = writeln!(out, "{REPORT_FOOTER}");
        out
    }

    /// Write the report to `out`. Write failures are logged, not returned.
    pub fn run<W: io::Write>(&self, out: &mut W) {
        let report = self.report();
        if let Err(e) = out.write_all(report.as_bytes()).and_then(|()| out.flush()) {
            warn!(error = %e, "Failed to write diagnostics report");
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let rt = self.runtime;
        let driver = rt.driver();
        let devices = rt
            .devices()
            .iter()
            .map(|d| DeviceSnapshot {
                descriptor: d.clone(),
                compatible: d.is_compatible(),
                stats: rt.memory_stats(Some(d.index)).ok(),
                mem_info: rt.mem_info(d.index).ok(),
            })
            .collect();

        DiagnosticsSnapshot {
            library_version: crate::VERSION.to_string(),
            build_profile: BUILD_PROFILE.to_string(),
            driver: driver.name().to_string(),
            runtime_version: driver.runtime_version().ok(),
            driver_version: driver.driver_version().ok(),
            current_device: rt.current_device().ok(),
            debug_logging: rt.flags().debug_logging(),
            profiling: rt.flags().profiling(),
            devices,
        }
    }
}

fn write_device(out: &mut String, d: &DeviceDescriptor) {
    let _ = writeln!(out, "  Device {}: {}", d.index, d.name);
    let _ = writeln!(out, "    Architecture: {} (RDNA: {})", d.architecture, yes_no(d.is_rdna()));
    let _ = writeln!(out, "    Memory: {}", format_bytes(d.total_memory_bytes));
    let _ = writeln!(out, "    Compute Units: {}", d.compute_unit_count);
    let _ = writeln!(
        out,
        "    Workgroup/Wavefront: {}/{}",
        d.max_workgroup_size, d.wavefront_size
    );
    let _ = writeln!(out, "    FP16 Support: {}", yes_no(d.supports(Capability::Fp16)));
    let _ = writeln!(out, "    BF16 Support: {}", yes_no(d.supports(Capability::Bf16)));
    let _ = writeln!(out, "    Compatible: {}", yes_no(d.is_compatible()));
}

fn write_stats(out: &mut String, stats: &AllocatorStats) {
    let _ = writeln!(out, "  Allocated: {}", format_bytes(stats.allocated_bytes));
    let _ = writeln!(out, "  Allocated Blocks: {}", stats.allocated_blocks);
    let _ = writeln!(out, "  Cached: {}", format_bytes(stats.cached_bytes));
    let _ = writeln!(out, "  Cached Blocks: {}", stats.cached_blocks);
    let _ = writeln!(out, "  Max Allocated: {}", format_bytes(stats.peak_allocated_bytes));
    let _ = writeln!(out, "  Reserved: {}", format_bytes(stats.reserved_bytes));
    let _ = writeln!(out, "  Total Allocations: {}", stats.total_allocations);
    let _ = writeln!(out, "  Total Frees: {}", stats.total_frees);
    let _ = writeln!(out, "  Cache Hits: {}", stats.cache_hits);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::gpu::driver::SimulatedDriver;

    fn runtime(devices: usize) -> Runtime {
        let rt = Runtime::new(Arc::new(SimulatedDriver::rx6800xt(devices)), Config::default()).unwrap();
        rt.initialize();
        rt
    }

    #[test]
    fn test_system_info_lists_devices() {
        let rt = runtime(2);
        let info = rt.diagnostics().system_info();
        assert!(info.contains("Device Count: 2"));
        assert!(info.contains("Device 1: AMD Radeon RX 6800 XT"));
        assert!(info.contains("Architecture: gfx1030"));
        assert!(info.contains("FP16 Support: Yes"));
        assert!(info.contains("BF16 Support: Yes"));
        assert!(info.contains("Runtime Version: 6.0.0"));
    }

    #[test]
    fn test_memory_info_bad_device_is_a_line() {
        let rt = runtime(1);
        let info = rt.diagnostics().memory_info(Some(7));
        assert!(info.contains("Memory Information for Device 7:"));
        assert!(info.contains("Error - "));
    }

    #[test]
    fn test_report_without_devices() {
        let rt = runtime(0);
        let report = rt.diagnostics().report();
        assert!(report.starts_with(REPORT_HEADER));
        assert!(report.trim_end().ends_with(REPORT_FOOTER));
        assert!(report.contains("RDNA Supported: No"));
        assert!(report.contains("Current Device: none"));
    }

    #[test]
    fn test_report_includes_profiler_when_enabled() {
        let rt = runtime(1);
        rt.set_profiling(true);
        let a = rt.allocate_on(0, 4096).unwrap();
        rt.free(a).unwrap();

        let report = rt.diagnostics().report();
        assert!(report.contains("Profiler:"));
        assert!(report.contains("rdna_allocator_ops_total"));
    }

    #[test]
    fn test_snapshot_serializes() {
        let rt = runtime(1);
        let snapshot = rt.diagnostics().snapshot();
        assert_eq!(snapshot.devices.len(), 1);
        assert!(snapshot.devices[0].compatible);
        assert_eq!(snapshot.current_device, Some(0));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["devices"][0]["descriptor"]["architecture"], "gfx1030");
    }
}
