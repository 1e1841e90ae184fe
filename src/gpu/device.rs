//! GPU device discovery and information.
//!
//! The registry enumerates devices through the [`Driver`] exactly once and
//! hands out immutable [`DeviceDescriptor`]s afterwards. When no device is
//! found the registry is simply empty and callers take their CPU path.

use std::collections::BTreeSet;
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::gpu::driver::{Driver, DriverError, RawDeviceInfo};
use crate::gpu::lock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("No RDNA devices available")]
    Unavailable,

    #[error("Device index {index} out of range (device count {count})")]
    OutOfRange { index: usize, count: usize },

    #[error("Device registry already initialized; visibility must be set before discovery")]
    AlreadyInitialized,

    #[error("Device discovery failed: {0}")]
    Discovery(#[from] DriverError),
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::Unavailable => ErrorKind::Unavailable,
            DeviceError::OutOfRange { .. } => ErrorKind::OutOfRange,
            DeviceError::AlreadyInitialized => ErrorKind::InvalidArgument,
            DeviceError::Discovery(_) => ErrorKind::Internal,
        }
    }
}

/// Optional hardware features a device may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Half-precision arithmetic.
    Fp16,
    /// Brain-float16 arithmetic.
    Bf16,
    /// Dedicated matrix units. RDNA has none.
    MatrixCores,
    /// Host/device unified addressing.
    UnifiedMemory,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Fp16 => write!(f, "fp16"),
            Capability::Bf16 => write!(f, "bf16"),
            Capability::MatrixCores => write!(f, "matrix_cores"),
            Capability::UnifiedMemory => write!(f, "unified_memory"),
        }
    }
}

/// Element type of a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    F32,
    F16,
    Bf16,
}

impl DataType {
    /// Bytes per element.
    pub fn size_bytes(&self) -> u64 {
        let size = match self {
            DataType::F32 => std::mem::size_of::<f32>(),
            DataType::F16 => std::mem::size_of::<half::f16>(),
            DataType::Bf16 => std::mem::size_of::<half::bf16>(),
        };
        size as u64
    }

    /// The capability a device needs to operate on this type.
    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            DataType::F32 => None,
            DataType::F16 => Some(Capability::Fp16),
            DataType::Bf16 => Some(Capability::Bf16),
        }
    }
}

/// Lowest architecture code with native FP16 (GCN3 onwards, so every RDNA part).
const FP16_MIN_ARCH: u32 = 803;

/// Lowest architecture code with BF16 (gfx9 onwards).
const BF16_MIN_ARCH: u32 = 900;

/// Minimum compute units for a device to be considered usable.
const MIN_COMPUTE_UNITS: u32 = 4;

/// Immutable description of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Logical index, in `[0, device_count)`.
    pub index: usize,

    /// Ordinal as seen by the driver (differs from `index` when a
    /// visibility filter is active).
    pub physical_index: usize,

    /// Device name (e.g., "AMD Radeon RX 6800 XT").
    pub name: String,

    /// GCN architecture name (e.g., "gfx1030").
    pub architecture: String,

    pub arch_code: u32,

    /// Total device memory in bytes.
    pub total_memory_bytes: u64,

    pub compute_unit_count: u32,
    pub max_workgroup_size: u32,
    pub wavefront_size: u32,
    pub pci_bus_id: u32,
    pub pci_device_id: u32,

    /// Supported optional features.
    pub capabilities: BTreeSet<Capability>,
}

impl DeviceDescriptor {
    /// Build a descriptor from raw driver info, deriving capability flags
    /// from the architecture code.
    pub fn from_raw(index: usize, raw: &RawDeviceInfo) -> Self {
        let mut capabilities = BTreeSet::new();
        if raw.arch_code >= FP16_MIN_ARCH {
            capabilities.insert(Capability::Fp16);
        }
        if raw.arch_code >= BF16_MIN_ARCH {
            capabilities.insert(Capability::Bf16);
        }
        if raw.total_global_mem > 0 {
            capabilities.insert(Capability::UnifiedMemory);
        }

        Self {
            index,
            physical_index: raw.ordinal,
            name: raw.name.clone(),
            architecture: raw.gcn_arch_name.clone(),
            arch_code: raw.arch_code,
            total_memory_bytes: raw.total_global_mem,
            compute_unit_count: raw.multi_processor_count,
            max_workgroup_size: raw.max_threads_per_block,
            wavefront_size: raw.warp_size,
            pci_bus_id: raw.pci_bus_id,
            pci_device_id: raw.pci_device_id,
            capabilities,
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Whether the architecture belongs to the RDNA family (gfx10xx / gfx11xx).
    pub fn is_rdna(&self) -> bool {
        self.architecture.starts_with("gfx10") || self.architecture.starts_with("gfx11")
    }

    /// Whether the device meets the minimum feature set the stack relies on.
    pub fn is_compatible(&self) -> bool {
        self.supports(Capability::Fp16) && self.compute_unit_count >= MIN_COMPUTE_UNITS
    }
}

/// Enumerated devices, populated once.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: OnceLock<Vec<DeviceDescriptor>>,

    /// Physical ordinals to expose. Only consulted during discovery.
    visible: Mutex<Option<Vec<usize>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry that will only expose the given physical ordinals.
    pub fn with_visible(visible: Option<Vec<usize>>) -> Self {
        Self {
            devices: OnceLock::new(),
            visible: Mutex::new(visible),
        }
    }

    /// Restrict discovery to the given physical ordinals, in order.
    pub fn set_visible_devices(&self, visible: Vec<usize>) -> Result<(), DeviceError> {
        let mut guard = lock(&self.visible);
        if self.devices.get().is_some() {
            return Err(DeviceError::AlreadyInitialized);
        }
        *guard = Some(visible);
        Ok(())
    }

    /// Enumerate devices through the driver. Only the first call does any
    /// work; later calls return the existing count.
    ///
    /// A failing enumeration still completes discovery with zero devices so
    /// the registry reports itself unavailable rather than retrying.
    pub fn discover(&self, driver: &dyn Driver) -> Result<usize, DeviceError> {
        let mut failure = None;

        let devices = self.devices.get_or_init(|| {
            let visible = lock(&self.visible).clone();
            match driver.enumerate_devices() {
                Ok(raw) => build_descriptors(&raw, visible.as_deref()),
                Err(e) => {
                    warn!(driver = driver.name(), error = %e, "Device enumeration failed");
                    failure = Some(e);
                    Vec::new()
                }
            }
        });

        if let Some(e) = failure {
            return Err(DeviceError::Discovery(e));
        }
        Ok(devices.len())
    }

    /// Whether discovery has completed.
    pub fn is_initialized(&self) -> bool {
        self.devices.get().is_some()
    }

    /// True iff at least one device was discovered.
    pub fn is_available(&self) -> bool {
        self.device_count() > 0
    }

    /// Number of discovered devices; 0 before discovery.
    pub fn device_count(&self) -> usize {
        self.devices.get().map_or(0, Vec::len)
    }

    /// All descriptors, ordered by logical index.
    pub fn devices(&self) -> &[DeviceDescriptor] {
        self.devices.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Descriptor for a logical index.
    pub fn get(&self, index: usize) -> Result<&DeviceDescriptor, DeviceError> {
        self.devices().get(index).ok_or(DeviceError::OutOfRange {
            index,
            count: self.device_count(),
        })
    }

    /// Fail with `OutOfRange` unless `index < device_count()`.
    pub fn check_index(&self, index: usize) -> Result<(), DeviceError> {
        self.get(index).map(|_| ())
    }

    /// Whether the device at `index` supports `capability`. Unknown indices
    /// support nothing.
    pub fn check_capability(&self, index: usize, capability: Capability) -> bool {
        self.get(index).is_ok_and(|d| d.supports(capability))
    }
}

fn build_descriptors(raw: &[RawDeviceInfo], visible: Option<&[usize]>) -> Vec<DeviceDescriptor> {
    let selected: Vec<&RawDeviceInfo> = match visible {
        None => raw.iter().collect(),
        Some(ordinals) => ordinals
            .iter()
            .filter_map(|&ordinal| {
                let found = raw.iter().find(|r| r.ordinal == ordinal);
                if found.is_none() {
                    warn!(ordinal, "Visible device does not exist, skipping");
                }
                found
            })
            .collect(),
    };

    let devices: Vec<DeviceDescriptor> = selected
        .into_iter()
        .enumerate()
        .map(|(index, r)| DeviceDescriptor::from_raw(index, r))
        .collect();

    if devices.is_empty() {
        info!("No RDNA devices found, running in CPU-only mode");
    }
    for d in &devices {
        info!(
            index = d.index,
            physical = d.physical_index,
            name = %d.name,
            arch = %d.architecture,
            memory = d.total_memory_bytes,
            compute_units = d.compute_unit_count,
            "Discovered device"
        );
    }
    devices
}
