//! Process-wide runtime state.
//!
//! A [`Runtime`] owns the device registry, the current-device state, and the
//! caching allocator for one driver. Nothing happens at construction time;
//! the host calls [`Runtime::initialize`] once to run discovery and build the
//! per-device pools. Applications that want a single shared instance use
//! [`init_global`] and [`global`].

use std::sync::{Arc, Mutex, OnceLock};

use tracing::{info, warn};

use crate::config::{AllocatorConfig, Config, RuntimeFlags};
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::gpu::allocator::{Allocation, AllocationInfo, AllocatorError, AllocatorStats, CachingAllocator};
use crate::gpu::context::{CurrentDevice, DeviceGuard, DeviceSpec};
use crate::gpu::device::{Capability, DataType, DeviceDescriptor, DeviceError, DeviceRegistry};
use crate::gpu::driver::{Driver, MemInfo, SimulatedDriver};
use crate::gpu::lock;
use crate::profiler::Profiler;

pub struct Runtime {
    config: Config,
    driver: Arc<dyn Driver>,
    registry: DeviceRegistry,
    current: CurrentDevice,
    allocator: OnceLock<CachingAllocator>,
    flags: Arc<RuntimeFlags>,
    profiler: Arc<Profiler>,

    /// Per-device cache limit applied to new and existing pools. Held while
    /// the value is pushed to the pools.
    cache_limit: Mutex<u64>,
}

impl Runtime {
    /// Create an uninitialized runtime on top of `driver`.
    pub fn new(driver: Arc<dyn Driver>, config: Config) -> Result<Self> {
        config.validate()?;
        let flags = Arc::new(RuntimeFlags::from_config(&config));
        let profiler = Arc::new(Profiler::new(flags.clone())?);

        Ok(Self {
            registry: DeviceRegistry::with_visible(config.devices.visible.clone()),
            current: CurrentDevice::new(),
            allocator: OnceLock::new(),
            cache_limit: Mutex::new(config.allocator.cache_size_limit),
            driver,
            flags,
            profiler,
            config,
        })
    }

    /// Create a runtime backed by the simulated driver described in `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let driver = Arc::new(SimulatedDriver::from_config(&config.devices.simulated));
        Self::new(driver, config)
    }

    /// Discover devices and set up allocator pools. Only the first call does
    /// any work; returns the device count.
    ///
    /// A failing driver leaves the runtime initialized with no devices.
    pub fn initialize(&self) -> usize {
        let allocator = self.allocator.get_or_init(|| {
            // Enumeration errors are logged by the registry.
            let _ = self.registry.discover(self.driver.as_ref());
            self.current.reset(self.registry.device_count());

            let config = AllocatorConfig {
                cache_size_limit: *lock(&self.cache_limit),
                ..self.config.allocator.clone()
            };
            info!(
                driver = self.driver.name(),
                devices = self.registry.device_count(),
                alignment = config.alignment,
                cache_limit = config.cache_size_limit,
                "Runtime initialized"
            );
            CachingAllocator::new(
                self.driver.clone(),
                self.registry.devices(),
                &config,
                self.flags.clone(),
                self.profiler.clone(),
            )
        });

        // The limit may have changed while the pools were being built.
        let limit = lock(&self.cache_limit);
        if let Err(e) = allocator.set_cache_limit(None, *limit) {
            warn!(limit = *limit, error = %e, "Failed to apply memory cache limit");
        }
        self.registry.device_count()
    }

    pub fn is_initialized(&self) -> bool {
        self.allocator.get().is_some()
    }

    fn allocator(&self) -> std::result::Result<&CachingAllocator, DeviceError> {
        self.allocator.get().ok_or(DeviceError::Unavailable)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn flags(&self) -> &RuntimeFlags {
        &self.flags
    }

    pub fn diagnostics(&self) -> Diagnostics<'_> {
        Diagnostics::new(self)
    }

    // Device registry

    pub fn is_available(&self) -> bool {
        self.registry.is_available()
    }

    pub fn device_count(&self) -> usize {
        self.registry.device_count()
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        self.registry.devices()
    }

    pub fn get_device_properties(&self, index: usize) -> Result<&DeviceDescriptor> {
        Ok(self.registry.get(index)?)
    }

    pub fn check_capability(&self, index: usize, capability: Capability) -> bool {
        self.registry.check_capability(index, capability)
    }

    /// Restrict discovery to the given physical ordinals. Must be called
    /// before [`Runtime::initialize`].
    pub fn set_visible_devices(&self, visible: Vec<usize>) -> Result<()> {
        Ok(self.registry.set_visible_devices(visible)?)
    }

    // Current device

    /// The active device; `Unavailable` when no device was discovered.
    pub fn current_device(&self) -> Result<usize> {
        Ok(self.current.get().ok_or(DeviceError::Unavailable)?)
    }

    /// Make `index` the active device, returning the previous one.
    pub fn set_device(&self, index: usize) -> Result<usize> {
        Ok(self.current.set(&self.registry, index)?)
    }

    /// Enter a device scope from a device string such as `"rdna:1"` or
    /// `"/device:RDNA:0"`. A malformed string fails before any state changes.
    pub fn device(&self, spec: &str) -> Result<DeviceGuard<'_>> {
        let spec: DeviceSpec = spec.parse()?;
        self.device_index(spec.index)
    }

    /// Enter a device scope by index.
    pub fn device_index(&self, index: usize) -> Result<DeviceGuard<'_>> {
        Ok(self.current.enter(&self.registry, index)?)
    }

    /// Run `f` with `index` as the current device, restoring the previous
    /// device afterwards (also when `f` panics).
    pub fn with_device<R>(&self, index: usize, f: impl FnOnce() -> R) -> Result<R> {
        let _guard = self.device_index(index)?;
        Ok(f())
    }

    fn resolve(&self, device: Option<usize>) -> Result<usize> {
        match device {
            Some(d) => Ok(d),
            None => self.current_device(),
        }
    }

    // Memory

    /// Allocate on the current device.
    pub fn allocate(&self, size: u64) -> Result<Allocation> {
        let device = self.current_device()?;
        self.allocate_on(device, size)
    }

    pub fn allocate_on(&self, device: usize, size: u64) -> Result<Allocation> {
        Ok(self.allocator()?.allocate(device, size)?)
    }

    /// Allocate room for `elements` values of `dtype` on the current device.
    pub fn allocate_tensor(&self, dtype: DataType, elements: u64) -> Result<Allocation> {
        let device = self.current_device()?;
        if let Some(capability) = dtype.required_capability() {
            if !self.check_capability(device, capability) {
                return Err(AllocatorError::InvalidArgument(format!(
                    "device {device} does not support {capability} tensors"
                ))
                .into());
            }
        }
        let bytes = elements.checked_mul(dtype.size_bytes()).ok_or_else(|| {
            AllocatorError::InvalidArgument(format!(
                "{elements} elements of {dtype:?} overflow a 64-bit size"
            ))
        })?;
        self.allocate_on(device, bytes)
    }

    pub fn free(&self, allocation: Allocation) -> Result<()> {
        Ok(self.allocator()?.free(allocation)?)
    }

    pub fn allocation_info(&self, device_ptr: u64) -> Option<AllocationInfo> {
        self.allocator.get()?.allocation_info(device_ptr)
    }

    /// Statistics for `device`, or the current device when `None`.
    pub fn memory_stats(&self, device: Option<usize>) -> Result<AllocatorStats> {
        let device = self.resolve(device)?;
        Ok(self.allocator()?.stats(device)?)
    }

    pub fn memory_allocated(&self, device: Option<usize>) -> Result<u64> {
        Ok(self.memory_stats(device)?.allocated_bytes)
    }

    pub fn memory_cached(&self, device: Option<usize>) -> Result<u64> {
        Ok(self.memory_stats(device)?.cached_bytes)
    }

    pub fn max_memory_allocated(&self, device: Option<usize>) -> Result<u64> {
        Ok(self.memory_stats(device)?.peak_allocated_bytes)
    }

    pub fn reset_peak_memory_stats(&self, device: Option<usize>) -> Result<()> {
        let device = self.resolve(device)?;
        Ok(self.allocator()?.reset_peak_stats(device)?)
    }

    /// Release cached memory on `device`, or on every device when `None`.
    /// Never fails; returns the bytes handed back to the driver.
    pub fn empty_cache(&self, device: Option<usize>) -> u64 {
        self.allocator
            .get()
            .map_or(0, |allocator| allocator.empty_cache(device))
    }

    pub fn memory_summary(&self, device: Option<usize>) -> Result<String> {
        Ok(self.allocator()?.memory_summary(device)?)
    }

    /// Copy host bytes into `allocation`, starting `offset` bytes in.
    pub fn copy_to_device(&self, allocation: &Allocation, offset: u64, data: &[u8]) -> Result<()> {
        Ok(self.allocator()?.copy_to_device(allocation, offset, data)?)
    }

    /// Fill `out` from `allocation`, starting `offset` bytes in.
    pub fn copy_to_host(&self, allocation: &Allocation, offset: u64, out: &mut [u8]) -> Result<()> {
        Ok(self.allocator()?.copy_to_host(allocation, offset, out)?)
    }

    /// Copy the first `size` bytes of `src` into `dst`, on the same or
    /// another device.
    pub fn copy_device(&self, dst: &Allocation, src: &Allocation, size: u64) -> Result<()> {
        Ok(self.allocator()?.copy_device(dst, src, size)?)
    }

    pub fn memset(&self, allocation: &Allocation, value: u8, size: u64) -> Result<()> {
        Ok(self.allocator()?.memset(allocation, value, size)?)
    }

    /// Free/total device memory as reported by the driver.
    pub fn mem_info(&self, device: usize) -> Result<MemInfo> {
        let physical = self.registry.get(device)?.physical_index;
        Ok(self.driver.mem_info(physical)?)
    }

    // Configuration toggles

    /// Cap cached bytes on every device.
    pub fn set_memory_cache_limit(&self, limit: u64) -> Result<()> {
        let mut current = lock(&self.cache_limit);
        *current = limit;
        if let Some(allocator) = self.allocator.get() {
            allocator.set_cache_limit(None, limit)?;
        }
        info!(limit, "Memory cache limit set");
        Ok(())
    }

    pub fn memory_cache_limit(&self) -> u64 {
        *lock(&self.cache_limit)
    }

    pub fn set_debug_logging(&self, enabled: bool) {
        self.flags.set_debug_logging(enabled);
    }

    pub fn set_profiling(&self, enabled: bool) {
        self.flags.set_profiling(enabled);
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("driver", &self.driver.name())
            .field("devices", &self.registry.device_count())
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

static GLOBAL: OnceLock<Runtime> = OnceLock::new();

/// Build and initialize the process-wide runtime. Later calls return the
/// existing instance and ignore `config`.
pub fn init_global(config: Config) -> Result<&'static Runtime> {
    if let Some(runtime) = GLOBAL.get() {
        return Ok(runtime);
    }
    let runtime = Runtime::from_config(config)?;
    let runtime = GLOBAL.get_or_init(|| runtime);
    runtime.initialize();
    Ok(runtime)
}

/// The process-wide runtime, if [`init_global`] has run.
pub fn global() -> Option<&'static Runtime> {
    GLOBAL.get()
}
