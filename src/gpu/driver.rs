//! Driver collaborator: device enumeration and raw device memory.
//!
//! The registry and the caching allocator only talk to the GPU through the
//! [`Driver`] trait. [`SimulatedDriver`] backs every build; it behaves like a
//! HIP runtime with a fixed set of devices and enforces per-device capacity so
//! out-of-memory paths can be exercised without hardware. Device contents are
//! kept in sparse host pages, so copies and fills round-trip real bytes.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SimulatedDeviceConfig;
use crate::gpu::lock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Driver out of memory on device {device}: requested {requested} bytes, {available} available")]
    OutOfMemory {
        device: usize,
        requested: u64,
        available: u64,
    },

    #[error("Invalid device ordinal {0}")]
    InvalidDevice(usize),

    #[error("Unknown driver handle {0:#x}")]
    InvalidHandle(u64),

    #[error("Device range {addr:#x}+{size} is not backed by a live allocation")]
    InvalidAddress { addr: u64, size: u64 },

    #[error("Driver error: {0}")]
    Other(String),
}

/// Raw device information as reported by the driver, before the registry
/// derives capability flags from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDeviceInfo {
    /// Physical ordinal as seen by the driver.
    pub ordinal: usize,

    /// Marketing name (e.g. "AMD Radeon RX 6800 XT").
    pub name: String,

    /// GCN architecture name (e.g. "gfx1030").
    pub gcn_arch_name: String,

    /// Numeric architecture code used for feature gating.
    pub arch_code: u32,

    pub total_global_mem: u64,
    pub multi_processor_count: u32,
    pub max_threads_per_block: u32,
    pub warp_size: u32,
    pub pci_bus_id: u32,
    pub pci_device_id: u32,
}

/// Opaque handle to a driver allocation. The value doubles as the device
/// address of the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverHandle(pub u64);

impl DriverHandle {
    pub fn addr(&self) -> u64 {
        self.0
    }
}

/// Free/total device memory as reported by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemInfo {
    pub free: u64,
    pub total: u64,
}

impl MemInfo {
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }
}

/// Primitives the core consumes from the GPU runtime.
pub trait Driver: Send + Sync {
    /// Short backend name for diagnostics.
    fn name(&self) -> &str;

    /// Enumerate every physical device.
    fn enumerate_devices(&self) -> Result<Vec<RawDeviceInfo>, DriverError>;

    /// Allocate `size` bytes on the device with the given physical ordinal.
    fn alloc(&self, device: usize, size: u64) -> Result<DriverHandle, DriverError>;

    /// Release a handle previously returned by [`Driver::alloc`].
    fn free(&self, handle: DriverHandle) -> Result<(), DriverError>;

    /// Return `size` bytes at `offset` within a live allocation to the device.
    /// The rest of the allocation stays mapped and the handle must still be
    /// passed to [`Driver::free`]. A released range is never readable again.
    fn release_range(&self, handle: DriverHandle, offset: u64, size: u64)
        -> Result<(), DriverError>;

    /// Copy host bytes to device address `dst`.
    fn copy_to_device(&self, dst: u64, data: &[u8]) -> Result<(), DriverError>;

    /// Copy `out.len()` bytes from device address `src` to the host.
    fn copy_to_host(&self, src: u64, out: &mut [u8]) -> Result<(), DriverError>;

    /// Copy `size` bytes between device addresses, possibly on different
    /// devices. Overlapping ranges behave like `memmove`.
    fn copy_device(&self, dst: u64, src: u64, size: u64) -> Result<(), DriverError> {
        let len = usize::try_from(size).map_err(|_| DriverError::InvalidAddress { addr: src, size })?;
        let mut staging = vec![0u8; len];
        self.copy_to_host(src, &mut staging)?;
        self.copy_to_device(dst, &staging)
    }

    /// Fill `size` bytes at device address `dst` with `value`.
    fn memset(&self, dst: u64, value: u8, size: u64) -> Result<(), DriverError>;

    /// Free/total memory on a device.
    fn mem_info(&self, device: usize) -> Result<MemInfo, DriverError>;

    /// Runtime version string (e.g. "6.0.0").
    fn runtime_version(&self) -> Result<String, DriverError>;

    /// Kernel driver version string.
    fn driver_version(&self) -> Result<String, DriverError>;
}

/// Base of the simulated device address space. Each device gets its own
/// 1 TiB window so addresses never collide across devices.
const SIM_ADDRESS_BASE: u64 = 0x7f00_0000_0000;
const SIM_DEVICE_WINDOW: u64 = 1 << 40;

/// Granularity of simulated device storage.
const SIM_PAGE_SIZE: u64 = 4096;

/// Driver-side bookkeeping for one simulated device.
#[derive(Debug)]
struct SimDevice {
    info: RawDeviceInfo,
    used: u64,
    next_addr: u64,
}

/// One live simulated allocation.
#[derive(Debug)]
struct SimAllocation {
    device: usize,
    size: u64,

    /// Ranges handed back through `release_range`, offset -> size.
    released: BTreeMap<u64, u64>,

    /// Written pages by page index. Missing pages read as zero.
    pages: HashMap<u64, Vec<u8>>,
}

impl SimAllocation {
    fn new(device: usize, size: u64) -> Self {
        Self {
            device,
            size,
            released: BTreeMap::new(),
            pages: HashMap::new(),
        }
    }

    fn released_bytes(&self) -> u64 {
        self.released.values().sum()
    }

    /// Whether `[offset, offset + size)` overlaps a released range.
    fn overlaps_released(&self, offset: u64, size: u64) -> bool {
        let end = offset + size;
        self.released
            .range(..end)
            .next_back()
            .is_some_and(|(&start, &len)| start + len > offset)
    }

    /// Visit `[offset, offset + len)` page by page as
    /// `(page, offset within page, position in range, chunk length)`.
    fn chunks(offset: u64, len: usize) -> impl Iterator<Item = (u64, usize, usize, usize)> {
        let mut done = 0usize;
        std::iter::from_fn(move || {
            if done == len {
                return None;
            }
            let pos = offset + done as u64;
            let within = (pos % SIM_PAGE_SIZE) as usize;
            let n = (SIM_PAGE_SIZE as usize - within).min(len - done);
            let chunk = (pos / SIM_PAGE_SIZE, within, done, n);
            done += n;
            Some(chunk)
        })
    }

    fn page_mut(&mut self, page: u64) -> &mut Vec<u8> {
        self.pages
            .entry(page)
            .or_insert_with(|| vec![0; SIM_PAGE_SIZE as usize])
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        for (page, within, at, n) in Self::chunks(offset, data.len()) {
            self.page_mut(page)[within..within + n].copy_from_slice(&data[at..at + n]);
        }
    }

    fn read(&self, offset: u64, out: &mut [u8]) {
        for (page, within, at, n) in Self::chunks(offset, out.len()) {
            match self.pages.get(&page) {
                Some(bytes) => out[at..at + n].copy_from_slice(&bytes[within..within + n]),
                None => out[at..at + n].fill(0),
            }
        }
    }

    fn fill(&mut self, offset: u64, value: u8, len: usize) {
        for (page, within, _, n) in Self::chunks(offset, len) {
            if value == 0 && n == SIM_PAGE_SIZE as usize {
                self.pages.remove(&page);
            } else if value != 0 || self.pages.contains_key(&page) {
                self.page_mut(page)[within..within + n].fill(value);
            }
        }
    }

    /// Drop pages lying entirely inside `[offset, offset + size)`.
    fn discard(&mut self, offset: u64, size: u64) {
        let end = offset + size;
        self.pages.retain(|&page, _| {
            let start = page * SIM_PAGE_SIZE;
            start < offset || start + SIM_PAGE_SIZE > end
        });
    }
}

/// A HIP-like driver that keeps all state in host memory.
pub struct SimulatedDriver {
    devices: Mutex<Vec<SimDevice>>,

    /// Live allocations by handle. Ordered so an address resolves to the
    /// allocation containing it.
    live: Mutex<BTreeMap<DriverHandle, SimAllocation>>,

    alloc_calls: AtomicU64,
    free_calls: AtomicU64,
}

impl SimulatedDriver {
    /// Create a driver exposing the given devices. Ordinals are reassigned
    /// from 0 in the order given.
    pub fn new(devices: Vec<RawDeviceInfo>) -> Self {
        let devices = devices
            .into_iter()
            .enumerate()
            .map(|(ordinal, mut info)| {
                info.ordinal = ordinal;
                SimDevice {
                    info,
                    used: 0,
                    next_addr: SIM_ADDRESS_BASE + ordinal as u64 * SIM_DEVICE_WINDOW,
                }
            })
            .collect();

        Self {
            devices: Mutex::new(devices),
            live: Mutex::new(BTreeMap::new()),
            alloc_calls: AtomicU64::new(0),
            free_calls: AtomicU64::new(0),
        }
    }

    /// A driver with no devices (CPU-only host).
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Build from configuration entries.
    pub fn from_config(devices: &[SimulatedDeviceConfig]) -> Self {
        Self::new(devices.iter().map(SimulatedDeviceConfig::to_raw).collect())
    }

    /// `count` identical RX 6800 XT boards (RDNA2, 16 GB, 72 CUs).
    pub fn rx6800xt(count: usize) -> Self {
        Self::new((0..count).map(|_| rx6800xt_info()).collect())
    }

    /// `count` small devices of `total_memory` bytes each, handy for
    /// exercising out-of-memory paths.
    pub fn with_capacity(count: usize, total_memory: u64) -> Self {
        Self::new(
            (0..count)
                .map(|_| RawDeviceInfo {
                    total_global_mem: total_memory,
                    ..rx6800xt_info()
                })
                .collect(),
        )
    }

    /// Number of `alloc` calls that reached the driver (successful or not).
    pub fn alloc_calls(&self) -> u64 {
        self.alloc_calls.load(Ordering::Relaxed)
    }

    /// Number of `free` calls that reached the driver.
    pub fn free_calls(&self) -> u64 {
        self.free_calls.load(Ordering::Relaxed)
    }

    /// Number of driver allocations currently outstanding.
    pub fn live_allocations(&self) -> usize {
        lock(&self.live).len()
    }

    /// Run `f` on the allocation holding `[addr, addr + size)` with the offset
    /// of `addr` inside it.
    fn with_range<R>(
        &self,
        addr: u64,
        size: u64,
        f: impl FnOnce(&mut SimAllocation, u64) -> R,
    ) -> Result<R, DriverError> {
        let invalid = DriverError::InvalidAddress { addr, size };
        let mut live = lock(&self.live);
        let Some((handle, alloc)) = live.range_mut(..=DriverHandle(addr)).next_back() else {
            return Err(invalid);
        };
        let offset = addr - handle.addr();
        let in_bounds = offset
            .checked_add(size)
            .is_some_and(|end| end <= alloc.size);
        if !in_bounds || alloc.overlaps_released(offset, size) {
            return Err(invalid);
        }
        Ok(f(alloc, offset))
    }

    /// Give released bytes back to the owning device's capacity.
    fn credit(&self, device: usize, bytes: u64) {
        let mut devices = lock(&self.devices);
        match devices.get_mut(device) {
            Some(dev) => dev.used = dev.used.saturating_sub(bytes),
            None => warn!(device, "Released memory for a device that no longer exists"),
        }
    }
}

/// Reference board used by the default configuration.
pub fn rx6800xt_info() -> RawDeviceInfo {
    RawDeviceInfo {
        ordinal: 0,
        name: "AMD Radeon RX 6800 XT".to_string(),
        gcn_arch_name: "gfx1030".to_string(),
        arch_code: 1030,
        total_global_mem: 16 * 1024 * 1024 * 1024, // 16 GB
        multi_processor_count: 72,
        max_threads_per_block: 1024,
        warp_size: 32,
        pci_bus_id: 3,
        pci_device_id: 0x73bf,
    }
}

impl Driver for SimulatedDriver {
    fn name(&self) -> &str {
        "simulated"
    }

    fn enumerate_devices(&self) -> Result<Vec<RawDeviceInfo>, DriverError> {
        Ok(lock(&self.devices).iter().map(|d| d.info.clone()).collect())
    }

    fn alloc(&self, device: usize, size: u64) -> Result<DriverHandle, DriverError> {
        self.alloc_calls.fetch_add(1, Ordering::Relaxed);

        let mut devices = lock(&self.devices);
        let dev = devices
            .get_mut(device)
            .ok_or(DriverError::InvalidDevice(device))?;

        let available = dev.info.total_global_mem.saturating_sub(dev.used);
        if size > available {
            debug!(device, requested = size, available, "Simulated driver out of memory");
            return Err(DriverError::OutOfMemory {
                device,
                requested: size,
                available,
            });
        }

        let handle = DriverHandle(dev.next_addr);
        dev.next_addr += size;
        dev.used += size;
        drop(devices);

        lock(&self.live).insert(handle, SimAllocation::new(device, size));
        Ok(handle)
    }

    fn free(&self, handle: DriverHandle) -> Result<(), DriverError> {
        self.free_calls.fetch_add(1, Ordering::Relaxed);

        let alloc = lock(&self.live)
            .remove(&handle)
            .ok_or(DriverError::InvalidHandle(handle.0))?;
        self.credit(alloc.device, alloc.size - alloc.released_bytes());
        Ok(())
    }

    fn release_range(
        &self,
        handle: DriverHandle,
        offset: u64,
        size: u64,
    ) -> Result<(), DriverError> {
        let device = {
            let mut live = lock(&self.live);
            let alloc = live
                .get_mut(&handle)
                .ok_or(DriverError::InvalidHandle(handle.0))?;
            let in_bounds = offset
                .checked_add(size)
                .is_some_and(|end| end <= alloc.size);
            if size == 0 || !in_bounds || alloc.overlaps_released(offset, size) {
                return Err(DriverError::InvalidAddress {
                    addr: handle.addr() + offset,
                    size,
                });
            }
            alloc.released.insert(offset, size);
            alloc.discard(offset, size);
            alloc.device
        };
        self.credit(device, size);
        Ok(())
    }

    fn copy_to_device(&self, dst: u64, data: &[u8]) -> Result<(), DriverError> {
        if data.is_empty() {
            return Ok(());
        }
        self.with_range(dst, data.len() as u64, |alloc, offset| alloc.write(offset, data))
    }

    fn copy_to_host(&self, src: u64, out: &mut [u8]) -> Result<(), DriverError> {
        if out.is_empty() {
            return Ok(());
        }
        self.with_range(src, out.len() as u64, |alloc, offset| alloc.read(offset, out))
    }

    fn memset(&self, dst: u64, value: u8, size: u64) -> Result<(), DriverError> {
        if size == 0 {
            return Ok(());
        }
        let len = usize::try_from(size).map_err(|_| DriverError::InvalidAddress { addr: dst, size })?;
        self.with_range(dst, size, |alloc, offset| alloc.fill(offset, value, len))
    }

    fn mem_info(&self, device: usize) -> Result<MemInfo, DriverError> {
        let devices = lock(&self.devices);
        let dev = devices.get(device).ok_or(DriverError::InvalidDevice(device))?;
        Ok(MemInfo {
            free: dev.info.total_global_mem.saturating_sub(dev.used),
            total: dev.info.total_global_mem,
        })
    }

    fn runtime_version(&self) -> Result<String, DriverError> {
        Ok(format_runtime_version(6_000_000))
    }

    fn driver_version(&self) -> Result<String, DriverError> {
        Ok(format_driver_version(60_000))
    }
}

/// Format a HIP runtime version integer (`major * 1e6 + minor * 1e3 + patch`).
pub fn format_runtime_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        version / 1_000_000,
        (version % 1_000_000) / 1000,
        version % 1000
    )
}

/// Format a driver version integer (`major * 1e3 + minor`).
pub fn format_driver_version(version: u32) -> String {
    format!("{}.{}", version / 1000, version % 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_reassigns_ordinals() {
        let driver = SimulatedDriver::rx6800xt(3);
        let devices = driver.enumerate_devices().unwrap();
        let ordinals: Vec<_> = devices.iter().map(|d| d.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[test]
    fn test_alloc_respects_capacity() {
        let driver = SimulatedDriver::with_capacity(1, 4096);

        let a = driver.alloc(0, 3000).unwrap();
        let err = driver.alloc(0, 2000).unwrap_err();
        assert_eq!(
            err,
            DriverError::OutOfMemory {
                device: 0,
                requested: 2000,
                available: 1096,
            }
        );

        driver.free(a).unwrap();
        driver.alloc(0, 2000).unwrap();
        assert_eq!(driver.alloc_calls(), 3);
        assert_eq!(driver.free_calls(), 1);
    }

    #[test]
    fn test_double_free_rejected() {
        let driver = SimulatedDriver::rx6800xt(1);
        let h = driver.alloc(0, 256).unwrap();
        driver.free(h).unwrap();
        assert_eq!(driver.free(h), Err(DriverError::InvalidHandle(h.0)));
    }

    #[test]
    fn test_mem_info_tracks_usage() {
        let driver = SimulatedDriver::with_capacity(2, 1 << 20);
        driver.alloc(1, 1 << 10).unwrap();

        let info = driver.mem_info(1).unwrap();
        assert_eq!(info.total, 1 << 20);
        assert_eq!(info.used(), 1 << 10);
        assert_eq!(driver.mem_info(0).unwrap().used(), 0);
        assert!(driver.mem_info(2).is_err());
    }

    #[test]
    fn test_release_range_returns_capacity() {
        let driver = SimulatedDriver::with_capacity(1, 16 * 1024);
        let h = driver.alloc(0, 8192).unwrap();

        driver.release_range(h, 2048, 4096).unwrap();
        assert_eq!(driver.mem_info(0).unwrap().used(), 4096);

        // Overlapping or out-of-bounds ranges are rejected.
        assert!(driver.release_range(h, 4096, 1024).is_err());
        assert!(driver.release_range(h, 6144, 4096).is_err());
        assert!(driver.release_range(h, 0, 0).is_err());

        driver.free(h).unwrap();
        assert_eq!(driver.mem_info(0).unwrap().used(), 0);
        assert_eq!(driver.live_allocations(), 0);
    }

    #[test]
    fn test_copies_round_trip_across_pages() {
        let driver = SimulatedDriver::rx6800xt(1);
        let h = driver.alloc(0, 3 * SIM_PAGE_SIZE).unwrap();

        let data: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
        driver.copy_to_device(h.addr() + 1000, &data).unwrap();

        let mut out = vec![0u8; 6000];
        driver.copy_to_host(h.addr() + 1000, &mut out).unwrap();
        assert_eq!(out, data);

        // Untouched memory reads as zero.
        let mut head = [0xffu8; 16];
        driver.copy_to_host(h.addr(), &mut head).unwrap();
        assert_eq!(head, [0u8; 16]);
    }

    #[test]
    fn test_memset_and_device_copy() {
        let driver = SimulatedDriver::rx6800xt(2);
        let a = driver.alloc(0, 8192).unwrap();
        let b = driver.alloc(1, 8192).unwrap();

        driver.memset(a.addr(), 0xab, 8192).unwrap();
        driver.memset(a.addr() + 100, 0, 50).unwrap();
        driver.copy_device(b.addr(), a.addr(), 8192).unwrap();

        let mut out = vec![0u8; 8192];
        driver.copy_to_host(b.addr(), &mut out).unwrap();
        assert!(out[..100].iter().all(|&x| x == 0xab));
        assert!(out[100..150].iter().all(|&x| x == 0));
        assert!(out[150..].iter().all(|&x| x == 0xab));
    }

    #[test]
    fn test_access_outside_live_memory_rejected() {
        let driver = SimulatedDriver::rx6800xt(1);
        let h = driver.alloc(0, 4096).unwrap();
        let mut buf = [0u8; 64];

        assert_eq!(
            driver.copy_to_host(h.addr() + 4090, &mut buf),
            Err(DriverError::InvalidAddress {
                addr: h.addr() + 4090,
                size: 64
            })
        );
        assert!(driver.copy_to_device(h.addr() - 1, &buf).is_err());
        assert!(driver.memset(SIM_ADDRESS_BASE - 4096, 0, 16).is_err());

        driver.release_range(h, 0, 1024).unwrap();
        assert!(driver.copy_to_host(h.addr() + 512, &mut buf).is_err());
        driver.copy_to_host(h.addr() + 1024, &mut buf).unwrap();

        driver.free(h).unwrap();
        assert!(driver.copy_to_host(h.addr() + 1024, &mut buf).is_err());
    }

    #[test]
    fn test_version_formatting() {
        assert_eq!(format_runtime_version(60_200_001), "60.200.1");
        assert_eq!(format_runtime_version(6_001_002), "6.1.2");
        assert_eq!(format_driver_version(60_000), "60.0");
    }
}
