//! Caching device memory allocator.
//!
//! Memory is requested from the driver in segments. A segment starts out as a
//! single block; when a cached block is reused for a smaller request the
//! remainder is split off, and freed blocks are coalesced with free neighbours
//! in the same segment. Freed memory stays cached until [`CachingAllocator::empty_cache`]
//! or the per-device cache limit hands it back to the driver: idle segments are
//! freed whole, and free fragments of segments that still hold live blocks are
//! released in place, leaving a hole that is never reused.
//!
//! Lookup is best-fit over a per-device `(size, id)` ordered set. Every device
//! has its own lock, so traffic on one device never contends with another.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{AllocatorConfig, RuntimeFlags};
use crate::error::ErrorKind;
use crate::gpu::device::{DeviceDescriptor, DeviceError};
use crate::gpu::driver::{Driver, DriverError, DriverHandle};
use crate::gpu::lock;
use crate::profiler::{Op, Profiler};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("Invalid allocation request: {0}")]
    InvalidArgument(String),

    #[error("Out of memory on device {device_id}: requested {requested} bytes with {cached} bytes cached")]
    OutOfMemory {
        device_id: usize,
        requested: u64,
        cached: u64,
        #[source]
        source: DriverError,
    },

    #[error("Allocation {block_id} is not live on device {device_id}")]
    BlockNotFound { device_id: usize, block_id: BlockId },

    #[error("Driver failure on device {device_id}: {source}")]
    Driver {
        device_id: usize,
        #[source]
        source: DriverError,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl AllocatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocatorError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            AllocatorError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            AllocatorError::BlockNotFound { .. } => ErrorKind::InvalidArgument,
            AllocatorError::Driver { .. } => ErrorKind::Internal,
            AllocatorError::Device(e) => e.kind(),
        }
    }
}

/// Unique identifier for a block record.
pub type BlockId = u64;

type SegmentId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockState {
    Free,
    InUse,
    /// Returned to the driver while the rest of its segment stays live.
    Released,
}

/// A contiguous range of one segment. Its size never changes; splitting and
/// merging replace records with new ones.
#[derive(Debug, Clone)]
struct MemoryBlock {
    id: BlockId,
    segment: SegmentId,
    offset: u64,
    size: u64,
    state: BlockState,
    prev: Option<BlockId>,
    next: Option<BlockId>,

    /// Size the caller asked for (0 while free).
    requested: u64,

    /// Allocation id of the current owner (0 while free).
    allocation_id: u64,
}

/// One driver allocation.
#[derive(Debug)]
struct Segment {
    handle: DriverHandle,
    size: u64,

    /// Block at offset 0.
    head: BlockId,

    /// Number of in-use blocks carved from this segment.
    live_blocks: usize,

    /// Bytes of this segment already returned through `release_range`.
    released: u64,

    /// Pool tick of the last allocate/free touching this segment.
    last_used: u64,
}

/// Per-device allocator statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorStats {
    /// Sum of sizes of in-use blocks.
    pub allocated_bytes: u64,
    pub allocated_blocks: u64,

    /// Sum of sizes of free blocks still held from the driver.
    pub cached_bytes: u64,
    pub cached_blocks: u64,

    /// High-water mark of `allocated_bytes` since the last reset.
    pub peak_allocated_bytes: u64,

    /// Bytes currently held from the driver (`allocated + cached`).
    pub reserved_bytes: u64,

    pub total_allocations: u64,
    pub total_frees: u64,
    pub driver_allocations: u64,
    pub driver_frees: u64,

    /// Allocations satisfied without calling the driver.
    pub cache_hits: u64,
}

/// Handle to a live allocation. Consumed by [`CachingAllocator::free`], so a
/// handle cannot be freed twice.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping an Allocation without freeing it leaks the block"]
pub struct Allocation {
    block_id: BlockId,
    device_index: usize,
    size_bytes: u64,
    requested_bytes: u64,
    device_ptr: u64,
    allocation_id: u64,
}

impl Allocation {
    pub fn device_index(&self) -> usize {
        self.device_index
    }

    /// Bytes reserved for this allocation (the request rounded up).
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn requested_bytes(&self) -> u64 {
        self.requested_bytes
    }

    /// Device address of the first byte.
    pub fn device_ptr(&self) -> u64 {
        self.device_ptr
    }

    /// Monotonic id; later allocations have larger ids.
    pub fn allocation_id(&self) -> u64 {
        self.allocation_id
    }
}

/// Lookup result for a device address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationInfo {
    pub device_index: usize,
    pub device_ptr: u64,
    pub size_bytes: u64,
    pub requested_bytes: u64,
    pub allocation_id: u64,
}

/// Allocator state for one device.
#[derive(Debug)]
struct DevicePool {
    device_index: usize,
    physical_index: usize,

    blocks: HashMap<BlockId, MemoryBlock>,

    /// Free blocks ordered by (size, id) for best-fit lookup.
    free_set: BTreeSet<(u64, BlockId)>,

    /// In-use blocks by device address.
    live_by_ptr: HashMap<u64, BlockId>,

    segments: HashMap<SegmentId, Segment>,
    next_segment: SegmentId,

    stats: AllocatorStats,
    cache_limit: u64,
    tick: u64,
}

impl DevicePool {
    fn new(device_index: usize, physical_index: usize, cache_limit: u64) -> Self {
        Self {
            device_index,
            physical_index,
            blocks: HashMap::new(),
            free_set: BTreeSet::new(),
            live_by_ptr: HashMap::new(),
            segments: HashMap::new(),
            next_segment: 0,
            stats: AllocatorStats::default(),
            cache_limit,
            tick: 0,
        }
    }

    /// Smallest free block of at least `size` bytes.
    fn best_fit(&self, size: u64) -> Option<BlockId> {
        self.free_set.range((size, 0)..).next().map(|&(_, id)| id)
    }

    fn insert_block(&mut self, block: MemoryBlock) {
        if block.offset == 0 {
            if let Some(seg) = self.segments.get_mut(&block.segment) {
                seg.head = block.id;
            }
        }
        if block.state == BlockState::Free {
            self.free_set.insert((block.size, block.id));
            self.stats.cached_bytes += block.size;
            self.stats.cached_blocks += 1;
        }
        self.blocks.insert(block.id, block);
    }

    /// Remove a free block from the free set and the block table.
    fn take_free(&mut self, id: BlockId) -> Option<MemoryBlock> {
        let block = self.blocks.remove(&id)?;
        debug_assert_eq!(block.state, BlockState::Free);
        self.free_set.remove(&(block.size, id));
        self.stats.cached_bytes -= block.size;
        self.stats.cached_blocks -= 1;
        Some(block)
    }

    /// Point `neighbour`'s back/forward link at `to`.
    fn relink(&mut self, neighbour: Option<BlockId>, forward: bool, to: BlockId) {
        if let Some(n) = neighbour.and_then(|id| self.blocks.get_mut(&id)) {
            if forward {
                n.prev = Some(to);
            } else {
                n.next = Some(to);
            }
        }
    }

    fn is_free(&self, id: Option<BlockId>) -> bool {
        id.and_then(|id| self.blocks.get(&id))
            .is_some_and(|b| b.state == BlockState::Free)
    }

    /// Segment with no live blocks that was used least recently.
    fn lru_idle_segment(&self) -> Option<SegmentId> {
        self.segments
            .iter()
            .filter(|(_, s)| s.live_blocks == 0)
            .min_by_key(|(_, s)| s.last_used)
            .map(|(&id, _)| id)
    }

    fn idle_segments(&self) -> Vec<SegmentId> {
        self.segments
            .iter()
            .filter(|(_, s)| s.live_blocks == 0)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Largest free block.
    fn largest_free(&self) -> Option<BlockId> {
        self.free_set.last().map(|&(_, id)| id)
    }

    fn free_blocks(&self) -> Vec<BlockId> {
        self.free_set.iter().map(|&(_, id)| id).collect()
    }
}

/// Multi-device caching allocator.
pub struct CachingAllocator {
    driver: Arc<dyn Driver>,
    pools: Vec<Mutex<DevicePool>>,
    alignment: u64,
    min_split_bytes: u64,
    next_block_id: AtomicU64,
    next_allocation_id: AtomicU64,
    flags: Arc<RuntimeFlags>,
    profiler: Arc<Profiler>,
}

impl CachingAllocator {
    /// Create an allocator with one pool per descriptor, indexed by
    /// `DeviceDescriptor::index`.
    pub fn new(
        driver: Arc<dyn Driver>,
        devices: &[DeviceDescriptor],
        config: &AllocatorConfig,
        flags: Arc<RuntimeFlags>,
        profiler: Arc<Profiler>,
    ) -> Self {
        let pools = devices
            .iter()
            .map(|d| Mutex::new(DevicePool::new(d.index, d.physical_index, config.cache_size_limit)))
            .collect();

        Self {
            driver,
            pools,
            alignment: config.alignment.max(1),
            min_split_bytes: config.min_split_bytes,
            next_block_id: AtomicU64::new(1),
            next_allocation_id: AtomicU64::new(1),
            flags,
            profiler,
        }
    }

    pub fn device_count(&self) -> usize {
        self.pools.len()
    }

    fn pool(&self, device: usize) -> Result<&Mutex<DevicePool>, AllocatorError> {
        self.pools.get(device).ok_or(AllocatorError::Device(DeviceError::OutOfRange {
            index: device,
            count: self.pools.len(),
        }))
    }

    fn new_block_id(&self) -> BlockId {
        self.next_block_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Round `size` up to the allocation alignment.
    pub fn round_size(&self, size: u64) -> Option<u64> {
        size.checked_next_multiple_of(self.alignment)
    }

    /// Allocate `size` bytes on `device`.
    ///
    /// Reuses the smallest cached block that fits, splitting off the remainder
    /// when it is at least `min_split_bytes`; otherwise asks the driver for a
    /// new segment of exactly the rounded size.
    pub fn allocate(&self, device: usize, size: u64) -> Result<Allocation, AllocatorError> {
        if size == 0 {
            return Err(AllocatorError::InvalidArgument(
                "zero-byte allocation".to_string(),
            ));
        }
        let rounded = self.round_size(size).ok_or_else(|| {
            AllocatorError::InvalidArgument(format!("allocation of {size} bytes overflows"))
        })?;
        let pool = self.pool(device)?;
        let _timer = self.profiler.start(Op::Allocate);

        let mut pool = lock(pool);
        pool.tick += 1;

        let cached = pool
            .best_fit(rounded)
            .and_then(|id| self.claim_cached(&mut pool, id, rounded));
        let block_id = match cached {
            Some(id) => {
                pool.stats.cache_hits += 1;
                self.profiler.record(Op::CacheHit, device, rounded);
                id
            }
            None => self.claim_new_segment(&mut pool, rounded)?,
        };

        let allocation_id = self.next_allocation_id.fetch_add(1, Ordering::Relaxed);
        let tick = pool.tick;
        let Some(block) = pool.blocks.get_mut(&block_id) else {
            return Err(AllocatorError::BlockNotFound {
                device_id: device,
                block_id,
            });
        };
        block.state = BlockState::InUse;
        block.requested = size;
        block.allocation_id = allocation_id;
        let (block_size, segment, offset) = (block.size, block.segment, block.offset);

        let mut device_ptr = offset;
        if let Some(seg) = pool.segments.get_mut(&segment) {
            seg.live_blocks += 1;
            seg.last_used = tick;
            device_ptr += seg.handle.addr();
        }
        pool.live_by_ptr.insert(device_ptr, block_id);

        let stats = &mut pool.stats;
        stats.allocated_bytes += block_size;
        stats.allocated_blocks += 1;
        stats.total_allocations += 1;
        stats.peak_allocated_bytes = stats.peak_allocated_bytes.max(stats.allocated_bytes);

        self.profiler.record(Op::Allocate, device, block_size);
        if self.flags.debug_logging() {
            debug!(
                device,
                requested = size,
                size = block_size,
                ptr = device_ptr,
                allocated = pool.stats.allocated_bytes,
                cached = pool.stats.cached_bytes,
                "Allocated device block"
            );
        }

        Ok(Allocation {
            block_id,
            device_index: device,
            size_bytes: block_size,
            requested_bytes: size,
            device_ptr,
            allocation_id,
        })
    }

    /// Take cached block `id` for a request of `size` bytes, splitting when
    /// the remainder is large enough. Returns the id of the block to hand out.
    fn claim_cached(&self, pool: &mut DevicePool, id: BlockId, size: u64) -> Option<BlockId> {
        let block = pool.take_free(id)?;

        let remainder = block.size - size;
        if remainder == 0 || remainder < self.min_split_bytes {
            pool.blocks.insert(id, block);
            return Some(id);
        }

        let used_id = self.new_block_id();
        let rest_id = self.new_block_id();

        let used = MemoryBlock {
            id: used_id,
            segment: block.segment,
            offset: block.offset,
            size,
            state: BlockState::Free,
            prev: block.prev,
            next: Some(rest_id),
            requested: 0,
            allocation_id: 0,
        };
        let rest = MemoryBlock {
            id: rest_id,
            segment: block.segment,
            offset: block.offset + size,
            size: remainder,
            state: BlockState::Free,
            prev: Some(used_id),
            next: block.next,
            requested: 0,
            allocation_id: 0,
        };

        pool.relink(block.prev, false, used_id);
        pool.relink(block.next, true, rest_id);

        // `used` is flipped to InUse by the caller; keep it out of the free set.
        if block.offset == 0 {
            if let Some(seg) = pool.segments.get_mut(&block.segment) {
                seg.head = used_id;
            }
        }
        pool.blocks.insert(used_id, used);
        pool.insert_block(rest);

        if self.flags.debug_logging() {
            debug!(
                device = pool.device_index,
                size,
                remainder,
                "Split cached block"
            );
        }
        Some(used_id)
    }

    /// Request a fresh segment of `size` bytes from the driver.
    fn claim_new_segment(
        &self,
        pool: &mut DevicePool,
        size: u64,
    ) -> Result<BlockId, AllocatorError> {
        let handle = {
            let _timer = self.profiler.start(Op::DriverAlloc);
            self.driver.alloc(pool.physical_index, size)
        };
        let handle = handle.map_err(|source| match source {
            DriverError::OutOfMemory { .. } => AllocatorError::OutOfMemory {
                device_id: pool.device_index,
                requested: size,
                cached: pool.stats.cached_bytes,
                source,
            },
            other => AllocatorError::Driver {
                device_id: pool.device_index,
                source: other,
            },
        })?;

        let segment = pool.next_segment;
        pool.next_segment += 1;
        let block_id = self.new_block_id();

        pool.segments.insert(
            segment,
            Segment {
                handle,
                size,
                head: block_id,
                live_blocks: 0,
                released: 0,
                last_used: pool.tick,
            },
        );
        pool.blocks.insert(
            block_id,
            MemoryBlock {
                id: block_id,
                segment,
                offset: 0,
                size,
                state: BlockState::Free,
                prev: None,
                next: None,
                requested: 0,
                allocation_id: 0,
            },
        );

        pool.stats.reserved_bytes += size;
        pool.stats.driver_allocations += 1;
        self.profiler.record(Op::DriverAlloc, pool.device_index, size);
        if self.flags.debug_logging() {
            debug!(
                device = pool.device_index,
                size,
                handle = handle.addr(),
                "Driver allocation"
            );
        }
        Ok(block_id)
    }

    /// Return an allocation to the cache.
    ///
    /// The block is coalesced with free neighbours in its segment, then idle
    /// segments are released if the device's cache exceeds its limit.
    pub fn free(&self, allocation: Allocation) -> Result<(), AllocatorError> {
        let device = allocation.device_index;
        let pool = self.pool(device)?;
        let _timer = self.profiler.start(Op::Free);

        let mut pool = lock(pool);
        pool.tick += 1;
        let tick = pool.tick;

        let not_found = || AllocatorError::BlockNotFound {
            device_id: device,
            block_id: allocation.block_id,
        };
        let block = match pool.blocks.get(&allocation.block_id) {
            Some(b)
                if b.state == BlockState::InUse
                    && b.allocation_id == allocation.allocation_id =>
            {
                b.clone()
            }
            _ => return Err(not_found()),
        };

        pool.blocks.remove(&block.id);
        pool.live_by_ptr.remove(&allocation.device_ptr);
        pool.stats.allocated_bytes -= block.size;
        pool.stats.allocated_blocks -= 1;
        pool.stats.total_frees += 1;
        if let Some(seg) = pool.segments.get_mut(&block.segment) {
            seg.live_blocks = seg.live_blocks.saturating_sub(1);
            seg.last_used = tick;
        }

        let merged = self.coalesce(&mut pool, block);
        self.profiler.record(Op::Free, device, allocation.size_bytes);
        if self.flags.debug_logging() {
            debug!(
                device,
                size = allocation.size_bytes,
                ptr = allocation.device_ptr,
                merged_size = merged,
                allocated = pool.stats.allocated_bytes,
                cached = pool.stats.cached_bytes,
                "Freed device block"
            );
        }

        self.enforce_cache_limit(&mut pool);
        Ok(())
    }

    /// Merge `block` (already removed from the table) with free neighbours and
    /// insert the result as a free block. Returns the merged size.
    fn coalesce(&self, pool: &mut DevicePool, block: MemoryBlock) -> u64 {
        let mut offset = block.offset;
        let mut size = block.size;
        let mut prev = block.prev;
        let mut next = block.next;
        let mut merged_any = false;

        if pool.is_free(prev) {
            if let Some(p) = prev.and_then(|id| pool.take_free(id)) {
                offset = p.offset;
                size += p.size;
                prev = p.prev;
                merged_any = true;
            }
        }
        if pool.is_free(next) {
            if let Some(n) = next.and_then(|id| pool.take_free(id)) {
                size += n.size;
                next = n.next;
                merged_any = true;
            }
        }

        let id = if merged_any { self.new_block_id() } else { block.id };
        pool.relink(prev, false, id);
        pool.relink(next, true, id);
        pool.insert_block(MemoryBlock {
            id,
            segment: block.segment,
            offset,
            size,
            state: BlockState::Free,
            prev,
            next,
            requested: 0,
            allocation_id: 0,
        });
        size
    }

    /// Release idle segments, least recently used first, then the largest
    /// free fragments of busy segments, until the cache is within its limit
    /// or nothing more can be released.
    fn enforce_cache_limit(&self, pool: &mut DevicePool) {
        while pool.stats.cached_bytes > pool.cache_limit {
            let released = match (pool.lru_idle_segment(), pool.largest_free()) {
                (Some(segment), _) => self.release_segment(pool, segment),
                (None, Some(block)) => self.release_fragment(pool, block),
                (None, None) => break,
            };
            if !matches!(released, Ok(bytes) if bytes > 0) {
                break;
            }
        }
    }

    /// Hand an idle segment back to the driver. Returns the bytes released.
    fn release_segment(
        &self,
        pool: &mut DevicePool,
        segment: SegmentId,
    ) -> Result<u64, DriverError> {
        let Some(seg) = pool.segments.get(&segment) else {
            return Ok(0);
        };
        debug_assert_eq!(seg.live_blocks, 0);
        let (handle, head) = (seg.handle, seg.head);
        let held = seg.size - seg.released;

        let result = {
            let _timer = self.profiler.start(Op::DriverFree);
            self.driver.free(handle)
        };
        if let Err(e) = result {
            warn!(
                device = pool.device_index,
                handle = handle.addr(),
                error = %e,
                "Failed to release cached segment"
            );
            return Err(e);
        }

        // Free blocks leave the cache; released holes just go away.
        let mut cursor = Some(head);
        while let Some(id) = cursor {
            let Some((state, next)) = pool.blocks.get(&id).map(|b| (b.state, b.next)) else {
                break;
            };
            cursor = next;
            if state == BlockState::Free {
                pool.take_free(id);
            } else {
                pool.blocks.remove(&id);
            }
        }
        pool.segments.remove(&segment);
        pool.stats.reserved_bytes -= held;
        pool.stats.driver_frees += 1;
        self.profiler.record(Op::DriverFree, pool.device_index, held);
        Ok(held)
    }

    /// Return one free block of a segment that still holds live blocks to the
    /// driver. The block stays in the segment's chain as a released hole.
    fn release_fragment(&self, pool: &mut DevicePool, id: BlockId) -> Result<u64, DriverError> {
        let Some(block) = pool.blocks.get(&id).filter(|b| b.state == BlockState::Free) else {
            return Ok(0);
        };
        let (segment, offset, size) = (block.segment, block.offset, block.size);
        let Some(handle) = pool.segments.get(&segment).map(|s| s.handle) else {
            return Ok(0);
        };

        let result = {
            let _timer = self.profiler.start(Op::DriverFree);
            self.driver.release_range(handle, offset, size)
        };
        if let Err(e) = result {
            warn!(
                device = pool.device_index,
                handle = handle.addr(),
                offset,
                size,
                error = %e,
                "Failed to release cached fragment"
            );
            return Err(e);
        }

        let Some(mut block) = pool.take_free(id) else {
            return Ok(0);
        };
        block.state = BlockState::Released;
        pool.insert_block(block);
        if let Some(seg) = pool.segments.get_mut(&segment) {
            seg.released += size;
        }
        pool.stats.reserved_bytes -= size;
        pool.stats.driver_frees += 1;
        self.profiler.record(Op::DriverFree, pool.device_index, size);
        if self.flags.debug_logging() {
            debug!(
                device = pool.device_index,
                handle = handle.addr(),
                offset,
                size,
                "Released cached fragment"
            );
        }
        Ok(size)
    }

    /// Return every cached byte on `device`, or on all devices when `None`, to
    /// the driver. Idle segments are freed whole; free fragments of segments
    /// with live blocks are released in place.
    ///
    /// Never fails: an unknown device is a no-op and driver failures are
    /// logged and leave the memory cached. Returns the bytes released.
    pub fn empty_cache(&self, device: Option<usize>) -> u64 {
        let targets: Vec<usize> = match device {
            Some(d) if d < self.pools.len() => vec![d],
            Some(d) => {
                warn!(device = d, "empty_cache on unknown device ignored");
                Vec::new()
            }
            None => (0..self.pools.len()).collect(),
        };

        let _timer = self.profiler.start(Op::EmptyCache);
        let mut released = 0;
        for d in targets {
            let mut pool = lock(&self.pools[d]);
            let mut device_released = 0;
            for segment in pool.idle_segments() {
                if let Ok(bytes) = self.release_segment(&mut pool, segment) {
                    device_released += bytes;
                }
            }
            for block in pool.free_blocks() {
                if let Ok(bytes) = self.release_fragment(&mut pool, block) {
                    device_released += bytes;
                }
            }
            self.profiler.record(Op::EmptyCache, d, device_released);
            if device_released > 0 {
                info!(
                    device = d,
                    released = device_released,
                    remaining_cached = pool.stats.cached_bytes,
                    "Emptied allocator cache"
                );
            }
            released += device_released;
        }
        released
    }

    /// Statistics snapshot for `device`.
    pub fn stats(&self, device: usize) -> Result<AllocatorStats, AllocatorError> {
        Ok(lock(self.pool(device)?).stats)
    }

    /// Reset the high-water mark to the current allocation.
    pub fn reset_peak_stats(&self, device: usize) -> Result<(), AllocatorError> {
        let mut pool = lock(self.pool(device)?);
        pool.stats.peak_allocated_bytes = pool.stats.allocated_bytes;
        Ok(())
    }

    /// Cap cached bytes on `device` (or all devices), releasing idle segments
    /// immediately if the cache is already above the new limit.
    pub fn set_cache_limit(&self, device: Option<usize>, limit: u64) -> Result<(), AllocatorError> {
        let targets: Vec<usize> = match device {
            Some(d) => {
                self.pool(d)?;
                vec![d]
            }
            None => (0..self.pools.len()).collect(),
        };
        for d in targets {
            let mut pool = lock(&self.pools[d]);
            pool.cache_limit = limit;
            self.enforce_cache_limit(&mut pool);
        }
        Ok(())
    }

    pub fn cache_limit(&self, device: usize) -> Result<u64, AllocatorError> {
        Ok(lock(self.pool(device)?).cache_limit)
    }

    /// Look up a live allocation by device address.
    pub fn allocation_info(&self, device_ptr: u64) -> Option<AllocationInfo> {
        self.pools.iter().find_map(|pool| {
            let pool = lock(pool);
            let block = pool
                .live_by_ptr
                .get(&device_ptr)
                .and_then(|id| pool.blocks.get(id))?;
            Some(AllocationInfo {
                device_index: pool.device_index,
                device_ptr,
                size_bytes: block.size,
                requested_bytes: block.requested,
                allocation_id: block.allocation_id,
            })
        })
    }

    /// Device address `offset` bytes into a live `allocation`, checking that
    /// `len` bytes from there stay inside it.
    fn resolve(&self, allocation: &Allocation, offset: u64, len: u64) -> Result<u64, AllocatorError> {
        let device = allocation.device_index;
        let pool = lock(self.pool(device)?);
        let live = pool.blocks.get(&allocation.block_id).is_some_and(|b| {
            b.state == BlockState::InUse && b.allocation_id == allocation.allocation_id
        });
        if !live {
            return Err(AllocatorError::BlockNotFound {
                device_id: device,
                block_id: allocation.block_id,
            });
        }

        let in_bounds = offset
            .checked_add(len)
            .is_some_and(|end| end <= allocation.size_bytes);
        if !in_bounds {
            return Err(AllocatorError::InvalidArgument(format!(
                "range {offset}+{len} exceeds allocation of {} bytes",
                allocation.size_bytes
            )));
        }
        Ok(allocation.device_ptr + offset)
    }

    /// Copy host bytes into `allocation`, starting `offset` bytes in.
    pub fn copy_to_device(
        &self,
        allocation: &Allocation,
        offset: u64,
        data: &[u8],
    ) -> Result<(), AllocatorError> {
        let device = allocation.device_index;
        let size = data.len() as u64;
        let dst = self.resolve(allocation, offset, size)?;
        {
            let _timer = self.profiler.start(Op::Memcpy);
            self.driver
                .copy_to_device(dst, data)
                .map_err(|source| AllocatorError::Driver { device_id: device, source })?;
        }

        self.profiler.record(Op::Memcpy, device, size);
        if self.flags.debug_logging() {
            debug!(device, ptr = dst, size, "H2D copy");
        }
        Ok(())
    }

    /// Fill `out` from `allocation`, starting `offset` bytes in.
    pub fn copy_to_host(
        &self,
        allocation: &Allocation,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), AllocatorError> {
        let device = allocation.device_index;
        let size = out.len() as u64;
        let src = self.resolve(allocation, offset, size)?;
        {
            let _timer = self.profiler.start(Op::Memcpy);
            self.driver
                .copy_to_host(src, out)
                .map_err(|source| AllocatorError::Driver { device_id: device, source })?;
        }

        self.profiler.record(Op::Memcpy, device, size);
        if self.flags.debug_logging() {
            debug!(device, ptr = src, size, "D2H copy");
        }
        Ok(())
    }

    /// Copy the first `size` bytes of `src` to the start of `dst`. The two
    /// allocations may live on different devices.
    pub fn copy_device(
        &self,
        dst: &Allocation,
        src: &Allocation,
        size: u64,
    ) -> Result<(), AllocatorError> {
        let to = self.resolve(dst, 0, size)?;
        let from = self.resolve(src, 0, size)?;
        {
            let _timer = self.profiler.start(Op::Memcpy);
            self.driver
                .copy_device(to, from, size)
                .map_err(|source| AllocatorError::Driver {
                    device_id: dst.device_index,
                    source,
                })?;
        }

        self.profiler.record(Op::Memcpy, dst.device_index, size);
        if self.flags.debug_logging() {
            debug!(
                src_device = src.device_index,
                dst_device = dst.device_index,
                size,
                "D2D copy"
            );
        }
        Ok(())
    }

    /// Set the first `size` bytes of `allocation` to `value`.
    pub fn memset(&self, allocation: &Allocation, value: u8, size: u64) -> Result<(), AllocatorError> {
        let device = allocation.device_index;
        let dst = self.resolve(allocation, 0, size)?;
        {
            let _timer = self.profiler.start(Op::Memset);
            self.driver
                .memset(dst, value, size)
                .map_err(|source| AllocatorError::Driver { device_id: device, source })?;
        }

        self.profiler.record(Op::Memset, device, size);
        if self.flags.debug_logging() {
            debug!(device, ptr = dst, value, size, "Memset");
        }
        Ok(())
    }

    /// Human-readable statistics for `device`, or every device when `None`.
    pub fn memory_summary(&self, device: Option<usize>) -> Result<String, AllocatorError> {
        let targets: Vec<usize> = match device {
            Some(d) => {
                self.pool(d)?;
                vec![d]
            }
            None => (0..self.pools.len()).collect(),
        };

        let mut out = String::new();
        if targets.is_empty() {
            out.push_str("No devices.\n");
        }
        for d in targets {
            let (stats, limit, segments) = {
                let pool = lock(&self.pools[d]);
                (pool.stats, pool.cache_limit, pool.segments.len())
            };
            let _ = writeln!(out, "Device {d}:");
            let _ = writeln!(
                out,
                "  Allocated:      {:>12} ({} blocks)",
                format_bytes(stats.allocated_bytes),
                stats.allocated_blocks
            );
            let _ = writeln!(
                out,
                "  Cached:         {:>12} ({} blocks, limit {})",
                format_bytes(stats.cached_bytes),
                stats.cached_blocks,
                format_bytes(limit)
            );
            let _ = writeln!(
                out,
                "  Peak allocated: {:>12}",
                format_bytes(stats.peak_allocated_bytes)
            );
            let _ = writeln!(
                out,
                "  Reserved:       {:>12} ({segments} segments)",
                format_bytes(stats.reserved_bytes)
            );
            let _ = writeln!(
                out,
                "  Allocations: {} (cache hits {}), frees: {}, driver allocs/frees: {}/{}",
                stats.total_allocations,
                stats.cache_hits,
                stats.total_frees,
                stats.driver_allocations,
                stats.driver_frees
            );
        }
        Ok(out)
    }
}

impl Drop for CachingAllocator {
    fn drop(&mut self) {
        for pool in &self.pools {
            let pool = lock(pool);
            for seg in pool.segments.values() {
                if let Err(e) = self.driver.free(seg.handle) {
                    warn!(
                        device = pool.device_index,
                        handle = seg.handle.addr(),
                        error = %e,
                        "Failed to release segment on shutdown"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for CachingAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingAllocator")
            .field("driver", &self.driver.name())
            .field("devices", &self.pools.len())
            .field("alignment", &self.alignment)
            .field("min_split_bytes", &self.min_split_bytes)
            .finish_non_exhaustive()
    }
}

/// Format a byte count with binary units ("1.50 MiB").
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}
