//! Integration tests for the caching allocator.

use std::sync::Arc;

use rdna_stack::config::Config;
use rdna_stack::{ErrorKind, Runtime, SimulatedDriver};

fn runtime_with(driver: SimulatedDriver, config: Config) -> (Arc<SimulatedDriver>, Runtime) {
    let driver = Arc::new(driver);
    let rt = Runtime::new(driver.clone(), config).unwrap();
    rt.initialize();
    (driver, rt)
}

fn runtime(devices: usize) -> (Arc<SimulatedDriver>, Runtime) {
    runtime_with(SimulatedDriver::rx6800xt(devices), Config::default())
}

#[test]
fn test_two_device_scenario() {
    let (_, rt) = runtime(2);

    assert_eq!(rt.set_device(1).unwrap(), 0);
    let block = rt.allocate_on(1, 1_048_576).unwrap();
    assert_eq!(rt.memory_allocated(Some(1)).unwrap(), 1_048_576);

    rt.free(block).unwrap();
    assert_eq!(rt.memory_allocated(Some(1)).unwrap(), 0);
    assert!(rt.memory_cached(Some(1)).unwrap() >= 1_048_576);

    rt.empty_cache(Some(1));
    assert_eq!(rt.memory_cached(Some(1)).unwrap(), 0);
}

#[test]
fn test_free_restores_allocated_and_grows_cache() {
    let (_, rt) = runtime(1);
    let keep = rt.allocate_on(0, 10_000).unwrap();

    for n in [1u64, 255, 256, 257, 4096, 100_000, 3 << 20] {
        let before_alloc = rt.memory_allocated(Some(0)).unwrap();
        let before_cache = rt.memory_cached(Some(0)).unwrap();

        let block = rt.allocate_on(0, n).unwrap();
        let cache_after_alloc = rt.memory_cached(Some(0)).unwrap();
        rt.free(block).unwrap();

        assert_eq!(rt.memory_allocated(Some(0)).unwrap(), before_alloc, "size {n}");
        let cache_after_free = rt.memory_cached(Some(0)).unwrap();
        assert!(cache_after_free >= cache_after_alloc + n, "size {n}");
        assert!(cache_after_free >= before_cache, "size {n}");
    }
    rt.free(keep).unwrap();
}

#[test]
fn test_zero_size_rejected_on_every_device() {
    let (_, rt) = runtime(3);
    for d in 0..3 {
        assert_eq!(rt.allocate_on(d, 0).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }
    assert_eq!(rt.allocate_on(3, 16).unwrap_err().kind(), ErrorKind::OutOfRange);
}

#[test]
fn test_peak_is_monotonic_and_survives_empty_cache() {
    let (_, rt) = runtime(1);
    let mut live = Vec::new();
    let mut last_peak = 0;

    for (i, size) in [4096u64, 1 << 20, 512, 64 << 10, 2 << 20, 768].into_iter().enumerate() {
        live.push(rt.allocate_on(0, size).unwrap());
        if i % 2 == 1 {
            rt.free(live.remove(0)).unwrap();
        }
        let peak = rt.max_memory_allocated(Some(0)).unwrap();
        assert!(peak >= last_peak);
        assert!(peak >= rt.memory_allocated(Some(0)).unwrap());
        last_peak = peak;
    }

    let allocated = rt.memory_allocated(Some(0)).unwrap();
    rt.empty_cache(None);
    assert_eq!(rt.max_memory_allocated(Some(0)).unwrap(), last_peak);
    assert_eq!(rt.memory_allocated(Some(0)).unwrap(), allocated);

    rt.reset_peak_memory_stats(Some(0)).unwrap();
    assert_eq!(rt.max_memory_allocated(Some(0)).unwrap(), allocated);

    for block in live {
        rt.free(block).unwrap();
    }
}

#[test]
fn test_cache_reuse_avoids_driver() {
    let (driver, rt) = runtime(1);

    let block = rt.allocate_on(0, 1 << 20).unwrap();
    rt.free(block).unwrap();
    let calls = driver.alloc_calls();

    for _ in 0..10 {
        let block = rt.allocate_on(0, 1 << 20).unwrap();
        rt.free(block).unwrap();
    }
    assert_eq!(driver.alloc_calls(), calls);

    let stats = rt.memory_stats(Some(0)).unwrap();
    assert_eq!(stats.cache_hits, 10);
    assert_eq!(stats.total_allocations, 11);
    assert_eq!(stats.total_frees, 11);
}

#[test]
fn test_out_of_memory_then_manual_retry() {
    let (_, rt) = runtime_with(SimulatedDriver::with_capacity(1, 4 << 20), Config::default());

    // Three 1 MiB segments cached, one live.
    let blocks: Vec<_> = (0..4).map(|_| rt.allocate_on(0, 1 << 20).unwrap()).collect();
    let mut blocks = blocks.into_iter();
    let live = blocks.next().unwrap();
    for b in blocks {
        rt.free(b).unwrap();
    }

    // No cached segment is large enough and the device is full.
    let err = rt.allocate_on(0, 2 << 20).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);

    rt.empty_cache(Some(0));
    let big = rt.allocate_on(0, 2 << 20).unwrap();
    rt.free(big).unwrap();
    rt.free(live).unwrap();
}

#[test]
fn test_empty_cache_is_per_device() {
    let (_, rt) = runtime(2);
    for d in 0..2 {
        let block = rt.allocate_on(d, 8192).unwrap();
        rt.free(block).unwrap();
    }

    rt.empty_cache(Some(0));
    assert_eq!(rt.memory_cached(Some(0)).unwrap(), 0);
    assert_eq!(rt.memory_cached(Some(1)).unwrap(), 8192);

    // Unknown device is a no-op.
    assert_eq!(rt.empty_cache(Some(42)), 0);

    rt.empty_cache(None);
    assert_eq!(rt.memory_cached(Some(1)).unwrap(), 0);
}

#[test]
fn test_empty_cache_clears_fragments_beside_live_blocks() {
    let (driver, rt) = runtime(1);

    let block = rt.allocate_on(0, 8192).unwrap();
    rt.free(block).unwrap();
    let live = rt.allocate_on(0, 2048).unwrap();
    assert_eq!(rt.memory_cached(Some(0)).unwrap(), 6144);

    assert_eq!(rt.empty_cache(Some(0)), 6144);
    assert_eq!(rt.memory_cached(Some(0)).unwrap(), 0);
    assert_eq!(rt.memory_allocated(Some(0)).unwrap(), 2048);
    assert_eq!(rt.mem_info(0).unwrap().used(), 2048);

    // The live block is untouched.
    rt.copy_to_device(&live, 0, b"still here").unwrap();
    let mut out = [0u8; 10];
    rt.copy_to_host(&live, 0, &mut out).unwrap();
    assert_eq!(&out, b"still here");

    rt.free(live).unwrap();
    rt.empty_cache(Some(0));
    assert_eq!(rt.memory_cached(Some(0)).unwrap(), 0);
    assert_eq!(driver.live_allocations(), 0);
    assert_eq!(rt.mem_info(0).unwrap().used(), 0);
}

#[test]
fn test_cache_limit_from_config() {
    let mut config = Config::default();
    config.allocator.cache_size_limit = 1 << 20;
    let (driver, rt) = runtime_with(SimulatedDriver::rx6800xt(1), config);

    let a = rt.allocate_on(0, 1 << 20).unwrap();
    let b = rt.allocate_on(0, 1 << 20).unwrap();
    rt.free(a).unwrap();
    rt.free(b).unwrap();

    assert_eq!(rt.memory_cached(Some(0)).unwrap(), 1 << 20);
    assert_eq!(driver.live_allocations(), 1);
}

#[test]
fn test_allocation_info_and_summary() {
    let (_, rt) = runtime(1);
    let block = rt.allocate_on(0, 5000).unwrap();

    let info = rt.allocation_info(block.device_ptr()).unwrap();
    assert_eq!(info.requested_bytes, 5000);
    assert_eq!(info.size_bytes, block.size_bytes());

    let summary = rt.memory_summary(Some(0)).unwrap();
    assert!(summary.contains("Device 0:"));
    assert!(summary.contains("Allocated:"));
    assert!(summary.contains("Cached:"));
    assert!(summary.contains("Peak allocated:"));

    // Summary is a pure read.
    let before = rt.memory_stats(Some(0)).unwrap();
    let _ = rt.memory_summary(None).unwrap();
    assert_eq!(rt.memory_stats(Some(0)).unwrap(), before);

    assert_eq!(rt.memory_summary(Some(3)).unwrap_err().kind(), ErrorKind::OutOfRange);
    rt.free(block).unwrap();
}

#[test]
fn test_concurrent_churn_across_devices() {
    let (driver, rt) = runtime(2);
    let rt = Arc::new(rt);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let rt = rt.clone();
            std::thread::spawn(move || {
                let device = t % 2;
                for i in 0..200u64 {
                    let size = 256 * (1 + (i * 7 + t as u64) % 64);
                    let block = rt.allocate_on(device, size).unwrap();
                    assert_eq!(block.device_index(), device);
                    rt.free(block).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for d in 0..2 {
        let stats = rt.memory_stats(Some(d)).unwrap();
        assert_eq!(stats.allocated_bytes, 0);
        assert_eq!(stats.allocated_blocks, 0);
        assert_eq!(stats.total_allocations, 800);
        assert_eq!(stats.total_frees, 800);
        assert_eq!(stats.reserved_bytes, stats.cached_bytes);
    }

    rt.empty_cache(None);
    assert_eq!(driver.live_allocations(), 0);
}
