//! rdna-stack: device and memory core for AMD RDNA GPUs.
//!
//! Provides a CUDA-like contract on top of a driver:
//!   device discovery → current-device scoping → caching allocator → diagnostics
//!
//! Start from [`Runtime`]: construct it, call [`Runtime::initialize`] once,
//! then query devices, enter device scopes, and allocate.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod gpu;
pub mod profiler;
pub mod runtime;

pub use config::Config;
pub use diagnostics::Diagnostics;
pub use error::{Error, ErrorKind, Result};
pub use gpu::allocator::{Allocation, AllocatorStats, CachingAllocator};
pub use gpu::context::{DeviceGuard, DeviceSpec};
pub use gpu::device::{Capability, DataType, DeviceDescriptor};
pub use gpu::driver::{Driver, SimulatedDriver};
pub use runtime::Runtime;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
