//! Error classification shared by every component.
//!
//! Each component has its own error enum; [`ErrorKind`] lets callers branch on
//! the failure category without matching on component-specific variants.

use thiserror::Error;

use crate::config::ConfigError;
use crate::gpu::allocator::AllocatorError;
use crate::gpu::context::ContextError;
use crate::gpu::device::DeviceError;
use crate::gpu::driver::DriverError;
use crate::profiler::ProfilerError;

/// Failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No devices were discovered. Callers fall back to a CPU path.
    Unavailable,
    /// A device index outside `[0, device_count)`.
    OutOfRange,
    /// Malformed identifiers, zero-size requests, unsupported data types.
    InvalidArgument,
    /// The driver could not satisfy an allocation and no cached block fit.
    OutOfMemory,
    /// Driver or bookkeeping failure that fits none of the above.
    Internal,
}

/// Result type for runtime-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Any error raised by the crate.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error(transparent)]
    Profiler(#[from] ProfilerError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::InvalidArgument,
            Error::Driver(e) => e.kind(),
            Error::Device(e) => e.kind(),
            Error::Context(e) => e.kind(),
            Error::Allocator(e) => e.kind(),
            Error::Profiler(_) => ErrorKind::Internal,
        }
    }
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            DriverError::InvalidDevice(_) => ErrorKind::OutOfRange,
            DriverError::InvalidHandle(_) => ErrorKind::InvalidArgument,
            DriverError::InvalidAddress { .. } => ErrorKind::InvalidArgument,
            DriverError::Other(_) => ErrorKind::Internal,
        }
    }
}
