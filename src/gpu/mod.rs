//! GPU device management and memory allocation.
//!
//! - [`driver`]: Driver collaborator trait and the simulated driver
//! - [`device`]: Device registry and per-device descriptors
//! - [`context`]: Current-device state and scoped device guards
//! - [`allocator`]: Caching device memory allocator

pub mod allocator;
pub mod context;
pub mod device;
pub mod driver;

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
