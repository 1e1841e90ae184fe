//! Current-device state and scoped device selection.
//!
//! The active device is shared by every thread using a runtime and is
//! changed either directly ([`CurrentDevice::set`]) or through a
//! [`DeviceGuard`], which restores the previous device when dropped. Guards
//! keep an explicit stack of saved devices so nested scopes unwind in LIFO
//! order even when a guard is dropped out of turn.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::gpu::device::{DeviceError, DeviceRegistry};
use crate::gpu::lock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("Invalid device string {input:?}: {reason}")]
    InvalidDeviceString { input: String, reason: &'static str },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl ContextError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContextError::InvalidDeviceString { .. } => ErrorKind::InvalidArgument,
            ContextError::Device(e) => e.kind(),
        }
    }
}

/// Naming convention a device string was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceScheme {
    /// `rdna` / `rdna:N`
    Rdna,
    /// `/device:RDNA` / `/device:RDNA:N`
    TensorFlow,
}

/// A parsed device identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceSpec {
    pub scheme: DeviceScheme,
    pub index: usize,
}

const RDNA_PREFIX: &str = "rdna";
const TF_PREFIX: &str = "/device:RDNA";

impl FromStr for DeviceSpec {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| ContextError::InvalidDeviceString {
            input: s.to_string(),
            reason,
        };

        let trimmed = s.trim();
        let (scheme, rest) = if let Some(rest) = trimmed.strip_prefix(TF_PREFIX) {
            (DeviceScheme::TensorFlow, rest)
        } else if let Some(rest) = trimmed.strip_prefix(RDNA_PREFIX) {
            (DeviceScheme::Rdna, rest)
        } else {
            return Err(invalid("expected \"rdna[:N]\" or \"/device:RDNA[:N]\""));
        };

        let index = match rest {
            "" => 0,
            _ => {
                let digits = rest
                    .strip_prefix(':')
                    .ok_or_else(|| invalid("unexpected characters after device name"))?;
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid("device index must be a non-negative integer"));
                }
                digits
                    .parse()
                    .map_err(|_| invalid("device index is too large"))?
            }
        };

        Ok(DeviceSpec { scheme, index })
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            DeviceScheme::Rdna => write!(f, "{RDNA_PREFIX}:{}", self.index),
            DeviceScheme::TensorFlow => write!(f, "{TF_PREFIX}:{}", self.index),
        }
    }
}

#[derive(Debug)]
struct SavedDevice {
    token: u64,
    previous: Option<usize>,
}

#[derive(Debug, Default)]
struct DeviceStack {
    active: Option<usize>,
    saved: Vec<SavedDevice>,
    next_token: u64,
}

/// The active device index, shared by all threads using one runtime.
#[derive(Debug, Default)]
pub struct CurrentDevice {
    state: Mutex<DeviceStack>,
}

impl CurrentDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset after discovery: device 0 if any device exists, else none.
    pub fn reset(&self, device_count: usize) {
        let mut state = lock(&self.state);
        state.active = (device_count > 0).then_some(0);
        state.saved.clear();
    }

    /// The active index, or `None` when no device is available.
    pub fn get(&self) -> Option<usize> {
        lock(&self.state).active
    }

    /// Make `index` the active device, returning the previous one.
    pub fn set(&self, registry: &DeviceRegistry, index: usize) -> Result<usize, DeviceError> {
        registry.check_index(index)?;
        let mut state = lock(&self.state);
        let previous = state.active.replace(index);
        debug!(device = index, ?previous, "Current device set");
        // A valid index implies at least one device, so `active` was populated.
        Ok(previous.unwrap_or(0))
    }

    /// Switch to `index` until the returned guard is dropped.
    pub fn enter(
        &self,
        registry: &DeviceRegistry,
        index: usize,
    ) -> Result<DeviceGuard<'_>, DeviceError> {
        registry.check_index(index)?;
        let mut state = lock(&self.state);
        let token = state.next_token;
        state.next_token += 1;
        let previous = state.active.replace(index);
        state.saved.push(SavedDevice { token, previous });
        debug!(device = index, ?previous, depth = state.saved.len(), "Entered device scope");

        Ok(DeviceGuard {
            owner: self,
            token,
            index,
        })
    }

    /// Number of device scopes currently open.
    pub fn depth(&self) -> usize {
        lock(&self.state).saved.len()
    }

    fn exit(&self, token: u64) {
        let mut state = lock(&self.state);
        let Some(pos) = state.saved.iter().rposition(|s| s.token == token) else {
            // Already unwound by an enclosing guard.
            return;
        };
        if pos + 1 != state.saved.len() {
            warn!(
                skipped = state.saved.len() - pos - 1,
                "Device scope exited out of order; unwinding nested scopes"
            );
        }
        let previous = state.saved[pos].previous;
        state.saved.truncate(pos);
        state.active = previous;
        debug!(?previous, depth = state.saved.len(), "Exited device scope");
    }
}

/// Restores the previously active device on drop, including during unwinding.
#[derive(Debug)]
#[must_use = "the device is restored as soon as the guard is dropped"]
pub struct DeviceGuard<'a> {
    owner: &'a CurrentDevice,
    token: u64,
    index: usize,
}

impl DeviceGuard<'_> {
    /// The device this scope selected.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        self.owner.exit(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::driver::SimulatedDriver;

    fn registry(count: usize) -> DeviceRegistry {
        let registry = DeviceRegistry::new();
        registry.discover(&SimulatedDriver::rx6800xt(count)).unwrap();
        registry
    }

    #[test]
    fn test_parse_device_strings() {
        let cases = [
            ("rdna", DeviceScheme::Rdna, 0),
            ("rdna:3", DeviceScheme::Rdna, 3),
            (" rdna:1 ", DeviceScheme::Rdna, 1),
            ("/device:RDNA", DeviceScheme::TensorFlow, 0),
            ("/device:RDNA:2", DeviceScheme::TensorFlow, 2),
        ];
        for (input, scheme, index) in cases {
            let spec: DeviceSpec = input.parse().unwrap();
            assert_eq!(spec, DeviceSpec { scheme, index }, "input {input:?}");
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for input in ["cuda:0", "rdna:", "rdna:x", "rdna:-1", "rdna0", "/device:GPU:0", "", "rdna:1:2"] {
            let err = input.parse::<DeviceSpec>().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "input {input:?}");
        }
    }

    #[test]
    fn test_display_roundtrips_scheme() {
        let spec: DeviceSpec = "/device:RDNA:4".parse().unwrap();
        assert_eq!(spec.to_string(), "/device:RDNA:4");
        assert_eq!("rdna".parse::<DeviceSpec>().unwrap().to_string(), "rdna:0");
    }

    #[test]
    fn test_set_returns_previous() {
        let reg = registry(2);
        let current = CurrentDevice::new();
        current.reset(reg.device_count());

        assert_eq!(current.get(), Some(0));
        assert_eq!(current.set(&reg, 1).unwrap(), 0);
        assert_eq!(current.get(), Some(1));
        assert!(matches!(
            current.set(&reg, 2),
            Err(DeviceError::OutOfRange { index: 2, count: 2 })
        ));
        assert_eq!(current.get(), Some(1));
    }

    #[test]
    fn test_nested_guards_restore_lifo() {
        let reg = registry(3);
        let current = CurrentDevice::new();
        current.reset(reg.device_count());

        {
            let outer = current.enter(&reg, 1).unwrap();
            assert_eq!(outer.index(), 1);
            {
                let _inner = current.enter(&reg, 2).unwrap();
                assert_eq!(current.get(), Some(2));
                assert_eq!(current.depth(), 2);
            }
            assert_eq!(current.get(), Some(1));
        }
        assert_eq!(current.get(), Some(0));
        assert_eq!(current.depth(), 0);
    }

    #[test]
    fn test_out_of_order_drop_unwinds_inner() {
        let reg = registry(3);
        let current = CurrentDevice::new();
        current.reset(reg.device_count());

        let outer = current.enter(&reg, 1).unwrap();
        let inner = current.enter(&reg, 2).unwrap();
        drop(outer);
        assert_eq!(current.get(), Some(0));
        drop(inner);
        assert_eq!(current.get(), Some(0));
        assert_eq!(current.depth(), 0);
    }

    #[test]
    fn test_enter_invalid_index_leaves_state() {
        let reg = registry(1);
        let current = CurrentDevice::new();
        current.reset(reg.device_count());

        assert!(current.enter(&reg, 5).is_err());
        assert_eq!(current.get(), Some(0));
        assert_eq!(current.depth(), 0);
    }
}
