use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};

// Device: where a tensor's storage lives
//
// Storage is always host memory; `Cuda(n)` is a placement tag that the
// runtime checks for availability (map_location on load, device-specific
// fusion). The number of accelerators is process-wide and defaults to 0.

static ACCELERATOR_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Placement of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl Device {
    /// Whether this device can hold tensors in the current process.
    pub fn is_available(&self) -> bool {
        match self {
            Device::Cpu => true,
            Device::Cuda(idx) => *idx < ACCELERATOR_COUNT.load(Ordering::Relaxed),
        }
    }

    /// Whether this is an accelerator device.
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    /// Error unless the device is available.
    pub fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::DeviceUnavailable { device: *self })
        }
    }
}

/// Number of accelerators visible to the process.
pub fn accelerator_count() -> usize {
    ACCELERATOR_COUNT.load(Ordering::Relaxed)
}

/// Override the accelerator count. Returns the previous value.
pub fn set_accelerator_count(n: usize) -> usize {
    ACCELERATOR_COUNT.swap(n, Ordering::Relaxed)
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    /// Accepts `cpu`, `cuda` and `cuda:N`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse::<usize>().ok())
                .map(Device::Cuda)
                .ok_or_else(|| Error::InvalidDevice(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:3".parse::<Device>().unwrap(), Device::Cuda(3));
        assert!("tpu".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for d in [Device::Cpu, Device::Cuda(1)] {
            assert_eq!(d.to_string().parse::<Device>().unwrap(), d);
        }
    }

    #[test]
    fn test_cpu_always_available() {
        assert!(Device::Cpu.is_available());
        assert!(Device::Cuda(usize::MAX).ensure_available().is_err());
    }
}
