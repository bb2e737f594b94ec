//! Device capability interface.
//!
//! The orchestrator only talks to devices through [`DeviceAdapter`], so a
//! vendor backend (see [`crate::nvidia`]) or a test fake can be injected.

use std::{fmt, path::Path, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::guard::{AccountingSession, GuardError};

/// Tri-state result of reading a device mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeStatus {
    On,
    Off,
    Unsupported,
}

impl ModeStatus {
    /// Parse the textual status reported by device tools.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "enabled" | "on" | "1" => Self::On,
            "disabled" | "off" | "0" => Self::Off,
            _ => Self::Unsupported,
        }
    }
}

/// Device modes the harness pins before benchmarking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceMode {
    /// Error-correcting memory.
    Ecc,
    /// Driver stays loaded between processes.
    Persistence,
    /// Opportunistic clock boosting.
    AutoBoost,
}

impl DeviceMode {
    pub const ALL: [Self; 3] = [Self::Ecc, Self::Persistence, Self::AutoBoost];

    /// Whether the mode should be enabled while benchmarking.
    #[must_use]
    pub fn wanted_enabled(self) -> bool {
        matches!(self, Self::Persistence)
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ecc => write!(f, "ecc"),
            Self::Persistence => write!(f, "persistence"),
            Self::AutoBoost => write!(f, "auto-boost"),
        }
    }
}

/// A device as enumerated by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub index: u32,
    pub name: String,
}

/// One utilization sample.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AccountingEntry {
    /// Unix time of the sample in milliseconds.
    pub timestamp_ms: i64,
    /// Device utilization in percent.
    pub gpu_util: f64,
    /// Memory controller utilization in percent.
    pub mem_util: f64,
    /// Memory in use, in MiB.
    pub max_memory_usage: f64,
}

impl AccountingEntry {
    /// Change since `previous`, stamped with this sample's time.
    #[must_use]
    pub fn delta(&self, previous: Option<&Self>) -> Self {
        let base = previous.copied().unwrap_or_default();
        Self {
            timestamp_ms: self.timestamp_ms,
            gpu_util: self.gpu_util - base.gpu_util,
            mem_util: self.mem_util - base.mem_util,
            max_memory_usage: self.max_memory_usage - base.max_memory_usage,
        }
    }
}

/// Query and control primitives for a host's compute devices.
pub trait DeviceAdapter: Send + Sync {
    /// Enumerate devices.
    fn list_devices(&self) -> Result<Vec<DeviceHandle>, DeviceError>;

    /// Read a mode flag.
    fn mode(&self, device: &DeviceHandle, mode: DeviceMode) -> Result<ModeStatus, DeviceError>;

    /// Turn a mode flag on or off.
    fn set_mode(
        &self,
        device: &DeviceHandle,
        mode: DeviceMode,
        enabled: bool,
    ) -> Result<(), DeviceError>;

    /// Take one utilization sample across the host's devices.
    fn sample(&self) -> Result<AccountingEntry, DeviceError>;

    /// Start sampling into `path` until the returned session is dropped.
    fn begin_accounting(
        self: Arc<Self>,
        path: &Path,
        interval: Duration,
    ) -> Result<AccountingSession, GuardError>
    where
        Self: Sized + 'static,
    {
        AccountingSession::start(self, path, interval)
    }
}

/// Pin every device into benchmarking modes: ECC off, persistence on,
/// auto-boost off.
///
/// Failures are logged and never abort; the returned list holds whatever
/// devices could be enumerated, possibly none.
pub fn prepare_devices<A: DeviceAdapter + ?Sized>(adapter: &A) -> Vec<DeviceHandle> {
    let devices = match adapter.list_devices() {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!("Device enumeration failed, continuing without devices: {e}");
            return Vec::new();
        }
    };
    tracing::info!("Found {} devices", devices.len());

    for device in &devices {
        for mode in DeviceMode::ALL {
            let wanted = mode.wanted_enabled();
            match adapter.mode(device, mode) {
                Ok(ModeStatus::Unsupported) => {
                    tracing::debug!("Device {}: {mode} mode unsupported", device.index);
                }
                Ok(status) if (status == ModeStatus::On) == wanted => {}
                Ok(_) => match adapter.set_mode(device, mode, wanted) {
                    Ok(()) => tracing::info!(
                        "Device {}: turned {mode} mode {}",
                        device.index,
                        if wanted { "on" } else { "off" }
                    ),
                    Err(e) => tracing::warn!("Device {}: failed to set {mode} mode: {e}", device.index),
                },
                Err(e) => tracing::warn!("Device {}: failed to read {mode} mode: {e}", device.index),
            }
        }
    }

    devices
}

/// Errors reported by a device adapter.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device tool unavailable: {0}")]
    Unavailable(String),
    #[error("device command failed: {0}")]
    Command(String),
    #[error("unexpected device tool output: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use super::*;

    struct FakeDevices {
        modes: Mutex<HashMap<(u32, &'static str), ModeStatus>>,
        writes: Mutex<Vec<(u32, DeviceMode, bool)>>,
    }

    fn key(mode: DeviceMode) -> &'static str {
        match mode {
            DeviceMode::Ecc => "ecc",
            DeviceMode::Persistence => "pm",
            DeviceMode::AutoBoost => "boost",
        }
    }

    impl DeviceAdapter for FakeDevices {
        fn list_devices(&self) -> Result<Vec<DeviceHandle>, DeviceError> {
            Ok(vec![
                DeviceHandle {
                    index: 0,
                    name: "fake0".into(),
                },
                DeviceHandle {
                    index: 1,
                    name: "fake1".into(),
                },
            ])
        }

        fn mode(&self, device: &DeviceHandle, mode: DeviceMode) -> Result<ModeStatus, DeviceError> {
            Ok(*self
                .modes
                .lock()
                .unwrap()
                .get(&(device.index, key(mode)))
                .unwrap_or(&ModeStatus::Unsupported))
        }

        fn set_mode(
            &self,
            device: &DeviceHandle,
            mode: DeviceMode,
            enabled: bool,
        ) -> Result<(), DeviceError> {
            self.writes.lock().unwrap().push((device.index, mode, enabled));
            Ok(())
        }

        fn sample(&self) -> Result<AccountingEntry, DeviceError> {
            Ok(AccountingEntry::default())
        }
    }

    #[test]
    fn test_prepare_only_flips_wrong_modes() {
        let devices = FakeDevices {
            modes: Mutex::new(HashMap::from([
                ((0, "ecc"), ModeStatus::On),
                ((0, "pm"), ModeStatus::Off),
                ((0, "boost"), ModeStatus::Off),
                ((1, "ecc"), ModeStatus::Off),
                ((1, "pm"), ModeStatus::On),
                ((1, "boost"), ModeStatus::On),
            ])),
            writes: Mutex::new(Vec::new()),
        };

        let found = prepare_devices(&devices);
        assert_eq!(found.len(), 2);

        let writes = devices.writes.lock().unwrap().clone();
        assert_eq!(
            writes,
            vec![
                (0, DeviceMode::Ecc, false),
                (0, DeviceMode::Persistence, true),
                (1, DeviceMode::AutoBoost, false),
            ]
        );
    }

    #[test]
    fn test_unsupported_modes_untouched() {
        let devices = FakeDevices {
            modes: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
        };
        prepare_devices(&devices);
        assert!(devices.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_mode_status_parse() {
        assert_eq!(ModeStatus::parse("Enabled"), ModeStatus::On);
        assert_eq!(ModeStatus::parse(" Disabled "), ModeStatus::Off);
        assert_eq!(ModeStatus::parse("[N/A]"), ModeStatus::Unsupported);
        assert_eq!(ModeStatus::parse("[Not Supported]"), ModeStatus::Unsupported);
    }

    #[test]
    fn test_delta_against_previous() {
        let first = AccountingEntry {
            timestamp_ms: 1,
            gpu_util: 40.0,
            mem_util: 10.0,
            max_memory_usage: 1000.0,
        };
        let second = AccountingEntry {
            timestamp_ms: 2,
            gpu_util: 55.0,
            mem_util: 12.0,
            max_memory_usage: 1500.0,
        };
        let delta = second.delta(Some(&first));
        assert_eq!(delta.timestamp_ms, 2);
        assert_eq!(delta.gpu_util, 15.0);
        assert_eq!(delta.max_memory_usage, 500.0);
        assert_eq!(first.delta(None), first);
    }
}
