//! Device descriptors shared between the catalog and the engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sampling interval used when a device record carries none.
pub const DEFAULT_INTERVAL_SECS: u32 = 60;

/// One configured camera.
///
/// `active` is written only by `Engine::start` / `Engine::stop` (and mirrored
/// to the catalog); every other field is owned by the catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: i64,
    pub name: String,
    pub stream_address: String,
    /// Empty means "buffer in memory and relay in batches".
    pub destination_path: String,
    pub interval_seconds: u32,
    pub active: bool,
}

impl DeviceDescriptor {
    pub fn new(
        id: i64,
        name: impl Into<String>,
        stream_address: impl Into<String>,
        destination_path: impl Into<String>,
        interval_seconds: u32,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            stream_address: stream_address.into(),
            destination_path: destination_path.into(),
            interval_seconds: normalize_interval(interval_seconds),
            active: false,
        }
    }

    /// Sampling interval as a duration, never shorter than one second.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(normalize_interval(self.interval_seconds)))
    }

    pub fn uses_local_storage(&self) -> bool {
        !self.destination_path.trim().is_empty()
    }
}

/// Fields for a device that has not been assigned an id yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDevice {
    pub name: String,
    pub stream_address: String,
    pub destination_path: String,
    pub interval_seconds: Option<u32>,
}

impl NewDevice {
    pub fn into_descriptor(self, id: i64) -> DeviceDescriptor {
        DeviceDescriptor::new(
            id,
            self.name,
            self.stream_address,
            self.destination_path,
            self.interval_seconds.unwrap_or(DEFAULT_INTERVAL_SECS),
        )
    }
}

/// A zero interval is treated as unset.
pub fn normalize_interval(interval_seconds: u32) -> u32 {
    if interval_seconds == 0 {
        DEFAULT_INTERVAL_SECS
    } else {
        interval_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_falls_back_to_default() {
        let device = DeviceDescriptor::new(1, "cam1", "stub://cam1", "", 0);
        assert_eq!(device.interval_seconds, DEFAULT_INTERVAL_SECS);
        assert_eq!(device.interval(), Duration::from_secs(60));
    }

    #[test]
    fn blank_destination_selects_buffering() {
        let buffered = DeviceDescriptor::new(1, "cam1", "stub://cam1", "  ", 5);
        let local = DeviceDescriptor::new(2, "cam2", "stub://cam2", "/data/cam2", 5);
        assert!(!buffered.uses_local_storage());
        assert!(local.uses_local_storage());
    }

    #[test]
    fn new_device_defaults_interval() {
        let new = NewDevice {
            name: "cam1".to_string(),
            stream_address: "stub://cam1".to_string(),
            destination_path: String::new(),
            interval_seconds: None,
        };
        let device = new.into_descriptor(7);
        assert_eq!(device.id, 7);
        assert_eq!(device.interval_seconds, 60);
        assert!(!device.active);
    }
}
