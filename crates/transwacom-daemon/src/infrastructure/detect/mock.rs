//! Fixture enumerator for unit and integration testing.
//!
//! Lets tests present an arbitrary set of devices without touching
//! `/dev/input`, and change the set between calls to exercise the
//! arrival/departure watcher.

use std::sync::Mutex;

use transwacom_core::PhysicalDevice;

use super::{DetectError, DeviceEnumerator};

/// A [`DeviceEnumerator`] backed by an in-memory list.
#[derive(Default)]
pub struct MockDetector {
    devices: Mutex<Vec<PhysicalDevice>>,
}

impl MockDetector {
    pub fn new(devices: Vec<PhysicalDevice>) -> Self {
        Self { devices: Mutex::new(devices) }
    }

    /// Replaces the visible device set, as if hardware was plugged or
    /// unplugged.
    pub fn set_devices(&self, devices: Vec<PhysicalDevice>) {
        *self.devices.lock().expect("lock poisoned") = devices;
    }
}

impl DeviceEnumerator for MockDetector {
    fn enumerate(&self) -> Vec<PhysicalDevice> {
        self.devices.lock().expect("lock poisoned").clone()
    }

    fn describe(&self, path: &str) -> Result<PhysicalDevice, DetectError> {
        self.devices
            .lock()
            .expect("lock poisoned")
            .iter()
            .find(|d| d.path == path)
            .cloned()
            .ok_or_else(|| DetectError::NotFound { path: path.to_string() })
    }
}
