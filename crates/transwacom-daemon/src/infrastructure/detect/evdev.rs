//! evdev-backed device enumeration.
//!
//! Walks `/dev/input/event*`, reduces each node's kernel capability bitmap
//! to the symbolic names the registry knows, and classifies the result.
//! Nodes we cannot open (usually a permissions problem on individual nodes)
//! are skipped during enumeration and reported as typed errors from
//! `describe`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use evdev::Device;
use tracing::debug;

use transwacom_core::protocol::codes::{self, EV_ABS, EV_KEY, EV_REL};
use transwacom_core::{AxisRange, DeviceKind, PhysicalDevice};

use super::{classify, DetectError, DeviceEnumerator};
use crate::infrastructure::capture::tablet::{lookup_tool_id, ModeCommandRunner};

/// The production detector.
pub struct EvdevDetector {
    /// Runner for the vendor-tool lookup (`xsetwacom`/`xinput`).
    runner: Arc<dyn ModeCommandRunner>,
}

impl EvdevDetector {
    pub fn new(runner: Arc<dyn ModeCommandRunner>) -> Self {
        Self { runner }
    }

    /// Reduces one open device to a classified [`PhysicalDevice`].
    ///
    /// Returns `None` for devices that are neither tablets nor joysticks.
    fn reduce(&self, path: &str, device: &Device) -> Option<PhysicalDevice> {
        let display_name = device.name().unwrap_or("unknown device").to_string();

        let mut capabilities = Vec::new();
        if let Some(keys) = device.supported_keys() {
            for key in keys.iter() {
                if let Some(name) = codes::name_for(EV_KEY, key.0) {
                    capabilities.push(name.to_string());
                }
            }
        }
        if let Some(axes) = device.supported_absolute_axes() {
            for axis in axes.iter() {
                if let Some(name) = codes::name_for(EV_ABS, axis.0) {
                    capabilities.push(name.to_string());
                }
            }
        }
        if let Some(rels) = device.supported_relative_axes() {
            for rel in rels.iter() {
                if let Some(name) = codes::name_for(EV_REL, rel.0) {
                    capabilities.push(name.to_string());
                }
            }
        }

        let kind = classify(&display_name, &capabilities)?;

        let mut axes = BTreeMap::new();
        if let Ok(infos) = device.get_absinfo() {
            for (axis, info) in infos {
                if let Some(name) = codes::name_for(EV_ABS, axis.0) {
                    axes.insert(
                        name.to_string(),
                        AxisRange {
                            min: info.minimum(),
                            max: info.maximum(),
                            resolution: info.resolution(),
                        },
                    );
                }
            }
        }

        // The vendor tool only knows tablets; absence is not an error.
        let vendor_tool_id = match kind {
            DeviceKind::Tablet => lookup_tool_id(self.runner.as_ref(), &display_name),
            DeviceKind::Joystick => None,
        };

        Some(PhysicalDevice {
            path: path.to_string(),
            kind,
            display_name,
            capabilities,
            axes,
            vendor_tool_id,
        })
    }
}

impl DeviceEnumerator for EvdevDetector {
    fn enumerate(&self) -> Vec<PhysicalDevice> {
        let mut devices = Vec::new();
        for (path, device) in evdev::enumerate() {
            let path = path.to_string_lossy().into_owned();
            match self.reduce(&path, &device) {
                Some(dev) => devices.push(dev),
                None => debug!(path, "skipping non-shareable device"),
            }
        }
        devices
    }

    fn describe(&self, path: &str) -> Result<PhysicalDevice, DetectError> {
        let device = Device::open(Path::new(path)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DetectError::NotFound { path: path.to_string() },
            std::io::ErrorKind::PermissionDenied => DetectError::Permission {
                path: path.to_string(),
                source: e,
            },
            _ => DetectError::Io { path: path.to_string(), source: e },
        })?;
        self.reduce(path, &device)
            .ok_or_else(|| DetectError::NotFound { path: path.to_string() })
    }
}
