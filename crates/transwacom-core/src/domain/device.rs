//! Device kinds, capability summaries, and per-axis metadata.
//!
//! A [`PhysicalDevice`] is what the detector reports about a local input
//! node. The [`CapabilityProfile`] is its portable subset: the part a host
//! sends in the handshake so the consumer can build a faithful virtual twin.
//! Axis ranges travel verbatim; no coordinate-space negotiation is performed.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The two device classes TransWacom shares.
///
/// Anything that is neither a tablet nor a joystick is not reportable and
/// never appears in a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Tablet,
    Joystick,
}

impl DeviceKind {
    /// The lowercase wire/config spelling (`"tablet"`, `"joystick"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Tablet => "tablet",
            DeviceKind::Joystick => "joystick",
        }
    }

    /// Parses the lowercase spelling used in config files and TXT records.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tablet" => Some(DeviceKind::Tablet),
            "joystick" => Some(DeviceKind::Joystick),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Range metadata for one absolute axis, carried per-axis in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisRange {
    pub min: i32,
    pub max: i32,
    /// Units per millimeter; 0 when the kernel reports none.
    #[serde(default)]
    pub resolution: i32,
}

impl AxisRange {
    /// Clamps `value` into `[min, max]`.
    pub fn clamp(&self, value: i32) -> i32 {
        value.clamp(self.min, self.max)
    }
}

/// The portable description of a device carried in the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    pub kind: DeviceKind,
    #[serde(default)]
    pub display_name: String,
    /// Symbolic capability tags (`ABS_X`, `BTN_STYLUS`, ...).
    pub capabilities: Vec<String>,
    /// Range metadata for each absolute axis named in `capabilities`.
    #[serde(default)]
    pub axes: BTreeMap<String, AxisRange>,
}

impl CapabilityProfile {
    /// Returns `true` if the profile declares the given symbolic capability.
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c == name)
    }
}

/// A discovered local input device.
///
/// Enumerated on demand by the detector; nothing about it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalDevice {
    /// OS handle identifier, e.g. `/dev/input/event11`.
    pub path: String,
    pub kind: DeviceKind,
    pub display_name: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub axes: BTreeMap<String, AxisRange>,
    /// Identifier understood by the vendor mode-control tool. Only tablets
    /// have one, and its absence is not an error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_tool_id: Option<String>,
}

impl PhysicalDevice {
    /// The portable subset sent in the handshake.
    pub fn profile(&self) -> CapabilityProfile {
        CapabilityProfile {
            kind: self.kind,
            display_name: self.display_name.clone(),
            capabilities: self.capabilities.clone(),
            axes: self.axes.clone(),
        }
    }
}
