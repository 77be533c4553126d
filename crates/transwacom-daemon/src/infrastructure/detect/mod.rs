//! Physical input-device detection and classification.
//!
//! Classification looks only at the capability summary and device name, in
//! this order:
//!
//! 1. Pressure plus a stylus button, or a name carrying the graphics-tablet
//!    vendor tag → `tablet`.
//! 2. A pair of absolute sticks (or a hat) plus gamepad buttons →
//!    `joystick`.
//! 3. Anything else is not reportable.
//!
//! The rules themselves are pure functions over symbolic capability names so
//! they can be tested without device nodes; the evdev-backed enumerator
//! lives in [`evdev`] and the supervisor reaches detection through the
//! [`DeviceEnumerator`] trait so tests can substitute a fixture.

pub mod evdev;
pub mod mock;

use thiserror::Error;

use transwacom_core::{DeviceKind, PhysicalDevice};

/// Error type for detection operations.
#[derive(Debug, Error)]
pub enum DetectError {
    /// No device exists at the requested path, or it is not reportable.
    #[error("no shareable device at {path}")]
    NotFound { path: String },

    /// The OS denied access to the input node.
    #[error("permission denied opening {path}: {source}")]
    Permission {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Any other I/O failure while probing.
    #[error("probe failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Enumeration seam between the supervisor and the OS.
pub trait DeviceEnumerator: Send + Sync {
    /// Lists every reportable device, classified.
    fn enumerate(&self) -> Vec<PhysicalDevice>;

    /// Describes a single device by path.
    ///
    /// # Errors
    ///
    /// Returns [`DetectError::NotFound`] when the path does not exist or is
    /// not a tablet or joystick.
    fn describe(&self, path: &str) -> Result<PhysicalDevice, DetectError>;
}

/// Name substrings that mark a graphics tablet regardless of capabilities.
const TABLET_NAME_TAGS: &[&str] = &["wacom", "pen"];

/// Applies the classification rules to a capability summary and name.
///
/// `capabilities` holds symbolic code names as produced by the registry
/// (`ABS_X`, `BTN_STYLUS`, ...).
pub fn classify(name: &str, capabilities: &[String]) -> Option<DeviceKind> {
    let has = |cap: &str| capabilities.iter().any(|c| c == cap);
    let name_lower = name.to_lowercase();

    // Rule 1: tablets. Pressure + stylus button, or the vendor name tag.
    let stylus = has("ABS_PRESSURE") && has("BTN_STYLUS");
    let vendor_tag = TABLET_NAME_TAGS.iter().any(|tag| name_lower.contains(tag));
    if stylus || vendor_tag {
        return Some(DeviceKind::Tablet);
    }

    // Rule 2: joysticks. A stick pair or a hat, plus at least one gamepad
    // button so plain touchpads (which also expose ABS_X/ABS_Y) do not match.
    let stick = (has("ABS_X") && has("ABS_Y"))
        || (has("ABS_RX") && has("ABS_RY"))
        || (has("ABS_HAT0X") && has("ABS_HAT0Y"));
    let gamepad_button = capabilities.iter().any(|c| {
        matches!(
            c.as_str(),
            "BTN_A" | "BTN_B" | "BTN_X" | "BTN_Y" | "BTN_TL" | "BTN_TR" | "BTN_TL2"
                | "BTN_TR2" | "BTN_SELECT" | "BTN_START" | "BTN_MODE" | "BTN_THUMBL"
                | "BTN_THUMBR"
        )
    });
    if stick && gamepad_button {
        return Some(DeviceKind::Joystick);
    }

    None
}
