//! uinput-backed virtual devices.
//!
//! The node declares *exactly* the capabilities in the accepted profile:
//! keys as a key set, absolute axes with the host's `(min, max,
//! resolution)` carried verbatim — no coordinate mapping is performed.
//! `VirtualDevice::emit` writes the batch followed by a `SYN_REPORT`, which
//! is why [`VirtualOutput::emit`] receives batches without their trailing
//! sync event.

use std::sync::Arc;

use evdev::uinput::VirtualDevice;
use evdev::{AbsInfo, AbsoluteAxisCode, AttributeSet, InputEvent, KeyCode, RelativeAxisCode, UinputAbsSetup};
use tracing::{debug, info, warn};

use transwacom_core::protocol::codes::{self, EV_ABS, EV_KEY, EV_REL};
use transwacom_core::{AxisRange, CapabilityProfile};

use crate::infrastructure::config::ConfigStore;

use super::{device_name, EmulationError, OutputFactory, RawEvent, VirtualOutput};

/// Fallback range for an absolute axis the handshake declared without
/// metadata.
const DEFAULT_AXIS_RANGE: AxisRange = AxisRange { min: 0, max: 65535, resolution: 0 };

/// Production factory; holds the config store for the per-kind gate.
pub struct UinputOutputFactory {
    config: Arc<ConfigStore>,
}

impl UinputOutputFactory {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self { config }
    }
}

impl OutputFactory for UinputOutputFactory {
    fn create(
        &self,
        profile: &CapabilityProfile,
        peer_name: &str,
    ) -> Result<Box<dyn VirtualOutput>, EmulationError> {
        if !self.config.kind_enabled(profile.kind) {
            return Err(EmulationError::Refused { kind: profile.kind });
        }

        let name = device_name(profile.kind, peer_name);

        let mut keys: AttributeSet<KeyCode> = AttributeSet::new();
        let mut rels: AttributeSet<RelativeAxisCode> = AttributeSet::new();
        let mut abs_setups: Vec<UinputAbsSetup> = Vec::new();

        for cap in &profile.capabilities {
            match codes::resolve(cap) {
                Some((EV_KEY, code)) => {
                    keys.insert(KeyCode(code));
                }
                Some((EV_REL, code)) => {
                    rels.insert(RelativeAxisCode(code));
                }
                Some((EV_ABS, code)) => {
                    let range = profile.axes.get(cap).copied().unwrap_or(DEFAULT_AXIS_RANGE);
                    abs_setups.push(UinputAbsSetup::new(
                        AbsoluteAxisCode(code),
                        AbsInfo::new(0, range.min, range.max, 0, 0, range.resolution),
                    ));
                }
                _ => {
                    debug!(capability = %cap, "profile capability outside the registry; skipped");
                }
            }
        }

        let mut builder = VirtualDevice::builder()
            .map_err(map_uinput_error)?
            .name(&name);
        if keys.iter().next().is_some() {
            builder = builder.with_keys(&keys).map_err(map_uinput_error)?;
        }
        if rels.iter().next().is_some() {
            builder = builder.with_relative_axes(&rels).map_err(map_uinput_error)?;
        }
        for setup in &abs_setups {
            builder = builder.with_absolute_axis(setup).map_err(map_uinput_error)?;
        }
        let device = builder.build().map_err(map_uinput_error)?;
        info!(name = %name, "created virtual device");

        Ok(Box::new(UinputOutput { name, device: Some(device) }))
    }
}

fn map_uinput_error(e: std::io::Error) -> EmulationError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound => {
            EmulationError::Permission { source: e }
        }
        _ => EmulationError::Io { source: e },
    }
}

/// A live uinput node. Dropping or destroying it removes the node.
pub struct UinputOutput {
    name: String,
    device: Option<VirtualDevice>,
}

impl VirtualOutput for UinputOutput {
    fn emit(&mut self, events: &[RawEvent]) -> Result<(), EmulationError> {
        let device = self.device.as_mut().ok_or(EmulationError::Destroyed)?;
        let raw: Vec<InputEvent> = events
            .iter()
            .map(|e| InputEvent::new(e.event_type, e.code, e.value))
            .collect();
        // emit() writes the batch and appends the SYN_REPORT frame.
        device.emit(&raw)?;
        Ok(())
    }

    fn destroy(&mut self) {
        if self.device.take().is_some() {
            info!(name = %self.name, "destroyed virtual device");
        }
    }

    fn is_alive(&self) -> bool {
        self.device.is_some()
    }
}

impl Drop for UinputOutput {
    fn drop(&mut self) {
        if self.device.is_some() {
            warn!(name = %self.name, "virtual device dropped without destroy");
        }
    }
}

/// Probes write access to the uinput control node, for the startup
/// permission check.
pub fn probe_uinput_access() -> Result<(), EmulationError> {
    std::fs::OpenOptions::new()
        .write(true)
        .open("/dev/uinput")
        .map(|_| ())
        .map_err(|e| EmulationError::Permission { source: e })
}
