//! Consumer-side virtual device emulation.
//!
//! A consumer session turns an accepted capability profile into a uinput
//! node and writes the received batches to it. The session engine reaches
//! the OS through two seams: [`OutputFactory`] (build a device for a
//! profile) and [`VirtualOutput`] (emit batches, destroy). The production
//! implementations live in [`uinput`], the recording test doubles in
//! [`mock`].

pub mod mock;
pub mod uinput;

use thiserror::Error;

use transwacom_core::{CapabilityProfile, DeviceKind};

/// Error type for emulation operations.
#[derive(Debug, Error)]
pub enum EmulationError {
    /// The device kind is disabled in the consumer config.
    #[error("{kind} devices are disabled on this consumer")]
    Refused { kind: DeviceKind },

    /// `/dev/uinput` is missing or not writable.
    #[error("uinput unavailable: {source}")]
    Permission {
        #[source]
        source: std::io::Error,
    },

    /// The virtual node was already destroyed.
    #[error("virtual device has been destroyed")]
    Destroyed,

    /// Any other I/O failure while building or writing.
    #[error("uinput I/O: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// One event ready for injection, in raw kernel terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub event_type: u16,
    pub code: u16,
    pub value: i32,
}

/// A live virtual device.
pub trait VirtualOutput: Send {
    /// Writes one batch in order and closes it with a synchronization
    /// frame. The batch passed here never contains a trailing `SYN_REPORT`;
    /// the implementation owns synchronization.
    ///
    /// # Errors
    ///
    /// Returns [`EmulationError::Destroyed`] after `destroy`, or the
    /// underlying write failure.
    fn emit(&mut self, events: &[RawEvent]) -> Result<(), EmulationError>;

    /// Removes the virtual node. Idempotent; subsequent `emit` calls fail.
    fn destroy(&mut self);

    /// Whether the node still exists.
    fn is_alive(&self) -> bool;
}

/// Builds virtual devices for accepted sessions.
pub trait OutputFactory: Send + Sync {
    /// Creates a virtual device matching `profile`, named after the sharing
    /// peer.
    ///
    /// # Errors
    ///
    /// Returns [`EmulationError::Refused`] when the kind is disabled in
    /// config, [`EmulationError::Permission`] when uinput is inaccessible.
    fn create(
        &self,
        profile: &CapabilityProfile,
        peer_name: &str,
    ) -> Result<Box<dyn VirtualOutput>, EmulationError>;
}

/// The product name the virtual node advertises.
pub fn device_name(kind: DeviceKind, peer_name: &str) -> String {
    format!("TransWacom Virtual {kind} ({peer_name})")
}
