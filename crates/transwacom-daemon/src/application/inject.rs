//! Injection use case: received event batches → virtual device writes.
//!
//! Sits between the consumer session and the [`VirtualOutput`] seam. For
//! each batch it resolves symbolic codes to raw pairs, clamps absolute
//! values into the ranges the handshake declared, and drops codes outside
//! the registry (counting them). Synchronization is normalized here: the
//! trailing `SYN_REPORT` is stripped if the sender included one, and the
//! output implementation closes every batch with its own sync frame — so a
//! sender that omits the terminator still produces a correctly framed
//! injection.

use tracing::trace;

use transwacom_core::protocol::codes::{self, EV_ABS, EV_SYN};
use transwacom_core::{CapabilityProfile, EventRecord};

use crate::infrastructure::emulation::{EmulationError, RawEvent, VirtualOutput};

/// Drives one virtual device for the lifetime of a consumer session.
pub struct InjectUseCase {
    profile: CapabilityProfile,
    output: Box<dyn VirtualOutput>,
    dropped_unknown: u64,
}

impl InjectUseCase {
    pub fn new(profile: CapabilityProfile, output: Box<dyn VirtualOutput>) -> Self {
        Self {
            profile,
            output,
            dropped_unknown: 0,
        }
    }

    /// Injects one batch in the order received.
    ///
    /// # Errors
    ///
    /// Propagates write failures from the output; the session treats them
    /// as resource errors and drains.
    pub fn inject(&mut self, events: &[EventRecord]) -> Result<(), EmulationError> {
        let mut raw = Vec::with_capacity(events.len());
        for event in events {
            let Some((event_type, code)) = codes::resolve(&event.code) else {
                self.dropped_unknown += 1;
                trace!(code = %event.code, "dropping unknown event code");
                continue;
            };
            if event_type == EV_SYN {
                // The output appends its own synchronization frame.
                continue;
            }
            let value = if event_type == EV_ABS {
                match self.profile.axes.get(&event.code) {
                    Some(range) => range.clamp(event.value),
                    None => event.value,
                }
            } else {
                event.value
            };
            raw.push(RawEvent { event_type, code, value });
        }
        self.output.emit(&raw)
    }

    /// How many events were dropped for carrying unknown codes.
    pub fn dropped_unknown(&self) -> u64 {
        self.dropped_unknown
    }

    /// Destroys the virtual device. Idempotent.
    pub fn destroy(&mut self) {
        self.output.destroy();
    }

    pub fn is_alive(&self) -> bool {
        self.output.is_alive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
