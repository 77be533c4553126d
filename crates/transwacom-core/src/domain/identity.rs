//! Stable per-installation machine identity.

use serde::{Deserialize, Serialize};

/// Identity broadcast in discovery and the handshake.
///
/// `machine_id` is an opaque fingerprint (32 lowercase hex chars, 128 bits
/// of entropy) generated once by the config store at first start and never
/// mutated afterwards. It identifies the installation for trust bindings;
/// it is not a secret and provides no confidentiality. `machine_name` is the
/// human label and is freely editable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineIdentity {
    pub machine_id: String,
    pub machine_name: String,
}

impl MachineIdentity {
    pub fn new(machine_id: impl Into<String>, machine_name: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            machine_name: machine_name.into(),
        }
    }
}
