//! Per-peer trust policy.
//!
//! Trust is keyed by `(peer_name, peer_machine_id)`: a stored policy only
//! applies when both match, so renaming a machine or reinstalling it (which
//! regenerates the fingerprint) drops back to the untrusted path.

use serde::{Deserialize, Serialize};

use super::device::DeviceKind;

/// The pair a peer presents about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub name: String,
    pub machine_id: String,
}

impl PeerIdentity {
    pub fn new(name: impl Into<String>, machine_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            machine_id: machine_id.into(),
        }
    }
}

/// Stored decision about a known peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerPolicy {
    /// Skip the interactive authorization prompt for this peer.
    pub auto_accept: bool,
    /// Device kinds this peer may share with us / receive from us.
    pub allowed_kinds: Vec<DeviceKind>,
}

impl PeerPolicy {
    /// A policy allowing every kind, used when a peer is trusted via the
    /// authorization prompt without narrowing.
    pub fn allow_all(auto_accept: bool) -> Self {
        Self {
            auto_accept,
            allowed_kinds: vec![DeviceKind::Tablet, DeviceKind::Joystick],
        }
    }

    pub fn allows(&self, kind: DeviceKind) -> bool {
        self.allowed_kinds.contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all_covers_both_kinds() {
        let policy = PeerPolicy::allow_all(true);
        assert!(policy.allows(DeviceKind::Tablet));
        assert!(policy.allows(DeviceKind::Joystick));
    }

    #[test]
    fn test_narrowed_policy_rejects_other_kind() {
        let policy = PeerPolicy {
            auto_accept: true,
            allowed_kinds: vec![DeviceKind::Joystick],
        };
        assert!(policy.allows(DeviceKind::Joystick));
        assert!(!policy.allows(DeviceKind::Tablet));
    }
}
