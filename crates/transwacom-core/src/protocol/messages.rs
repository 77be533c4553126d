//! All TransWacom protocol message types.
//!
//! Forward-compat rules: unknown top-level keys are ignored on decode (serde
//! default behavior), unknown event codes travel through and are dropped at
//! injection, and an unknown `type` is a protocol violation. The `version`
//! field is compared by major component only.

use serde::{Deserialize, Serialize};

use crate::domain::device::{CapabilityProfile, DeviceKind};
use crate::protocol::codes;

/// Protocol version sent in every handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Frames longer than this (including the trailing newline) are a protocol
/// violation on both encode and decode.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// One input event on the wire.
///
/// `code` is the symbolic axis/button name (`ABS_X`, `BTN_STYLUS`, ...);
/// `ts` is monotonic seconds since the capture started. The last element of
/// a logical batch is always the synthetic synchronization code
/// `SYN_REPORT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub code: String,
    pub value: i32,
    pub ts: f64,
}

impl EventRecord {
    pub fn new(code: impl Into<String>, value: i32, ts: f64) -> Self {
        Self { code: code.into(), value, ts }
    }

    /// `true` for the batch-terminating synchronization event.
    pub fn is_syn_report(&self) -> bool {
        self.code == codes::SYN_REPORT
    }
}

/// The four TransWacom messages, discriminated by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Host → consumer, first frame of every session.
    Handshake {
        host_name: String,
        host_id: String,
        version: String,
        /// Exactly one profile per session in practice; an array on the
        /// wire for forward compatibility.
        devices: Vec<CapabilityProfile>,
    },
    /// Consumer → host, the authorization verdict.
    AuthResponse {
        accepted: bool,
        consumer_name: String,
        consumer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Host → consumer. An empty `events` array is the liveness keepalive.
    Event {
        device_type: DeviceKind,
        events: Vec<EventRecord>,
    },
    /// Either direction. Advisory; the receiver still runs full teardown.
    Bye {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl WireMessage {
    /// The wire spelling of this message's `type` field.
    pub fn kind_name(&self) -> &'static str {
        match self {
            WireMessage::Handshake { .. } => "handshake",
            WireMessage::AuthResponse { .. } => "auth_response",
            WireMessage::Event { .. } => "event",
            WireMessage::Bye { .. } => "bye",
        }
    }
}

/// Compares two protocol version strings by major component.
///
/// `"1.0"` and `"1.3"` are compatible; `"2.0"` is not. A version with no
/// parseable major component is never compatible.
pub fn version_compatible(ours: &str, theirs: &str) -> bool {
    fn major(v: &str) -> Option<&str> {
        let m = v.split('.').next()?;
        if m.is_empty() || !m.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(m)
    }
    match (major(ours), major(theirs)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_record_recognizes_syn_report() {
        assert!(EventRecord::new("SYN_REPORT", 0, 0.0).is_syn_report());
        assert!(!EventRecord::new("ABS_X", 512, 0.0).is_syn_report());
    }

    #[test]
    fn test_handshake_serializes_with_type_tag() {
        let msg = WireMessage::Handshake {
            host_name: "HostA".to_string(),
            host_id: "H1".to_string(),
            version: PROTOCOL_VERSION.to_string(),
            devices: vec![],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"handshake\""));
        assert!(json.contains("\"host_name\":\"HostA\""));
    }

    #[test]
    fn test_auth_response_omits_reason_when_accepted() {
        let msg = WireMessage::AuthResponse {
            accepted: true,
            consumer_name: "studio".to_string(),
            consumer_id: "C1".to_string(),
            reason: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("reason"));
    }

    #[test]
    fn test_unknown_top_level_keys_are_ignored() {
        let json = r#"{"type":"bye","reason":"done","next_gen_field":42}"#;
        let msg: WireMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg, WireMessage::Bye { reason: Some("done".to_string()) });
    }

    #[test]
    fn test_version_compatibility_is_major_only() {
        assert!(version_compatible("1.0", "1.0"));
        assert!(version_compatible("1.0", "1.7"));
        assert!(!version_compatible("1.0", "2.0"));
        assert!(!version_compatible("1.0", "garbage"));
        assert!(!version_compatible("1.0", ""));
    }
}
