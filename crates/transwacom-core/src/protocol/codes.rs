//! Symbolic event-code registry.
//!
//! Events travel the wire as symbolic names (`ABS_PRESSURE`, `BTN_STYLUS`)
//! rather than raw kernel numbers, so the two ends do not need matching
//! header versions. This registry maps between names and the raw
//! `(event_type, code)` pairs of the Linux input subsystem for the tablet
//! and gamepad code sets TransWacom handles.
//!
//! The registry is deliberately closed: a capture that sees a code outside
//! it emits a positional fallback name (`TYPE_3_CODE_40`) which the
//! injection side counts and drops. This crate stays free of OS headers by
//! carrying the numeric constants itself.

/// Event type constants from `linux/input-event-codes.h`.
pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_ABS: u16 = 0x03;

/// Symbolic name of the batch-terminating synchronization event.
pub const SYN_REPORT: &str = "SYN_REPORT";

/// Every `(name, event_type, code)` triple the registry knows.
///
/// Tablet rows mirror what a Wacom pen reports; joystick rows cover the
/// standard gamepad layout (two sticks, two analog triggers, hat, and the
/// BTN_GAMEPAD button block).
static CODE_TABLE: &[(&str, u16, u16)] = &[
    ("SYN_REPORT", EV_SYN, 0x00),
    // Absolute axes
    ("ABS_X", EV_ABS, 0x00),
    ("ABS_Y", EV_ABS, 0x01),
    ("ABS_Z", EV_ABS, 0x02),
    ("ABS_RX", EV_ABS, 0x03),
    ("ABS_RY", EV_ABS, 0x04),
    ("ABS_RZ", EV_ABS, 0x05),
    ("ABS_HAT0X", EV_ABS, 0x10),
    ("ABS_HAT0Y", EV_ABS, 0x11),
    ("ABS_PRESSURE", EV_ABS, 0x18),
    ("ABS_DISTANCE", EV_ABS, 0x19),
    ("ABS_TILT_X", EV_ABS, 0x1a),
    ("ABS_TILT_Y", EV_ABS, 0x1b),
    // Relative axes (a tablet in relative mode reports these)
    ("REL_X", EV_REL, 0x00),
    ("REL_Y", EV_REL, 0x01),
    ("REL_WHEEL", EV_REL, 0x08),
    // Gamepad buttons
    ("BTN_A", EV_KEY, 0x130),
    ("BTN_B", EV_KEY, 0x131),
    ("BTN_X", EV_KEY, 0x133),
    ("BTN_Y", EV_KEY, 0x134),
    ("BTN_TL", EV_KEY, 0x136),
    ("BTN_TR", EV_KEY, 0x137),
    ("BTN_TL2", EV_KEY, 0x138),
    ("BTN_TR2", EV_KEY, 0x139),
    ("BTN_SELECT", EV_KEY, 0x13a),
    ("BTN_START", EV_KEY, 0x13b),
    ("BTN_MODE", EV_KEY, 0x13c),
    ("BTN_THUMBL", EV_KEY, 0x13d),
    ("BTN_THUMBR", EV_KEY, 0x13e),
    // Stylus tools and buttons
    ("BTN_TOOL_PEN", EV_KEY, 0x140),
    ("BTN_TOOL_RUBBER", EV_KEY, 0x141),
    ("BTN_TOUCH", EV_KEY, 0x14a),
    ("BTN_STYLUS", EV_KEY, 0x14b),
    ("BTN_STYLUS2", EV_KEY, 0x14c),
];

/// Resolves a symbolic name to its raw `(event_type, code)` pair.
pub fn resolve(name: &str) -> Option<(u16, u16)> {
    CODE_TABLE
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|(_, t, c)| (*t, *c))
}

/// The symbolic name for a raw `(event_type, code)` pair, if registered.
pub fn name_for(event_type: u16, code: u16) -> Option<&'static str> {
    CODE_TABLE
        .iter()
        .find(|(_, t, c)| *t == event_type && *c == code)
        .map(|(n, _, _)| *n)
}

/// Positional fallback for codes outside the registry.
///
/// The consumer cannot resolve these and drops them, but they keep the
/// batch structure intact on the wire.
pub fn fallback_name(event_type: u16, code: u16) -> String {
    format!("TYPE_{event_type}_CODE_{code}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_and_name_for_agree_on_every_entry() {
        for (name, event_type, code) in CODE_TABLE {
            assert_eq!(resolve(name), Some((*event_type, *code)), "{name}");
            assert_eq!(name_for(*event_type, *code), Some(*name), "{name}");
        }
    }

    #[test]
    fn test_table_has_no_duplicate_names_or_pairs() {
        for (i, (name, t, c)) in CODE_TABLE.iter().enumerate() {
            for (other_name, ot, oc) in &CODE_TABLE[i + 1..] {
                assert_ne!(name, other_name);
                assert!(!(t == ot && c == oc), "{name} and {other_name} share a pair");
            }
        }
    }

    #[test]
    fn test_resolve_rejects_unknown_names() {
        assert_eq!(resolve("ABS_MT_SLOT"), None);
        assert_eq!(resolve(""), None);
        assert_eq!(resolve("TYPE_3_CODE_47"), None);
    }

    #[test]
    fn test_fallback_name_is_positional() {
        assert_eq!(fallback_name(EV_ABS, 0x2f), "TYPE_3_CODE_47");
    }

    #[test]
    fn test_stylus_and_sync_codes_match_kernel_values() {
        assert_eq!(resolve("BTN_STYLUS"), Some((EV_KEY, 0x14b)));
        assert_eq!(resolve("ABS_PRESSURE"), Some((EV_ABS, 0x18)));
        assert_eq!(resolve(SYN_REPORT), Some((EV_SYN, 0)));
    }
}
