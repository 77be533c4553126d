//! # transwacom-daemon
//!
//! The unified TransWacom daemon. A single process can act as **host**
//! (grab a local tablet or joystick and stream its events out) and as
//! **consumer** (accept streams and synthesize virtual devices) at the same
//! time, for different devices.
//!
//! The crate is split into two layers, following the usual dependency rule
//! (outer layers depend on inner ones, never the reverse):
//!
//! - **`application`** – role-independent use cases: the supervisor (session
//!   registry and driver API), the authorization decision, and event
//!   injection. Everything OS-facing is reached through traits.
//! - **`infrastructure`** – the concrete edges: evdev detection and capture,
//!   uinput emulation, the xsetwacom/xinput mode controller, mDNS
//!   discovery, the YAML config store, and the TCP session engine.
//!
//! `main.rs` wires the two together and owns process concerns: logging,
//! signal handling, and exit codes.

pub mod application;
pub mod infrastructure;
