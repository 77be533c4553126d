//! # transwacom-core
//!
//! Shared library for TransWacom containing the wire protocol codec, the
//! symbolic event-code registry, and the domain entities exchanged between
//! hosts and consumers.
//!
//! TransWacom shares input devices across a LAN: the machine that owns a
//! tablet or joystick (the **host**) grabs it exclusively and streams its
//! events over TCP to another machine (the **consumer**), which synthesizes
//! a matching virtual device. A single process can play both roles for
//! different devices at once.
//!
//! This crate is the shared foundation used by both roles. It defines:
//!
//! - **`protocol`** – How bytes travel over the network. Messages are
//!   newline-delimited UTF-8 JSON frames; the codec buffers partial reads
//!   and enforces the frame-size ceiling.
//!
//! - **`domain`** – Pure data with no OS dependencies: device kinds,
//!   capability profiles (the portable description of a device sufficient
//!   to reconstruct a virtual twin), machine identity, and per-peer trust
//!   policy.
//!
//! It has zero dependencies on OS APIs, sockets, or the async runtime.

pub mod domain;
pub mod protocol;

pub use domain::device::{AxisRange, CapabilityProfile, DeviceKind, PhysicalDevice};
pub use domain::identity::MachineIdentity;
pub use domain::policy::{PeerIdentity, PeerPolicy};
pub use protocol::codec::{encode, CodecError, FrameDecoder};
pub use protocol::messages::{
    version_compatible, EventRecord, WireMessage, MAX_FRAME_LEN, PROTOCOL_VERSION,
};
