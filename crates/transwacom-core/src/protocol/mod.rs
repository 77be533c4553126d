//! The TransWacom wire protocol.
//!
//! A session is a full-duplex TCP stream of newline-terminated UTF-8 JSON
//! frames. Four message kinds exist: `handshake` (host → consumer),
//! `auth_response` (consumer → host), `event` (host → consumer, also the
//! zero-event keepalive), and `bye` (either direction, advisory).
//!
//! See [`messages`] for the message types, [`codec`] for framing, and
//! [`codes`] for the symbolic event-code registry shared by capture and
//! injection.

pub mod codec;
pub mod codes;
pub mod messages;

pub use codec::{encode, CodecError, FrameDecoder};
pub use messages::{version_compatible, EventRecord, WireMessage, MAX_FRAME_LEN, PROTOCOL_VERSION};
