//! The per-connection session engine.
//!
//! Both roles run the same state machine; the role only parameterizes who
//! sends what:
//!
//! ```text
//! Host:      Dialing ─► Handshaking ─► AwaitingAuth ─► Streaming ─► Draining ─► Closed
//! Consumer:             Handshaking ─► AwaitingAuth ─► Streaming ─► Draining ─► Closed
//! ```
//!
//! - **Handshaking**: host sends `handshake`; consumer reads it.
//! - **AwaitingAuth**: consumer decides (policy, then prompt) and answers;
//!   host waits for the answer.
//! - **Streaming**: events flow host→consumer; both sides keepalive and
//!   watch liveness.
//! - **Draining**: ≤ 100 ms of grace to flush in-flight frames, the host's
//!   `bye` strictly after its last batch, then the socket closes. The
//!   host's restoration guard runs strictly after the socket is closed and
//!   before the session is marked Closed; the consumer's virtual device is
//!   destroyed in the same window.
//!
//! An external `stop()` pushes a cancel signal; the state machine drains
//! from any pre-terminal state. Stopping twice is harmless.

pub mod consumer;
pub mod host;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use transwacom_core::{CodecError, DeviceKind, PeerIdentity};

use crate::application::supervisor::SupervisorEvent;
use crate::infrastructure::capture::CaptureError;
use crate::infrastructure::emulation::EmulationError;

// ── Timing parameters ─────────────────────────────────────────────────────────

/// Send a keepalive when nothing was received for this long...
pub const KEEPALIVE_RX_IDLE: Duration = Duration::from_secs(5);
/// ...and nothing was sent for this long.
pub const KEEPALIVE_TX_IDLE: Duration = Duration::from_secs(2);
/// No inbound bytes for this long ends Streaming with an error.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period for flushing in-flight frames while draining.
pub const DRAIN_GRACE: Duration = Duration::from_millis(100);
/// How long the host waits for the consumer's verdict. Covers the
/// consumer's 30 s interactive prompt with margin.
pub const AUTH_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);
/// How long the consumer waits for the opening handshake frame.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

// ── Session record ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Host,
    Consumer,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionRole::Host => "host",
            SessionRole::Consumer => "consumer",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Dialing,
    Handshaking,
    AwaitingAuth,
    Streaming,
    Draining,
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Dialing => "dialing",
            SessionState::Handshaking => "handshaking",
            SessionState::AwaitingAuth => "awaiting-auth",
            SessionState::Streaming => "streaming",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        })
    }
}

/// Error classification surfaced to the UI, per the error-handling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Refused,
    Protocol,
    Resource,
    Permission,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Refused => "refused",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Resource => "resource",
            ErrorKind::Permission => "permission",
            ErrorKind::Config => "config",
        })
    }
}

/// The live record for one session, shared between its task and the
/// supervisor registry.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub role: SessionRole,
    pub state: SessionState,
    pub peer: Option<PeerIdentity>,
    /// Host role: the captured device path (exclusivity key).
    pub device_path: Option<String>,
    pub device_kind: Option<DeviceKind>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub last_heartbeat_at: Option<Instant>,
    /// Set when the session closed because of an error.
    pub close_error: Option<(ErrorKind, String)>,
}

impl SessionInfo {
    pub fn new(id: Uuid, role: SessionRole, initial: SessionState) -> Self {
        Self {
            id,
            role,
            state: initial,
            peer: None,
            device_path: None,
            device_kind: None,
            bytes_in: 0,
            bytes_out: 0,
            last_heartbeat_at: None,
            close_error: None,
        }
    }
}

pub type SharedSession = Arc<Mutex<SessionInfo>>;

/// Moves the session to `state` and notifies the UI channel. Transitions
/// out of `Closed` are ignored; terminal means terminal.
pub fn set_state(
    info: &SharedSession,
    events: &mpsc::UnboundedSender<SupervisorEvent>,
    state: SessionState,
) {
    let id = {
        let mut guard = info.lock().expect("session lock poisoned");
        if guard.state.is_terminal() || guard.state == state {
            return;
        }
        guard.state = state;
        guard.id
    };
    let _ = events.send(SupervisorEvent::SessionStateChanged { session_id: id, state });
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Everything that can end a session abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error(transparent)]
    Protocol(#[from] CodecError),

    #[error("peer protocol version {theirs} is incompatible with {ours}")]
    VersionMismatch { ours: String, theirs: String },

    #[error("handshake carried no device profile")]
    EmptyHandshake,

    #[error("unexpected {got} frame in {state} state")]
    UnexpectedFrame { got: &'static str, state: SessionState },

    #[error("peer refused the session: {reason}")]
    Refused { reason: String },

    #[error("no inbound traffic for {}s", LIVENESS_TIMEOUT.as_secs())]
    LivenessExpired,

    #[error("timed out waiting for the opening handshake")]
    HandshakeTimeout,

    #[error("timed out waiting for the authorization response")]
    AuthTimeout,

    #[error("capture ended unexpectedly")]
    CaptureStopped,

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Emulation(#[from] EmulationError),
}

impl SessionError {
    /// Maps the error onto the UI-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Connect(_)
            | SessionError::Io(_)
            | SessionError::PeerClosed
            | SessionError::LivenessExpired
            | SessionError::HandshakeTimeout
            | SessionError::AuthTimeout => ErrorKind::Transient,
            SessionError::Protocol(_)
            | SessionError::VersionMismatch { .. }
            | SessionError::EmptyHandshake
            | SessionError::UnexpectedFrame { .. } => ErrorKind::Protocol,
            SessionError::Refused { .. } => ErrorKind::Refused,
            SessionError::CaptureStopped => ErrorKind::Resource,
            SessionError::Capture(e) => match e {
                CaptureError::Permission { .. } => ErrorKind::Permission,
                CaptureError::Io { .. } => ErrorKind::Transient,
                _ => ErrorKind::Resource,
            },
            SessionError::Emulation(e) => match e {
                EmulationError::Refused { .. } => ErrorKind::Refused,
                EmulationError::Permission { .. } => ErrorKind::Permission,
                _ => ErrorKind::Resource,
            },
        }
    }
}

/// Encodes and writes one frame, accounting the bytes to the session.
pub(crate) async fn write_frame(
    wr: &mut tokio::net::tcp::OwnedWriteHalf,
    info: &SharedSession,
    msg: &transwacom_core::WireMessage,
) -> Result<(), SessionError> {
    use tokio::io::AsyncWriteExt;

    let bytes = transwacom_core::encode(msg)?;
    wr.write_all(&bytes).await?;
    info.lock().expect("session lock poisoned").bytes_out += bytes.len() as u64;
    Ok(())
}

// ── Liveness ──────────────────────────────────────────────────────────────────

/// Verdict of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    /// Quiet in both directions: nudge the peer with a zero-event frame.
    SendKeepalive,
    /// Nothing inbound for the full timeout: leave Streaming.
    Expired,
}

/// Tracks when bytes last moved in each direction.
#[derive(Debug, Clone, Copy)]
pub struct LivenessClock {
    last_rx: Instant,
    last_tx: Instant,
}

impl LivenessClock {
    pub fn new(now: Instant) -> Self {
        Self { last_rx: now, last_tx: now }
    }

    pub fn on_rx(&mut self, now: Instant) {
        self.last_rx = now;
    }

    pub fn on_tx(&mut self, now: Instant) {
        self.last_tx = now;
    }

    pub fn last_rx(&self) -> Instant {
        self.last_rx
    }

    pub fn check(&self, now: Instant) -> Liveness {
        if now.duration_since(self.last_rx) >= LIVENESS_TIMEOUT {
            Liveness::Expired
        } else if now.duration_since(self.last_rx) >= KEEPALIVE_RX_IDLE
            && now.duration_since(self.last_tx) >= KEEPALIVE_TX_IDLE
        {
            Liveness::SendKeepalive
        } else {
            Liveness::Healthy
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
