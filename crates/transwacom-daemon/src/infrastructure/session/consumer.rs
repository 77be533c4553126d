//! Consumer-side session driver and the TCP listener.
//!
//! A consumer session starts from an accepted socket: read the handshake,
//! run the authorization sequence, answer with the verdict, and only after
//! an affirmative answer construct the virtual device. While streaming it
//! injects every batch in order, answers radio silence with keepalives,
//! and tears down deterministically: socket closed, virtual device
//! destroyed, then Closed — the virtual node never outlives its session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use transwacom_core::{
    version_compatible, CapabilityProfile, FrameDecoder, MachineIdentity, PeerIdentity,
    WireMessage, PROTOCOL_VERSION,
};

use crate::application::authorize::{AuthOutcome, Authorizer};
use crate::application::inject::InjectUseCase;
use crate::application::supervisor::SupervisorEvent;
use crate::infrastructure::emulation::OutputFactory;

use super::{
    set_state, write_frame, Liveness, LivenessClock, SessionError, SessionState, SharedSession,
    DRAIN_GRACE, HANDSHAKE_TIMEOUT,
};

/// Error type for the consumer listener.
#[derive(Debug, Error)]
pub enum ListenError {
    /// Someone else already owns the port.
    #[error("port {port} is already in use")]
    PortInUse { port: u16 },

    /// Any other bind failure.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Binds the consumer listen socket on all interfaces.
///
/// # Errors
///
/// Returns [`ListenError::PortInUse`] when the port is taken, which the
/// daemon maps to its dedicated exit code.
pub async fn bind_listener(port: u16) -> Result<TcpListener, ListenError> {
    TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            ListenError::PortInUse { port }
        } else {
            ListenError::Bind { port, source: e }
        }
    })
}

/// Everything a consumer session task needs, injected by the supervisor.
pub struct ConsumerSessionParams {
    pub info: SharedSession,
    /// Taken by the session on startup.
    pub stream: Option<TcpStream>,
    pub peer_addr: SocketAddr,
    pub identity: MachineIdentity,
    pub authorizer: Authorizer,
    pub outputs: Arc<dyn OutputFactory>,
    pub events: mpsc::UnboundedSender<SupervisorEvent>,
    pub cancel: watch::Receiver<bool>,
}

enum CloseOutcome {
    /// Cancelled locally; send `bye`, destroy, close.
    Stopped,
    /// The host said `bye`.
    PeerBye,
    /// Policy refused the stream; the verdict was already sent.
    RefusedLocally,
}

#[derive(Default)]
struct Links {
    wr: Option<OwnedWriteHalf>,
    inject: Option<InjectUseCase>,
}

/// Runs one consumer session to completion. Spawned per accepted socket.
pub async fn run(mut params: ConsumerSessionParams) {
    let mut links = Links::default();
    let outcome = drive(&mut params, &mut links).await;
    teardown(&params, links, outcome).await;
}

async fn drive(
    p: &mut ConsumerSessionParams,
    links: &mut Links,
) -> Result<CloseOutcome, SessionError> {
    let session_id = p.info.lock().expect("session lock poisoned").id;

    let stream = p.stream.take().expect("consumer session runs once");
    stream.set_nodelay(true).ok();
    let (mut rd, mut wr) = stream.into_split();

    // Handshaking: the host speaks first.
    let mut decoder = FrameDecoder::new();
    let handshake = tokio::select! {
        handshake = timeout(
            HANDSHAKE_TIMEOUT,
            read_handshake(&mut rd, &mut decoder, &p.info),
        ) => handshake.map_err(|_| SessionError::HandshakeTimeout)??,
        _ = p.cancel.changed() => {
            links.wr = Some(wr);
            return Ok(CloseOutcome::Stopped);
        }
    };

    let peer = PeerIdentity::new(handshake.host_name, handshake.host_id);
    {
        let mut session = p.info.lock().expect("session lock poisoned");
        session.peer = Some(peer.clone());
    }

    // Major version mismatch is a protocol violation; tell the peer why
    // before closing.
    if !version_compatible(PROTOCOL_VERSION, &handshake.version) {
        let refusal = auth_response(&p.identity, false, Some("version_mismatch"));
        let _ = write_frame(&mut wr, &p.info, &refusal).await;
        links.wr = Some(wr);
        return Err(SessionError::VersionMismatch {
            ours: PROTOCOL_VERSION.to_string(),
            theirs: handshake.version,
        });
    }

    let Some(profile) = handshake.devices.into_iter().next() else {
        links.wr = Some(wr);
        return Err(SessionError::EmptyHandshake);
    };
    p.info.lock().expect("session lock poisoned").device_kind = Some(profile.kind);

    // AwaitingAuth: policy, then (maybe) the interactive prompt. A local
    // stop drains even while the prompt is outstanding.
    set_state(&p.info, &p.events, SessionState::AwaitingAuth);
    let decision = tokio::select! {
        decision = p.authorizer.authorize(&peer, profile.kind, &profile.display_name) => decision,
        _ = p.cancel.changed() => {
            links.wr = Some(wr);
            return Ok(CloseOutcome::Stopped);
        }
    };
    match decision {
        AuthOutcome::Refused { reason } => {
            info!(session = %session_id, peer = %peer.name, %reason, "stream refused");
            let refusal = auth_response(&p.identity, false, Some(&reason));
            let _ = write_frame(&mut wr, &p.info, &refusal).await;
            links.wr = Some(wr);
            return Ok(CloseOutcome::RefusedLocally);
        }
        AuthOutcome::Accepted => {
            // The acceptance goes on the wire before any virtual device
            // exists, so a construction failure can still be reported.
            let acceptance = auth_response(&p.identity, true, None);
            write_frame(&mut wr, &p.info, &acceptance).await?;
        }
    }

    let output = match p.outputs.create(&profile, &peer.name) {
        Ok(output) => output,
        Err(e) => {
            let bye = WireMessage::Bye { reason: Some("virtual_device_unavailable".to_string()) };
            let _ = write_frame(&mut wr, &p.info, &bye).await;
            links.wr = Some(wr);
            return Err(e.into());
        }
    };
    info!(session = %session_id, peer = %peer.name, kind = %profile.kind, "virtual device ready");
    links.inject = Some(InjectUseCase::new(profile.clone(), output));

    set_state(&p.info, &p.events, SessionState::Streaming);
    let mut clock = LivenessClock::new(Instant::now());
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            read = rd.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    links.wr = Some(wr);
                    return Err(SessionError::PeerClosed);
                }
                clock.on_rx(Instant::now());
                {
                    let mut session = p.info.lock().expect("session lock poisoned");
                    session.bytes_in += n as u64;
                    session.last_heartbeat_at = Some(Instant::now());
                }
                for msg in decoder.push(&buf[..n])? {
                    match msg {
                        WireMessage::Event { events, .. } if events.is_empty() => {
                            // Keepalive: the read itself refreshed liveness.
                        }
                        WireMessage::Event { events, .. } => {
                            links
                                .inject
                                .as_mut()
                                .expect("inject exists while streaming")
                                .inject(&events)?;
                        }
                        WireMessage::Bye { reason } => {
                            debug!(session = %session_id, ?reason, "host said bye");
                            links.wr = Some(wr);
                            return Ok(CloseOutcome::PeerBye);
                        }
                        other => {
                            links.wr = Some(wr);
                            return Err(SessionError::UnexpectedFrame {
                                got: other.kind_name(),
                                state: SessionState::Streaming,
                            });
                        }
                    }
                }
            },

            _ = tick.tick() => match clock.check(Instant::now()) {
                Liveness::Healthy => {}
                Liveness::SendKeepalive => {
                    let keepalive = WireMessage::Event {
                        device_type: profile.kind,
                        events: Vec::new(),
                    };
                    write_frame(&mut wr, &p.info, &keepalive).await?;
                    clock.on_tx(Instant::now());
                }
                Liveness::Expired => {
                    links.wr = Some(wr);
                    return Err(SessionError::LivenessExpired);
                }
            },

            _ = p.cancel.changed() => {
                links.wr = Some(wr);
                return Ok(CloseOutcome::Stopped);
            }
        }
    }
}

/// Frames the consumer's side of the verdict.
fn auth_response(identity: &MachineIdentity, accepted: bool, reason: Option<&str>) -> WireMessage {
    WireMessage::AuthResponse {
        accepted,
        consumer_name: identity.machine_name.clone(),
        consumer_id: identity.machine_id.clone(),
        reason: reason.map(str::to_string),
    }
}

struct HandshakeFields {
    host_name: String,
    host_id: String,
    version: String,
    devices: Vec<CapabilityProfile>,
}

/// Reads frames until the opening handshake arrives.
async fn read_handshake(
    rd: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
    info: &SharedSession,
) -> Result<HandshakeFields, SessionError> {
    let mut buf = vec![0u8; 8192];
    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            return Err(SessionError::PeerClosed);
        }
        info.lock().expect("session lock poisoned").bytes_in += n as u64;
        for msg in decoder.push(&buf[..n])? {
            match msg {
                WireMessage::Handshake { host_name, host_id, version, devices } => {
                    return Ok(HandshakeFields { host_name, host_id, version, devices });
                }
                other => {
                    return Err(SessionError::UnexpectedFrame {
                        got: other.kind_name(),
                        state: SessionState::Handshaking,
                    });
                }
            }
        }
    }
}

async fn teardown(
    p: &ConsumerSessionParams,
    mut links: Links,
    outcome: Result<CloseOutcome, SessionError>,
) {
    let session_id = p.info.lock().expect("session lock poisoned").id;
    set_state(&p.info, &p.events, SessionState::Draining);

    // A local stop announces itself; the grace window lets the frame out.
    if matches!(outcome, Ok(CloseOutcome::Stopped)) {
        if let Some(wr) = &mut links.wr {
            let bye = WireMessage::Bye { reason: Some("user_request".to_string()) };
            let _ = timeout(DRAIN_GRACE, write_frame(wr, &p.info, &bye)).await;
        }
    }

    // Socket down first, then the virtual device, then Closed: the node
    // exists only while its session is Streaming or Draining.
    if let Some(mut wr) = links.wr.take() {
        let _ = wr.shutdown().await;
    }
    if let Some(inject) = &mut links.inject {
        inject.destroy();
    }

    if let Err(e) = &outcome {
        warn!(session = %session_id, error = %e, "consumer session closed abnormally");
        p.info.lock().expect("session lock poisoned").close_error = Some((e.kind(), e.to_string()));
        let _ = p.events.send(SupervisorEvent::Error {
            session_id: Some(session_id),
            kind: e.kind(),
            message: e.to_string(),
        });
    }
    set_state(&p.info, &p.events, SessionState::Closed);
}
