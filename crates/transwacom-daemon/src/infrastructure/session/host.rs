//! Host-side session driver.
//!
//! Dial the consumer, introduce the device, wait for the verdict, then pump
//! capture batches onto the socket until someone says `bye`, the link dies,
//! or the supervisor cancels us. Teardown ordering is the point of this
//! module: stop the capture reader (which releases the grab), flush
//! in-flight batches and send `bye` strictly after the last one, close the
//! socket, and only then run the restoration guard — the device's
//! pre-session state is re-applied on *every* exit path before the session
//! reports Closed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use transwacom_core::{
    FrameDecoder, MachineIdentity, PeerIdentity, PhysicalDevice, WireMessage, PROTOCOL_VERSION,
};

use crate::application::supervisor::SupervisorEvent;
use crate::infrastructure::capture::guard::GuardRegistry;
use crate::infrastructure::capture::{CaptureBackend, CaptureHandle, CaptureOptions, EventBatch};

use super::{
    set_state, write_frame, Liveness, LivenessClock, SessionError, SessionState, SharedSession,
    AUTH_RESPONSE_TIMEOUT, DRAIN_GRACE,
};

/// Everything a host session task needs, injected by the supervisor.
pub struct HostSessionParams {
    pub info: SharedSession,
    pub device: PhysicalDevice,
    pub target: SocketAddr,
    pub identity: MachineIdentity,
    pub opts: CaptureOptions,
    pub capture: Arc<dyn CaptureBackend>,
    pub guards: GuardRegistry,
    pub events: mpsc::UnboundedSender<SupervisorEvent>,
    pub cancel: watch::Receiver<bool>,
}

/// Ways a session can end without an error.
enum CloseOutcome {
    /// Cancelled locally; drain, send `bye`, restore.
    Stopped,
    /// The peer said `bye`; close and restore.
    PeerBye,
}

/// Resources that outlive the drive loop into teardown.
#[derive(Default)]
struct Links {
    wr: Option<OwnedWriteHalf>,
    sink_rx: Option<mpsc::Receiver<EventBatch>>,
    capture: Option<CaptureHandle>,
}

/// Runs one host session to completion. Spawned by the supervisor.
pub async fn run(mut params: HostSessionParams) {
    let mut links = Links::default();
    let outcome = drive(&mut params, &mut links).await;
    teardown(&params, links, outcome).await;
}

async fn drive(
    p: &mut HostSessionParams,
    links: &mut Links,
) -> Result<CloseOutcome, SessionError> {
    let session_id = p.info.lock().expect("session lock poisoned").id;

    // Dialing → Handshaking.
    let stream = TcpStream::connect(p.target)
        .await
        .map_err(SessionError::Connect)?;
    stream.set_nodelay(true).ok();
    let (mut rd, mut wr) = stream.into_split();
    set_state(&p.info, &p.events, SessionState::Handshaking);

    let handshake = WireMessage::Handshake {
        host_name: p.identity.machine_name.clone(),
        host_id: p.identity.machine_id.clone(),
        version: PROTOCOL_VERSION.to_string(),
        devices: vec![p.device.profile()],
    };
    write_frame(&mut wr, &p.info, &handshake).await?;
    set_state(&p.info, &p.events, SessionState::AwaitingAuth);

    // The consumer may be holding an interactive prompt; wait generously,
    // but stay responsive to a local stop.
    let mut decoder = FrameDecoder::new();
    let verdict = tokio::select! {
        verdict = timeout(
            AUTH_RESPONSE_TIMEOUT,
            read_auth_response(&mut rd, &mut decoder, &p.info),
        ) => verdict.map_err(|_| SessionError::AuthTimeout)??,
        _ = p.cancel.changed() => {
            links.wr = Some(wr);
            return Ok(CloseOutcome::Stopped);
        }
    };

    if !verdict.accepted {
        links.wr = Some(wr);
        return Err(SessionError::Refused {
            reason: verdict.reason.unwrap_or_else(|| "refused".to_string()),
        });
    }
    let peer = PeerIdentity::new(verdict.consumer_name, verdict.consumer_id);
    info!(session = %session_id, peer = %peer.name, "consumer accepted the stream");
    p.info.lock().expect("session lock poisoned").peer = Some(peer);

    // Grab the device only after authorization: a refused session must not
    // disturb the local machine at all.
    let (sink_tx, mut sink_rx) = mpsc::channel::<EventBatch>(64);
    let handle = p.capture.start(&p.device, p.opts, sink_tx).await?;
    p.guards.register(session_id, handle.guard());
    links.capture = Some(handle);

    set_state(&p.info, &p.events, SessionState::Streaming);
    let mut clock = LivenessClock::new(Instant::now());
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            batch = sink_rx.recv() => match batch {
                Some(batch) => {
                    let frame = WireMessage::Event {
                        device_type: batch.device_type,
                        events: batch.events,
                    };
                    write_frame(&mut wr, &p.info, &frame).await?;
                    clock.on_tx(Instant::now());
                }
                None => {
                    links.wr = Some(wr);
                    return Err(SessionError::CaptureStopped);
                }
            },

            read = rd.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    links.wr = Some(wr);
                    links.sink_rx = Some(sink_rx);
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
                        WireMessage::Bye { reason } => {
                            debug!(session = %session_id, ?reason, "peer said bye");
                            links.wr = Some(wr);
                            links.sink_rx = Some(sink_rx);
                            return Ok(CloseOutcome::PeerBye);
                        }
                        // Inbound events on the host are consumer keepalives.
                        WireMessage::Event { .. } => {}
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
                        device_type: p.device.kind,
                        events: Vec::new(),
                    };
                    write_frame(&mut wr, &p.info, &keepalive).await?;
                    clock.on_tx(Instant::now());
                }
                Liveness::Expired => {
                    links.wr = Some(wr);
                    links.sink_rx = Some(sink_rx);
                    return Err(SessionError::LivenessExpired);
                }
            },

            _ = p.cancel.changed() => {
                links.wr = Some(wr);
                links.sink_rx = Some(sink_rx);
                return Ok(CloseOutcome::Stopped);
            }
        }
    }
}

/// Reads frames until the authorization verdict arrives.
async fn read_auth_response(
    rd: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
    info: &SharedSession,
) -> Result<AuthVerdict, SessionError> {
    let mut buf = vec![0u8; 4096];
    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            return Err(SessionError::PeerClosed);
        }
        info.lock().expect("session lock poisoned").bytes_in += n as u64;
        for msg in decoder.push(&buf[..n])? {
            match msg {
                WireMessage::AuthResponse { accepted, consumer_name, consumer_id, reason } => {
                    return Ok(AuthVerdict { accepted, consumer_name, consumer_id, reason });
                }
                WireMessage::Bye { reason } => {
                    return Err(SessionError::Refused {
                        reason: reason.unwrap_or_else(|| "bye before authorization".to_string()),
                    });
                }
                other => {
                    return Err(SessionError::UnexpectedFrame {
                        got: other.kind_name(),
                        state: SessionState::AwaitingAuth,
                    });
                }
            }
        }
    }
}

struct AuthVerdict {
    accepted: bool,
    consumer_name: String,
    consumer_id: String,
    reason: Option<String>,
}

async fn teardown(p: &HostSessionParams, mut links: Links, outcome: Result<CloseOutcome, SessionError>) {
    let session_id = p.info.lock().expect("session lock poisoned").id;
    set_state(&p.info, &p.events, SessionState::Draining);

    // Stop producing; the reader releases the grab on its way out.
    if let Some(handle) = &mut links.capture {
        handle.halt().await;
    }

    // On a local stop, flush what the capture already produced and follow
    // it with `bye` — never the other way around.
    if matches!(outcome, Ok(CloseOutcome::Stopped)) {
        if let (Some(wr), Some(sink_rx)) = (&mut links.wr, &mut links.sink_rx) {
            let deadline = Instant::now() + DRAIN_GRACE;
            while let Ok(batch) = sink_rx.try_recv() {
                if Instant::now() >= deadline {
                    break;
                }
                let frame = WireMessage::Event {
                    device_type: batch.device_type,
                    events: batch.events,
                };
                if write_frame(wr, &p.info, &frame).await.is_err() {
                    break;
                }
            }
            let bye = WireMessage::Bye { reason: Some("user_request".to_string()) };
            if let Err(e) = write_frame(wr, &p.info, &bye).await {
                debug!(session = %session_id, error = %e, "bye not delivered");
            }
        }
    }

    // Socket down first...
    if let Some(mut wr) = links.wr.take() {
        let _ = wr.shutdown().await;
    }
    drop(links.sink_rx.take());

    // ...then restoration, strictly before the session reports Closed.
    if let Some(handle) = &links.capture {
        let guard = handle.guard();
        let _ = tokio::task::spawn_blocking(move || guard.run()).await;
    }
    p.guards.deregister(session_id);

    if let Err(e) = &outcome {
        warn!(session = %session_id, error = %e, "host session closed abnormally");
        p.info.lock().expect("session lock poisoned").close_error = Some((e.kind(), e.to_string()));
        let _ = p.events.send(SupervisorEvent::Error {
            session_id: Some(session_id),
            kind: e.kind(),
            message: e.to_string(),
        });
    }
    set_state(&p.info, &p.events, SessionState::Closed);
}
