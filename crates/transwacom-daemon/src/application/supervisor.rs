//! The supervisor: session registry, driver API, and the event channel the
//! UI layer consumes.
//!
//! All mutating calls return immediately; actual progress happens inside
//! the session tasks and is reported through [`SupervisorEvent`]s. The UI
//! (tray, CLI, tests) never gets called into — it subscribes. Sessions
//! likewise hold only a write end of the event channel, which breaks the
//! UI↔supervisor↔session ownership cycle.
//!
//! The registry enforces device exclusivity on the host side: at most one
//! session per local device path, with duplicates refused as `DeviceBusy`
//! before anything touches the hardware (the kernel grab backs this up
//! underneath).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use transwacom_core::{DeviceKind, MachineIdentity, PeerIdentity, PhysicalDevice};

use crate::application::authorize::{Authorizer, PromptAnswer, PromptRegistry};
use crate::infrastructure::capture::guard::GuardRegistry;
use crate::infrastructure::capture::{CaptureBackend, CaptureOptions};
use crate::infrastructure::config::ConfigStore;
use crate::infrastructure::detect::{DetectError, DeviceEnumerator};
use crate::infrastructure::discovery::{DiscoveredConsumer, DiscoveryEvent};
use crate::infrastructure::emulation::OutputFactory;
use crate::infrastructure::session::{
    consumer, host, ErrorKind, SessionInfo, SessionRole, SessionState, SharedSession,
};

/// Everything the UI layer can observe.
#[derive(Debug)]
pub enum SupervisorEvent {
    SessionStateChanged {
        session_id: Uuid,
        state: SessionState,
    },
    /// Answer with [`Supervisor::accept`] / [`Supervisor::decline`] within
    /// 30 s, or the session refuses with `timeout`.
    AuthorizationPrompt {
        prompt_id: Uuid,
        peer: PeerIdentity,
        kind: DeviceKind,
        device_name: String,
    },
    DeviceArrived(PhysicalDevice),
    DeviceDeparted {
        path: String,
    },
    Error {
        session_id: Option<Uuid>,
        kind: ErrorKind,
        message: String,
    },
}

/// Where to stream a shared device.
#[derive(Debug, Clone)]
pub struct ConsumerTarget {
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
}

impl From<&DiscoveredConsumer> for ConsumerTarget {
    fn from(c: &DiscoveredConsumer) -> Self {
        Self {
            name: c.name.clone(),
            address: c.address,
            port: c.port,
        }
    }
}

/// Error type for `share`.
#[derive(Debug, Error)]
pub enum ShareError {
    /// Invariant: at most one session per local device path.
    #[error("device {path} already has an active session")]
    DeviceBusy { path: String },

    #[error(transparent)]
    Detect(#[from] DetectError),
}

struct SessionHandle {
    info: SharedSession,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the session registry and wires detector, capture, emulation, and
/// discovery together. All dependencies are injected at construction; the
/// only process-wide mutable state lives behind this struct's mutexes.
pub struct Supervisor {
    config: Arc<ConfigStore>,
    identity: MachineIdentity,
    detector: Arc<dyn DeviceEnumerator>,
    capture: Arc<dyn CaptureBackend>,
    outputs: Arc<dyn OutputFactory>,
    guards: GuardRegistry,
    prompts: Arc<PromptRegistry>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
    discovered: Mutex<HashMap<String, DiscoveredConsumer>>,
}

impl Supervisor {
    /// Builds the supervisor and returns the event stream the UI consumes.
    pub fn new(
        config: Arc<ConfigStore>,
        detector: Arc<dyn DeviceEnumerator>,
        capture: Arc<dyn CaptureBackend>,
        outputs: Arc<dyn OutputFactory>,
        guards: GuardRegistry,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let identity = config.ensure_identity();
        let (events, events_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            config,
            identity,
            detector,
            capture,
            outputs,
            guards,
            prompts: Arc::new(PromptRegistry::new()),
            events,
            sessions: Mutex::new(HashMap::new()),
            discovered: Mutex::new(HashMap::new()),
        });
        (supervisor, events_rx)
    }

    pub fn identity(&self) -> &MachineIdentity {
        &self.identity
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// The authorization use case handed to consumer sessions.
    pub fn authorizer(&self) -> Authorizer {
        Authorizer::new(
            Arc::clone(&self.config),
            Arc::clone(&self.prompts),
            self.events.clone(),
        )
    }

    // ── Driver API ────────────────────────────────────────────────────────────

    pub fn list_local_devices(&self) -> Vec<PhysicalDevice> {
        self.detector.enumerate()
    }

    pub fn list_discovered_consumers(&self) -> Vec<DiscoveredConsumer> {
        self.discovered
            .lock()
            .expect("discovery cache poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of every live session. Closed sessions are pruned here;
    /// their final state already went out as an event.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions = self.sessions.lock().expect("session registry poisoned");
        sessions.retain(|_, handle| {
            !handle
                .info
                .lock()
                .expect("session lock poisoned")
                .state
                .is_terminal()
        });
        sessions
            .values()
            .map(|h| h.info.lock().expect("session lock poisoned").clone())
            .collect()
    }

    /// Starts sharing a local device with a consumer. Returns immediately;
    /// progress arrives as `SessionStateChanged` events.
    ///
    /// # Errors
    ///
    /// Returns [`ShareError::DeviceBusy`] when the device already has a
    /// session, or the detection error for unknown paths.
    pub fn share(&self, device_path: &str, target: ConsumerTarget) -> Result<Uuid, ShareError> {
        let device = self.detector.describe(device_path)?;

        let opts = match device.kind {
            DeviceKind::Tablet => CaptureOptions {
                relative_mode: self.config.relative_mode(),
                disable_local: self.config.disable_local(),
            },
            DeviceKind::Joystick => CaptureOptions::default(),
        };

        let session_id = Uuid::new_v4();
        {
            let mut sessions = self.sessions.lock().expect("session registry poisoned");
            sessions.retain(|_, handle| {
                !handle
                    .info
                    .lock()
                    .expect("session lock poisoned")
                    .state
                    .is_terminal()
            });
            let busy = sessions.values().any(|handle| {
                handle
                    .info
                    .lock()
                    .expect("session lock poisoned")
                    .device_path
                    .as_deref()
                    == Some(device_path)
            });
            if busy {
                return Err(ShareError::DeviceBusy { path: device_path.to_string() });
            }

            let mut info = SessionInfo::new(session_id, SessionRole::Host, SessionState::Dialing);
            info.device_path = Some(device.path.clone());
            info.device_kind = Some(device.kind);
            let info: SharedSession = Arc::new(Mutex::new(info));

            let (cancel_tx, cancel_rx) = watch::channel(false);
            let params = host::HostSessionParams {
                info: Arc::clone(&info),
                device,
                target: SocketAddr::new(target.address, target.port),
                identity: self.identity.clone(),
                opts,
                capture: Arc::clone(&self.capture),
                guards: self.guards.clone(),
                events: self.events.clone(),
                cancel: cancel_rx,
            };
            let task = tokio::spawn(host::run(params));
            sessions.insert(session_id, SessionHandle { info, cancel: cancel_tx, task });
        }

        info!(session = %session_id, device = %device_path, consumer = %target.name, "sharing started");
        let _ = self.events.send(SupervisorEvent::SessionStateChanged {
            session_id,
            state: SessionState::Dialing,
        });
        Ok(session_id)
    }

    /// Signals a session to drain. Safe to call repeatedly, also for ids
    /// that already closed.
    pub fn stop(&self, session_id: Uuid) {
        let sessions = self.sessions.lock().expect("session registry poisoned");
        if let Some(handle) = sessions.get(&session_id) {
            debug!(session = %session_id, "stop requested");
            let _ = handle.cancel.send(true);
        }
    }

    /// Answers an authorization prompt affirmatively.
    pub fn accept(&self, prompt_id: Uuid, trust: bool) -> bool {
        self.prompts.resolve(prompt_id, PromptAnswer::Accept { trust })
    }

    /// Answers an authorization prompt negatively.
    pub fn decline(&self, prompt_id: Uuid) -> bool {
        self.prompts.resolve(prompt_id, PromptAnswer::Decline)
    }

    // ── Consumer listener ─────────────────────────────────────────────────────

    /// Accepts consumer connections until `shutdown` flips. Each accepted
    /// socket becomes a registered consumer session.
    pub async fn serve_consumer(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(addr = ?listener.local_addr().ok(), "consumer listener ready");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(%peer_addr, "incoming connection");
                        self.spawn_consumer_session(stream, peer_addr);
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        debug!("consumer listener stopped");
    }

    fn spawn_consumer_session(&self, stream: tokio::net::TcpStream, peer_addr: SocketAddr) {
        let session_id = Uuid::new_v4();
        let info: SharedSession = Arc::new(Mutex::new(SessionInfo::new(
            session_id,
            SessionRole::Consumer,
            SessionState::Handshaking,
        )));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let params = consumer::ConsumerSessionParams {
            info: Arc::clone(&info),
            stream: Some(stream),
            peer_addr,
            identity: self.identity.clone(),
            authorizer: self.authorizer(),
            outputs: Arc::clone(&self.outputs),
            events: self.events.clone(),
            cancel: cancel_rx,
        };
        let task = tokio::spawn(consumer::run(params));
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .insert(session_id, SessionHandle { info, cancel: cancel_tx, task });
        let _ = self.events.send(SupervisorEvent::SessionStateChanged {
            session_id,
            state: SessionState::Handshaking,
        });
    }

    // ── Discovery cache ───────────────────────────────────────────────────────

    /// Pumps browse events into the cache behind `list_discovered_consumers`.
    pub fn attach_discovery(
        self: &Arc<Self>,
        mut browse_rx: mpsc::Receiver<DiscoveryEvent>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = browse_rx.recv().await {
                let mut cache = this.discovered.lock().expect("discovery cache poisoned");
                match event {
                    DiscoveryEvent::ConsumerFound(consumer) => {
                        debug!(instance = %consumer.instance, addr = %consumer.address, "consumer found");
                        cache.insert(consumer.instance.clone(), consumer);
                    }
                    DiscoveryEvent::ConsumerLost { instance } => {
                        debug!(%instance, "consumer lost");
                        cache.remove(&instance);
                    }
                }
            }
        })
    }

    // ── Device watcher ────────────────────────────────────────────────────────

    /// Rescans periodically and reports arrivals and departures.
    pub fn spawn_device_watcher(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut known: HashMap<String, PhysicalDevice> = HashMap::new();
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                let current: HashMap<String, PhysicalDevice> = this
                    .detector
                    .enumerate()
                    .into_iter()
                    .map(|d| (d.path.clone(), d))
                    .collect();

                for (path, device) in &current {
                    if !known.contains_key(path) {
                        let _ = this
                            .events
                            .send(SupervisorEvent::DeviceArrived(device.clone()));
                    }
                }
                for path in known.keys() {
                    if !current.contains_key(path) {
                        let _ = this
                            .events
                            .send(SupervisorEvent::DeviceDeparted { path: path.clone() });
                    }
                }
                known = current;
            }
        })
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Drains every session concurrently and waits for their restoration
    /// guards, bounded by `deadline`. Guards that did not get their turn
    /// are swept directly afterwards — no device is left in session state.
    pub async fn shutdown_all(&self, deadline: Duration) {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock().expect("session registry poisoned");
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        if !handles.is_empty() {
            info!(count = handles.len(), "draining all sessions");
        }
        for handle in &handles {
            let _ = handle.cancel.send(true);
        }

        let join_all = async {
            for handle in handles {
                let _ = handle.task.await;
            }
        };
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            warn!("sessions did not drain within the deadline; sweeping guards");
        }

        let guards = self.guards.clone();
        let _ = tokio::task::spawn_blocking(move || guards.run_all()).await;
    }
}
