//! End-to-end session tests over loopback TCP.
//!
//! # Purpose
//!
//! These tests wire two complete supervisors together — one playing host,
//! one playing consumer, each with its own config store — and drive real
//! sessions through real sockets. Only the OS edges are substituted: the
//! capture backend replays scripted batches instead of reading evdev, and
//! the output factory records injected frames instead of writing uinput.
//! Everything between the seams (codec, session state machines,
//! authorization, supervisor registry, restoration ordering) is the
//! production code path.
//!
//! The scenarios covered:
//!
//! - Happy path: trusted tablet host streams one synchronized frame, stop
//!   restores the device and destroys the virtual twin exactly once.
//! - Untrusted host: the consumer raises a prompt; declining refuses.
//! - Disabled kind: immediate refusal without any prompt or device.
//! - Network drop mid-stream: the host restores and closes.
//! - Duplicate share: second session for the same device path is refused.
//! - Process shutdown: all sessions drain concurrently, every captured
//!   device reports its restoration exactly once.
//! - Wire level: the literal JSON frames of the protocol, driven by hand.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use transwacom_core::{AxisRange, DeviceKind, EventRecord, PhysicalDevice};

use transwacom_daemon::application::supervisor::{
    ConsumerTarget, ShareError, Supervisor, SupervisorEvent,
};
use transwacom_daemon::infrastructure::capture::guard::GuardRegistry;
use transwacom_daemon::infrastructure::capture::mock::MockCaptureBackend;
use transwacom_daemon::infrastructure::capture::CaptureBackend;
use transwacom_daemon::infrastructure::config::{AppConfig, ConfigStore, TrustedHost};
use transwacom_daemon::infrastructure::detect::mock::MockDetector;
use transwacom_daemon::infrastructure::emulation::mock::RecordingOutputFactory;
use transwacom_daemon::infrastructure::emulation::OutputFactory;
use transwacom_daemon::infrastructure::session::consumer::bind_listener;
use transwacom_daemon::infrastructure::session::{ErrorKind, SessionState};

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn host_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.general.machine_name = Some("HostA".to_string());
    cfg.general.machine_id = Some("H1".to_string());
    cfg
}

fn consumer_config_trusting(host_name: &str, host_id: &str) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.general.machine_name = Some("studio".to_string());
    cfg.general.machine_id = Some("C1".to_string());
    cfg.consumer.trusted_hosts.insert(
        host_name.to_string(),
        TrustedHost { host_id: host_id.to_string(), auto_accept: true },
    );
    cfg
}

fn consumer_config_untrusting() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.general.machine_name = Some("studio".to_string());
    cfg.general.machine_id = Some("C1".to_string());
    cfg
}

fn tablet_device(path: &str) -> PhysicalDevice {
    let mut axes = BTreeMap::new();
    axes.insert("ABS_X".to_string(), AxisRange { min: 0, max: 15360, resolution: 100 });
    axes.insert("ABS_Y".to_string(), AxisRange { min: 0, max: 10240, resolution: 100 });
    axes.insert("ABS_PRESSURE".to_string(), AxisRange { min: 0, max: 2047, resolution: 0 });
    PhysicalDevice {
        path: path.to_string(),
        kind: DeviceKind::Tablet,
        display_name: "Wacom Intuos S Pen".to_string(),
        capabilities: vec![
            "ABS_X".to_string(),
            "ABS_Y".to_string(),
            "ABS_PRESSURE".to_string(),
            "BTN_STYLUS".to_string(),
        ],
        axes,
        vendor_tool_id: Some("9".to_string()),
    }
}

fn joystick_device(path: &str) -> PhysicalDevice {
    PhysicalDevice {
        path: path.to_string(),
        kind: DeviceKind::Joystick,
        display_name: "8BitDo Pro 2".to_string(),
        capabilities: vec!["ABS_X".to_string(), "ABS_Y".to_string(), "BTN_A".to_string()],
        axes: BTreeMap::new(),
        vendor_tool_id: None,
    }
}

fn pen_stroke() -> Vec<EventRecord> {
    vec![
        EventRecord::new("ABS_X", 100, 0.001),
        EventRecord::new("ABS_Y", 200, 0.001),
        EventRecord::new("SYN_REPORT", 0, 0.001),
    ]
}

// ── Harness ───────────────────────────────────────────────────────────────────

struct Peer {
    supervisor: Arc<Supervisor>,
    events: mpsc::UnboundedReceiver<SupervisorEvent>,
    capture: Arc<MockCaptureBackend>,
    outputs: Arc<RecordingOutputFactory>,
    /// Loopback port of the consumer listener, when one was started.
    port: Option<u16>,
    _shutdown: watch::Sender<bool>,
}

async fn spawn_peer(
    config: AppConfig,
    devices: Vec<PhysicalDevice>,
    script: Vec<Vec<EventRecord>>,
    listen: bool,
) -> Peer {
    let store = Arc::new(ConfigStore::in_memory(config));
    let detector = Arc::new(MockDetector::new(devices));
    let capture = Arc::new(MockCaptureBackend::scripted(script));
    let outputs = Arc::new(RecordingOutputFactory::new(Arc::clone(&store)));
    let (supervisor, events) = Supervisor::new(
        store,
        detector,
        Arc::clone(&capture) as Arc<dyn CaptureBackend>,
        Arc::clone(&outputs) as Arc<dyn OutputFactory>,
        GuardRegistry::new(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let port = if listen {
        let listener = bind_listener(0).await.expect("ephemeral bind");
        let port = listener.local_addr().expect("local addr").port();
        tokio::spawn(Arc::clone(&supervisor).serve_consumer(listener, shutdown_rx));
        Some(port)
    } else {
        None
    };

    Peer {
        supervisor,
        events,
        capture,
        outputs,
        port,
        _shutdown: shutdown_tx,
    }
}

fn target(port: u16) -> ConsumerTarget {
    ConsumerTarget {
        name: "studio".to_string(),
        address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port,
    }
}

const WAIT: Duration = Duration::from_secs(5);

async fn await_state(
    events: &mut mpsc::UnboundedReceiver<SupervisorEvent>,
    session: Uuid,
    wanted: SessionState,
) {
    tokio::time::timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if let SupervisorEvent::SessionStateChanged { session_id, state } = event {
                if session_id == session && state == wanted {
                    return;
                }
            }
        }
        panic!("event channel closed while waiting for {wanted}");
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {wanted}"));
}

async fn await_error(events: &mut mpsc::UnboundedReceiver<SupervisorEvent>) -> (ErrorKind, String) {
    tokio::time::timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if let SupervisorEvent::Error { kind, message, .. } = event {
                return (kind, message);
            }
        }
        panic!("event channel closed while waiting for an error");
    })
    .await
    .expect("timed out waiting for an error event")
}

async fn await_prompt(events: &mut mpsc::UnboundedReceiver<SupervisorEvent>) -> Uuid {
    tokio::time::timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if let SupervisorEvent::AuthorizationPrompt { prompt_id, .. } = event {
                return prompt_id;
            }
        }
        panic!("event channel closed while waiting for a prompt");
    })
    .await
    .expect("timed out waiting for a prompt")
}

async fn poll_until(what: &str, mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out polling for: {what}");
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_happy_path_tablet_streams_one_synchronized_frame() {
    let consumer = spawn_peer(consumer_config_trusting("HostA", "H1"), vec![], vec![], true).await;
    let mut host = spawn_peer(
        host_config(),
        vec![tablet_device("/dev/input/event11")],
        vec![pen_stroke()],
        false,
    )
    .await;

    let session_id = host
        .supervisor
        .share("/dev/input/event11", target(consumer.port.unwrap()))
        .expect("share");
    await_state(&mut host.events, session_id, SessionState::Streaming).await;

    // The stroke arrives as exactly one synchronized frame on the twin.
    let outputs = Arc::clone(&consumer.outputs);
    poll_until("the stroke to reach the virtual device", || {
        outputs
            .created()
            .first()
            .is_some_and(|(_, _, rec)| !rec.batches().is_empty())
    })
    .await;

    let created = consumer.outputs.created();
    assert_eq!(created.len(), 1);
    let (profile, peer_name, recording) = &created[0];
    assert_eq!(peer_name, "HostA");
    assert_eq!(profile.kind, DeviceKind::Tablet);
    assert_eq!(
        profile.capabilities,
        vec!["ABS_X", "ABS_Y", "ABS_PRESSURE", "BTN_STYLUS"]
    );

    let batches = recording.batches();
    assert_eq!(batches.len(), 1);
    let values: Vec<i32> = batches[0].iter().map(|e| e.value).collect();
    assert_eq!(values, vec![100, 200], "order preserved, SYN handled by the sink");

    // Stop: restoration runs exactly once, the twin is destroyed.
    host.supervisor.stop(session_id);
    await_state(&mut host.events, session_id, SessionState::Closed).await;

    let guard = host.capture.last_guard().expect("capture ran");
    assert!(guard.pending().is_empty(), "all compensating ops executed");
    assert_eq!(guard.runs_performed(), 1);

    let recording = Arc::clone(recording);
    poll_until("the virtual device to be destroyed", || recording.is_destroyed()).await;

    // Stopping again is a no-op and never re-runs restoration.
    host.supervisor.stop(session_id);
    assert_eq!(guard.runs_performed(), 1);
}

#[tokio::test]
async fn test_untrusted_host_is_prompted_and_decline_refuses() {
    let mut consumer = spawn_peer(consumer_config_untrusting(), vec![], vec![], true).await;
    let mut host = spawn_peer(
        host_config(),
        vec![tablet_device("/dev/input/event11")],
        vec![],
        false,
    )
    .await;

    let session_id = host
        .supervisor
        .share("/dev/input/event11", target(consumer.port.unwrap()))
        .expect("share");

    let prompt_id = await_prompt(&mut consumer.events).await;
    assert!(consumer.supervisor.decline(prompt_id));

    let (kind, message) = await_error(&mut host.events).await;
    assert_eq!(kind, ErrorKind::Refused);
    assert!(message.contains("declined"), "got: {message}");
    await_state(&mut host.events, session_id, SessionState::Closed).await;

    // The refused session never touched the device or built a twin.
    assert!(host.capture.last_guard().is_none());
    assert!(consumer.outputs.created().is_empty());
}

#[tokio::test]
async fn test_disabled_kind_refuses_immediately_without_prompt() {
    let mut config = consumer_config_trusting("HostA", "H1");
    config.consumer.devices.joystick_enabled = false;
    let mut consumer = spawn_peer(config, vec![], vec![], true).await;
    let mut host = spawn_peer(
        host_config(),
        vec![joystick_device("/dev/input/event7")],
        vec![],
        false,
    )
    .await;

    let session_id = host
        .supervisor
        .share("/dev/input/event7", target(consumer.port.unwrap()))
        .expect("share");

    let (kind, message) = await_error(&mut host.events).await;
    assert_eq!(kind, ErrorKind::Refused);
    assert!(message.contains("kind_disabled"), "got: {message}");
    await_state(&mut host.events, session_id, SessionState::Closed).await;

    // No prompt was ever raised and no virtual device exists.
    while let Ok(event) = consumer.events.try_recv() {
        assert!(
            !matches!(event, SupervisorEvent::AuthorizationPrompt { .. }),
            "a disabled kind must refuse without prompting"
        );
    }
    assert!(consumer.outputs.created().is_empty());
}

#[tokio::test]
async fn test_network_drop_mid_stream_runs_restoration() {
    // A hand-rolled consumer that accepts the stream, reads one frame, and
    // severs the link without a bye.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let (rd, mut wr) = stream.into_split();
        let mut lines = BufReader::new(rd).lines();
        let _handshake = lines.next_line().await.expect("handshake").expect("line");
        wr.write_all(
            b"{\"type\":\"auth_response\",\"accepted\":true,\"consumer_name\":\"raw\",\"consumer_id\":\"R1\"}\n",
        )
        .await
        .expect("verdict");
        let _first_batch = lines.next_line().await;
        // Dropping both halves severs the TCP stream.
    });

    let mut host = spawn_peer(
        host_config(),
        vec![tablet_device("/dev/input/event11")],
        vec![pen_stroke()],
        false,
    )
    .await;

    let session_id = host
        .supervisor
        .share(
            "/dev/input/event11",
            ConsumerTarget { name: "raw".to_string(), address: addr.ip(), port: addr.port() },
        )
        .expect("share");
    await_state(&mut host.events, session_id, SessionState::Streaming).await;

    let (kind, _) = await_error(&mut host.events).await;
    assert_eq!(kind, ErrorKind::Transient);
    await_state(&mut host.events, session_id, SessionState::Closed).await;

    let guard = host.capture.last_guard().expect("capture ran");
    assert_eq!(guard.runs_performed(), 1, "device restored after the drop");
    assert!(guard.pending().is_empty());
}

#[tokio::test]
async fn test_duplicate_share_returns_device_busy_and_leaves_first_alone() {
    let consumer = spawn_peer(consumer_config_trusting("HostA", "H1"), vec![], vec![], true).await;
    let mut host = spawn_peer(
        host_config(),
        vec![tablet_device("/dev/input/event11")],
        vec![],
        false,
    )
    .await;
    let port = consumer.port.unwrap();

    let first = host
        .supervisor
        .share("/dev/input/event11", target(port))
        .expect("first share");
    await_state(&mut host.events, first, SessionState::Streaming).await;

    let second = host.supervisor.share("/dev/input/event11", target(port));
    assert!(matches!(second, Err(ShareError::DeviceBusy { .. })));

    // The original session keeps streaming.
    let sessions = host.supervisor.list_sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, first);
    assert_eq!(sessions[0].state, SessionState::Streaming);
}

#[tokio::test]
async fn test_shutdown_drains_every_session_and_restores_every_device() {
    let consumer = spawn_peer(consumer_config_trusting("HostA", "H1"), vec![], vec![], true).await;
    let mut host = spawn_peer(
        host_config(),
        vec![
            tablet_device("/dev/input/event11"),
            tablet_device("/dev/input/event12"),
        ],
        vec![],
        false,
    )
    .await;
    let port = consumer.port.unwrap();

    let s1 = host.supervisor.share("/dev/input/event11", target(port)).expect("share 1");
    let s2 = host.supervisor.share("/dev/input/event12", target(port)).expect("share 2");
    await_state(&mut host.events, s1, SessionState::Streaming).await;
    await_state(&mut host.events, s2, SessionState::Streaming).await;

    host.supervisor.shutdown_all(Duration::from_secs(3)).await;

    assert!(host.supervisor.list_sessions().is_empty());
    let guards = host.capture.all_guards();
    assert_eq!(guards.len(), 2);
    for guard in &guards {
        assert_eq!(guard.runs_performed(), 1, "each device restored exactly once");
        assert!(guard.pending().is_empty());
    }

    // The consumer saw both byes and destroyed both twins.
    let outputs = Arc::clone(&consumer.outputs);
    poll_until("both virtual devices to be destroyed", || {
        let created = outputs.created();
        created.len() == 2 && created.iter().all(|(_, _, rec)| rec.is_destroyed())
    })
    .await;
}

#[tokio::test]
async fn test_wire_level_json_session_against_a_real_consumer() {
    let consumer = spawn_peer(consumer_config_trusting("HostA", "H1"), vec![], vec![], true).await;
    let port = consumer.port.unwrap();

    let stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();

    // The documented handshake frame, byte for byte.
    wr.write_all(
        b"{\"type\":\"handshake\",\"host_name\":\"HostA\",\"host_id\":\"H1\",\"version\":\"1.0\",\
          \"devices\":[{\"kind\":\"tablet\",\"display_name\":\"Wacom Intuos S Pen\",\
          \"capabilities\":[\"ABS_X\",\"ABS_Y\",\"ABS_PRESSURE\",\"BTN_STYLUS\"]}]}\n",
    )
    .await
    .expect("handshake");

    let verdict = lines.next_line().await.expect("io").expect("verdict line");
    let verdict: serde_json::Value = serde_json::from_str(&verdict).expect("json");
    assert_eq!(verdict["type"], "auth_response");
    assert_eq!(verdict["accepted"], true);
    assert_eq!(verdict["consumer_name"], "studio");
    assert_eq!(verdict["consumer_id"], "C1");

    wr.write_all(
        b"{\"type\":\"event\",\"device_type\":\"tablet\",\"events\":[\
          {\"code\":\"ABS_X\",\"value\":100,\"ts\":0.01},\
          {\"code\":\"ABS_Y\",\"value\":200,\"ts\":0.01},\
          {\"code\":\"SYN_REPORT\",\"value\":0,\"ts\":0.01}]}\n",
    )
    .await
    .expect("event frame");

    let outputs = Arc::clone(&consumer.outputs);
    poll_until("the frame to reach the virtual device", || {
        outputs
            .created()
            .first()
            .is_some_and(|(_, _, rec)| rec.batches().len() == 1)
    })
    .await;
    let created = consumer.outputs.created();
    let (profile, _, recording) = &created[0];
    assert_eq!(
        profile.capabilities,
        vec!["ABS_X", "ABS_Y", "ABS_PRESSURE", "BTN_STYLUS"],
        "the twin declares exactly the handshake capabilities"
    );
    let values: Vec<i32> = recording.batches()[0].iter().map(|e| e.value).collect();
    assert_eq!(values, vec![100, 200]);

    wr.write_all(b"{\"type\":\"bye\",\"reason\":\"user_request\"}\n")
        .await
        .expect("bye");
    let recording = Arc::clone(recording);
    poll_until("teardown after bye", || recording.is_destroyed()).await;
}

#[tokio::test]
async fn test_wire_level_refusal_for_disabled_kind() {
    let mut config = consumer_config_trusting("HostA", "H1");
    config.consumer.devices.joystick_enabled = false;
    let consumer = spawn_peer(config, vec![], vec![], true).await;

    let stream = TcpStream::connect(("127.0.0.1", consumer.port.unwrap()))
        .await
        .expect("connect");
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();

    wr.write_all(
        b"{\"type\":\"handshake\",\"host_name\":\"HostA\",\"host_id\":\"H1\",\"version\":\"1.0\",\
          \"devices\":[{\"kind\":\"joystick\",\"capabilities\":[\"ABS_X\",\"ABS_Y\",\"BTN_A\"]}]}\n",
    )
    .await
    .expect("handshake");

    let verdict = lines.next_line().await.expect("io").expect("verdict line");
    let verdict: serde_json::Value = serde_json::from_str(&verdict).expect("json");
    assert_eq!(verdict["accepted"], false);
    assert_eq!(verdict["reason"], "kind_disabled");
    assert!(consumer.outputs.created().is_empty());
}

#[tokio::test]
async fn test_incompatible_major_version_is_refused() {
    let consumer = spawn_peer(consumer_config_trusting("HostA", "H1"), vec![], vec![], true).await;

    let stream = TcpStream::connect(("127.0.0.1", consumer.port.unwrap()))
        .await
        .expect("connect");
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();

    wr.write_all(
        b"{\"type\":\"handshake\",\"host_name\":\"HostA\",\"host_id\":\"H1\",\"version\":\"2.0\",\
          \"devices\":[{\"kind\":\"tablet\",\"capabilities\":[\"ABS_X\"]}]}\n",
    )
    .await
    .expect("handshake");

    let verdict = lines.next_line().await.expect("io").expect("verdict line");
    let verdict: serde_json::Value = serde_json::from_str(&verdict).expect("json");
    assert_eq!(verdict["accepted"], false);
    assert_eq!(verdict["reason"], "version_mismatch");
    assert!(consumer.outputs.created().is_empty());
}
