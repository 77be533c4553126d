//! TransWacom unified daemon entry point.
//!
//! Wires the infrastructure together and runs both roles: the consumer
//! listener (with its mDNS record) and the host-side driver API. In daemon
//! mode the supervisor's event stream is logged; an interactive tray would
//! subscribe to the same stream instead.
//!
//! ```text
//! main()
//!  ├─ ConfigStore::load()      -- YAML view, machine identity
//!  ├─ Supervisor::new()        -- registry + event channel
//!  ├─ consumer listener        -- TCP accept loop (exit 3 if port taken)
//!  ├─ mDNS publish + browse    -- advisory discovery
//!  ├─ device watcher           -- arrival/departure events
//!  └─ signal loop              -- SIGTERM/SIGINT → drain all, ≤ 3 s
//! ```
//!
//! Exit codes: 0 clean, 1 fatal config error, 2 missing input/uinput
//! permissions, 3 listen port in use.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use transwacom_daemon::application::supervisor::{Supervisor, SupervisorEvent};
use transwacom_daemon::infrastructure::capture::evdev::EvdevCaptureBackend;
use transwacom_daemon::infrastructure::capture::guard::GuardRegistry;
use transwacom_daemon::infrastructure::capture::tablet::{ModeCommandRunner, SystemCommandRunner};
use transwacom_daemon::infrastructure::config::ConfigStore;
use transwacom_daemon::infrastructure::detect::evdev::EvdevDetector;
use transwacom_daemon::infrastructure::discovery::Discovery;
use transwacom_daemon::infrastructure::emulation::uinput::{
    probe_uinput_access, UinputOutputFactory,
};
use transwacom_daemon::infrastructure::session::consumer::{bind_listener, ListenError};

/// How long the shutdown path waits for sessions and their restoration
/// guards before sweeping and exiting anyway.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(3);
/// Device rescan period for arrival/departure events.
const DEVICE_SCAN_PERIOD: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}

async fn run() -> Result<(), ExitCode> {
    // Config first: logging verbosity comes from it.
    let config_dir = match ConfigStore::default_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("fatal: {e}");
            return Err(ExitCode::from(1));
        }
    };
    let config = Arc::new(ConfigStore::load(&config_dir));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level())),
        )
        .init();
    info!(config = %config_dir.display(), "TransWacom daemon starting");

    // Fail fast on missing OS capabilities; a headless daemon cannot ask
    // anyone to fix group membership later.
    if !config.enabled_kinds().is_empty() {
        if let Err(e) = probe_uinput_access() {
            error!(error = %e, "cannot write /dev/uinput (add this user to the input group?)");
            return Err(ExitCode::from(2));
        }
    }

    let runner: Arc<dyn ModeCommandRunner> = Arc::new(SystemCommandRunner);
    let guards = GuardRegistry::new();
    let detector = Arc::new(EvdevDetector::new(Arc::clone(&runner)));
    let capture = Arc::new(EvdevCaptureBackend::new(Arc::clone(&runner)));
    let outputs = Arc::new(UinputOutputFactory::new(Arc::clone(&config)));

    let (supervisor, mut events) = Supervisor::new(
        Arc::clone(&config),
        detector,
        capture,
        outputs,
        guards,
    );
    info!(
        machine = %supervisor.identity().machine_name,
        id = %supervisor.identity().machine_id,
        "identity ready"
    );

    // Consumer listener; the port is the contract with peers.
    let port = config.consumer_port();
    let listener = match bind_listener(port).await {
        Ok(listener) => listener,
        Err(ListenError::PortInUse { port }) => {
            error!(port, "listen port already in use");
            return Err(ExitCode::from(3));
        }
        Err(ListenError::Bind { port, source })
            if source.kind() == std::io::ErrorKind::PermissionDenied =>
        {
            error!(port, error = %source, "not allowed to bind listen port");
            return Err(ExitCode::from(2));
        }
        Err(e) => {
            error!(error = %e, "listener setup failed");
            return Err(ExitCode::from(1));
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener_task = tokio::spawn(
        Arc::clone(&supervisor).serve_consumer(listener, shutdown_rx),
    );

    // Discovery is advisory: failure to publish degrades to manual dialing.
    let discovery = match Discovery::new() {
        Ok(discovery) => {
            let publish = discovery.publish(
                &config.mdns_name(),
                supervisor.identity(),
                port,
                &config.enabled_kinds(),
            );
            if let Err(e) = publish {
                warn!(error = %e, "mDNS publish failed; consumers must dial directly");
            }
            match discovery.browse() {
                Ok(browse_rx) => {
                    supervisor.attach_discovery(browse_rx);
                }
                Err(e) => warn!(error = %e, "mDNS browse failed"),
            }
            Some(discovery)
        }
        Err(e) => {
            warn!(error = %e, "mDNS unavailable; discovery disabled");
            None
        }
    };

    supervisor.spawn_device_watcher(DEVICE_SCAN_PERIOD);

    // Daemon-mode event sink: log what a tray would display.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SupervisorEvent::SessionStateChanged { session_id, state } => {
                    info!(session = %session_id, %state, "session state");
                }
                SupervisorEvent::AuthorizationPrompt { prompt_id, peer, kind, .. } => {
                    warn!(
                        prompt = %prompt_id,
                        peer = %peer.name,
                        %kind,
                        "authorization required but no UI is attached; the request will time out"
                    );
                }
                SupervisorEvent::DeviceArrived(device) => {
                    info!(path = %device.path, kind = %device.kind, name = %device.display_name, "device arrived");
                }
                SupervisorEvent::DeviceDeparted { path } => {
                    info!(%path, "device departed");
                }
                SupervisorEvent::Error { session_id, kind, message } => {
                    warn!(session = ?session_id, %kind, %message, "error");
                }
            }
        }
    });

    // Block until SIGTERM or SIGINT, then drain everything.
    wait_for_shutdown_signal().await;
    info!("shutdown signal received; draining sessions");
    let _ = shutdown_tx.send(true);
    supervisor.shutdown_all(SHUTDOWN_DEADLINE).await;
    if let Some(discovery) = discovery {
        discovery.shutdown();
    }
    listener_task.abort();
    info!("TransWacom daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
