//! evdev-backed capture: exclusive grab and the async reader task.
//!
//! # How grabbing works
//!
//! `EVIOCGRAB` gives this process exclusive delivery of the device's
//! events: the compositor and every other reader stop seeing them, which is
//! exactly what sharing needs — the pen must not also move the local
//! cursor. The kernel rejects a second grab with `EBUSY`, which surfaces
//! here as [`CaptureError::DeviceBusy`] and backs invariant checks higher
//! up. A grab is tied to the file descriptor, so it is released explicitly
//! on reader exit and implicitly if the process dies.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use evdev::Device;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use transwacom_core::protocol::codes;
use transwacom_core::{DeviceKind, PhysicalDevice};

use super::tablet::{ModeCommandRunner, TabletControl};
use super::{
    CaptureBackend, CaptureError, CaptureHandle, CaptureOptions, EventBatch, EventBatcher,
    RestorationGuard, RestoreAction,
};

/// `errno` for a rejected exclusive grab.
const EBUSY: i32 = 16;

/// The production capture backend.
pub struct EvdevCaptureBackend {
    runner: Arc<dyn ModeCommandRunner>,
}

impl EvdevCaptureBackend {
    pub fn new(runner: Arc<dyn ModeCommandRunner>) -> Self {
        Self { runner }
    }

    fn open_error(path: &str, e: io::Error) -> CaptureError {
        match e.kind() {
            io::ErrorKind::NotFound => CaptureError::NotFound { path: path.to_string() },
            io::ErrorKind::PermissionDenied => CaptureError::Permission {
                path: path.to_string(),
                source: e,
            },
            _ => CaptureError::Io { path: path.to_string(), source: e },
        }
    }

    /// Applies the requested transforms, pushing each inverse onto the
    /// guard *before* executing the forward command. A failed forward
    /// command is logged and skipped; the recorded inverse stays on the
    /// stack, where re-applying the unchanged state at teardown is
    /// harmless.
    fn apply_transforms(
        guard: &RestorationGuard,
        control: &TabletControl,
        opts: CaptureOptions,
    ) {
        if opts.relative_mode {
            let prior = control.current_mode().unwrap_or_else(|| "Absolute".to_string());
            guard.push(RestoreAction::RestoreMode { mode: prior });
            if let Err(e) = control.set_mode("Relative") {
                warn!(error = %e, "could not switch tablet to relative mode");
            }
        }
        if opts.disable_local {
            guard.push(RestoreAction::EnableLocal);
            if let Err(e) = control.disable_local() {
                warn!(error = %e, "could not disable local tablet input");
            }
        }
    }
}

#[async_trait]
impl CaptureBackend for EvdevCaptureBackend {
    async fn start(
        &self,
        device: &PhysicalDevice,
        opts: CaptureOptions,
        sink: mpsc::Sender<EventBatch>,
    ) -> Result<CaptureHandle, CaptureError> {
        let path = device.path.clone();

        // Refuse devices whose capability summary the registry cannot carry.
        if !device.capabilities.iter().any(|c| codes::resolve(c).is_some()) {
            return Err(CaptureError::Unsupported { path });
        }

        let mut dev = Device::open(&path).map_err(|e| Self::open_error(&path, e))?;
        dev.grab().map_err(|e| {
            if e.raw_os_error() == Some(EBUSY) {
                CaptureError::DeviceBusy { path: path.clone() }
            } else {
                Self::open_error(&path, e)
            }
        })?;
        info!(path = %path, name = %device.display_name, "grabbed device");

        // The guard exists before any mutation is applied.
        let control = match (device.kind, &device.vendor_tool_id) {
            (DeviceKind::Tablet, Some(tool_id)) => {
                Some(TabletControl::new(tool_id.clone(), Arc::clone(&self.runner)))
            }
            _ => None,
        };
        let guard = Arc::new(RestorationGuard::new(path.clone(), control.clone()));
        if let Some(control) = &control {
            Self::apply_transforms(&guard, control, opts);
        }

        let stream = match dev.into_event_stream() {
            Ok(stream) => stream,
            Err(e) => {
                // The grab dies with the descriptor; the transforms need
                // their compensating ops run before reporting failure.
                guard.run();
                return Err(Self::open_error(&path, e));
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let reader = tokio::spawn(reader_loop(
            stream,
            device.kind,
            path.clone(),
            sink,
            cancel_rx,
        ));

        Ok(CaptureHandle::new(cancel_tx, reader, guard))
    }
}

/// Reads events until cancelled or the device goes away, then releases the
/// grab. Timestamps are monotonic seconds since the capture started.
async fn reader_loop(
    mut stream: evdev::EventStream,
    device_type: DeviceKind,
    path: String,
    sink: mpsc::Sender<EventBatch>,
    mut cancel: watch::Receiver<bool>,
) {
    let started = Instant::now();
    let mut batcher = EventBatcher::new(device_type);

    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            event = stream.next_event() => match event {
                Ok(event) => {
                    let ts = started.elapsed().as_secs_f64();
                    let batch = batcher.push(event.event_type().0, event.code(), event.value(), ts);
                    if let Some(batch) = batch {
                        if sink.send(batch).await.is_err() {
                            // Session gone; nothing left to feed.
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "device read failed; stopping capture");
                    break;
                }
            }
        }
    }

    if let Err(e) = stream.device_mut().ungrab() {
        warn!(path = %path, error = %e, "ungrab failed");
    } else {
        debug!(path = %path, "released grab");
    }
}
