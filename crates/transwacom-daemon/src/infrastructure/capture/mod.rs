//! Host-side capture: exclusive grab, mode transforms, and the restoration
//! guard.
//!
//! Starting a capture does three things, in order:
//!
//! 1. Open the device and **grab** it exclusively, so local consumers stop
//!    seeing its events.
//! 2. Apply the requested transforms (relative mode, local disable) — but
//!    only after pushing the inverse of each onto the session's
//!    [`RestorationGuard`], so the pre-session state is recorded before
//!    anything is mutated.
//! 3. Spawn a reader that timestamps events against a monotonic clock and
//!    forwards them to the sink in contiguous `SYN_REPORT`-terminated
//!    batches. A batch is never split across frames.
//!
//! Teardown is the mirror image and runs on *every* exit path: the reader
//! stops and releases the grab, then the guard executes its recorded
//! actions in LIFO order. The guard drains as it runs, so running it twice
//! (session stop followed by the process-wide signal sweep in
//! [`guard::GuardRegistry`]) executes each action exactly once.

pub mod evdev;
pub mod guard;
pub mod mock;
pub mod tablet;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use transwacom_core::protocol::codes::{self, EV_SYN};
use transwacom_core::{DeviceKind, EventRecord, PhysicalDevice};

use self::tablet::TabletControl;

/// Error type for capture operations. None of these leave partial mutations
/// behind; the guard runs on every error path.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The exclusive grab was rejected; someone else holds the device.
    #[error("device {path} is busy (exclusive grab rejected)")]
    DeviceBusy { path: String },

    /// No device node at the given path.
    #[error("no device at {path}")]
    NotFound { path: String },

    /// The device advertises nothing the registry can carry.
    #[error("device {path} has no shareable capabilities")]
    Unsupported { path: String },

    /// The OS denied access to the input node.
    #[error("permission denied opening {path}: {source}")]
    Permission {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Any other I/O failure.
    #[error("capture I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Local transforms applied for the duration of a capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Switch a tablet to relative mode, remembering the prior mode.
    pub relative_mode: bool,
    /// Detach a tablet from the local pointer, remembering the prior state.
    pub disable_local: bool,
}

/// One contiguous, `SYN_REPORT`-terminated batch of events.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    pub device_type: DeviceKind,
    pub events: Vec<EventRecord>,
}

/// Capture seam between the session engine and the OS.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Grabs `device`, applies `opts`, and starts streaming batches into
    /// `sink`.
    ///
    /// # Errors
    ///
    /// Returns a [`CaptureError`]; in that case no mutation remains applied.
    async fn start(
        &self,
        device: &PhysicalDevice,
        opts: CaptureOptions,
        sink: mpsc::Sender<EventBatch>,
    ) -> Result<CaptureHandle, CaptureError>;
}

// ── Restoration guard ─────────────────────────────────────────────────────────

/// A compensating operation recorded before its forward transform ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreAction {
    /// Put the tablet back into `mode` (usually `"Absolute"`).
    RestoreMode { mode: String },
    /// Re-attach the tablet to the local pointer.
    EnableLocal,
}

/// The per-session stack of compensating operations.
///
/// Every mutation pushes its inverse *before* executing; teardown pops in
/// LIFO order. [`run`](RestorationGuard::run) drains the stack, which makes
/// it idempotent: the second caller finds nothing left to do. Failures
/// during restoration are logged and do not stop the remaining actions.
pub struct RestorationGuard {
    device_path: String,
    control: Option<TabletControl>,
    actions: Mutex<Vec<RestoreAction>>,
    runs_performed: AtomicU32,
}

impl RestorationGuard {
    pub fn new(device_path: impl Into<String>, control: Option<TabletControl>) -> Self {
        Self {
            device_path: device_path.into(),
            control,
            actions: Mutex::new(Vec::new()),
            runs_performed: AtomicU32::new(0),
        }
    }

    /// Records a compensating op. Call *before* applying the forward
    /// transform.
    pub fn push(&self, action: RestoreAction) {
        self.actions.lock().expect("guard lock poisoned").push(action);
    }

    /// The actions still waiting to run, oldest first. For inspection and
    /// tests.
    pub fn pending(&self) -> Vec<RestoreAction> {
        self.actions.lock().expect("guard lock poisoned").clone()
    }

    /// How many `run` calls actually executed at least one action.
    pub fn runs_performed(&self) -> u32 {
        self.runs_performed.load(Ordering::SeqCst)
    }

    /// Executes and drains the stack in LIFO order.
    ///
    /// This is the only place restoration happens. Safe to call from any
    /// thread and any number of times.
    pub fn run(&self) {
        let drained: Vec<RestoreAction> = {
            let mut actions = self.actions.lock().expect("guard lock poisoned");
            std::mem::take(&mut *actions)
        };
        if drained.is_empty() {
            return;
        }
        self.runs_performed.fetch_add(1, Ordering::SeqCst);

        for action in drained.into_iter().rev() {
            let result = match (&action, &self.control) {
                (RestoreAction::RestoreMode { mode }, Some(ctl)) => ctl.set_mode(mode),
                (RestoreAction::EnableLocal, Some(ctl)) => ctl.enable_local(),
                (_, None) => Ok(()),
            };
            if let Err(e) = result {
                warn!(
                    device = %self.device_path,
                    action = ?action,
                    error = %e,
                    "restoration action failed; continuing with the rest"
                );
            }
        }
    }
}

// ── Capture handle ────────────────────────────────────────────────────────────

/// Handle to a running capture, owned by the host session.
pub struct CaptureHandle {
    cancel: watch::Sender<bool>,
    reader: Option<JoinHandle<()>>,
    guard: Arc<RestorationGuard>,
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle").finish_non_exhaustive()
    }
}

impl CaptureHandle {
    pub fn new(
        cancel: watch::Sender<bool>,
        reader: JoinHandle<()>,
        guard: Arc<RestorationGuard>,
    ) -> Self {
        Self {
            cancel,
            reader: Some(reader),
            guard,
        }
    }

    /// The restoration guard, shared with the process-wide registry.
    pub fn guard(&self) -> Arc<RestorationGuard> {
        Arc::clone(&self.guard)
    }

    /// Stops the reader and waits for it to release the grab. Does **not**
    /// run restoration; the session does that after the socket is closed.
    pub async fn halt(&mut self) {
        let _ = self.cancel.send(true);
        if let Some(reader) = self.reader.take() {
            if tokio::time::timeout(Duration::from_secs(1), reader).await.is_err() {
                warn!("capture reader did not stop within 1 s; detaching");
            }
        }
    }

    /// Full teardown: halt the reader, then run the restoration guard.
    /// Used on paths where no socket ordering applies.
    pub async fn stop(&mut self) {
        self.halt().await;
        let guard = Arc::clone(&self.guard);
        let _ = tokio::task::spawn_blocking(move || guard.run()).await;
    }
}

// ── Batcher ───────────────────────────────────────────────────────────────────

/// Accumulates raw events into `SYN_REPORT`-terminated batches.
///
/// Codes outside the registry get positional fallback names so the batch
/// structure stays intact; the consumer drops them on injection.
#[derive(Debug)]
pub struct EventBatcher {
    device_type: DeviceKind,
    pending: Vec<EventRecord>,
}

impl EventBatcher {
    pub fn new(device_type: DeviceKind) -> Self {
        Self {
            device_type,
            pending: Vec::new(),
        }
    }

    /// Feeds one raw event; returns a completed batch on `SYN_REPORT`.
    pub fn push(&mut self, event_type: u16, code: u16, value: i32, ts: f64) -> Option<EventBatch> {
        let name = codes::name_for(event_type, code)
            .map(str::to_string)
            .unwrap_or_else(|| codes::fallback_name(event_type, code));
        self.pending.push(EventRecord::new(name, value, ts));

        if event_type == EV_SYN && code == 0 {
            let events = std::mem::take(&mut self.pending);
            return Some(EventBatch {
                device_type: self.device_type,
                events,
            });
        }
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use transwacom_core::protocol::codes::{EV_ABS, EV_KEY};

    // ── Batcher ───────────────────────────────────────────────────────────────

    #[test]
    fn test_batcher_holds_events_until_syn_report() {
        let mut batcher = EventBatcher::new(DeviceKind::Tablet);
        assert!(batcher.push(EV_ABS, 0x00, 100, 0.1).is_none());
        assert!(batcher.push(EV_ABS, 0x01, 200, 0.1).is_none());

        let batch = batcher.push(EV_SYN, 0, 0, 0.1).expect("batch on SYN_REPORT");
        let codes: Vec<&str> = batch.events.iter().map(|e| e.code.as_str()).collect();
        assert_eq!(codes, vec!["ABS_X", "ABS_Y", "SYN_REPORT"]);
    }

    #[test]
    fn test_batcher_never_emits_a_partial_batch() {
        let mut batcher = EventBatcher::new(DeviceKind::Joystick);
        for i in 0..50 {
            assert!(batcher.push(EV_ABS, 0x00, i, 0.0).is_none());
        }
    }

    #[test]
    fn test_batcher_preserves_submission_order_across_batches() {
        let mut batcher = EventBatcher::new(DeviceKind::Tablet);
        batcher.push(EV_KEY, 0x14a, 1, 0.0); // BTN_TOUCH down
        let first = batcher.push(EV_SYN, 0, 0, 0.0).unwrap();
        batcher.push(EV_KEY, 0x14a, 0, 0.2); // BTN_TOUCH up
        let second = batcher.push(EV_SYN, 0, 0, 0.2).unwrap();

        assert_eq!(first.events[0].value, 1);
        assert_eq!(second.events[0].value, 0);
    }

    #[test]
    fn test_batcher_uses_fallback_names_for_unknown_codes() {
        let mut batcher = EventBatcher::new(DeviceKind::Tablet);
        batcher.push(EV_ABS, 0x2f, 3, 0.0); // ABS_MT_SLOT, outside the registry
        let batch = batcher.push(EV_SYN, 0, 0, 0.0).unwrap();
        assert_eq!(batch.events[0].code, "TYPE_3_CODE_47");
    }

    // ── Restoration guard ─────────────────────────────────────────────────────

    #[test]
    fn test_guard_drains_on_run_and_is_idempotent() {
        let guard = RestorationGuard::new("/dev/input/event11", None);
        guard.push(RestoreAction::RestoreMode { mode: "Absolute".to_string() });
        guard.push(RestoreAction::EnableLocal);
        assert_eq!(guard.pending().len(), 2);

        guard.run();
        assert!(guard.pending().is_empty());
        assert_eq!(guard.runs_performed(), 1);

        // Second run finds nothing: stop-then-signal executes once total.
        guard.run();
        assert_eq!(guard.runs_performed(), 1);
    }

    #[test]
    fn test_guard_records_actions_in_push_order_for_inspection() {
        let guard = RestorationGuard::new("/dev/input/event11", None);
        guard.push(RestoreAction::RestoreMode { mode: "Absolute".to_string() });
        guard.push(RestoreAction::EnableLocal);
        assert_eq!(
            guard.pending(),
            vec![
                RestoreAction::RestoreMode { mode: "Absolute".to_string() },
                RestoreAction::EnableLocal,
            ]
        );
    }

    #[test]
    fn test_guard_with_no_actions_counts_no_run() {
        let guard = RestorationGuard::new("/dev/input/event11", None);
        guard.run();
        assert_eq!(guard.runs_performed(), 0);
    }
}
