//! Scripted capture backend for unit and integration testing.
//!
//! Plays a fixed sequence of batches into the sink as if they came from
//! hardware, then idles until halted. The guard it creates records the same
//! compensating actions the real backend would, so tests can verify
//! restoration ordering and idempotence without an X session or device
//! nodes.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use transwacom_core::{DeviceKind, EventRecord, PhysicalDevice};

use super::{
    CaptureBackend, CaptureError, CaptureHandle, CaptureOptions, EventBatch, RestorationGuard,
    RestoreAction,
};

/// A [`CaptureBackend`] that replays scripted batches.
#[derive(Default)]
pub struct MockCaptureBackend {
    script: Mutex<Vec<Vec<EventRecord>>>,
    guards: Mutex<Vec<Arc<RestorationGuard>>>,
    fail_with_busy: Mutex<bool>,
}

impl MockCaptureBackend {
    /// Each inner vec is one `SYN_REPORT`-terminated batch to emit at start.
    pub fn scripted(batches: Vec<Vec<EventRecord>>) -> Self {
        Self {
            script: Mutex::new(batches),
            ..Default::default()
        }
    }

    /// Makes the next `start` fail as if the grab was rejected.
    pub fn set_busy(&self, busy: bool) {
        *self.fail_with_busy.lock().expect("lock poisoned") = busy;
    }

    /// The guard created by the most recent `start`, for assertions about
    /// restoration.
    pub fn last_guard(&self) -> Option<Arc<RestorationGuard>> {
        self.guards.lock().expect("lock poisoned").last().cloned()
    }

    /// Every guard this backend handed out, in start order.
    pub fn all_guards(&self) -> Vec<Arc<RestorationGuard>> {
        self.guards.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl CaptureBackend for MockCaptureBackend {
    async fn start(
        &self,
        device: &PhysicalDevice,
        opts: CaptureOptions,
        sink: mpsc::Sender<EventBatch>,
    ) -> Result<CaptureHandle, CaptureError> {
        if *self.fail_with_busy.lock().expect("lock poisoned") {
            return Err(CaptureError::DeviceBusy { path: device.path.clone() });
        }

        let guard = Arc::new(RestorationGuard::new(device.path.clone(), None));
        if device.kind == DeviceKind::Tablet {
            if opts.relative_mode {
                guard.push(RestoreAction::RestoreMode { mode: "Absolute".to_string() });
            }
            if opts.disable_local {
                guard.push(RestoreAction::EnableLocal);
            }
        }
        self.guards.lock().expect("lock poisoned").push(Arc::clone(&guard));

        let batches = self.script.lock().expect("lock poisoned").clone();
        let kind = device.kind;
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let reader = tokio::spawn(async move {
            for events in batches {
                if sink.send(EventBatch { device_type: kind, events }).await.is_err() {
                    return;
                }
            }
            // Hold the "grab" until the session halts us.
            let _ = cancel_rx.changed().await;
        });

        Ok(CaptureHandle::new(cancel_tx, reader, guard))
    }
}
