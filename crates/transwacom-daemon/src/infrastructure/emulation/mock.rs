//! Recording emulation doubles for unit and integration testing.

use std::sync::{Arc, Mutex};

use transwacom_core::CapabilityProfile;

use crate::infrastructure::config::ConfigStore;

use super::{EmulationError, OutputFactory, RawEvent, VirtualOutput};

/// Shared recording of everything a [`RecordingOutput`] received.
#[derive(Default)]
pub struct OutputRecording {
    pub batches: Mutex<Vec<Vec<RawEvent>>>,
    pub destroyed: Mutex<bool>,
}

impl OutputRecording {
    pub fn batches(&self) -> Vec<Vec<RawEvent>> {
        self.batches.lock().expect("lock poisoned").clone()
    }

    pub fn is_destroyed(&self) -> bool {
        *self.destroyed.lock().expect("lock poisoned")
    }
}

/// A [`VirtualOutput`] that stores batches instead of writing to uinput.
pub struct RecordingOutput {
    recording: Arc<OutputRecording>,
    alive: bool,
}

impl VirtualOutput for RecordingOutput {
    fn emit(&mut self, events: &[RawEvent]) -> Result<(), EmulationError> {
        if !self.alive {
            return Err(EmulationError::Destroyed);
        }
        self.recording
            .batches
            .lock()
            .expect("lock poisoned")
            .push(events.to_vec());
        Ok(())
    }

    fn destroy(&mut self) {
        self.alive = false;
        *self.recording.destroyed.lock().expect("lock poisoned") = true;
    }

    fn is_alive(&self) -> bool {
        self.alive
    }
}

/// Factory handing out [`RecordingOutput`]s and keeping their recordings
/// reachable for assertions. Applies the same config gate as the uinput
/// factory.
pub struct RecordingOutputFactory {
    config: Arc<ConfigStore>,
    recordings: Mutex<Vec<(CapabilityProfile, String, Arc<OutputRecording>)>>,
}

impl RecordingOutputFactory {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            config,
            recordings: Mutex::new(Vec::new()),
        }
    }

    /// `(profile, peer_name, recording)` for every device created so far.
    pub fn created(&self) -> Vec<(CapabilityProfile, String, Arc<OutputRecording>)> {
        self.recordings.lock().expect("lock poisoned").clone()
    }
}

impl OutputFactory for RecordingOutputFactory {
    fn create(
        &self,
        profile: &CapabilityProfile,
        peer_name: &str,
    ) -> Result<Box<dyn VirtualOutput>, EmulationError> {
        if !self.config.kind_enabled(profile.kind) {
            return Err(EmulationError::Refused { kind: profile.kind });
        }
        let recording = Arc::new(OutputRecording::default());
        self.recordings.lock().expect("lock poisoned").push((
            profile.clone(),
            peer_name.to_string(),
            Arc::clone(&recording),
        ));
        Ok(Box::new(RecordingOutput { recording, alive: true }))
    }
}
