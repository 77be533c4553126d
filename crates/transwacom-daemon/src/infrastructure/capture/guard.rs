//! Process-wide restoration registry.
//!
//! Every active capture registers its [`RestorationGuard`] here so that
//! abrupt termination (SIGTERM/SIGINT) can still restore every device: the
//! signal path sweeps the registry after asking sessions to drain, bounded
//! by the 3 s shutdown deadline in `main`. Because guards drain as they
//! run, a session that already restored on its own way down contributes a
//! no-op to the sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use super::RestorationGuard;

/// Registry of outstanding restoration guards, keyed by session id.
#[derive(Clone, Default)]
pub struct GuardRegistry {
    inner: Arc<Mutex<HashMap<Uuid, Arc<RestorationGuard>>>>,
}

impl GuardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: Uuid, guard: Arc<RestorationGuard>) {
        self.inner
            .lock()
            .expect("guard registry poisoned")
            .insert(session_id, guard);
    }

    pub fn deregister(&self, session_id: Uuid) {
        self.inner
            .lock()
            .expect("guard registry poisoned")
            .remove(&session_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("guard registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every outstanding guard and empties the registry. The final
    /// safety net on the signal path.
    pub fn run_all(&self) {
        let guards: Vec<Arc<RestorationGuard>> = {
            let mut inner = self.inner.lock().expect("guard registry poisoned");
            inner.drain().map(|(_, g)| g).collect()
        };
        for guard in guards {
            guard.run();
        }
    }
}
