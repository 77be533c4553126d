//! Consumer-side authorization.
//!
//! The decision sequence for an incoming handshake:
//!
//! 1. Kind disabled in config → refuse with `kind_disabled`, no prompt.
//! 2. Peer auto-accepted by stored policy → accept.
//! 3. Otherwise raise an `AuthorizationPrompt` event and wait up to 30 s
//!    for the UI to answer. Accept (optionally recording the peer as
//!    trusted), decline, or let the deadline refuse with `timeout`.
//!
//! Sessions never hold a reference to the UI: the prompt is an event on the
//! supervisor channel carrying a correlation id, and the answer comes back
//! through the [`PromptRegistry`] as a one-shot message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use transwacom_core::{DeviceKind, PeerIdentity};

use crate::application::supervisor::SupervisorEvent;
use crate::infrastructure::config::ConfigStore;

/// How long the UI gets to answer a prompt.
pub const PROMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// The UI's answer to an authorization prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAnswer {
    Accept {
        /// Also store the peer as trusted with auto-accept.
        trust: bool,
    },
    Decline,
}

/// Outcome of the authorization sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted,
    Refused { reason: String },
}

/// Pending prompts, keyed by correlation id.
///
/// A session registers before raising the event; the supervisor resolves
/// when the UI calls `accept`/`decline`. Unanswered prompts are discarded
/// by the deadline.
#[derive(Default)]
pub struct PromptRegistry {
    inner: Mutex<HashMap<Uuid, oneshot::Sender<PromptAnswer>>>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, prompt_id: Uuid) -> oneshot::Receiver<PromptAnswer> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .expect("prompt registry poisoned")
            .insert(prompt_id, tx);
        rx
    }

    /// Delivers the UI's answer. Returns `false` for unknown or already
    /// answered prompts (e.g. after the deadline fired).
    pub fn resolve(&self, prompt_id: Uuid, answer: PromptAnswer) -> bool {
        let sender = self
            .inner
            .lock()
            .expect("prompt registry poisoned")
            .remove(&prompt_id);
        match sender {
            Some(tx) => tx.send(answer).is_ok(),
            None => false,
        }
    }

    fn discard(&self, prompt_id: Uuid) {
        self.inner
            .lock()
            .expect("prompt registry poisoned")
            .remove(&prompt_id);
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().expect("prompt registry poisoned").len()
    }
}

/// The authorization use case, shared by all consumer sessions.
#[derive(Clone)]
pub struct Authorizer {
    config: Arc<ConfigStore>,
    prompts: Arc<PromptRegistry>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    prompt_timeout: Duration,
}

impl Authorizer {
    pub fn new(
        config: Arc<ConfigStore>,
        prompts: Arc<PromptRegistry>,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Self {
        Self {
            config,
            prompts,
            events,
            prompt_timeout: PROMPT_TIMEOUT,
        }
    }

    /// Shortens the prompt deadline. For tests.
    pub fn with_prompt_timeout(mut self, timeout: Duration) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    /// Runs the decision sequence for one handshake.
    pub async fn authorize(
        &self,
        peer: &PeerIdentity,
        kind: DeviceKind,
        device_name: &str,
    ) -> AuthOutcome {
        if !self.config.kind_enabled(kind) {
            return AuthOutcome::Refused { reason: "kind_disabled".to_string() };
        }
        if self.config.should_auto_accept_host(peer) {
            return AuthOutcome::Accepted;
        }

        let prompt_id = Uuid::new_v4();
        let answer_rx = self.prompts.register(prompt_id);
        let raised = self.events.send(SupervisorEvent::AuthorizationPrompt {
            prompt_id,
            peer: peer.clone(),
            kind,
            device_name: device_name.to_string(),
        });
        if raised.is_err() {
            // No UI is listening; treat like an unanswered prompt.
            self.prompts.discard(prompt_id);
            return AuthOutcome::Refused { reason: "timeout".to_string() };
        }

        match tokio::time::timeout(self.prompt_timeout, answer_rx).await {
            Ok(Ok(PromptAnswer::Accept { trust })) => {
                if trust {
                    self.config.trust_host(peer, true);
                }
                AuthOutcome::Accepted
            }
            Ok(Ok(PromptAnswer::Decline)) => {
                AuthOutcome::Refused { reason: "declined".to_string() }
            }
            Ok(Err(_)) | Err(_) => {
                self.prompts.discard(prompt_id);
                AuthOutcome::Refused { reason: "timeout".to_string() }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::{AppConfig, ConfigStore, TrustedHost};

    fn make_authorizer(
        config: AppConfig,
    ) -> (
        Authorizer,
        Arc<PromptRegistry>,
        mpsc::UnboundedReceiver<SupervisorEvent>,
    ) {
        let store = Arc::new(ConfigStore::in_memory(config));
        let prompts = Arc::new(PromptRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Authorizer::new(store, Arc::clone(&prompts), tx),
            prompts,
            rx,
        )
    }

    fn peer() -> PeerIdentity {
        PeerIdentity::new("HostA", "H1")
    }

    #[tokio::test]
    async fn test_disabled_kind_refuses_without_prompting() {
        let mut cfg = AppConfig::default();
        cfg.consumer.devices.joystick_enabled = false;
        let (authorizer, _prompts, mut events) = make_authorizer(cfg);

        let outcome = authorizer
            .authorize(&peer(), DeviceKind::Joystick, "Pad")
            .await;

        assert_eq!(
            outcome,
            AuthOutcome::Refused { reason: "kind_disabled".to_string() }
        );
        assert!(events.try_recv().is_err(), "no prompt may be raised");
    }

    #[tokio::test]
    async fn test_trusted_peer_is_auto_accepted() {
        let mut cfg = AppConfig::default();
        cfg.consumer.trusted_hosts.insert(
            "HostA".to_string(),
            TrustedHost { host_id: "H1".to_string(), auto_accept: true },
        );
        let (authorizer, _prompts, mut events) = make_authorizer(cfg);

        let outcome = authorizer.authorize(&peer(), DeviceKind::Tablet, "Pen").await;

        assert_eq!(outcome, AuthOutcome::Accepted);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_falls_through_to_prompt() {
        let mut cfg = AppConfig::default();
        cfg.consumer.trusted_hosts.insert(
            "HostA".to_string(),
            TrustedHost { host_id: "OTHER".to_string(), auto_accept: true },
        );
        let (authorizer, prompts, mut events) = make_authorizer(cfg);
        let authorizer = authorizer.with_prompt_timeout(Duration::from_millis(20));

        let outcome = authorizer.authorize(&peer(), DeviceKind::Tablet, "Pen").await;

        assert!(matches!(
            events.try_recv(),
            Ok(SupervisorEvent::AuthorizationPrompt { .. })
        ));
        assert_eq!(outcome, AuthOutcome::Refused { reason: "timeout".to_string() });
        assert_eq!(prompts.pending(), 0, "timed-out prompt is discarded");
    }

    #[tokio::test]
    async fn test_prompt_accept_with_trust_updates_the_store() {
        let (authorizer, prompts, mut events) = make_authorizer(AppConfig::default());
        let store = Arc::clone(&authorizer.config);

        let task = tokio::spawn({
            let authorizer = authorizer.clone();
            async move { authorizer.authorize(&peer(), DeviceKind::Tablet, "Pen").await }
        });

        let prompt_id = match events.recv().await {
            Some(SupervisorEvent::AuthorizationPrompt { prompt_id, .. }) => prompt_id,
            other => panic!("expected a prompt, got {other:?}"),
        };
        assert!(prompts.resolve(prompt_id, PromptAnswer::Accept { trust: true }));

        assert_eq!(task.await.unwrap(), AuthOutcome::Accepted);
        assert!(store.should_auto_accept_host(&peer()));
    }

    #[tokio::test]
    async fn test_prompt_decline_refuses() {
        let (authorizer, prompts, mut events) = make_authorizer(AppConfig::default());

        let task = tokio::spawn({
            let authorizer = authorizer.clone();
            async move { authorizer.authorize(&peer(), DeviceKind::Tablet, "Pen").await }
        });

        let prompt_id = match events.recv().await {
            Some(SupervisorEvent::AuthorizationPrompt { prompt_id, .. }) => prompt_id,
            other => panic!("expected a prompt, got {other:?}"),
        };
        prompts.resolve(prompt_id, PromptAnswer::Decline);

        assert_eq!(
            task.await.unwrap(),
            AuthOutcome::Refused { reason: "declined".to_string() }
        );
    }

    #[tokio::test]
    async fn test_resolving_an_expired_prompt_reports_failure() {
        let (authorizer, prompts, mut events) = make_authorizer(AppConfig::default());
        let authorizer = authorizer.with_prompt_timeout(Duration::from_millis(10));

        let outcome = authorizer.authorize(&peer(), DeviceKind::Tablet, "Pen").await;
        assert_eq!(outcome, AuthOutcome::Refused { reason: "timeout".to_string() });

        let prompt_id = match events.recv().await {
            Some(SupervisorEvent::AuthorizationPrompt { prompt_id, .. }) => prompt_id,
            other => panic!("expected a prompt, got {other:?}"),
        };
        assert!(!prompts.resolve(prompt_id, PromptAnswer::Decline));
    }
}
