//! YAML-based configuration and trust store.
//!
//! The file lives at `$XDG_CONFIG_HOME/transwacom/config.yml` (falling back
//! to `~/.config/transwacom/config.yml`) and is read once at start. All
//! queries and mutations go against an in-memory view; writes are atomic
//! (write to a temp file in the same directory, then rename) and best
//! effort: a failed write keeps the in-memory policy for the process
//! lifetime and surfaces a warning, so the store never blocks protocol
//! progress.
//!
//! Unknown keys at any level are captured into flattened maps and written
//! back unchanged, so hand-edited extras survive a rewrite.
//!
//! # Serde default values
//!
//! Fields annotated with `#[serde(default = "some_fn")]` use the return
//! value of `some_fn()` when the key is absent from the YAML file. This
//! makes a missing or partial file equivalent to the documented defaults,
//! both on first run and when upgrading from an older file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use transwacom_core::{DeviceKind, MachineIdentity, PeerIdentity, PeerPolicy};

/// Error type for configuration store operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine config directory (no XDG_CONFIG_HOME or HOME)")]
    NoConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The YAML content could not be parsed.
    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Unknown top-level keys, preserved on rewrite.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Identity and logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Human label broadcast in discovery and the handshake. Defaults to the
    /// hostname when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_name: Option<String>,
    /// Stable fingerprint, 32 lowercase hex chars. Auto-generated at first
    /// start and never regenerated afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    /// `tracing` level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            machine_name: None,
            machine_id: None,
            log_level: default_log_level(),
            extra: BTreeMap::new(),
        }
    }
}

/// Host-role behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    /// Switch tablets to relative mode while sharing.
    #[serde(default = "default_true")]
    pub relative_mode: bool,
    /// Detach tablets from the local pointer while sharing.
    #[serde(default = "default_true")]
    pub disable_local: bool,
    /// Consumers this host will stream to without prompting.
    #[serde(default)]
    pub trusted_consumers: BTreeMap<String, TrustedConsumer>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            relative_mode: true,
            disable_local: true,
            trusted_consumers: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

/// A consumer the host trusts, keyed by name in the config map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrustedConsumer {
    pub consumer_id: String,
    #[serde(default = "default_true")]
    pub auto_accept: bool,
    #[serde(default = "default_all_kinds")]
    pub allowed_devices: Vec<DeviceKind>,
}

/// Consumer-role behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    /// Hosts this consumer will accept streams from without prompting.
    #[serde(default)]
    pub trusted_hosts: BTreeMap<String, TrustedHost>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Listen port and mDNS label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Service instance label; the machine name is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mdns_name: Option<String>,
}

/// Per-kind accept gates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DevicesConfig {
    #[serde(default = "default_true")]
    pub tablet_enabled: bool,
    #[serde(default = "default_true")]
    pub joystick_enabled: bool,
}

/// A host the consumer trusts, keyed by name in the config map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrustedHost {
    pub host_id: String,
    #[serde(default = "default_true")]
    pub auto_accept: bool,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_port() -> u16 {
    3333
}
fn default_all_kinds() -> Vec<DeviceKind> {
    vec![DeviceKind::Tablet, DeviceKind::Joystick]
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { port: default_port(), mdns_name: None }
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self { tablet_enabled: true, joystick_enabled: true }
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// The in-memory view of the configuration, with best-effort persistence.
///
/// The supervisor is the single writer; sessions take snapshots or use the
/// synchronous query methods. Internally a `std::sync::RwLock` is enough:
/// no lock is ever held across an await point.
pub struct ConfigStore {
    state: RwLock<AppConfig>,
    /// `None` for in-memory stores used in tests; then `save` is a no-op.
    path: Option<PathBuf>,
}

impl ConfigStore {
    /// Loads the store from `dir/config.yml`.
    ///
    /// A missing file yields the defaults. A malformed file also yields the
    /// defaults, with a warning — a broken config must never prevent the
    /// daemon from starting.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join("config.yml");
        let config = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_yaml::from_str::<AppConfig>(&content) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed config, using defaults");
                    AppConfig::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable config, using defaults");
                AppConfig::default()
            }
        };
        Self {
            state: RwLock::new(config),
            path: Some(path),
        }
    }

    /// Creates a store that lives only in memory. Used by tests.
    pub fn in_memory(config: AppConfig) -> Self {
        Self {
            state: RwLock::new(config),
            path: None,
        }
    }

    /// Resolves the config directory: `$XDG_CONFIG_HOME/transwacom` or
    /// `~/.config/transwacom`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConfigDir`] when neither `XDG_CONFIG_HOME`
    /// nor `HOME` is set.
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(base.join("transwacom"))
    }

    /// Returns a copy of the whole configuration.
    pub fn snapshot(&self) -> AppConfig {
        self.state.read().expect("config lock poisoned").clone()
    }

    // ── Identity ──────────────────────────────────────────────────────────────

    /// Returns the machine identity, generating and persisting the
    /// fingerprint on first call.
    ///
    /// The fingerprint is 16 random bytes rendered as 32 lowercase hex
    /// chars. Once present in the config it is never regenerated.
    pub fn ensure_identity(&self) -> MachineIdentity {
        let existing = {
            let state = self.state.read().expect("config lock poisoned");
            state.general.machine_id.clone()
        };
        let machine_id = match existing {
            Some(id) => id,
            None => {
                let id = generate_machine_id();
                self.state
                    .write()
                    .expect("config lock poisoned")
                    .general
                    .machine_id = Some(id.clone());
                self.persist();
                id
            }
        };
        MachineIdentity::new(machine_id, self.machine_name())
    }

    /// The human label: configured name, or the hostname, or `"transwacom"`.
    pub fn machine_name(&self) -> String {
        let state = self.state.read().expect("config lock poisoned");
        state.general.machine_name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "transwacom".to_string())
        })
    }

    pub fn log_level(&self) -> String {
        self.state.read().expect("config lock poisoned").general.log_level.clone()
    }

    // ── Consumer-role queries ─────────────────────────────────────────────────

    pub fn consumer_port(&self) -> u16 {
        self.state.read().expect("config lock poisoned").consumer.network.port
    }

    /// The mDNS instance label: configured, or the machine name.
    pub fn mdns_name(&self) -> String {
        let configured = {
            let state = self.state.read().expect("config lock poisoned");
            state.consumer.network.mdns_name.clone()
        };
        configured.unwrap_or_else(|| self.machine_name())
    }

    /// The per-kind accept gate (`consumer.devices.*_enabled`).
    pub fn kind_enabled(&self, kind: DeviceKind) -> bool {
        let state = self.state.read().expect("config lock poisoned");
        match kind {
            DeviceKind::Tablet => state.consumer.devices.tablet_enabled,
            DeviceKind::Joystick => state.consumer.devices.joystick_enabled,
        }
    }

    /// The kinds currently accepted, for the discovery TXT record.
    pub fn enabled_kinds(&self) -> Vec<DeviceKind> {
        [DeviceKind::Tablet, DeviceKind::Joystick]
            .into_iter()
            .filter(|k| self.kind_enabled(*k))
            .collect()
    }

    /// Whether the consumer knows this host: both name and fingerprint must
    /// match the stored entry.
    pub fn is_host_trusted(&self, peer: &PeerIdentity) -> bool {
        let state = self.state.read().expect("config lock poisoned");
        state
            .consumer
            .trusted_hosts
            .get(&peer.name)
            .is_some_and(|t| t.host_id == peer.machine_id)
    }

    /// Whether a stream from this host is accepted without prompting.
    pub fn should_auto_accept_host(&self, peer: &PeerIdentity) -> bool {
        let state = self.state.read().expect("config lock poisoned");
        state
            .consumer
            .trusted_hosts
            .get(&peer.name)
            .is_some_and(|t| t.host_id == peer.machine_id && t.auto_accept)
    }

    /// Records a host as trusted and persists best-effort.
    pub fn trust_host(&self, peer: &PeerIdentity, auto_accept: bool) {
        {
            let mut state = self.state.write().expect("config lock poisoned");
            state.consumer.trusted_hosts.insert(
                peer.name.clone(),
                TrustedHost { host_id: peer.machine_id.clone(), auto_accept },
            );
        }
        self.persist();
    }

    /// Removes a host from the trust list and persists best-effort.
    pub fn untrust_host(&self, name: &str) {
        let removed = {
            let mut state = self.state.write().expect("config lock poisoned");
            state.consumer.trusted_hosts.remove(name).is_some()
        };
        if removed {
            self.persist();
        }
    }

    // ── Host-role queries ─────────────────────────────────────────────────────

    pub fn relative_mode(&self) -> bool {
        self.state.read().expect("config lock poisoned").host.relative_mode
    }

    pub fn disable_local(&self) -> bool {
        self.state.read().expect("config lock poisoned").host.disable_local
    }

    pub fn is_consumer_trusted(&self, peer: &PeerIdentity) -> bool {
        self.consumer_policy(peer).is_some()
    }

    /// The stored policy for a consumer, when name and fingerprint match.
    pub fn consumer_policy(&self, peer: &PeerIdentity) -> Option<PeerPolicy> {
        let state = self.state.read().expect("config lock poisoned");
        state
            .host
            .trusted_consumers
            .get(&peer.name)
            .filter(|t| t.consumer_id == peer.machine_id)
            .map(|t| PeerPolicy {
                auto_accept: t.auto_accept,
                allowed_kinds: t.allowed_devices.clone(),
            })
    }

    /// Whether this host shares `kind` devices with the given consumer.
    pub fn allowed_for_consumer(&self, peer: &PeerIdentity, kind: DeviceKind) -> bool {
        self.consumer_policy(peer).is_some_and(|p| p.allows(kind))
    }

    /// Records a consumer as trusted with the given policy and persists
    /// best-effort.
    pub fn trust_consumer(&self, peer: &PeerIdentity, policy: PeerPolicy) {
        {
            let mut state = self.state.write().expect("config lock poisoned");
            state.host.trusted_consumers.insert(
                peer.name.clone(),
                TrustedConsumer {
                    consumer_id: peer.machine_id.clone(),
                    auto_accept: policy.auto_accept,
                    allowed_devices: policy.allowed_kinds,
                },
            );
        }
        self.persist();
    }

    /// Removes a consumer from the trust list and persists best-effort.
    pub fn untrust_consumer(&self, name: &str) {
        let removed = {
            let mut state = self.state.write().expect("config lock poisoned");
            state.host.trusted_consumers.remove(name).is_some()
        };
        if removed {
            self.persist();
        }
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Writes the current state atomically: serialize to a temp file in the
    /// config directory, then rename over `config.yml`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] for file-system failures. In-memory
    /// stores return `Ok` without touching disk.
    pub fn save(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = {
            let state = self.state.read().expect("config lock poisoned");
            serde_yaml::to_string(&*state)?
        };

        let dir = path.parent().expect("config path has a parent");
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let tmp = path.with_extension("yml.tmp");
        std::fs::write(&tmp, content).map_err(|source| ConfigError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Best-effort save: a failure is logged and the in-memory state stands.
    fn persist(&self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "config write failed; in-memory settings remain active");
        }
    }
}

/// Generates a fresh 128-bit machine fingerprint as lowercase hex.
fn generate_machine_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_store() -> (ConfigStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("transwacom_test_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        (ConfigStore::load(&dir), dir)
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.consumer.network.port, 3333);
        assert!(cfg.consumer.devices.tablet_enabled);
        assert!(cfg.consumer.devices.joystick_enabled);
        assert!(cfg.host.relative_mode);
        assert!(cfg.host.disable_local);
        assert!(cfg.consumer.trusted_hosts.is_empty());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let (store, dir) = temp_store();
        assert_eq!(store.snapshot(), AppConfig::default());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_malformed_yaml_yields_defaults_without_panicking() {
        let dir = std::env::temp_dir().join(format!("transwacom_test_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.yml"), "{{{{ not yaml").unwrap();

        let store = ConfigStore::load(&dir);
        assert_eq!(store.snapshot(), AppConfig::default());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partial_yaml_keeps_defaults_for_missing_keys() {
        let yaml = "consumer:\n  network:\n    port: 4444\n";
        let cfg: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.consumer.network.port, 4444);
        assert!(cfg.consumer.devices.tablet_enabled);
        assert!(cfg.host.relative_mode);
    }

    #[test]
    fn test_unknown_keys_survive_a_rewrite() {
        let yaml = "future_section:\n  knob: 7\ngeneral:\n  log_level: debug\n";
        let cfg: AppConfig = serde_yaml::from_str(yaml).unwrap();
        let out = serde_yaml::to_string(&cfg).unwrap();
        assert!(out.contains("future_section"), "unknown key dropped: {out}");
        assert!(out.contains("knob"));
    }

    #[test]
    fn test_ensure_identity_generates_once_and_persists() {
        let (store, dir) = temp_store();

        let first = store.ensure_identity();
        assert_eq!(first.machine_id.len(), 32);
        assert!(first.machine_id.chars().all(|c| c.is_ascii_hexdigit()));

        // A second call must return the same fingerprint, and so must a
        // fresh store loaded from the same directory.
        assert_eq!(store.ensure_identity().machine_id, first.machine_id);
        let reloaded = ConfigStore::load(&dir);
        assert_eq!(reloaded.ensure_identity().machine_id, first.machine_id);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_save_is_atomic_and_leaves_no_temp_file() {
        let (store, dir) = temp_store();
        store.ensure_identity();
        store.save().unwrap();

        assert!(dir.join("config.yml").exists());
        assert!(!dir.join("config.yml.tmp").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_trust_host_then_queries_match() {
        let store = ConfigStore::in_memory(AppConfig::default());
        let peer = PeerIdentity::new("HostA", "H1");

        assert!(!store.is_host_trusted(&peer));
        assert!(!store.should_auto_accept_host(&peer));

        store.trust_host(&peer, true);
        assert!(store.is_host_trusted(&peer));
        assert!(store.should_auto_accept_host(&peer));

        // Same name with a different fingerprint is a different machine.
        let impostor = PeerIdentity::new("HostA", "H2");
        assert!(!store.is_host_trusted(&impostor));
        assert!(!store.should_auto_accept_host(&impostor));

        store.untrust_host("HostA");
        assert!(!store.is_host_trusted(&peer));
    }

    #[test]
    fn test_kind_gate_reads_per_kind_flags() {
        let mut cfg = AppConfig::default();
        cfg.consumer.devices.joystick_enabled = false;
        let store = ConfigStore::in_memory(cfg);
        assert!(store.kind_enabled(DeviceKind::Tablet));
        assert!(!store.kind_enabled(DeviceKind::Joystick));
        assert_eq!(store.enabled_kinds(), vec![DeviceKind::Tablet]);
    }

    #[test]
    fn test_trust_consumer_round_trips_through_the_policy_type() {
        let store = ConfigStore::in_memory(AppConfig::default());
        let peer = PeerIdentity::new("couch-pc", "C9");

        store.trust_consumer(
            &peer,
            PeerPolicy { auto_accept: true, allowed_kinds: vec![DeviceKind::Joystick] },
        );
        assert!(store.is_consumer_trusted(&peer));
        let policy = store.consumer_policy(&peer).unwrap();
        assert!(policy.auto_accept);
        assert!(policy.allows(DeviceKind::Joystick));
        assert!(!policy.allows(DeviceKind::Tablet));

        store.untrust_consumer("couch-pc");
        assert!(!store.is_consumer_trusted(&peer));
    }

    #[test]
    fn test_allowed_for_consumer_respects_device_list() {
        let mut cfg = AppConfig::default();
        cfg.host.trusted_consumers.insert(
            "studio".to_string(),
            TrustedConsumer {
                consumer_id: "C1".to_string(),
                auto_accept: true,
                allowed_devices: vec![DeviceKind::Tablet],
            },
        );
        let store = ConfigStore::in_memory(cfg);
        let peer = PeerIdentity::new("studio", "C1");
        assert!(store.allowed_for_consumer(&peer, DeviceKind::Tablet));
        assert!(!store.allowed_for_consumer(&peer, DeviceKind::Joystick));
    }
}
