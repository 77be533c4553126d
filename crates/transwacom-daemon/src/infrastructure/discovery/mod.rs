//! mDNS publication and browsing.
//!
//! Consumers publish a `_input-consumer._tcp.local.` service whose TXT
//! record carries the protocol version, the machine name and fingerprint,
//! and the device kinds currently accepted. Hosts browse for the same type.
//! Discovery is advisory only — a host can always dial a user-supplied
//! `address:port` directly.
//!
//! The browse pump runs on a dedicated thread (the mDNS receiver blocks)
//! and forwards typed events into a tokio channel, so the async side never
//! parks a runtime worker.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use transwacom_core::{DeviceKind, MachineIdentity, PROTOCOL_VERSION};

/// The service type consumers publish.
pub const SERVICE_TYPE: &str = "_input-consumer._tcp.local.";

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mDNS daemon error: {0}")]
    Daemon(String),
}

/// A consumer seen on the LAN.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredConsumer {
    /// Full mDNS instance name; the stable key for this record.
    pub instance: String,
    /// Human label from the TXT record (falls back to the instance name).
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    /// Device kinds the consumer currently accepts.
    pub capabilities: Vec<DeviceKind>,
    pub version: String,
    /// Machine fingerprint, when the record carries one.
    pub machine_id: Option<String>,
}

/// Event stream produced by browsing.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    ConsumerFound(DiscoveredConsumer),
    ConsumerLost { instance: String },
}

/// Handle to the mDNS daemon, owning the published registration.
pub struct Discovery {
    daemon: ServiceDaemon,
    registered: Mutex<Option<String>>,
}

impl Discovery {
    /// Starts the mDNS daemon.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Daemon`] when the daemon cannot bind its
    /// multicast sockets.
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        Ok(Self {
            daemon,
            registered: Mutex::new(None),
        })
    }

    /// Publishes (or republishes) the consumer service record.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Daemon`] when registration fails.
    pub fn publish(
        &self,
        instance_name: &str,
        identity: &MachineIdentity,
        port: u16,
        capabilities: &[DeviceKind],
    ) -> Result<(), DiscoveryError> {
        self.unpublish();

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "transwacom".to_string());
        let service = ServiceInfo::new(
            SERVICE_TYPE,
            instance_name,
            &format!("{host}.local."),
            (),
            port,
            build_txt(identity, capabilities),
        )
        .map_err(|e| DiscoveryError::Daemon(e.to_string()))?
        .enable_addr_auto();

        let fullname = service.get_fullname().to_string();
        self.daemon
            .register(service)
            .map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        info!(instance = %fullname, port, "published consumer service");
        *self.registered.lock().expect("discovery lock poisoned") = Some(fullname);
        Ok(())
    }

    /// Withdraws the published record, if any.
    pub fn unpublish(&self) {
        let fullname = self
            .registered
            .lock()
            .expect("discovery lock poisoned")
            .take();
        if let Some(fullname) = fullname {
            if let Err(e) = self.daemon.unregister(&fullname) {
                warn!(instance = %fullname, error = %e, "unregister failed");
            }
        }
    }

    /// Starts browsing; events arrive on the returned channel until the
    /// daemon shuts down.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Daemon`] when the browse cannot start.
    pub fn browse(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        let (tx, rx) = mpsc::channel(32);

        // The mDNS receiver blocks; pump it from a plain thread.
        std::thread::spawn(move || {
            while let Ok(event) = receiver.recv() {
                let forward = match event {
                    ServiceEvent::ServiceResolved(info) => {
                        match parse_resolved(&info) {
                            Some(consumer) => DiscoveryEvent::ConsumerFound(consumer),
                            None => continue,
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        DiscoveryEvent::ConsumerLost { instance: fullname }
                    }
                    _ => continue,
                };
                if tx.blocking_send(forward).is_err() {
                    break;
                }
            }
            debug!("discovery browse pump ended");
        });
        Ok(rx)
    }

    /// Stops the daemon; the published record is withdrawn with it.
    pub fn shutdown(&self) {
        self.unpublish();
        if let Err(e) = self.daemon.shutdown() {
            warn!(error = %e, "mDNS daemon shutdown failed");
        }
    }
}

/// Builds the TXT record map.
fn build_txt(identity: &MachineIdentity, capabilities: &[DeviceKind]) -> HashMap<String, String> {
    let caps: Vec<&str> = capabilities.iter().map(DeviceKind::as_str).collect();
    HashMap::from([
        ("version".to_string(), PROTOCOL_VERSION.to_string()),
        ("name".to_string(), identity.machine_name.clone()),
        ("capabilities".to_string(), caps.join(",")),
        ("id".to_string(), identity.machine_id.clone()),
    ])
}

/// Reduces a resolved service to a [`DiscoveredConsumer`].
fn parse_resolved(info: &ServiceInfo) -> Option<DiscoveredConsumer> {
    let address = info.get_addresses().iter().next().copied()?;
    let props = info.get_properties();
    let instance = info.get_fullname().to_string();

    let name = props
        .get("name")
        .map(|p| p.val_str().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| instance.split('.').next().unwrap_or("unknown").to_string());
    let capabilities = props
        .get("capabilities")
        .map(|p| parse_capabilities(p.val_str()))
        .unwrap_or_default();
    let version = props
        .get("version")
        .map(|p| p.val_str().to_string())
        .unwrap_or_else(|| "1.0".to_string());
    let machine_id = props
        .get("id")
        .map(|p| p.val_str().to_string())
        .filter(|s| !s.is_empty());

    Some(DiscoveredConsumer {
        instance,
        name,
        address,
        port: info.get_port(),
        capabilities,
        version,
        machine_id,
    })
}

/// Parses the comma-joined kinds list, ignoring unknown entries.
fn parse_capabilities(joined: &str) -> Vec<DeviceKind> {
    joined
        .split(',')
        .filter_map(|s| DeviceKind::parse(s.trim()))
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
