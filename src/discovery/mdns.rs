//! mDNS service advertisement and lookup
//!
//! Service type: `_capture-sync._tcp.local.`
//! Instance name: `capture-sync-{hostname}`
//!
//! The advertised port is the TCP control port. TXT records:
//! - `version`: Controller version
//! - `control_port`: TCP control channel
//! - `telemetry_port`: UDP telemetry channel
//! - `api_port`: HTTP operator API

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::Mutex;

use crate::{Error, Result};

/// mDNS service type for the capture controller
pub const SERVICE_TYPE: &str = "_capture-sync._tcp.local.";

/// Ports a controller advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisedPorts {
    pub control: u16,
    pub telemetry: u16,
    pub api: u16,
}

/// Announces this controller on the local network
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    /// Full service name while advertising
    advertised: Mutex<Option<String>>,
}

/// `capture-sync-<hostname>`, falling back when the hostname is unreadable
fn instance_name() -> (String, String) {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "capture".to_string());
    (format!("capture-sync-{host}"), format!("{host}.local."))
}

impl MdnsAdvertiser {
    /// # Errors
    ///
    /// Returns `Error::Discovery` if the mDNS responder cannot start
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| Error::Discovery(format!("mDNS responder unavailable: {e}")))?;
        Ok(Self {
            daemon,
            advertised: Mutex::new(None),
        })
    }

    /// Advertise the control port with every port in the TXT record
    ///
    /// Advertising again replaces the previous announcement.
    ///
    /// # Errors
    ///
    /// Returns `Error::Discovery` if the announcement is rejected
    pub async fn start(&self, ports: AdvertisedPorts) -> Result<()> {
        let (instance, host) = instance_name();
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &instance,
            &host,
            "",
            ports.control,
            txt_properties(ports),
        )
        .map_err(|e| Error::Discovery(format!("invalid service record for {instance}: {e}")))?
        .enable_addr_auto();
        let fullname = info.get_fullname().to_string();

        let mut advertised = self.advertised.lock().await;
        if let Some(previous) = advertised.take() {
            self.withdraw(&previous);
        }
        self.daemon
            .register(info)
            .map_err(|e| Error::Discovery(format!("mDNS announcement failed: {e}")))?;
        *advertised = Some(fullname);

        tracing::info!(
            instance = %instance,
            control_port = ports.control,
            telemetry_port = ports.telemetry,
            api_port = ports.api,
            "advertising controller over mDNS"
        );
        Ok(())
    }

    /// Withdraw the announcement, if any
    pub async fn stop(&self) {
        if let Some(fullname) = self.advertised.lock().await.take() {
            self.withdraw(&fullname);
        }
    }

    pub async fn is_advertising(&self) -> bool {
        self.advertised.lock().await.is_some()
    }

    fn withdraw(&self, fullname: &str) {
        match self.daemon.unregister(fullname) {
            Ok(_) => tracing::info!(service = %fullname, "mDNS announcement withdrawn"),
            Err(e) => tracing::warn!(service = %fullname, error = %e, "mDNS withdrawal failed"),
        }
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        if let Some(fullname) = self.advertised.get_mut().take() {
            let _ = self.daemon.unregister(&fullname);
        }
        // the responder thread may already be gone at process exit
        let _ = self.daemon.shutdown();
    }
}

fn txt_properties(ports: AdvertisedPorts) -> HashMap<String, String> {
    HashMap::from([
        ("version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
        ("control_port".to_string(), ports.control.to_string()),
        ("telemetry_port".to_string(), ports.telemetry.to_string()),
        ("api_port".to_string(), ports.api.to_string()),
    ])
}

/// A controller found on the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerEndpoint {
    pub control: SocketAddr,
    pub telemetry: SocketAddr,
    pub version: Option<String>,
}

impl ControllerEndpoint {
    fn resolve(address: IpAddr, port: u16, txt: &HashMap<String, String>) -> Self {
        let telemetry_port = txt
            .get("telemetry_port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(crate::config::DEFAULT_TELEMETRY_PORT);
        Self {
            control: SocketAddr::new(address, port),
            telemetry: SocketAddr::new(address, telemetry_port),
            version: txt.get("version").cloned(),
        }
    }
}

/// Browse for a controller, giving up after `timeout`
///
/// # Errors
///
/// Returns error if the mDNS daemon cannot be started
pub async fn browse(timeout: Duration) -> Result<Option<ControllerEndpoint>> {
    let daemon = ServiceDaemon::new()
        .map_err(|e| Error::Discovery(format!("failed to create mDNS daemon: {e}")))?;
    let receiver = daemon
        .browse(SERVICE_TYPE)
        .map_err(|e| Error::Discovery(format!("failed to browse: {e}")))?;

    let deadline = tokio::time::Instant::now() + timeout;
    let found = loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, receiver.recv_async()).await {
            Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                let Some(address) = info.get_addresses().iter().find(|a| a.is_ipv4()).copied() else {
                    continue;
                };
                let txt: HashMap<String, String> = info
                    .get_properties()
                    .iter()
                    .map(|p| (p.key().to_string(), p.val_str().to_string()))
                    .collect();
                let endpoint = ControllerEndpoint::resolve(address, info.get_port(), &txt);
                tracing::info!(control = %endpoint.control, telemetry = %endpoint.telemetry, "controller discovered");
                break Some(endpoint);
            }
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break None,
        }
    };

    if let Err(e) = daemon.shutdown() {
        tracing::trace!(error = %e, "mDNS daemon shutdown error");
    }
    Ok(found)
}
