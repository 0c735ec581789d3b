//! Host identification for the delivery source and the relay client id
//!
//! This module handles:
//! - Primary MAC address detection with priority (Ethernet > WiFi > Other)
//! - Primary IP address for the metrics source
//! - Stable client id derivation (MAC first, hostname-based UUID as fallback)

use anyhow::{Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Network interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: Option<String>,
    pub ip: String,
    #[serde(rename = "type")]
    pub interface_type: InterfaceType,
}

/// Interface type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Loopback,
    Other,
}

/// What the agent knows about the machine it runs on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostIdentity {
    pub hostname: String,
    pub primary_mac: Option<String>,
    pub primary_ip: Option<String>,
    pub interfaces: Vec<NetworkInterface>,
}

impl HostIdentity {
    /// Discover hostname and network interfaces.
    ///
    /// Interface enumeration failing is not fatal: the identity then falls back
    /// to the hostname alone.
    pub fn discover() -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();

        let interfaces = match Self::enumerate_interfaces() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!("Interface discovery failed, using hostname only: {:#}", e);
                Vec::new()
            }
        };

        let primary = Self::select_primary(&interfaces);
        let identity = HostIdentity {
            hostname,
            primary_mac: primary.and_then(|i| i.mac.clone()),
            primary_ip: primary.map(|i| i.ip.clone()),
            interfaces,
        };

        info!(
            "Host discovery complete - hostname: {}, primary MAC: {:?}, primary IP: {:?}",
            identity.hostname, identity.primary_mac, identity.primary_ip
        );
        identity
    }

    /// Candidate relay id: MAC without colons, else a name-based UUID of the hostname.
    ///
    /// Depends on the current primary interface; the agent persists the first
    /// value through `RegistrationStore::resolve_client_id`.
    pub fn client_id(&self) -> String {
        match &self.primary_mac {
            Some(mac) => mac.replace(':', ""),
            None => Uuid::new_v5(&Uuid::NAMESPACE_DNS, self.hostname.as_bytes()).to_string(),
        }
    }

    fn enumerate_interfaces() -> Result<Vec<NetworkInterface>> {
        debug!("Enumerating network interfaces...");

        let if_addrs = get_if_addrs().context("Failed to enumerate network interfaces")?;

        let mut interfaces = Vec::new();
        for if_addr in if_addrs {
            if if_addr.is_loopback() {
                continue;
            }

            let ip = match if_addr.addr {
                IfAddr::V4(v4) => v4.ip.to_string(),
                IfAddr::V6(v6) => v6.ip.to_string(),
            };

            let mac = match mac_address::mac_address_by_name(&if_addr.name) {
                Ok(Some(mac)) => Some(format_mac(&mac.bytes())),
                Ok(None) => None,
                Err(e) => {
                    debug!("Error getting MAC for {}: {}", if_addr.name, e);
                    None
                }
            };

            let interface = NetworkInterface {
                interface_type: classify_interface(&if_addr.name),
                name: if_addr.name,
                mac,
                ip,
            };
            debug!("Found interface: {} ({:?})", interface.name, interface.mac);
            interfaces.push(interface);
        }

        Ok(interfaces)
    }

    /// Ethernet first, then wireless, then anything; IPv4 preferred within a class
    fn select_primary(interfaces: &[NetworkInterface]) -> Option<&NetworkInterface> {
        for wanted in [InterfaceType::Ethernet, InterfaceType::Wireless, InterfaceType::Other] {
            let mut candidates = interfaces
                .iter()
                .filter(|i| i.interface_type == wanted && i.mac.is_some());
            let first = candidates.clone().next();
            if let Some(v4) = candidates.find(|i| !i.ip.contains(':')) {
                return Some(v4);
            }
            if first.is_some() {
                return first;
            }
        }
        interfaces.first()
    }
}

fn format_mac(bytes: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}

/// Classify interface type based on name patterns
fn classify_interface(name: &str) -> InterfaceType {
    let name_lower = name.to_lowercase();

    if name_lower == "lo" || name_lower.starts_with("lo0") || name_lower.starts_with("loopback") {
        return InterfaceType::Loopback;
    }

    if name_lower.contains("wlan")
        || name_lower.contains("wifi")
        || name_lower.starts_with("wlp")
        || name_lower.starts_with("wlo")
    {
        return InterfaceType::Wireless;
    }

    if name_lower.starts_with("eth") || name_lower.starts_with("en") {
        return InterfaceType::Ethernet;
    }

    InterfaceType::Other
}
