use std::fmt;
use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::protocol::STATE_OPEN;

/// Kind of an `<address>` entry on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Ipv4,
    Ipv6,
    Mac,
}

impl AddressKind {
    /// Parse the scanner's `addrtype` attribute. Unknown kinds yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ipv4" => Some(Self::Ipv4),
            "ipv6" => Some(Self::Ipv6),
            "mac" => Some(Self::Mac),
            _ => None,
        }
    }

    pub fn is_ip(self) -> bool {
        matches!(self, Self::Ipv4 | Self::Ipv6)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub addr: String,
    pub kind: AddressKind,
}

/// One `<osmatch>` guess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsMatch {
    pub name: String,
    pub accuracy: Option<u8>,
}

/// One `<osclass>` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsClass {
    pub class_type: Option<String>,
    pub vendor: Option<String>,
    pub accuracy: Option<u8>,
}

/// A single `<port>` of a scanned host, with its nested state and service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub port: u16,
    pub protocol: String,
    pub state: Option<String>,
    pub name: Option<String>,
    pub tunnel: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
}

impl ServiceRecord {
    pub fn is_open(&self) -> bool {
        self.state.as_deref() == Some(STATE_OPEN)
    }

    /// Service name prefixed with the tunnel label, e.g. `ssl/http`.
    pub fn name_with_tunnel(&self) -> Option<String> {
        let name = self.name.as_deref()?;
        match self.tunnel.as_deref() {
            Some(tunnel) if !tunnel.is_empty() => Some(format!("{tunnel}/{name}")),
            _ => Some(name.to_string()),
        }
    }

    /// Product, followed by the version when both are known.
    pub fn info(&self) -> Option<String> {
        let product = self.product.as_deref()?;
        match self.version.as_deref() {
            Some(version) if !version.is_empty() => Some(format!("{product} {version}")),
            _ => Some(product.to_string()),
        }
    }
}

impl fmt::Display for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.port)?;
        if let Some(name) = self.name_with_tunnel() {
            write!(f, " ({name})")?;
        }
        Ok(())
    }
}

/// A decoded `<host>` element.
///
/// Lists keep document order; the first IP address, first OS match and
/// first OS class are the authoritative ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub status: Option<String>,
    pub addresses: Vec<Address>,
    pub hostnames: Vec<String>,
    pub services: Vec<ServiceRecord>,
    pub os_matches: Vec<OsMatch>,
    pub os_classes: Vec<OsClass>,
}

impl ScanRecord {
    pub fn has_open_services(&self) -> bool {
        self.services.iter().any(ServiceRecord::is_open)
    }

    pub fn open_services(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.services.iter().filter(|s| s.is_open())
    }

    /// All IPv4/IPv6 entries that parse as addresses, in document order.
    pub fn ip_addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.addresses
            .iter()
            .filter(|a| a.kind.is_ip())
            .filter_map(|a| a.addr.parse().ok())
    }

    /// First IP address in document order; the host's identity key.
    pub fn preferred_address(&self) -> Option<IpAddr> {
        self.ip_addresses().next()
    }

    /// First well-formed MAC address, normalised to lower-case colon form.
    pub fn first_mac(&self) -> Option<String> {
        self.addresses
            .iter()
            .filter(|a| a.kind == AddressKind::Mac)
            .find_map(|a| normalize_mac(&a.addr))
    }

    pub fn os_name(&self) -> Option<&str> {
        self.os_matches.first().map(|m| m.name.as_str())
    }

    pub fn purpose(&self) -> Option<&str> {
        self.os_classes.first().and_then(|c| c.class_type.as_deref())
    }
}

impl fmt::Display for ScanRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = self.preferred_address() {
            return write!(f, "{ip}");
        }
        match self.hostnames.first() {
            Some(name) => f.write_str(name),
            None => f.write_str("<unknown>"),
        }
    }
}

/// Accepts six hex octets separated by `:` or `-`.
fn normalize_mac(raw: &str) -> Option<String> {
    let octets: Vec<&str> = raw.split(|c: char| c == ':' || c == '-').collect();
    if octets.len() != 6 || !octets.iter().all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit())) {
        return None;
    }
    Some(octets.join(":").to_ascii_lowercase())
}

/// A stored host row, unique per (workspace_id, address).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedHost {
    pub id: i64,
    pub workspace_id: i64,
    pub address: String,
    pub mac: Option<String>,
    /// Comma-joined, lower-cased, sorted hostname set.
    pub name: Option<String>,
    pub state: String,
    pub os_name: String,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored service row, unique per (host_id, proto, port).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedService {
    pub id: i64,
    pub host_id: i64,
    pub port: u16,
    pub proto: String,
    pub state: String,
    pub name: Option<String>,
    pub info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(port: u16, state: &str) -> ServiceRecord {
        ServiceRecord {
            port,
            protocol: "tcp".to_string(),
            state: Some(state.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_preferred_address_skips_mac_and_garbage() {
        let record = ScanRecord {
            addresses: vec![
                Address { addr: "00:11:22:33:44:55".into(), kind: AddressKind::Mac },
                Address { addr: "not-an-ip".into(), kind: AddressKind::Ipv4 },
                Address { addr: "fe80::0001".into(), kind: AddressKind::Ipv6 },
                Address { addr: "10.0.0.1".into(), kind: AddressKind::Ipv4 },
            ],
            ..Default::default()
        };

        assert_eq!(record.preferred_address().unwrap().to_string(), "fe80::1");
        assert_eq!(record.to_string(), "fe80::1");
    }

    #[test]
    fn test_first_mac_normalized() {
        let record = ScanRecord {
            addresses: vec![
                Address { addr: "bogus".into(), kind: AddressKind::Mac },
                Address { addr: "AA-BB-CC-00-11-22".into(), kind: AddressKind::Mac },
            ],
            ..Default::default()
        };

        assert_eq!(record.first_mac().as_deref(), Some("aa:bb:cc:00:11:22"));
    }

    #[test]
    fn test_display_falls_back_to_hostname() {
        let mut record = ScanRecord::default();
        assert_eq!(record.to_string(), "<unknown>");

        record.hostnames.push("printer.lan".into());
        assert_eq!(record.to_string(), "printer.lan");
    }

    #[test]
    fn test_open_services_filter() {
        let record = ScanRecord {
            services: vec![service(22, "open"), service(23, "closed"), service(80, "open")],
            ..Default::default()
        };

        assert!(record.has_open_services());
        let ports: Vec<u16> = record.open_services().map(|s| s.port).collect();
        assert_eq!(ports, vec![22, 80]);
    }

    #[test]
    fn test_service_name_and_info() {
        let mut svc = service(443, "open");
        assert_eq!(svc.name_with_tunnel(), None);
        assert_eq!(svc.info(), None);

        svc.name = Some("http".into());
        svc.tunnel = Some("ssl".into());
        svc.version = Some("2.4".into());
        assert_eq!(svc.name_with_tunnel().as_deref(), Some("ssl/http"));
        // version alone carries no info
        assert_eq!(svc.info(), None);

        svc.product = Some("Apache httpd".into());
        assert_eq!(svc.info().as_deref(), Some("Apache httpd 2.4"));
        assert_eq!(svc.to_string(), "tcp:443 (ssl/http)");
    }
}
