//! Network interface enumeration and information

use nettrace_core::{Error, Result};
use pnet_datalink::{self, NetworkInterface};
use std::net::IpAddr;

/// Information about a network interface in the current namespace
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    /// Interface name (e.g., "veth0")
    pub name: String,
    /// Kernel interface index
    pub index: u32,
    /// MAC address if available
    pub mac: Option<String>,
    /// List of IP addresses assigned to this interface
    pub ips: Vec<IpAddr>,
    /// Whether the interface is up
    pub is_up: bool,
    /// Whether the interface is a loopback
    pub is_loopback: bool,
}

impl From<&NetworkInterface> for InterfaceInfo {
    fn from(iface: &NetworkInterface) -> Self {
        InterfaceInfo {
            name: iface.name.clone(),
            index: iface.index,
            mac: iface.mac.map(|mac| mac.to_string()),
            ips: iface.ips.iter().map(|network| network.ip()).collect(),
            is_up: iface.is_up(),
            is_loopback: iface.is_loopback(),
        }
    }
}

/// List all network interfaces
pub fn list_interfaces() -> Vec<InterfaceInfo> {
    pnet_datalink::interfaces()
        .iter()
        .map(InterfaceInfo::from)
        .collect()
}

/// Get information about a specific interface by name
pub fn get_interface(name: &str) -> Result<InterfaceInfo> {
    pnet_datalink::interfaces()
        .iter()
        .find(|iface| iface.name == name)
        .map(InterfaceInfo::from)
        .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))
}

/// List the names of all interfaces except loopback
///
/// Used to capture "all interfaces of a node".
pub fn capture_interface_names() -> Vec<String> {
    list_interfaces()
        .into_iter()
        .filter(|iface| !iface.is_loopback)
        .map(|iface| iface.name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_interfaces() {
        // Every namespace has at least a loopback device
        let interfaces = list_interfaces();
        assert!(interfaces.iter().any(|iface| iface.is_loopback));
    }

    #[test]
    fn test_get_nonexistent_interface() {
        match get_interface("nonexistent_iface_xyz") {
            Err(Error::InterfaceNotFound(name)) => assert_eq!(name, "nonexistent_iface_xyz"),
            other => panic!("Expected InterfaceNotFound error, got {:?}", other),
        }
    }

    #[test]
    fn test_capture_names_exclude_loopback() {
        let loopbacks: Vec<String> = list_interfaces()
            .into_iter()
            .filter(|iface| iface.is_loopback)
            .map(|iface| iface.name)
            .collect();

        for name in capture_interface_names() {
            assert!(!loopbacks.contains(&name));
        }
    }
}
