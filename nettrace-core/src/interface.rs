//! Interface identity types

use crate::LinkType;
use std::fmt;

/// Reference to a network interface on a node of the topology
///
/// Displayed as `"<node>/<interface>"`, which is also the name recorded in
/// the trace container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceRef {
    /// Node (namespace) owning the interface
    pub node: String,
    /// Interface name inside the node (e.g., "veth0")
    pub name: String,
}

impl InterfaceRef {
    /// Create a new interface reference
    pub fn new<N: Into<String>, I: Into<String>>(node: N, name: I) -> Self {
        Self {
            node: node.into(),
            name: name.into(),
        }
    }

    /// Name recorded in the trace container
    pub fn qualified_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for InterfaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.name)
    }
}

/// Registration of an interface in a capture session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    /// Index assigned in registration order, starting at 0
    pub index: u32,
    /// Qualified interface name
    pub name: String,
    /// Link-layer type of the payloads
    pub link_type: LinkType,
    /// Maximum number of bytes captured per record
    pub snapshot_length: u32,
}
