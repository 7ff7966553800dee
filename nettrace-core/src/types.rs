//! Common types used throughout nettrace

use std::fmt;
use std::str::FromStr;

/// Link-layer type of a source's payload (pcap LINKTYPE_* value)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkType(pub u32);

impl LinkType {
    /// IEEE 802.3 Ethernet
    pub const ETHERNET: LinkType = LinkType(1);
    /// Raw IPv4/IPv6, no link-layer header
    pub const RAW: LinkType = LinkType(101);
    /// Linux "cooked" capture
    pub const LINUX_SLL: LinkType = LinkType(113);
    /// Synthetic trace events (LINKTYPE_USER0)
    pub const TRACEPOINT: LinkType = LinkType(147);

    /// Numeric value as written to the container
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Whether records of this type are instrumentation events rather than packets
    pub const fn is_tracepoint(self) -> bool {
        self.0 == Self::TRACEPOINT.0
    }

    /// Short name for well-known values
    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::ETHERNET => Some("EN10MB"),
            Self::RAW => Some("RAW"),
            Self::LINUX_SLL => Some("LINUX_SLL"),
            Self::TRACEPOINT => Some("TRACEPOINT"),
            _ => None,
        }
    }
}

impl Default for LinkType {
    fn default() -> Self {
        Self::ETHERNET
    }
}

impl From<u32> for LinkType {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

impl FromStr for LinkType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EN10MB" | "ETHERNET" => Ok(Self::ETHERNET),
            "RAW" => Ok(Self::RAW),
            "LINUX_SLL" => Ok(Self::LINUX_SLL),
            "TRACEPOINT" => Ok(Self::TRACEPOINT),
            other => other.parse::<u32>().map(LinkType).map_err(|_| {
                crate::Error::invalid_config("link_type", format!("unknown link type '{}'", s))
            }),
        }
    }
}
