//! Live listener address syntax: `[tcp|tcp4|tcp6|unix:]address`

use nettrace_core::{Error, Result};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Network kind used when the address carries no prefix
pub const DEFAULT_NETWORK: &str = "tcp";

/// Parsed listener address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// Stream socket on any address family, `host:port`
    Tcp(String),
    /// Stream socket restricted to IPv4
    Tcp4(String),
    /// Stream socket restricted to IPv6
    Tcp6(String),
    /// Unix domain stream socket at a filesystem path
    Unix(PathBuf),
}

impl ListenAddress {
    /// Network kind as written in the address prefix
    pub fn network(&self) -> &'static str {
        match self {
            ListenAddress::Tcp(_) => "tcp",
            ListenAddress::Tcp4(_) => "tcp4",
            ListenAddress::Tcp6(_) => "tcp6",
            ListenAddress::Unix(_) => "unix",
        }
    }
}

impl FromStr for ListenAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidAddress("empty listener address".to_string()));
        }

        let (network, address) = match s.split_once(':') {
            // "unix:/path" always names a kind; "word:host:port" does when the
            // remainder still carries a port, otherwise "host:port" is plain tcp
            Some((kind, rest))
                if kind == "unix"
                    || (!kind.is_empty()
                        && kind.chars().all(|c| c.is_ascii_alphanumeric())
                        && !kind.chars().all(|c| c.is_ascii_digit())
                        && rest.contains(':')) =>
            {
                (kind, rest)
            }
            _ => (DEFAULT_NETWORK, s),
        };

        if address.is_empty() {
            return Err(Error::InvalidAddress(format!("'{}' has no address", s)));
        }

        match network {
            "tcp" => Ok(ListenAddress::Tcp(address.to_string())),
            "tcp4" => Ok(ListenAddress::Tcp4(address.to_string())),
            "tcp6" => Ok(ListenAddress::Tcp6(address.to_string())),
            "unix" => Ok(ListenAddress::Unix(PathBuf::from(address))),
            other => Err(Error::InvalidAddress(format!(
                "unsupported network '{}' in '{}'",
                other, s
            ))),
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddress::Tcp(addr) | ListenAddress::Tcp4(addr) | ListenAddress::Tcp6(addr) => {
                write!(f, "{}:{}", self.network(), addr)
            }
            ListenAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_network_is_tcp() {
        assert_eq!(
            "127.0.0.1:5000".parse::<ListenAddress>().unwrap(),
            ListenAddress::Tcp("127.0.0.1:5000".into())
        );
        assert_eq!(
            "localhost:5000".parse::<ListenAddress>().unwrap(),
            ListenAddress::Tcp("localhost:5000".into())
        );
        assert_eq!(
            "[::1]:5000".parse::<ListenAddress>().unwrap(),
            ListenAddress::Tcp("[::1]:5000".into())
        );
    }

    #[test]
    fn test_explicit_networks() {
        assert_eq!(
            "tcp:0.0.0.0:7000".parse::<ListenAddress>().unwrap(),
            ListenAddress::Tcp("0.0.0.0:7000".into())
        );
        assert_eq!(
            "tcp4:localhost:7000".parse::<ListenAddress>().unwrap(),
            ListenAddress::Tcp4("localhost:7000".into())
        );
        assert_eq!(
            "tcp6:[::]:7000".parse::<ListenAddress>().unwrap(),
            ListenAddress::Tcp6("[::]:7000".into())
        );
        assert_eq!(
            "unix:/run/nettrace.sock".parse::<ListenAddress>().unwrap(),
            ListenAddress::Unix("/run/nettrace.sock".into())
        );
    }

    #[test]
    fn test_invalid_addresses() {
        assert!("".parse::<ListenAddress>().is_err());
        assert!("unix:".parse::<ListenAddress>().is_err());
        assert!(matches!(
            "udp:127.0.0.1:53".parse::<ListenAddress>(),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_display() {
        let addr: ListenAddress = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(addr.to_string(), "tcp:127.0.0.1:5000");
        let addr: ListenAddress = "unix:/tmp/a.sock".parse().unwrap();
        assert_eq!(addr.to_string(), "unix:/tmp/a.sock");
    }
}
