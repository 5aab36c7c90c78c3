//! Public types for gateway sessions.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use aqara_protocol::{Frame, Payload, ProtoVersion};

use crate::GatewayError;

/// Network interface the sockets are bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interface {
    /// Let the OS pick (`0.0.0.0`).
    #[default]
    Any,
    /// A specific local IPv4 address.
    Addr(Ipv4Addr),
}

impl Interface {
    /// Resolves a selector: `"any"`, an IPv4 literal, or an interface name.
    pub fn resolve(selector: &str) -> Result<Self, GatewayError> {
        let selector = selector.trim();
        if selector.is_empty() || selector.eq_ignore_ascii_case("any") {
            return Ok(Interface::Any);
        }
        if let Ok(ip) = selector.parse::<Ipv4Addr>() {
            return Ok(Interface::Addr(ip));
        }

        let interfaces = if_addrs::get_if_addrs()
            .map_err(|e| GatewayError::Interface(format!("cannot list interfaces: {e}")))?;
        interfaces
            .iter()
            .filter(|iface| iface.name == selector)
            .find_map(|iface| match iface.ip() {
                IpAddr::V4(v4) => Some(Interface::Addr(v4)),
                IpAddr::V6(_) => None,
            })
            .ok_or_else(|| {
                GatewayError::Interface(format!("no IPv4 address on interface {selector}"))
            })
    }

    /// Local address to bind and join multicast on.
    pub fn ipv4(&self) -> Ipv4Addr {
        match self {
            Interface::Any => Ipv4Addr::UNSPECIFIED,
            Interface::Addr(ip) => *ip,
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interface::Any => write!(f, "any"),
            Interface::Addr(ip) => write!(f, "{ip}"),
        }
    }
}

/// Token lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No token received from the hub yet.
    Uninitialized,
    /// A token is cached and can sign the next write.
    TokenKnown,
    /// A signed write is awaiting its acknowledgement.
    WritePending,
}

/// A sub-device enumerated from a hub's device list.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub sid: String,
    pub model: String,
    pub short_id: u64,
    pub proto: ProtoVersion,
    pub data: Payload,
    pub raw: Frame,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_any() {
        assert_eq!(Interface::resolve("any").unwrap(), Interface::Any);
        assert_eq!(Interface::resolve("ANY").unwrap(), Interface::Any);
        assert_eq!(Interface::resolve("").unwrap(), Interface::Any);
    }

    #[test]
    fn resolve_literal() {
        assert_eq!(
            Interface::resolve("192.168.1.20").unwrap(),
            Interface::Addr(Ipv4Addr::new(192, 168, 1, 20))
        );
    }

    #[test]
    fn resolve_unknown_name() {
        assert!(matches!(
            Interface::resolve("definitely-not-a-nic0"),
            Err(GatewayError::Interface(_))
        ));
    }

    #[test]
    fn interface_display() {
        assert_eq!(Interface::Any.to_string(), "any");
        assert_eq!(
            Interface::Addr(Ipv4Addr::new(10, 0, 0, 2)).to_string(),
            "10.0.0.2"
        );
        assert_eq!(Interface::Any.ipv4(), Ipv4Addr::UNSPECIFIED);
    }
}
