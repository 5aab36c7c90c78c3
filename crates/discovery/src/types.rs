use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;

use aqara_protocol::constants::DEFAULT_GATEWAY_PORT;
use aqara_protocol::normalize_sid;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::DiscoveryError;

/// Length of a hub control key.
pub const KEY_LEN: usize = 16;

/// A statically configured hub.
///
/// Every field is optional: an entry may only carry a key for a hub that
/// is found by `whois`, or pin a hub to a fixed host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Hub serial id / MAC, with or without `:` separators.
    #[serde(default, alias = "sid", skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub disable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub miio_token: Option<String>,
    /// Pins the LAN protocol version instead of probing the hub.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
}

impl GatewayConfig {
    /// Normalized sid, if declared.
    pub fn sid(&self) -> Option<String> {
        self.mac.as_deref().map(normalize_sid)
    }
}

/// Validates and normalizes the configured hubs.
///
/// Rejects sid-less entries when more than one hub is declared, duplicate
/// sids and keys that are not 16 characters. Sids are normalized, `port`
/// defaults to 9898 when a host is set and is dropped otherwise.
pub fn validate(configs: &[GatewayConfig]) -> Result<Vec<GatewayConfig>, DiscoveryError> {
    if configs.len() > 1 && configs.iter().any(|c| c.mac.is_none()) {
        return Err(DiscoveryError::Config(
            "mac is required when more than one gateway is configured".into(),
        ));
    }

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(configs.len());

    for config in configs {
        let mut entry = config.clone();
        entry.mac = config.sid();

        if let Some(sid) = &entry.mac {
            if !seen.insert(sid.clone()) {
                return Err(DiscoveryError::Config(format!("duplicate gateway mac {sid}")));
            }
        }

        match &entry.key {
            Some(key) if key.len() != KEY_LEN => {
                return Err(DiscoveryError::Config(format!(
                    "gateway key must be {KEY_LEN} characters, got {}",
                    key.len()
                )));
            }
            Some(_) => {}
            None => warn!(
                mac = ?entry.mac,
                "gateway key is not provided, the gateway will be read-only"
            ),
        }

        entry.port = match entry.host {
            Some(_) => Some(entry.port.unwrap_or(DEFAULT_GATEWAY_PORT)),
            None => None,
        };

        out.push(entry);
    }

    Ok(out)
}

/// A hub found or skipped during discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub event_type: EventType,
    pub ip: Ipv4Addr,
    pub sid: String,
}

/// Type of discovery event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Configured,
    Discovered,
    Disabled,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Configured => write!(f, "configured"),
            EventType::Discovered => write!(f, "discovered"),
            EventType::Disabled => write!(f, "disabled"),
        }
    }
}
