//! Protocol constants shared by discovery, sessions and the push listener.

use std::net::Ipv4Addr;
use std::time::Duration;

/// Multicast group used for `whois` discovery and hub reports.
pub const MULTICAST_ADDRESS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 50);

/// Port the hubs multicast `report`/`heartbeat` frames to.
pub const MULTICAST_PORT: u16 = 9898;

/// Port the hubs listen on for `whois`.
pub const GATEWAY_DISCOVERY_PORT: u16 = 4321;

/// Default unicast command port of a hub.
pub const DEFAULT_GATEWAY_PORT: u16 = 9898;

/// Receive buffer for a single datagram.
pub const SOCKET_BUFSIZE: usize = 4096;

/// Wall-clock window for collecting `iam` replies.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Time a session waits for a correlated reply before retrying.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// A sub-device that stays silent this long is reported unavailable.
pub const TIME_TILL_UNAVAILABLE: Duration = Duration::from_secs(150 * 60);

/// Hub models that answer `whois` and own a device list.
pub const GATEWAY_MODELS: &[&str] = &["gateway", "gateway.v3", "acpartner.v3"];

/// Error string a hub returns when a write was signed with a stale token.
pub const INVALID_KEY_ERROR: &str = "Invalid key";
