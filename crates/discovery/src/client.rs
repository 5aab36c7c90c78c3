use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use aqara_gateway::{Gateway, GatewayParams, GatewayTable, Interface};
use aqara_protocol::constants::{
    DEFAULT_GATEWAY_PORT, GATEWAY_DISCOVERY_PORT, MULTICAST_ADDRESS, SOCKET_BUFSIZE,
};
use aqara_protocol::{Frame, is_gateway_model, normalize_sid};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::DiscoveryError;
use crate::types::{DiscoveryEvent, EventType, GatewayConfig, validate};

const WHOIS: &[u8] = br#"{"cmd":"whois"}"#;

/// Finds hubs from static config and by `whois` on the multicast group.
///
/// Sessions are accumulated in a shared [`GatewayTable`]; calling
/// [`discover`](Self::discover) again only adds hubs not yet known.
pub struct GatewayDiscovery {
    configs: Vec<GatewayConfig>,
    interface: Interface,
    table: GatewayTable,
    disabled: Mutex<HashSet<Ipv4Addr>>,
    whois_target: SocketAddr,
    command_timeout: Option<Duration>,
    events_tx: mpsc::Sender<DiscoveryEvent>,
    events_rx: Option<mpsc::Receiver<DiscoveryEvent>>,
}

impl GatewayDiscovery {
    /// Validates `configs` before any network activity.
    pub fn new(
        configs: &[GatewayConfig],
        interface: Interface,
        table: GatewayTable,
    ) -> Result<Self, DiscoveryError> {
        let configs = validate(configs)?;
        let (tx, rx) = mpsc::channel(16);
        Ok(Self {
            configs,
            interface,
            table,
            disabled: Mutex::new(HashSet::new()),
            whois_target: SocketAddr::V4(SocketAddrV4::new(
                MULTICAST_ADDRESS,
                GATEWAY_DISCOVERY_PORT,
            )),
            command_timeout: None,
            events_tx: tx,
            events_rx: Some(rx),
        })
    }

    /// Redirects the `whois` request, e.g. to a loopback hub.
    pub fn set_whois_target(&mut self, target: SocketAddr) {
        self.whois_target = target;
    }

    /// Overrides the per-command timeout of created sessions.
    pub fn set_command_timeout(&mut self, timeout: Duration) {
        self.command_timeout = Some(timeout);
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<DiscoveryEvent>> {
        self.events_rx.take()
    }

    pub fn table(&self) -> &GatewayTable {
        &self.table
    }

    pub fn configs(&self) -> &[GatewayConfig] {
        &self.configs
    }

    /// IPs skipped because their config entry is disabled.
    pub fn disabled(&self) -> Vec<Ipv4Addr> {
        self.disabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Runs one discovery round. Returns how many hubs were added.
    pub async fn discover(&self, timeout: Duration) -> Result<usize, DiscoveryError> {
        let mut added = 0;

        for config in &self.configs {
            let (Some(host), Some(port), Some(sid)) = (&config.host, config.port, config.sid())
            else {
                continue;
            };

            let ip = match resolve(host, port).await {
                Ok(ip) => ip,
                Err(e) => {
                    error!("{e}");
                    continue;
                }
            };

            if config.disable {
                info!(%sid, "gateway is disabled by configuration");
                self.mark_disabled(ip, &sid);
                continue;
            }
            if self.table.contains(ip) {
                continue;
            }

            info!(%sid, %ip, port, "gateway configured");
            if self.add_session(ip, port, &sid, config, None).await {
                self.emit(EventType::Configured, ip, &sid);
                added += 1;
            }
        }

        // Dropped on every return path below.
        let socket = UdpSocket::bind(SocketAddrV4::new(self.interface.ipv4(), 0)).await?;
        socket.send_to(WHOIS, self.whois_target).await?;
        debug!(target = %self.whois_target, "whois sent");

        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; SOCKET_BUFSIZE];

        loop {
            let (n, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await
            {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    debug!("discovery receive error: {e}");
                    continue;
                }
                Err(_) => break,
            };

            let IpAddr::V4(ip) = from.ip() else {
                continue;
            };
            if self.table.contains(ip) || self.is_disabled(ip) {
                continue;
            }

            if self.handle_iam(&buf[..n], ip).await {
                added += 1;
            }
        }

        Ok(added)
    }

    /// Handles one `whois` response. Returns `true` if a session was added.
    async fn handle_iam(&self, bytes: &[u8], ip: Ipv4Addr) -> bool {
        let frame = match Frame::parse(bytes) {
            Ok(f) => f,
            Err(e) => {
                error!(%ip, "cannot parse discovery response: {e}");
                return false;
            }
        };
        if frame.cmd != "iam" {
            error!(%ip, cmd = %frame.cmd, "response does not match return cmd");
            return false;
        }
        if !frame.model.as_deref().is_some_and(is_gateway_model) {
            error!(%ip, model = ?frame.model, "response must be gateway model");
            return false;
        }
        let Some(sid) = frame.sid.as_deref().map(normalize_sid) else {
            error!(%ip, "iam without sid");
            return false;
        };

        let config = self.config_for(&sid);
        if config.is_some_and(|c| c.disable && c.sid().as_deref() == Some(sid.as_str())) {
            info!(%sid, "gateway is disabled by configuration");
            self.mark_disabled(ip, &sid);
            return false;
        }

        let port = frame.port.unwrap_or(DEFAULT_GATEWAY_PORT);
        info!(%sid, %ip, port, "gateway found");
        let fallback = GatewayConfig::default();
        let config = config.unwrap_or(&fallback);
        if self
            .add_session(ip, port, &sid, config, frame.proto_version.clone())
            .await
        {
            self.emit(EventType::Discovered, ip, &sid);
            true
        } else {
            false
        }
    }

    /// Entry whose sid matches, else the sole entry without a sid.
    fn config_for(&self, sid: &str) -> Option<&GatewayConfig> {
        self.configs
            .iter()
            .find(|c| c.sid().as_deref() == Some(sid))
            .or_else(|| self.configs.iter().find(|c| c.mac.is_none()))
    }

    async fn add_session(
        &self,
        ip: Ipv4Addr,
        port: u16,
        sid: &str,
        config: &GatewayConfig,
        proto: Option<String>,
    ) -> bool {
        let mut params = GatewayParams::new(ip, port, sid);
        params.key = config.key.clone();
        params.aux_token = config.miio_token.clone();
        params.proto = proto.or_else(|| config.proto.clone());
        params.interface = self.interface;
        if let Some(timeout) = self.command_timeout {
            params.timeout = timeout;
        }

        match Gateway::connect(params).await {
            Ok(gateway) => self.table.insert(gateway),
            Err(e) => {
                error!(%sid, %ip, "cannot open gateway session: {e}");
                false
            }
        }
    }

    fn mark_disabled(&self, ip: Ipv4Addr, sid: &str) {
        let inserted = self
            .disabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ip);
        if inserted {
            self.emit(EventType::Disabled, ip, sid);
        }
    }

    fn is_disabled(&self, ip: Ipv4Addr) -> bool {
        self.disabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&ip)
    }

    fn emit(&self, event_type: EventType, ip: Ipv4Addr, sid: &str) {
        let _ = self.events_tx.try_send(DiscoveryEvent {
            event_type,
            ip,
            sid: sid.to_string(),
        });
    }
}

/// Resolves `host` to its first IPv4 address.
async fn resolve(host: &str, port: u16) -> Result<Ipv4Addr, DiscoveryError> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| DiscoveryError::DnsResolution {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

    addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| DiscoveryError::DnsResolution {
            host: host.to_string(),
            reason: "no IPv4 address".into(),
        })
}
