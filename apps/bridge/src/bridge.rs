//! Bridge context: the hubs, their sub-devices and the push listener.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use aqara_devices::{DeviceRegistry, ModelRegistry};
use aqara_discovery::GatewayDiscovery;
use aqara_gateway::{DeviceInfo, Gateway, GatewayTable, Interface, PushListener};
use aqara_miio::{AuxClient, FmStatus, MiioToken, MiioTransport};
use aqara_protocol::constants::DISCOVERY_TIMEOUT;
use aqara_protocol::{Frame, Payload};
use tracing::{debug, error, info, warn};

use crate::config::Config;

/// Device list requests per hub before giving up on it.
const ENUMERATE_ATTEMPTS: u32 = 5;

/// Everything the host-facing side of the bridge needs.
pub struct Bridge {
    table: GatewayTable,
    registry: Arc<DeviceRegistry>,
    listener: PushListener,
    aux: HashMap<String, AuxClient>,
    /// Last radio state per hub sid, refreshed by polling.
    radio: Mutex<HashMap<String, FmStatus>>,
}

impl Bridge {
    pub fn new(table: GatewayTable, interface: Interface, registry: Arc<DeviceRegistry>) -> Self {
        let listener = PushListener::new(table.clone(), interface);
        Self {
            table,
            registry,
            listener,
            aux: HashMap::new(),
            radio: Mutex::new(HashMap::new()),
        }
    }

    /// Discovers the hubs, wires their devices into the registry and
    /// starts listening for pushes.
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        let interface = Interface::resolve(&config.interface)?;
        let table = GatewayTable::new();
        let mut discovery = GatewayDiscovery::new(&config.gateways, interface, table.clone())?;
        let mut events = discovery.take_events();

        let expected = config.gateways.iter().filter(|g| !g.disable).count();
        discover_with_retry(&discovery, config.discovery_retry, expected).await;

        if let Some(events) = events.as_mut() {
            while let Ok(event) = events.try_recv() {
                info!(sid = %event.sid, ip = %event.ip, kind = %event.event_type, "gateway");
            }
        }
        if table.is_empty() {
            error!("no gateway discovered");
            anyhow::bail!("no gateway discovered");
        }

        let registry = Arc::new(DeviceRegistry::new(ModelRegistry::builtin()));
        let mut bridge = Self::new(table, interface, registry);
        for gateway in bridge.table.all() {
            bridge.attach(&gateway).await;
        }
        bridge.listener.start().await?;
        Ok(bridge)
    }

    /// Probes a hub, registers its devices and routes its pushes to the
    /// registry.
    pub async fn attach(&mut self, gateway: &Arc<Gateway>) {
        let hub = gateway.sid().to_string();

        if let Err(e) = gateway.probe_protocol().await {
            warn!(sid = %hub, "cannot detect protocol version, assuming {}: {e}", gateway.proto_version());
        }

        let devices = enumerate_with_retry(gateway).await;
        for info in &devices {
            self.track(gateway, info);
        }

        // Devices paired after start-up are created on their first report.
        let registry = Arc::clone(&self.registry);
        let hub_sid = hub.clone();
        gateway
            .subscriptions()
            .set_fallback(Arc::new(move |data: &Payload, raw: &Frame| {
                if let Some(sid) = raw.sid.as_deref() {
                    registry.on_push(&hub_sid, sid, data, raw);
                }
            }));

        if let Some(client) = aux_client(gateway) {
            self.set_aux(&hub, client);
        }
        info!(sid = %hub, devices = devices.len(), "gateway ready");
    }

    fn track(&self, gateway: &Arc<Gateway>, info: &DeviceInfo) {
        let hub = gateway.sid().to_string();
        if let Err(e) = self
            .registry
            .register(&hub, &info.sid, &info.model, info.proto, &info.data)
        {
            warn!(gateway = %hub, "{e}");
            return;
        }

        let registry = Arc::clone(&self.registry);
        let sid = info.sid.clone();
        gateway.subscribe(
            info.sid.clone(),
            Arc::new(move |data: &Payload, raw: &Frame| {
                registry.on_push(&hub, &sid, data, raw);
            }),
        );
    }

    pub fn table(&self) -> &GatewayTable {
        &self.table
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub(crate) fn aux(&self, sid: &str) -> Option<&AuxClient> {
        self.aux.get(sid)
    }

    /// Uses `client` for the hub's auxiliary calls.
    pub fn set_aux(&mut self, sid: &str, client: AuxClient) {
        self.aux.insert(sid.to_string(), client);
    }

    /// Radio state from the last poll or radio command.
    pub fn radio_state(&self, sid: &str) -> Option<FmStatus> {
        self.radio
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sid)
            .cloned()
    }

    pub(crate) fn update_radio(&self, sid: &str, update: impl FnOnce(&mut FmStatus)) {
        let mut radio = self.radio.lock().unwrap_or_else(PoisonError::into_inner);
        let status = radio.entry(sid.to_string()).or_insert(FmStatus {
            volume: None,
            running: false,
        });
        update(status);
    }

    /// Reads every polled device and hub radio once. Returns how many
    /// answered.
    pub async fn poll_once(&self) -> usize {
        let mut answered = 0;
        for (sid, aux) in &self.aux {
            match aux.fm_status().await {
                Ok(status) => {
                    self.update_radio(sid, |s| *s = status);
                    answered += 1;
                }
                Err(e) => debug!(%sid, "radio status unavailable: {e}"),
            }
        }
        for key in self.registry.polled() {
            let Some(gateway) = self.table.by_sid(&key.hub) else {
                continue;
            };
            match gateway.get_from_hub(&key.sid).await {
                Ok(true) => answered += 1,
                Ok(false) => debug!(device = %key, "poll returned no data"),
                Err(e) => warn!(device = %key, "poll failed: {e}"),
            }
        }
        answered
    }

    /// Stops the listener and closes every session.
    pub async fn shutdown(&self) {
        self.listener.stop().await;
        for gateway in self.table.all() {
            gateway.close();
        }
    }
}

/// Runs discovery rounds until every expected hub is known.
async fn discover_with_retry(discovery: &GatewayDiscovery, rounds: u32, expected: usize) {
    for round in 1..=rounds.max(1) {
        match discovery.discover(DISCOVERY_TIMEOUT).await {
            Ok(added) => info!(round, added, total = discovery.table().len(), "discovery round finished"),
            Err(e) => warn!(round, "discovery failed: {e}"),
        }
        let found = discovery.table().len();
        if found > 0 && found >= expected {
            break;
        }
    }
}

async fn enumerate_with_retry(gateway: &Gateway) -> Vec<DeviceInfo> {
    for attempt in 1..=ENUMERATE_ATTEMPTS {
        info!(sid = %gateway.sid(), attempt, "discovering devices");
        match gateway.enumerate_devices().await {
            Ok(devices) => return devices,
            Err(e) => warn!(sid = %gateway.sid(), attempt, "device discovery failed: {e}"),
        }
    }
    error!(sid = %gateway.sid(), "giving up on device discovery");
    Vec::new()
}

/// Builds the auxiliary RPC client if the hub has a token configured.
fn aux_client(gateway: &Gateway) -> Option<AuxClient> {
    let token = gateway.aux_token()?;
    match MiioToken::from_hex(token) {
        Ok(token) => {
            let transport = MiioTransport::new(gateway.ip(), token);
            Some(AuxClient::new(gateway.ip(), Arc::new(transport)))
        }
        Err(e) => {
            warn!(sid = %gateway.sid(), "ignoring miio token: {e}");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::time::Duration;

    use aqara_devices::DeviceState;
    use aqara_gateway::GatewayParams;
    use tokio::net::UdpSocket;

    pub const HUB_SID: &str = "7811dcb07917";
    pub const PLUG_SID: &str = "158d0001a2b3c4";
    pub const KEY: &str = "1234567890123456";

    pub type Received = Arc<Mutex<Vec<Frame>>>;

    /// Loopback v1 hub with one plug that accepts every write.
    pub async fn fake_hub() -> (u16, Received) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let rec = received.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let frame = Frame::parse(&buf[..n]).unwrap();
                rec.lock().unwrap().push(frame.clone());
                let sid = frame.sid.clone().unwrap_or_default();
                let reply = match frame.cmd.as_str() {
                    "get_id_list" => format!(
                        r#"{{"cmd":"get_id_list_ack","sid":"{HUB_SID}","token":"1234567890abcdef","data":"[\"{PLUG_SID}\"]"}}"#
                    ),
                    "read" if sid == HUB_SID => format!(
                        r#"{{"cmd":"read_ack","model":"gateway","sid":"{HUB_SID}","short_id":0,"data":"{{\"rgb\":0,\"illumination\":300,\"proto_version\":\"1.1.2\"}}"}}"#
                    ),
                    "read" => format!(
                        r#"{{"cmd":"read_ack","model":"plug","sid":"{PLUG_SID}","short_id":4343,"data":"{{\"status\":\"off\",\"load_power\":\"0.0\"}}"}}"#
                    ),
                    "write" => format!(
                        r#"{{"cmd":"write_ack","sid":"{sid}","data":"{{}}"}}"#
                    ),
                    _ => continue,
                };
                let _ = socket.send_to(reply.as_bytes(), from).await;
            }
        });

        (port, received)
    }

    pub async fn connect(port: u16) -> Arc<Gateway> {
        Gateway::connect(GatewayParams {
            key: Some(KEY.into()),
            timeout: Duration::from_millis(300),
            ..GatewayParams::new(Ipv4Addr::LOCALHOST, port, HUB_SID)
        })
        .await
        .unwrap()
    }

    /// A bridge with one attached loopback hub.
    pub async fn attached_bridge() -> (Bridge, Arc<Gateway>, Received) {
        let (port, received) = fake_hub().await;
        let gateway = connect(port).await;
        let table = GatewayTable::new();
        table.insert(Arc::clone(&gateway));

        let registry = Arc::new(DeviceRegistry::new(ModelRegistry::builtin()));
        let mut bridge = Bridge::new(table, Interface::Any, registry);
        bridge.attach(&gateway).await;
        (bridge, gateway, received)
    }

    fn report(sid: &str, model: &str, data: &str) -> Frame {
        Frame::parse(
            format!(r#"{{"cmd":"report","model":"{model}","sid":"{sid}","data":"{data}"}}"#)
                .as_bytes(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn attach_registers_enumerated_devices() {
        let (bridge, _gateway, _) = attached_bridge().await;

        let plug = bridge.registry().snapshot(HUB_SID, PLUG_SID).unwrap();
        assert_eq!(plug.model, "plug");
        assert!(plug.available);
        assert!(bridge.registry().snapshot(HUB_SID, HUB_SID).is_some());
        assert!(bridge.aux(HUB_SID).is_none());
    }

    #[tokio::test]
    async fn pushes_reach_the_registry() {
        let (bridge, gateway, _) = attached_bridge().await;

        assert!(gateway.push(&report(PLUG_SID, "plug", r#"{\"status\":\"on\"}"#)));
        let plug = bridge.registry().snapshot(HUB_SID, PLUG_SID).unwrap();
        let DeviceState::Switch(state) = plug.state else {
            panic!("plug should be a switch");
        };
        assert_eq!(state.channels[0].on, Some(true));
    }

    #[tokio::test]
    async fn unknown_device_is_created_from_push() {
        let (bridge, gateway, _) = attached_bridge().await;

        assert!(gateway.push(&report("158d000fffffff", "magnet", r#"{\"status\":\"open\"}"#)));
        let magnet = bridge.registry().snapshot(HUB_SID, "158d000fffffff").unwrap();
        assert_eq!(magnet.model, "magnet");
    }

    #[tokio::test]
    async fn poll_reads_metering_plugs() {
        let (bridge, _gateway, received) = attached_bridge().await;
        let reads_before = reads_of(&received, PLUG_SID);

        assert_eq!(bridge.poll_once().await, 1);
        assert_eq!(reads_of(&received, PLUG_SID), reads_before + 1);
    }

    fn reads_of(received: &Received, sid: &str) -> usize {
        received
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.cmd == "read" && f.sid.as_deref() == Some(sid))
            .count()
    }

    #[tokio::test]
    async fn discovery_gives_up_after_configured_rounds() {
        let config = Config {
            interface: "127.0.0.1".into(),
            discovery_retry: 1,
            ..Config::default()
        };
        let table = GatewayTable::new();
        let mut discovery =
            GatewayDiscovery::new(&config.gateways, Interface::Addr(Ipv4Addr::LOCALHOST), table)
                .unwrap();
        // Nobody listens here.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        discovery.set_whois_target(silent.local_addr().unwrap());

        tokio::time::pause();
        discover_with_retry(&discovery, config.discovery_retry, 0).await;
        assert!(discovery.table().is_empty());
    }
}
