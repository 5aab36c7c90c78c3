//! Gateway services exposed to the host.

use std::sync::Arc;

use aqara_devices::Command;
use aqara_gateway::{Gateway, GatewayError};
use aqara_miio::{AuxClient, FmStatus, HubInfo, RpcError};
use aqara_protocol::{Payload, normalize_sid};
use serde_json::Value;
use tracing::info;

use crate::bridge::Bridge;

/// Ringtone ids the hub reserves for alarms and doorbells.
const RESERVED_RINGTONES: &[u32] = &[9, 14, 15, 16, 17, 18, 19];

/// `mid` value that stops playback.
const STOP_RINGTONE: u32 = 10000;

/// How long the hub accepts new devices after `add_device`.
pub const PAIRING_WINDOW_SECS: u64 = 30;

/// Length of a sub-device id as the hub expects it in `remove_device`.
const DEVICE_ID_LEN: usize = 14;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("unknown gateway {0}")]
    UnknownGateway(String),

    #[error("gateway must be given when {0} gateways are known")]
    AmbiguousGateway(usize),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("gateway {0} has no miio token configured")]
    NoAuxChannel(String),

    #[error("{0} was not acknowledged")]
    Rejected(&'static str),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("aux rpc: {0}")]
    Rpc(#[from] RpcError),
}

impl Bridge {
    /// Resolves a gateway argument. Optional when exactly one hub is known.
    pub fn gateway(&self, sid: Option<&str>) -> Result<Arc<Gateway>, ServiceError> {
        match sid {
            Some(sid) => {
                let sid = normalize_sid(sid.trim());
                self.table()
                    .by_sid(&sid)
                    .ok_or(ServiceError::UnknownGateway(sid))
            }
            None => {
                let mut all = self.table().all();
                if all.len() == 1 {
                    Ok(all.remove(0))
                } else {
                    Err(ServiceError::AmbiguousGateway(all.len()))
                }
            }
        }
    }

    pub async fn play_ringtone(
        &self,
        gateway: Option<&str>,
        ringtone_id: u32,
        volume: Option<u8>,
    ) -> Result<(), ServiceError> {
        let gateway = self.gateway(gateway)?;
        let fields = ringtone_fields(ringtone_id, volume)?;
        write_hub(&gateway, fields, "play_ringtone").await
    }

    pub async fn stop_ringtone(&self, gateway: Option<&str>) -> Result<(), ServiceError> {
        let gateway = self.gateway(gateway)?;
        write_hub(&gateway, fields("mid", STOP_RINGTONE), "stop_ringtone").await
    }

    /// Opens the hub's pairing window.
    pub async fn add_device(&self, gateway: Option<&str>) -> Result<(), ServiceError> {
        let gateway = self.gateway(gateway)?;
        write_hub(&gateway, fields("join_permission", "yes"), "add_device").await?;
        info!(
            sid = %gateway.sid(),
            "pairing mode enabled for {PAIRING_WINDOW_SECS} seconds, press the pairing button on the new device"
        );
        Ok(())
    }

    pub async fn remove_device(
        &self,
        gateway: Option<&str>,
        device_id: &str,
    ) -> Result<(), ServiceError> {
        let gateway = self.gateway(gateway)?;
        let fields = remove_device_fields(device_id)?;
        write_hub(&gateway, fields, "remove_device").await?;
        info!(sid = %gateway.sid(), device = %device_id, "device removal requested");
        Ok(())
    }

    /// Sets the radio volume over the auxiliary channel, clamped to 0–100.
    pub async fn radio_volume(&self, gateway: Option<&str>, volume: u8) -> Result<(), ServiceError> {
        let (gateway, aux) = self.aux_for(gateway)?;
        if !aux.set_radio_volume(volume).await? {
            return Err(ServiceError::Rejected("radio_volume"));
        }
        self.update_radio(gateway.sid(), |s| s.volume = Some(volume.min(100)));
        Ok(())
    }

    /// Starts or stops the hub radio.
    pub async fn set_radio(&self, gateway: Option<&str>, on: bool) -> Result<(), ServiceError> {
        let (gateway, aux) = self.aux_for(gateway)?;
        if !aux.play_fm(on).await? {
            return Err(ServiceError::Rejected("radio"));
        }
        self.update_radio(gateway.sid(), |s| s.running = on);
        Ok(())
    }

    /// Reads the radio state from the hub and caches it.
    pub async fn radio_status(&self, gateway: Option<&str>) -> Result<FmStatus, ServiceError> {
        let (gateway, aux) = self.aux_for(gateway)?;
        let status = aux.fm_status().await?;
        let cached = status.clone();
        self.update_radio(gateway.sid(), |s| *s = cached);
        Ok(status)
    }

    /// Model, token and address the hub reports about itself.
    pub async fn hub_info(&self, gateway: Option<&str>) -> Result<HubInfo, ServiceError> {
        let (_, aux) = self.aux_for(gateway)?;
        Ok(aux.info().await?)
    }

    fn aux_for(&self, gateway: Option<&str>) -> Result<(Arc<Gateway>, &AuxClient), ServiceError> {
        let gateway = self.gateway(gateway)?;
        let aux = self
            .aux(gateway.sid())
            .ok_or_else(|| ServiceError::NoAuxChannel(gateway.sid().to_string()))?;
        Ok((gateway, aux))
    }

    /// Switches one channel of a sub-device.
    pub async fn set_switch(
        &self,
        gateway: Option<&str>,
        device: &str,
        channel: usize,
        on: bool,
    ) -> Result<(), ServiceError> {
        let gateway = self.gateway(gateway)?;
        let device = normalize_sid(device.trim());
        let command = if on {
            Command::TurnOn { channel }
        } else {
            Command::TurnOff { channel }
        };

        let registry = self.registry();
        if registry.snapshot(gateway.sid(), &device).is_none() {
            return Err(ServiceError::UnknownDevice(device));
        }
        let fields = registry
            .command(gateway.sid(), &device, &command)
            .ok_or_else(|| ServiceError::InvalidArgument(format!("{device} has no channel {channel}")))?;

        if !gateway.write(&device, fields).await? {
            return Err(ServiceError::Rejected("switch"));
        }
        Ok(())
    }
}

async fn write_hub(
    gateway: &Gateway,
    fields: Payload,
    service: &'static str,
) -> Result<(), ServiceError> {
    if gateway.write(gateway.sid(), fields).await? {
        Ok(())
    } else {
        Err(ServiceError::Rejected(service))
    }
}

fn fields(key: &str, value: impl Into<Value>) -> Payload {
    let mut payload = Payload::new();
    payload.insert(key.into(), value.into());
    payload
}

fn ringtone_fields(ringtone_id: u32, volume: Option<u8>) -> Result<Payload, ServiceError> {
    if RESERVED_RINGTONES.contains(&ringtone_id) {
        return Err(ServiceError::InvalidArgument(format!(
            "ringtone {ringtone_id} is reserved"
        )));
    }
    let mut payload = fields("mid", ringtone_id);
    if let Some(volume) = volume {
        payload.insert("vol".into(), Value::from(volume.min(100)));
    }
    Ok(payload)
}

fn remove_device_fields(device_id: &str) -> Result<Payload, ServiceError> {
    let device_id = device_id.trim();
    if device_id.chars().count() != DEVICE_ID_LEN {
        return Err(ServiceError::InvalidArgument(format!(
            "device id must be {DEVICE_ID_LEN} characters, got {device_id:?}"
        )));
    }
    Ok(fields("remove_device", device_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::{HUB_SID, PLUG_SID, Received, attached_bridge};
    use aqara_devices::{DeviceRegistry, ModelRegistry};
    use aqara_gateway::{GatewayTable, Interface};
    use aqara_miio::{RpcFuture, RpcTransport};
    use aqara_protocol::Frame;
    use serde_json::json;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    /// Records aux calls and answers from a fixed table.
    struct MockTransport {
        calls: Mutex<Vec<(String, Value)>>,
        reply: Box<dyn Fn(&str) -> Result<Value, RpcError> + Send + Sync>,
    }

    impl MockTransport {
        fn new(reply: impl Fn(&str) -> Result<Value, RpcError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply: Box::new(reply),
            })
        }
    }

    impl RpcTransport for MockTransport {
        fn command<'a>(&'a self, method: &'a str, params: Value) -> RpcFuture<'a> {
            Box::pin(async move {
                self.calls.lock().unwrap().push((method.to_string(), params));
                (self.reply)(method)
            })
        }
    }

    fn hub_radio(method: &str) -> Result<Value, RpcError> {
        match method {
            "get_prop_fm" => Ok(json!({"current_volume": 35, "current_status": "run"})),
            "miIO.info" => Ok(json!({
                "model": "lumi.gateway.v3",
                "token": "00112233445566778899aabbccddeeff",
                "netif": {"localIp": "192.168.1.5"}
            })),
            _ => Ok(json!(["ok"])),
        }
    }

    async fn bridge_with_radio(
        reply: impl Fn(&str) -> Result<Value, RpcError> + Send + Sync + 'static,
    ) -> (Bridge, Arc<MockTransport>) {
        let (mut bridge, _gw, _) = attached_bridge().await;
        let mock = MockTransport::new(reply);
        bridge.set_aux(HUB_SID, AuxClient::new(Ipv4Addr::LOCALHOST, mock.clone()));
        (bridge, mock)
    }

    fn writes(received: &Received) -> Vec<Frame> {
        received
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.cmd == "write")
            .cloned()
            .collect()
    }

    #[test]
    fn reserved_ringtones_are_rejected() {
        for id in [9, 14, 19] {
            assert!(matches!(
                ringtone_fields(id, None),
                Err(ServiceError::InvalidArgument(_))
            ));
        }
        let payload = ringtone_fields(10, None).unwrap();
        assert_eq!(payload["mid"], 10);
        assert!(!payload.contains_key("vol"));
    }

    #[test]
    fn ringtone_volume_is_clamped() {
        let payload = ringtone_fields(2, Some(150)).unwrap();
        assert_eq!(payload["vol"], 100);
        assert_eq!(ringtone_fields(2, Some(40)).unwrap()["vol"], 40);
    }

    #[test]
    fn remove_device_requires_full_id() {
        assert!(remove_device_fields("158d0001a2").is_err());
        assert_eq!(
            remove_device_fields(" 158d0001a2b3c4 ").unwrap()["remove_device"],
            "158d0001a2b3c4"
        );
    }

    #[tokio::test]
    async fn gateway_argument_resolution() {
        let (bridge, _gw, _) = attached_bridge().await;

        assert_eq!(bridge.gateway(None).unwrap().sid(), HUB_SID);
        assert_eq!(bridge.gateway(Some("78:11:DC:B0:79:17")).unwrap().sid(), HUB_SID);
        assert!(matches!(
            bridge.gateway(Some("000000000000")),
            Err(ServiceError::UnknownGateway(_))
        ));

        let empty = Bridge::new(
            GatewayTable::new(),
            Interface::Any,
            Arc::new(DeviceRegistry::new(ModelRegistry::builtin())),
        );
        assert!(matches!(empty.gateway(None), Err(ServiceError::AmbiguousGateway(0))));
    }

    #[tokio::test]
    async fn stop_ringtone_writes_to_the_hub() {
        let (bridge, _gw, received) = attached_bridge().await;

        bridge.stop_ringtone(None).await.unwrap();
        let writes = writes(&received);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].sid.as_deref(), Some(HUB_SID));
        let data = writes[0].data.as_ref().unwrap();
        assert_eq!(data["mid"], 10000);
        assert!(data.get("key").is_some());
    }

    #[tokio::test]
    async fn add_device_opens_pairing() {
        let (bridge, _gw, received) = attached_bridge().await;

        bridge.add_device(Some(HUB_SID)).await.unwrap();
        assert_eq!(writes(&received)[0].data.as_ref().unwrap()["join_permission"], "yes");
    }

    #[tokio::test]
    async fn switch_uses_the_model_encoder() {
        let (bridge, _gw, received) = attached_bridge().await;

        bridge.set_switch(None, PLUG_SID, 0, true).await.unwrap();
        let writes = writes(&received);
        assert_eq!(writes[0].sid.as_deref(), Some(PLUG_SID));
        assert_eq!(writes[0].data.as_ref().unwrap()["status"], "on");

        assert!(matches!(
            bridge.set_switch(None, PLUG_SID, 3, true).await,
            Err(ServiceError::InvalidArgument(_))
        ));
        assert!(matches!(
            bridge.set_switch(None, "158d000fffffff", 0, true).await,
            Err(ServiceError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn radio_switch_updates_cached_state() {
        let (bridge, mock) = bridge_with_radio(hub_radio).await;

        bridge.set_radio(None, true).await.unwrap();
        assert!(bridge.radio_state(HUB_SID).unwrap().running);
        bridge.radio_volume(None, 120).await.unwrap();
        assert_eq!(bridge.radio_state(HUB_SID).unwrap().volume, Some(100));
        bridge.set_radio(Some(HUB_SID), false).await.unwrap();
        assert!(!bridge.radio_state(HUB_SID).unwrap().running);

        let calls = mock.calls.lock().unwrap();
        assert_eq!(calls[0], ("play_fm".to_string(), json!(["on"])));
        assert_eq!(calls[1], ("volume_ctrl_fm".to_string(), json!(["100"])));
        assert_eq!(calls[2], ("play_fm".to_string(), json!(["off"])));
    }

    #[tokio::test]
    async fn unacknowledged_radio_command_is_rejected() {
        let (bridge, _) = bridge_with_radio(|_| Ok(json!(["error"]))).await;
        assert!(matches!(
            bridge.set_radio(None, true).await,
            Err(ServiceError::Rejected("radio"))
        ));
        assert!(bridge.radio_state(HUB_SID).is_none());
    }

    #[tokio::test]
    async fn radio_status_and_hub_info() {
        let (bridge, _) = bridge_with_radio(hub_radio).await;

        let status = bridge.radio_status(None).await.unwrap();
        assert_eq!(status, FmStatus { volume: Some(35), running: true });
        assert_eq!(bridge.radio_state(HUB_SID), Some(status));

        let info = bridge.hub_info(None).await.unwrap();
        assert_eq!(info.model.as_deref(), Some("lumi.gateway.v3"));
        assert_eq!(info.local_ip.as_deref(), Some("192.168.1.5"));
    }

    #[tokio::test]
    async fn poll_refreshes_radio_state() {
        let (bridge, mock) = bridge_with_radio(hub_radio).await;

        // One radio plus the metering plug.
        assert_eq!(bridge.poll_once().await, 2);
        assert_eq!(
            bridge.radio_state(HUB_SID),
            Some(FmStatus { volume: Some(35), running: true })
        );
        assert_eq!(mock.calls.lock().unwrap()[0].0, "get_prop_fm");
    }

    #[tokio::test]
    async fn radio_needs_a_token() {
        let (bridge, _gw, _) = attached_bridge().await;
        assert!(matches!(
            bridge.radio_volume(None, 50).await,
            Err(ServiceError::NoAuxChannel(_))
        ));
        assert!(matches!(
            bridge.radio_status(None).await,
            Err(ServiceError::NoAuxChannel(_))
        ));
    }
}
