//! Auxiliary RPC facade over an opaque `command(method, params)` seam.

use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::RpcError;

/// Boxed future returned by [`RpcTransport::command`].
pub type RpcFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send + 'a>>;

/// Sends one RPC to a device and returns its `result`.
pub trait RpcTransport: Send + Sync {
    fn command<'a>(&'a self, method: &'a str, params: Value) -> RpcFuture<'a>;
}

/// FM radio state of the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FmStatus {
    pub volume: Option<u8>,
    pub running: bool,
}

/// Identity reported by `miIO.info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubInfo {
    pub model: Option<String>,
    pub token: Option<String>,
    pub local_ip: Option<String>,
}

/// Helper calls for a hub's auxiliary channel.
#[derive(Clone)]
pub struct AuxClient {
    ip: Ipv4Addr,
    transport: Arc<dyn RpcTransport>,
}

impl AuxClient {
    pub fn new(ip: Ipv4Addr, transport: Arc<dyn RpcTransport>) -> Self {
        Self { ip, transport }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// Raw call.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        debug!(ip = %self.ip, %method, %params, "aux call");
        self.transport.command(method, params).await
    }

    /// Current radio volume, 0–100.
    pub async fn radio_volume(&self) -> Result<Option<u8>, RpcError> {
        Ok(self.fm_status().await?.volume)
    }

    /// Sets the radio volume, clamped to 0–100. `Ok(false)` if not acknowledged.
    pub async fn set_radio_volume(&self, volume: u8) -> Result<bool, RpcError> {
        let volume = volume.min(100);
        let reply = self
            .call("volume_ctrl_fm", json!([volume.to_string()]))
            .await?;
        Ok(is_ok(&reply))
    }

    /// Starts or stops the radio. `Ok(false)` if not acknowledged.
    pub async fn play_fm(&self, on: bool) -> Result<bool, RpcError> {
        let reply = self
            .call("play_fm", json!([if on { "on" } else { "off" }]))
            .await?;
        Ok(is_ok(&reply))
    }

    pub async fn fm_status(&self) -> Result<FmStatus, RpcError> {
        let reply = self.call("get_prop_fm", json!([])).await?;
        let volume = reply
            .get("current_volume")
            .and_then(Value::as_u64)
            .map(|v| v.min(100) as u8);
        let running = reply.get("current_status").and_then(Value::as_str) == Some("run");
        Ok(FmStatus { volume, running })
    }

    pub async fn info(&self) -> Result<HubInfo, RpcError> {
        let reply = self.call("miIO.info", json!([])).await?;
        let text = |v: Option<&Value>| v.and_then(Value::as_str).map(str::to_string);
        Ok(HubInfo {
            model: text(reply.get("model")),
            token: text(reply.get("token")),
            local_ip: text(reply.get("netif").and_then(|n| n.get("localIp"))),
        })
    }
}

/// `true` if the reply is `"ok"` or a list containing it.
fn is_ok(reply: &Value) -> bool {
    match reply {
        Value::String(s) => s == "ok",
        Value::Array(items) => items.iter().any(|v| v.as_str() == Some("ok")),
        _ => false,
    }
}
