//! Per-hub UDP session.
//!
//! Each [`Gateway`] owns one unicast socket and a response pump. Commands
//! are serialized: one correlated exchange is outstanding per hub at a
//! time, retried once on timeout.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use aqara_protocol::constants::COMMAND_TIMEOUT;
use aqara_protocol::envelope::correlation_id;
use aqara_protocol::{Frame, Payload, ProtoVersion, signed_key};

use crate::GatewayError;
use crate::pumps::response::{PendingMap, Reply, response_pump};
use crate::socket;
use crate::subscriptions::{PushCallback, SubscriptionId, Subscriptions};
use crate::types::{DeviceInfo, Interface, SessionState};

/// Retries after a timed-out exchange.
pub const COMMAND_RETRIES: u32 = 1;

/// Read attempts per sub-device while enumerating.
pub const DEVICE_READ_ATTEMPTS: u32 = 3;

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct GatewayParams {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub sid: String,
    /// 16-character hub password. `None` makes the session read-only.
    pub key: Option<String>,
    /// `proto_version` from the `iam` reply, if known.
    pub proto: Option<String>,
    /// Token for the auxiliary RPC channel.
    pub aux_token: Option<String>,
    pub interface: Interface,
    pub timeout: Duration,
}

impl GatewayParams {
    pub fn new(ip: Ipv4Addr, port: u16, sid: impl Into<String>) -> Self {
        Self {
            ip,
            port,
            sid: sid.into(),
            key: None,
            proto: None,
            aux_token: None,
            interface: Interface::Any,
            timeout: COMMAND_TIMEOUT,
        }
    }
}

/// Cached session token plus the write-pending flag.
#[derive(Debug, Default)]
pub(crate) struct TokenCell {
    inner: StdMutex<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    token: Option<String>,
    write_pending: bool,
}

impl TokenCell {
    pub(crate) fn get(&self) -> Option<String> {
        self.lock().token.clone()
    }

    pub(crate) fn set(&self, token: String) {
        self.lock().token = Some(token);
    }

    fn set_write_pending(&self, pending: bool) {
        self.lock().write_pending = pending;
    }

    fn state(&self) -> SessionState {
        let inner = self.lock();
        match (&inner.token, inner.write_pending) {
            (None, _) => SessionState::Uninitialized,
            (Some(_), true) => SessionState::WritePending,
            (Some(_), false) => SessionState::TokenKnown,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TokenInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Session with a single hub.
pub struct Gateway {
    ip: Ipv4Addr,
    port: u16,
    sid: String,
    key: Option<String>,
    aux_token: Option<String>,
    proto: RwLock<ProtoVersion>,
    proto_known: RwLock<bool>,
    socket: Arc<UdpSocket>,
    token: Arc<TokenCell>,
    pending: PendingMap,
    /// Serializes correlated exchanges.
    command_lock: Mutex<()>,
    devices: RwLock<HashMap<String, DeviceInfo>>,
    last_payloads: RwLock<HashMap<String, Payload>>,
    subscriptions: Subscriptions,
    last_seen: StdMutex<Option<Instant>>,
    timeout: Duration,
    cancel: CancellationToken,
    _read_handle: tokio::task::JoinHandle<()>,
}

impl Gateway {
    /// Binds the session socket and starts the response pump.
    pub async fn connect(params: GatewayParams) -> Result<Arc<Self>, GatewayError> {
        let socket = Arc::new(socket::command_socket(params.interface).await?);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let token = Arc::new(TokenCell::default());
        let cancel = CancellationToken::new();

        let read_handle = {
            let socket = socket.clone();
            let pending = pending.clone();
            let token = token.clone();
            let cancel = cancel.clone();
            tokio::spawn(response_pump(socket, params.ip, pending, token, cancel))
        };

        if params.key.is_none() {
            warn!(
                sid = %params.sid,
                "key is not provided for gateway, controlling it will not be possible"
            );
        }

        let proto_known = params.proto.is_some();
        let proto = params
            .proto
            .as_deref()
            .map(ProtoVersion::parse)
            .unwrap_or_default();

        info!(
            sid = %params.sid,
            ip = %params.ip,
            port = params.port,
            %proto,
            "gateway session opened"
        );

        Ok(Arc::new(Self {
            ip: params.ip,
            port: params.port,
            sid: params.sid,
            key: params.key,
            aux_token: params.aux_token,
            proto: RwLock::new(proto),
            proto_known: RwLock::new(proto_known),
            socket,
            token,
            pending,
            command_lock: Mutex::new(()),
            devices: RwLock::new(HashMap::new()),
            last_payloads: RwLock::new(HashMap::new()),
            subscriptions: Subscriptions::new(),
            last_seen: StdMutex::new(None),
            timeout: params.timeout,
            cancel,
            _read_handle: read_handle,
        }))
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// `true` if no key is configured and writes are impossible.
    pub fn is_read_only(&self) -> bool {
        self.key.is_none()
    }

    pub fn aux_token(&self) -> Option<&str> {
        self.aux_token.as_deref()
    }

    pub fn proto_version(&self) -> ProtoVersion {
        *self.proto.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current session token, if one has been received.
    pub fn get_token(&self) -> Option<String> {
        self.token.get()
    }

    /// Caches a token seen in a heartbeat or reply.
    pub fn update_token(&self, token: &str) {
        self.token.set(token.to_string());
        self.touch();
    }

    pub fn state(&self) -> SessionState {
        self.token.state()
    }

    /// Records that the hub was heard from.
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    pub fn last_seen(&self) -> Option<Instant> {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    /// Registers a push callback for a sub-device of this hub.
    pub fn subscribe(&self, sid: impl Into<String>, callback: PushCallback) -> SubscriptionId {
        self.subscriptions.subscribe(sid, callback)
    }

    /// Sub-devices found by the last [`enumerate_devices`](Self::enumerate_devices).
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn device(&self, sid: &str) -> Option<DeviceInfo> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sid)
            .cloned()
    }

    /// Last attributes received for `sid`, merged across reports.
    pub fn last_payload(&self, sid: &str) -> Option<Payload> {
        self.last_payloads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sid)
            .cloned()
    }

    /// Sends a signed write and reports whether the hub accepted it.
    pub async fn write(&self, sid: &str, fields: Payload) -> Result<bool, GatewayError> {
        let Some(key) = self.key.as_deref() else {
            error!(sid = %self.sid, "gateway key is not provided, cannot send commands");
            return Err(GatewayError::NoKey {
                sid: self.sid.clone(),
            });
        };

        let _guard = self.command_lock.lock().await;

        if self.token.get().is_none() {
            debug!(sid = %self.sid, "no token yet, requesting device list");
            self.refresh_token_locked().await?;
        }

        let resp = self.signed_write(key, sid, &fields).await?;
        let Some(err) = resp.error() else {
            return Ok(true);
        };

        if !resp.is_invalid_key() {
            warn!(sid = %self.sid, target = %sid, error = %err, "gateway rejected write");
            return Ok(false);
        }

        warn!(sid = %self.sid, "gateway reported invalid key, requesting a new token");
        self.refresh_token_locked().await?;
        let resp = self.signed_write(key, sid, &fields).await?;
        match resp.error() {
            None => Ok(true),
            Some(err) => {
                warn!(sid = %self.sid, target = %sid, error = %err, "write rejected after token refresh");
                Ok(false)
            }
        }
    }

    /// Reads a sub-device. `None` if the hub stays silent.
    pub async fn read(&self, sid: &str) -> Result<Option<Payload>, GatewayError> {
        let frame = {
            let _guard = self.command_lock.lock().await;
            match self.read_locked(sid).await {
                Ok(f) => f,
                Err(GatewayError::CommandTimeout { .. }) => {
                    error!(sid = %self.sid, target = %sid, "cannot connect to gateway");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        };

        if let Some(err) = frame.error() {
            return Err(GatewayError::Protocol(format!("read of {sid} failed: {err}")));
        }
        Ok(frame.payload()?)
    }

    /// Reads a sub-device and pushes the reply to its subscribers.
    pub async fn get_from_hub(&self, sid: &str) -> Result<bool, GatewayError> {
        let frame = {
            let _guard = self.command_lock.lock().await;
            match self.read_locked(sid).await {
                Ok(f) => f,
                Err(GatewayError::CommandTimeout { .. }) => {
                    error!(sid = %self.sid, target = %sid, "cannot connect to gateway");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        };
        Ok(self.push(&frame))
    }

    /// Learns `proto_version` by reading the hub itself, unless discovery
    /// already supplied it.
    pub async fn probe_protocol(&self) -> Result<ProtoVersion, GatewayError> {
        if *self.proto_known.read().unwrap_or_else(PoisonError::into_inner) {
            return Ok(self.proto_version());
        }

        let _guard = self.command_lock.lock().await;
        let frame = self
            .exchange(&Frame::for_sid("read", &self.sid), "read_ack", &self.sid)
            .await?;
        if frame.cmd != "read_ack" && frame.cmd != "read_rsp" {
            return Err(unexpected("read_ack", &frame));
        }

        let version = frame.proto_version.clone().or_else(|| {
            frame
                .payload()
                .ok()
                .flatten()
                .and_then(|p| p.get("proto_version").and_then(Value::as_str).map(str::to_string))
        });
        let proto = version
            .as_deref()
            .map(ProtoVersion::parse)
            .unwrap_or_default();

        *self.proto.write().unwrap_or_else(PoisonError::into_inner) = proto;
        *self.proto_known.write().unwrap_or_else(PoisonError::into_inner) = true;
        info!(sid = %self.sid, version = ?version, %proto, "gateway protocol detected");
        Ok(proto)
    }

    /// Fetches the device list and reads every sub-device.
    ///
    /// Devices that never answer or whose model the firmware does not
    /// report are logged and skipped.
    pub async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, GatewayError> {
        let _guard = self.command_lock.lock().await;
        let proto = self.proto_version();

        let resp = self.refresh_token_locked().await?;
        let mut sids = resp.id_list()?;
        if !sids.contains(&self.sid) {
            sids.push(self.sid.clone());
        }
        info!(sid = %self.sid, count = sids.len(), "found devices");

        let mut found = Vec::new();
        for sid in sids {
            let Some(frame) = self.read_with_attempts(&sid, proto).await else {
                error!(
                    gateway = %self.sid,
                    %sid,
                    "not a valid device, check the mac address and update the firmware"
                );
                continue;
            };

            let Some(model) = frame.model.clone().filter(|m| !m.is_empty()) else {
                error!(
                    gateway = %self.sid,
                    %sid,
                    "device isn't supported by the gateway firmware"
                );
                continue;
            };

            let reported_sid = frame.sid.clone().unwrap_or(sid);
            let info = DeviceInfo {
                sid: format!("{reported_sid:0>12}"),
                model,
                short_id: frame.short_id_value(),
                proto,
                data: frame.payload().ok().flatten().unwrap_or_default(),
                raw: frame,
            };
            debug!(gateway = %self.sid, sid = %info.sid, model = %info.model, "registering device");

            self.last_payloads
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(info.sid.clone(), info.data.clone());
            self.devices
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(info.sid.clone(), info.clone());
            found.push(info);
        }

        Ok(found)
    }

    /// Routes a report, heartbeat or read reply to the subscribers of its sid.
    ///
    /// Returns `false` if the frame carried no usable payload.
    pub fn push(&self, frame: &Frame) -> bool {
        if let Some(err) = frame.error() {
            warn!(sid = %self.sid, error = %err, "got error element in data");
            return false;
        }
        let payload = match frame.payload() {
            Ok(Some(p)) => p,
            Ok(None) => {
                debug!(sid = %self.sid, cmd = %frame.cmd, "frame without data");
                return false;
            }
            Err(e) => {
                warn!(sid = %self.sid, "cannot decode pushed data: {e}");
                return false;
            }
        };
        let Some(sid) = frame.sid.as_deref() else {
            warn!(sid = %self.sid, cmd = %frame.cmd, "pushed frame without sid");
            return false;
        };

        self.touch();
        self.last_payloads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(sid.to_string())
            .or_default()
            .extend(payload.clone());

        let delivered = self.subscriptions.dispatch(sid, &payload, frame);
        if delivered == 0 {
            debug!(gateway = %self.sid, %sid, "no subscriber for sub-device, dropping report");
        }
        true
    }

    /// Stops the response pump. Pending commands fail with `Closed`.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    async fn read_locked(&self, sid: &str) -> Result<Frame, GatewayError> {
        let ack = self.proto_version().read_ack();
        let frame = self.exchange(&Frame::for_sid("read", sid), ack, sid).await?;
        expect_cmd(frame, ack)
    }

    async fn read_with_attempts(&self, sid: &str, proto: ProtoVersion) -> Option<Frame> {
        for attempt in 1..=DEVICE_READ_ATTEMPTS {
            debug!(%sid, attempt, "discovery read attempt");
            match self
                .exchange(&Frame::for_sid("read", sid), proto.read_ack(), sid)
                .await
            {
                Ok(frame) if frame.cmd == proto.read_ack() && frame.error().is_none() => {
                    return Some(frame);
                }
                Ok(frame) => debug!(%sid, cmd = %frame.cmd, "unusable read reply"),
                Err(e) => debug!(%sid, "read failed: {e}"),
            }
        }
        None
    }

    async fn refresh_token_locked(&self) -> Result<Frame, GatewayError> {
        let proto = self.proto_version();
        let resp = self
            .exchange(&Frame::new(proto.id_list_cmd()), proto.id_list_ack(), &self.sid)
            .await?;
        let resp = expect_cmd(resp, proto.id_list_ack())?;

        let Some(token) = resp.token.clone() else {
            return Err(GatewayError::Protocol(format!(
                "{} carries no token",
                resp.cmd
            )));
        };
        self.token.set(token);
        self.touch();
        Ok(resp)
    }

    async fn signed_write(
        &self,
        key: &str,
        sid: &str,
        fields: &Payload,
    ) -> Result<Frame, GatewayError> {
        let token = self
            .token
            .get()
            .ok_or_else(|| GatewayError::Protocol("no token from gateway".into()))?;
        let signature = signed_key(key, &token)?;
        let proto = self.proto_version();
        let (model, short_id) = match self.device(sid) {
            Some(d) => (Some(d.model), d.short_id),
            None => (None, 0),
        };
        let frame = build_write(proto, sid, model.as_deref(), short_id, fields, signature);

        self.token.set_write_pending(true);
        let result = self.exchange(&frame, proto.write_ack(), sid).await;
        self.token.set_write_pending(false);
        expect_cmd(result?, proto.write_ack())
    }

    /// Sends `frame` and waits for the reply, retrying once on timeout.
    /// Callers must hold `command_lock`.
    async fn exchange(&self, frame: &Frame, expect: &str, sid: &str) -> Result<Frame, GatewayError> {
        let bytes = frame.to_bytes()?;
        let mut attempt = 0;
        loop {
            debug!(gateway = %self.sid, cmd = %frame.cmd, %sid, attempt, ">> gateway");
            match self.exchange_once(&bytes, expect, sid).await {
                Err(GatewayError::CommandTimeout { .. }) if attempt < COMMAND_RETRIES => {
                    attempt += 1;
                    warn!(gateway = %self.sid, cmd = %frame.cmd, %sid, "no reply, retrying");
                }
                other => return other,
            }
        }
    }

    async fn exchange_once(
        &self,
        bytes: &[u8],
        expect: &str,
        sid: &str,
    ) -> Result<Frame, GatewayError> {
        let id = correlation_id(expect, sid);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(e) = self.socket.send_to(bytes, self.addr()).await {
            self.pending.lock().await.remove(&id);
            return Err(e.into());
        }

        let result = tokio::time::timeout(self.timeout, rx).await;

        // Clean up pending entry on any exit path.
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(Reply::Frame(frame))) => Ok(frame),
            Ok(Ok(Reply::Malformed(reason))) => Err(GatewayError::Protocol(reason)),
            Ok(Err(_)) => Err(GatewayError::Closed),
            Err(_) => Err(GatewayError::CommandTimeout {
                cmd: expect.to_string(),
                sid: sid.to_string(),
            }),
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
    }
}

/// Builds a `write` frame in the layout the hub's protocol version expects.
pub fn build_write(
    proto: ProtoVersion,
    sid: &str,
    model: Option<&str>,
    short_id: u64,
    fields: &Payload,
    signature: String,
) -> Frame {
    let mut frame = Frame::for_sid("write", sid);
    frame.model = model.map(str::to_string);

    match proto {
        ProtoVersion::V1 => {
            let mut data = fields.clone();
            data.insert("key".into(), Value::String(signature));
            frame.short_id = Some(Value::from(short_id));
            frame.data = Some(Value::Object(data));
        }
        ProtoVersion::V2 => {
            frame.key = Some(signature);
            frame.params = Some(
                fields
                    .iter()
                    .map(|(k, v)| {
                        let mut param = Payload::new();
                        param.insert(k.clone(), v.clone());
                        Value::Object(param)
                    })
                    .collect(),
            );
        }
    }
    frame
}

fn expect_cmd(frame: Frame, expected: &str) -> Result<Frame, GatewayError> {
    if frame.cmd == expected {
        Ok(frame)
    } else {
        Err(unexpected(expected, &frame))
    }
}

fn unexpected(expected: &str, frame: &Frame) -> GatewayError {
    GatewayError::Protocol(format!(
        "non matching response, expecting {expected} but got {}",
        frame.cmd
    ))
}
