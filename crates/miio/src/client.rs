//! miIO UDP transport.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use rand::Rng;
use serde_json::{Value, json};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::RpcError;
use crate::rpc::{RpcFuture, RpcTransport};
use crate::token::MiioToken;
use crate::wire::{self, Header};
use crate::{MIIO_PORT, RPC_TIMEOUT};

/// Handshake state learned from the device's hello reply.
#[derive(Debug, Clone, Copy)]
struct Handshake {
    device_id: u32,
    stamp: u32,
    at: Instant,
}

#[derive(Debug)]
struct Session {
    handshake: Option<Handshake>,
    next_id: u32,
}

/// Sends miIO commands to one device over UDP.
///
/// The hello handshake runs lazily before the first command and again
/// after a timeout. Calls are serialized.
pub struct MiioTransport {
    addr: SocketAddr,
    token: MiioToken,
    timeout: Duration,
    session: Mutex<Session>,
}

impl MiioTransport {
    pub fn new(ip: Ipv4Addr, token: MiioToken) -> Self {
        Self::with_addr(SocketAddr::V4(SocketAddrV4::new(ip, MIIO_PORT)), token)
    }

    /// Transport to a non-standard address.
    pub fn with_addr(addr: SocketAddr, token: MiioToken) -> Self {
        Self {
            addr,
            token,
            timeout: RPC_TIMEOUT,
            session: Mutex::new(Session {
                handshake: None,
                next_id: rand::thread_rng().gen_range(1..1000),
            }),
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sends `method` and returns the `result` member of the reply.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let mut session = self.session.lock().await;
        let socket = UdpSocket::bind(unspecified(self.addr)).await?;

        let handshake = match session.handshake {
            Some(h) => h,
            None => {
                let h = self.hello(&socket).await?;
                session.handshake = Some(h);
                h
            }
        };

        let id = session.next_id;
        session.next_id = session.next_id.wrapping_add(1).max(1);

        let request = serde_json::to_vec(&json!({
            "id": id,
            "method": method,
            "params": params,
        }))?;
        let elapsed = u32::try_from(handshake.at.elapsed().as_secs()).unwrap_or(u32::MAX);
        let stamp = handshake.stamp.wrapping_add(elapsed).wrapping_add(1);
        let packet = wire::encode(&self.token, handshake.device_id, stamp, &request)?;

        debug!(addr = %self.addr, %method, id, ">> miio");
        socket.send_to(&packet, self.addr).await?;

        match self.receive_reply(&socket, id).await {
            Err(RpcError::Timeout) => {
                // Stale stamp or device rebooted; redo the handshake next time.
                session.handshake = None;
                Err(RpcError::Timeout)
            }
            other => other,
        }
    }

    async fn hello(&self, socket: &UdpSocket) -> Result<Handshake, RpcError> {
        socket.send_to(&wire::hello_packet(), self.addr).await?;

        let mut buf = [0u8; 1024];
        let deadline = Instant::now() + self.timeout;
        loop {
            let (n, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
                .await
                .map_err(|_| RpcError::Timeout)??;
            if from != self.addr {
                continue;
            }
            let header = Header::parse(&buf[..n])?;
            trace!(addr = %self.addr, device_id = header.device_id, stamp = header.stamp, "miio hello");
            return Ok(Handshake {
                device_id: header.device_id,
                stamp: header.stamp,
                at: Instant::now(),
            });
        }
    }

    async fn receive_reply(&self, socket: &UdpSocket, id: u32) -> Result<Value, RpcError> {
        let mut buf = vec![0u8; 4096];
        let deadline = Instant::now() + self.timeout;
        loop {
            let (n, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
                .await
                .map_err(|_| RpcError::Timeout)??;
            if from != self.addr {
                continue;
            }

            let (_, payload) = wire::decode(&self.token, &buf[..n])?;
            if payload.is_empty() {
                continue;
            }
            let reply: Value = serde_json::from_slice(&payload)?;
            trace!(addr = %self.addr, %reply, "<< miio");

            if reply.get("id").and_then(Value::as_u64) != Some(u64::from(id)) {
                debug!(addr = %self.addr, expected = id, "ignoring reply for another request");
                continue;
            }
            return parse_reply(reply);
        }
    }
}

impl RpcTransport for MiioTransport {
    fn command<'a>(&'a self, method: &'a str, params: Value) -> RpcFuture<'a> {
        Box::pin(self.send(method, params))
    }
}

fn parse_reply(mut reply: Value) -> Result<Value, RpcError> {
    if let Some(error) = reply.get("error") {
        return Err(RpcError::Device {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(-1),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    reply
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| RpcError::Protocol(format!("reply without result: {reply}")))
}

fn unspecified(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOKEN: &str = "00112233445566778899aabbccddeeff";
    const DEVICE_ID: u32 = 0x0102_0304;

    /// Loopback device answering hello and echoing `result` per method.
    async fn fake_device(
        respond: impl Fn(&Value) -> Option<Value> + Send + 'static,
    ) -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let hellos = Arc::new(AtomicUsize::new(0));
        let h = hellos.clone();
        let token = MiioToken::from_hex(TOKEN).unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let packet = &buf[..n];
                if packet == wire::hello_packet() {
                    h.fetch_add(1, Ordering::SeqCst);
                    let mut reply = [0u8; 32];
                    reply[..16].copy_from_slice(&wire::encode(&token, DEVICE_ID, 500, b"").unwrap()[..16]);
                    reply[2..4].copy_from_slice(&32u16.to_be_bytes());
                    socket.send_to(&reply, from).await.unwrap();
                    continue;
                }

                let (header, payload) = wire::decode(&token, packet).unwrap();
                assert_eq!(header.device_id, DEVICE_ID);
                assert!(header.stamp > 500);
                let request: Value = serde_json::from_slice(&payload).unwrap();
                if let Some(reply) = respond(&request) {
                    let body = serde_json::to_vec(&reply).unwrap();
                    let out = wire::encode(&token, DEVICE_ID, header.stamp, &body).unwrap();
                    socket.send_to(&out, from).await.unwrap();
                }
            }
        });

        (addr, hellos)
    }

    fn transport(addr: SocketAddr) -> MiioTransport {
        let mut t = MiioTransport::with_addr(addr, MiioToken::from_hex(TOKEN).unwrap());
        t.set_timeout(Duration::from_millis(200));
        t
    }

    #[tokio::test]
    async fn command_round_trip_and_ids_increment() {
        let (addr, hellos) = fake_device(|req| {
            Some(json!({"id": req["id"], "result": [req["method"], req["id"]]}))
        })
        .await;
        let t = transport(addr);

        let first = t.send("play_fm", json!(["on"])).await.unwrap();
        let second = t.send("play_fm", json!(["off"])).await.unwrap();
        assert_eq!(first[0], "play_fm");
        assert_eq!(second[1].as_u64().unwrap(), first[1].as_u64().unwrap() + 1);
        assert_eq!(hellos.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn device_error_is_surfaced() {
        let (addr, _) = fake_device(|req| {
            Some(json!({"id": req["id"], "error": {"code": -5001, "message": "invalid arg"}}))
        })
        .await;
        let t = transport(addr);

        let err = t.send("volume_ctrl_fm", json!(["500"])).await.unwrap_err();
        assert!(matches!(err, RpcError::Device { code: -5001, .. }));
    }

    #[tokio::test]
    async fn silent_device_times_out_and_rehandshakes() {
        let (addr, hellos) = fake_device(|_| None).await;
        let t = transport(addr);

        assert!(matches!(t.send("get_prop_fm", json!([])).await, Err(RpcError::Timeout)));
        assert!(matches!(t.send("get_prop_fm", json!([])).await, Err(RpcError::Timeout)));
        assert_eq!(hellos.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reply_without_result() {
        assert!(matches!(parse_reply(json!({"id": 1})), Err(RpcError::Protocol(_))));
        assert_eq!(parse_reply(json!({"id": 1, "result": ["ok"]})).unwrap(), json!(["ok"]));
    }
}
