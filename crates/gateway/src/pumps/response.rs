//! Session response pump: routes hub replies to pending commands.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use aqara_protocol::Frame;
use aqara_protocol::constants::SOCKET_BUFSIZE;

use crate::session::TokenCell;

/// Pending commands keyed by correlation id (`"<reply cmd>:<sid>"`).
pub(crate) type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>;

/// What the pump hands back to a waiting command.
#[derive(Debug)]
pub(crate) enum Reply {
    Frame(Frame),
    Malformed(String),
}

/// Reads replies from the session socket until cancelled.
///
/// Datagrams from hosts other than the hub are ignored. Any reply carrying
/// a `token` refreshes the session token before the waiting command is
/// woken, so the caller always observes the newest token.
pub(crate) async fn response_pump(
    socket: Arc<UdpSocket>,
    hub: Ipv4Addr,
    pending: PendingMap,
    token: Arc<TokenCell>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; SOCKET_BUFSIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, from)) => {
                        if from.ip() != IpAddr::V4(hub) {
                            trace!(%from, "ignoring datagram from foreign host");
                            continue;
                        }
                        handle_reply(&buf[..n], &pending, &token).await;
                    }
                    Err(e) => {
                        debug!("session socket receive error: {e}");
                    }
                }
            }
        }
    }

    trace!(%hub, "response pump stopped");
}

/// Handles one datagram from the hub.
pub(crate) async fn handle_reply(bytes: &[u8], pending: &PendingMap, token: &TokenCell) {
    let frame = match Frame::parse(bytes) {
        Ok(f) => f,
        Err(e) => {
            warn!("malformed reply from gateway: {e}");
            // At most one command is outstanding per hub; fail it now
            // instead of letting it run into the timeout.
            let mut map = pending.lock().await;
            for (_, tx) in map.drain() {
                let _ = tx.send(Reply::Malformed(e.to_string()));
            }
            return;
        }
    };

    trace!(cmd = %frame.cmd, sid = ?frame.sid, "<< gateway");

    if let Some(t) = &frame.token {
        token.set(t.clone());
    }

    let mut map = pending.lock().await;
    match route(&map, &frame) {
        Some(id) => {
            if let Some(tx) = map.remove(&id) {
                let _ = tx.send(Reply::Frame(frame));
            }
        }
        None => debug!(cmd = %frame.cmd, sid = ?frame.sid, "unsolicited reply, dropping"),
    }
}

/// Picks the pending entry a reply belongs to.
///
/// Exact `cmd:sid` first. Otherwise the reply may use the other protocol
/// version's name for the same command (`read_ack`/`read_rsp`) or a
/// zero-padded sid, but the sid must still match. A device list reply
/// without a sid can only answer the device list request.
fn route<V>(map: &HashMap<String, V>, frame: &Frame) -> Option<String> {
    let exact = frame.correlation_id();
    if map.contains_key(&exact) {
        return Some(exact);
    }

    let kind = reply_kind(&frame.cmd);
    let sid = frame.sid.as_deref().unwrap_or("");
    map.keys()
        .find(|key| {
            let (cmd, expected_sid) = key.split_once(':').unwrap_or((key.as_str(), ""));
            if reply_kind(cmd) != kind {
                return false;
            }
            if sid.is_empty() {
                return kind == "id_list";
            }
            same_sid(expected_sid, sid)
        })
        .cloned()
}

/// Reply command with the version-specific name folded away.
fn reply_kind(cmd: &str) -> &str {
    match cmd {
        "read_ack" | "read_rsp" => "read",
        "write_ack" | "write_rsp" => "write",
        "get_id_list_ack" | "discovery_rsp" => "id_list",
        other => other,
    }
}

/// Hubs drop leading zeros of short sids.
fn same_sid(a: &str, b: &str) -> bool {
    format!("{a:0>12}") == format!("{b:0>12}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqara_protocol::envelope::correlation_id;

    fn pending() -> PendingMap {
        Arc::new(Mutex::new(HashMap::new()))
    }

    #[tokio::test]
    async fn routes_exact_match_and_updates_token() {
        let pending = pending();
        let token = TokenCell::default();
        let (tx, rx) = oneshot::channel();
        pending
            .lock()
            .await
            .insert(correlation_id("write_ack", "158d0001a2b3c4"), tx);

        handle_reply(
            br#"{"cmd":"write_ack","sid":"158d0001a2b3c4","token":"abcdefghijklmnop","data":"{}"}"#,
            &pending,
            &token,
        )
        .await;

        match rx.await.unwrap() {
            Reply::Frame(f) => assert_eq!(f.cmd, "write_ack"),
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(token.get().as_deref(), Some("abcdefghijklmnop"));
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn routes_v2_reply_by_sid() {
        let pending = pending();
        let token = TokenCell::default();
        let (tx, rx) = oneshot::channel();
        pending
            .lock()
            .await
            .insert(correlation_id("read_ack", "7811dcb07917"), tx);

        handle_reply(
            br#"{"cmd":"read_rsp","sid":"7811dcb07917","params":[{"proto_version":"2.0.1"}]}"#,
            &pending,
            &token,
        )
        .await;

        assert!(matches!(rx.await.unwrap(), Reply::Frame(f) if f.cmd == "read_rsp"));
    }

    #[tokio::test]
    async fn reply_for_another_device_is_not_routed() {
        let pending = pending();
        let token = TokenCell::default();
        let (tx, mut rx) = oneshot::channel();
        pending
            .lock()
            .await
            .insert(correlation_id("read_ack", "158d00000000bb"), tx);

        handle_reply(
            br#"{"cmd":"read_ack","sid":"158d00000000aa","data":"{\"status\":\"open\"}"}"#,
            &pending,
            &token,
        )
        .await;
        handle_reply(
            br#"{"cmd":"read_rsp","sid":"158d00000000aa","params":[{"status":"open"}]}"#,
            &pending,
            &token,
        )
        .await;

        assert_eq!(pending.lock().await.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn routes_reply_with_unpadded_sid() {
        let pending = pending();
        let token = TokenCell::default();
        let (tx, rx) = oneshot::channel();
        pending
            .lock()
            .await
            .insert(correlation_id("read_ack", "00158d0001a2"), tx);

        handle_reply(br#"{"cmd":"read_ack","sid":"158d0001a2","data":"{}"}"#, &pending, &token).await;

        assert!(matches!(rx.await.unwrap(), Reply::Frame(f) if f.cmd == "read_ack"));
    }

    #[tokio::test]
    async fn sidless_device_list_reply_answers_list_request() {
        let pending = pending();
        let token = TokenCell::default();
        let (tx, rx) = oneshot::channel();
        pending
            .lock()
            .await
            .insert(correlation_id("get_id_list_ack", "7811dcb07917"), tx);

        handle_reply(
            br#"{"cmd":"get_id_list_ack","token":"1234567890abcdef","data":"[]"}"#,
            &pending,
            &token,
        )
        .await;

        assert!(matches!(rx.await.unwrap(), Reply::Frame(_)));
    }

    #[tokio::test]
    async fn malformed_reply_fails_pending_command() {
        let pending = pending();
        let token = TokenCell::default();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(correlation_id("read_ack", "s1"), tx);

        handle_reply(b"not json {{{", &pending, &token).await;

        assert!(matches!(rx.await.unwrap(), Reply::Malformed(_)));
    }

    #[tokio::test]
    async fn unsolicited_reply_is_dropped() {
        let pending = pending();
        let token = TokenCell::default();
        let (tx, _rx) = oneshot::channel();
        pending.lock().await.insert(correlation_id("read_ack", "s1"), tx);

        handle_reply(br#"{"cmd":"write_ack","sid":"s2"}"#, &pending, &token).await;

        assert_eq!(pending.lock().await.len(), 1);
    }
}
