//! Multicast push pump: routes hub reports and heartbeats to sessions.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use aqara_protocol::constants::SOCKET_BUFSIZE;
use aqara_protocol::{Frame, is_gateway_model};

use crate::table::GatewayTable;

/// Outcome of handling one multicast datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    /// Hub heartbeat; the session token was refreshed.
    Token,
    /// Report forwarded to the session; `true` if it carried a payload.
    Pushed(bool),
    /// Not routable.
    Dropped,
}

/// Receives multicast datagrams until cancelled.
///
/// A bad datagram never stops the loop.
pub(crate) async fn push_pump(
    socket: Arc<UdpSocket>,
    table: GatewayTable,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; SOCKET_BUFSIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, from)) => {
                        handle_datagram(&buf[..n], from, &table);
                    }
                    Err(e) => {
                        error!("cannot process multicast message: {e}");
                    }
                }
            }
        }
    }

    debug!("push listener stopped");
}

/// Routes one datagram to the session of the hub that sent it.
pub(crate) fn handle_datagram(bytes: &[u8], from: SocketAddr, table: &GatewayTable) -> Routed {
    let frame = match Frame::parse(bytes) {
        Ok(f) => f,
        Err(e) => {
            error!(%from, "cannot process multicast message: {e}");
            return Routed::Dropped;
        }
    };

    let IpAddr::V4(ip) = from.ip() else {
        debug!(%from, "ignoring IPv6 sender");
        return Routed::Dropped;
    };

    let Some(gateway) = table.get(ip) else {
        error!(%ip, cmd = %frame.cmd, "unknown gateway ip");
        return Routed::Dropped;
    };

    trace!(%ip, cmd = %frame.cmd, sid = ?frame.sid, "<< multicast");

    match frame.cmd.as_str() {
        "heartbeat" if frame.model.as_deref().is_some_and(is_gateway_model) => {
            match &frame.token {
                Some(token) => {
                    gateway.update_token(token);
                    Routed::Token
                }
                None => {
                    debug!(%ip, "gateway heartbeat without token");
                    gateway.touch();
                    Routed::Dropped
                }
            }
        }
        "report" | "heartbeat" => Routed::Pushed(gateway.push(&frame)),
        other => {
            warn!(%ip, cmd = other, "unknown multicast data");
            Routed::Dropped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use aqara_protocol::Payload;

    use crate::session::{Gateway, GatewayParams};

    fn hub_addr() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 9898))
    }

    async fn table_with_hub() -> (GatewayTable, Arc<Gateway>) {
        let table = GatewayTable::new();
        let gw = Gateway::connect(GatewayParams::new(Ipv4Addr::LOCALHOST, 9898, "7811dcb07917"))
            .await
            .unwrap();
        table.insert(gw.clone());
        (table, gw)
    }

    #[tokio::test]
    async fn heartbeat_refreshes_token() {
        let (table, gw) = table_with_hub().await;

        let routed = handle_datagram(
            br#"{"cmd":"heartbeat","model":"gateway","sid":"7811dcb07917","token":"1234567890abcdef","data":"{\"ip\":\"127.0.0.1\"}"}"#,
            hub_addr(),
            &table,
        );

        assert_eq!(routed, Routed::Token);
        assert_eq!(gw.get_token().as_deref(), Some("1234567890abcdef"));
    }

    #[tokio::test]
    async fn report_reaches_subscriber() {
        let (table, gw) = table_with_hub().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        gw.subscribe(
            "158d0001a2b3c4",
            Arc::new(move |p: &Payload, _: &Frame| {
                assert_eq!(p["status"], "open");
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let routed = handle_datagram(
            br#"{"cmd":"report","model":"magnet","sid":"158d0001a2b3c4","data":"{\"status\":\"open\"}"}"#,
            hub_addr(),
            &table,
        );

        assert_eq!(routed, Routed::Pushed(true));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_sender_is_dropped() {
        let (table, _gw) = table_with_hub().await;
        let routed = handle_datagram(
            br#"{"cmd":"report","sid":"158d0001a2b3c4","data":"{}"}"#,
            SocketAddr::from((Ipv4Addr::new(10, 9, 9, 9), 9898)),
            &table,
        );
        assert_eq!(routed, Routed::Dropped);
    }

    #[tokio::test]
    async fn invalid_json_does_not_stop_the_pump() {
        let (table, gw) = table_with_hub().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        gw.subscribe(
            "158d0001a2b3c4",
            Arc::new(move |_: &Payload, _: &Frame| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let recv = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let target = recv.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(push_pump(recv, table, cancel.clone()));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"{not json", target).await.unwrap();
        sender
            .send_to(
                br#"{"cmd":"report","model":"motion","sid":"158d0001a2b3c4","data":"{\"status\":\"motion\"}"}"#,
                target,
            )
            .await
            .unwrap();

        for _ in 0..50 {
            if hits.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
