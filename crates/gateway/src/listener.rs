//! Multicast push listener.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use aqara_protocol::constants::{MULTICAST_ADDRESS, MULTICAST_PORT};

use crate::GatewayError;
use crate::pumps::push::push_pump;
use crate::socket;
use crate::table::GatewayTable;
use crate::types::Interface;

/// Receives hub reports on the multicast group and fans them out to the
/// sessions in a [`GatewayTable`].
pub struct PushListener {
    table: GatewayTable,
    interface: Interface,
    group: Ipv4Addr,
    port: u16,
    cancel: Mutex<CancellationToken>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PushListener {
    pub fn new(table: GatewayTable, interface: Interface) -> Self {
        Self {
            table,
            interface,
            group: MULTICAST_ADDRESS,
            port: MULTICAST_PORT,
            cancel: Mutex::new(CancellationToken::new()),
            handle: Mutex::new(None),
        }
    }

    /// Overrides the multicast port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Joins the multicast group and starts the receive loop.
    ///
    /// Calling `start` on a running listener is a no-op.
    pub async fn start(&self) -> Result<(), GatewayError> {
        if self.is_running().await {
            return Ok(());
        }
        let socket = socket::multicast_socket(self.interface, self.group, self.port)?;
        info!(group = %self.group, port = self.port, interface = %self.interface, "push listener started");
        self.start_with_socket(socket).await;
        Ok(())
    }

    /// Starts the receive loop on an already bound socket.
    pub async fn start_with_socket(&self, socket: UdpSocket) {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().await = cancel.clone();
        *handle = Some(tokio::spawn(push_pump(
            Arc::new(socket),
            self.table.clone(),
            cancel,
        )));
    }

    /// Stops the receive loop and waits for it to exit. Idempotent.
    pub async fn stop(&self) {
        self.cancel.lock().await.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
            info!("push listener stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for PushListener {
    fn drop(&mut self) {
        if let Ok(cancel) = self.cancel.try_lock() {
            cancel.cancel();
        }
        if let Ok(mut handle) = self.handle.try_lock() {
            if let Some(h) = handle.take() {
                h.abort();
            }
        }
    }
}
