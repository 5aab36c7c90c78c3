//! Application orchestrator: wires discovery, sessions, the registry and
//! the push listener together.

use std::sync::Arc;
use std::time::Duration;

use aqara_devices::DeviceEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::Bridge;
use crate::config::Config;

/// Runs the bridge until shutdown is requested.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // -- Discovery, sessions, registry, listener --
    let bridge = Arc::new(Bridge::start(&config).await?);

    // -- Host event feed --
    if let Some(events) = bridge.registry().take_events() {
        tokio::spawn(log_events(events, cancel.clone()));
    }

    // -- Polling --
    let poll = tokio::spawn(poll_loop(
        Arc::clone(&bridge),
        Duration::from_secs(config.poll_interval_secs.max(1)),
        cancel.clone(),
    ));

    tracing::info!(
        gateways = bridge.table().len(),
        devices = bridge.registry().len(),
        "bridge ready"
    );

    // -- Main loop: wait for shutdown --
    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!("shutdown signal received");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
    }

    // -- Graceful shutdown --
    tracing::info!("stopping services...");
    cancel.cancel();
    let _ = poll.await;
    bridge.shutdown().await;

    Ok(())
}

async fn poll_loop(bridge: Arc<Bridge>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; devices were just read.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let answered = bridge.poll_once().await;
                tracing::trace!(answered, "poll round finished");
            }
        }
    }
}

async fn log_events(mut events: mpsc::Receiver<DeviceEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(e) => e,
                None => break,
            },
        };
        match event {
            DeviceEvent::Updated(snapshot) => tracing::info!(
                device = %snapshot.key,
                model = %snapshot.model,
                available = snapshot.available,
                state = %serde_json::to_string(&snapshot.state).unwrap_or_default(),
                battery = ?snapshot.battery_level,
                "device updated"
            ),
            DeviceEvent::Unavailable(key) => tracing::warn!(device = %key, "device unavailable"),
        }
    }
}
