//! Aqara gateway bridge entry point.

use aqara_bridge::{Config, app};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting aqara bridge"
    );

    let config = Config::load()?;
    tracing::info!(
        interface = %config.interface,
        gateways = config.gateways.len(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("bridge shut down cleanly");
    Ok(())
}
