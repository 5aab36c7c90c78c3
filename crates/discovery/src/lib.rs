pub mod client;
pub mod types;

// Re-export primary types.
pub use client::GatewayDiscovery;
pub use types::{DiscoveryEvent, EventType, GatewayConfig, validate};

/// Errors for discovery operations.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("could not resolve {host}: {reason}")]
    DnsResolution { host: String, reason: String },

    #[error("interface error: {0}")]
    Interface(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gateway error: {0}")]
    Gateway(#[from] aqara_gateway::GatewayError),
}
