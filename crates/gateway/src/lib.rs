//! Gateway sessions and push-event fan-out.
//!
//! Provides the per-hub UDP session (signed writes, correlated reads),
//! the sub-device subscription registry, and the multicast listener that
//! routes hub reports to subscribers.

pub mod listener;
pub(crate) mod pumps;
pub mod session;
pub(crate) mod socket;
pub mod subscriptions;
pub mod table;
pub mod types;

pub use listener::PushListener;
pub use session::{Gateway, GatewayParams};
pub use subscriptions::{PushCallback, SubscriptionId, Subscriptions};
pub use table::GatewayTable;
pub use types::{DeviceInfo, Interface, SessionState};

use aqara_protocol::{CipherError, FrameError};

/// Errors from gateway sessions and the push listener.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("gateway {sid} has no key configured, it is read-only")]
    NoKey { sid: String },

    #[error("invalid key: {0}")]
    InvalidKey(#[from] CipherError),

    #[error("{cmd} to {sid} timed out")]
    CommandTimeout { cmd: String, sid: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("interface error: {0}")]
    Interface(String),

    #[error("session closed")]
    Closed,
}

impl From<FrameError> for GatewayError {
    fn from(e: FrameError) -> Self {
        GatewayError::Protocol(e.to_string())
    }
}
