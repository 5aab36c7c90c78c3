//! Sub-device model table, per-kind decoders and the availability tracker.

pub mod battery;
pub mod models;
pub mod registry;

pub use battery::{Battery, battery_percent, parse_battery};
pub use models::{Command, DeviceKind, DeviceState, ModelDescriptor, ModelRegistry};
pub use registry::{DeviceEvent, DeviceKey, DeviceRegistry, DeviceSnapshot};

/// Errors from the device registry.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device {sid} has unsupported model {model}")]
    UnsupportedModel { model: String, sid: String },
}
