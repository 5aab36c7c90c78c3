//! Aqara gateway bridge.
//!
//! [`Bridge`] owns the hub sessions, the device registry and the push
//! listener; the gateway services are methods on it.

pub mod app;
pub mod bridge;
pub mod config;
pub mod services;

pub use bridge::Bridge;
pub use config::Config;
pub use services::ServiceError;
