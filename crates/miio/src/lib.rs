//! miIO auxiliary RPC channel.
//!
//! The hub exposes radio and identity calls over the vendor's encrypted
//! UDP RPC. [`AuxClient`] wraps those calls over any [`RpcTransport`];
//! [`MiioTransport`] is the UDP implementation.
//!
//! # Wire format
//!
//! See [`wire`] module for the packet layout.

pub mod client;
pub mod error;
pub mod rpc;
pub mod token;
pub mod wire;

pub use client::MiioTransport;
pub use error::RpcError;
pub use rpc::{AuxClient, FmStatus, HubInfo, RpcFuture, RpcTransport};
pub use token::MiioToken;

use std::time::Duration;

/// UDP port of the miIO service.
pub const MIIO_PORT: u16 = 54321;

/// Timeout for one RPC round trip.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);
