//! Wire protocol for the Aqara gateway LAN API.
//!
//! JSON datagrams exchanged with the hub over UDP (discovery, reports,
//! read/write commands) plus the AES key signing used for writes.

pub mod cipher;
pub mod constants;
pub mod envelope;
pub mod types;

pub use cipher::{CipherError, encrypt_token, signed_key};
pub use envelope::{Frame, FrameError, Payload};
pub use types::{ProtoVersion, is_gateway_model, normalize_sid};
