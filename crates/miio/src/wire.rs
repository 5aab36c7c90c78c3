//! miIO packet format.
//!
//! # Wire format
//!
//! ```text
//! HEADER (32 bytes, big-endian):
//!   [2 bytes: magic 0x2131]
//!   [2 bytes: packet length, header included]
//!   [4 bytes: unknown, 0 for requests, 0xffffffff for hello]
//!   [4 bytes: device id]
//!   [4 bytes: stamp, seconds since device boot]
//!   [16 bytes: md5(header with token in this slot || payload)]
//! PAYLOAD: AES-128-CBC(JSON), absent for hello
//! ```

use md5::{Digest, Md5};

use crate::error::RpcError;
use crate::token::MiioToken;

pub const MAGIC: u16 = 0x2131;
pub const HEADER_LEN: usize = 32;

/// Parsed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length: u16,
    pub unknown: u32,
    pub device_id: u32,
    pub stamp: u32,
    pub checksum: [u8; 16],
}

impl Header {
    pub fn parse(packet: &[u8]) -> Result<Self, RpcError> {
        if packet.len() < HEADER_LEN {
            return Err(RpcError::Protocol(format!(
                "packet too short: {} bytes",
                packet.len()
            )));
        }
        let magic = u16::from_be_bytes([packet[0], packet[1]]);
        if magic != MAGIC {
            return Err(RpcError::Protocol(format!("bad magic {magic:#06x}")));
        }

        let mut checksum = [0u8; 16];
        checksum.copy_from_slice(&packet[16..32]);
        Ok(Self {
            length: u16::from_be_bytes([packet[2], packet[3]]),
            unknown: be_u32(&packet[4..8]),
            device_id: be_u32(&packet[8..12]),
            stamp: be_u32(&packet[12..16]),
            checksum,
        })
    }

    fn prefix(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..2].copy_from_slice(&MAGIC.to_be_bytes());
        out[2..4].copy_from_slice(&self.length.to_be_bytes());
        out[4..8].copy_from_slice(&self.unknown.to_be_bytes());
        out[8..12].copy_from_slice(&self.device_id.to_be_bytes());
        out[12..16].copy_from_slice(&self.stamp.to_be_bytes());
        out
    }
}

/// The handshake packet that makes a device reveal its id and stamp.
pub fn hello_packet() -> [u8; HEADER_LEN] {
    let mut packet = [0xffu8; HEADER_LEN];
    packet[0..2].copy_from_slice(&MAGIC.to_be_bytes());
    packet[2..4].copy_from_slice(&(HEADER_LEN as u16).to_be_bytes());
    packet
}

/// Encrypts `payload` and frames it for `device_id`.
pub fn encode(
    token: &MiioToken,
    device_id: u32,
    stamp: u32,
    payload: &[u8],
) -> Result<Vec<u8>, RpcError> {
    let encrypted = token.encrypt(payload);
    let length = u16::try_from(HEADER_LEN + encrypted.len())
        .map_err(|_| RpcError::Protocol(format!("payload too large: {} bytes", payload.len())))?;

    let header = Header {
        length,
        unknown: 0,
        device_id,
        stamp,
        checksum: [0; 16],
    };
    let prefix = header.prefix();
    let checksum = checksum(&prefix, token, &encrypted);

    let mut packet = Vec::with_capacity(usize::from(length));
    packet.extend_from_slice(&prefix);
    packet.extend_from_slice(&checksum);
    packet.extend_from_slice(&encrypted);
    Ok(packet)
}

/// Verifies the checksum and decrypts the payload.
pub fn decode(token: &MiioToken, packet: &[u8]) -> Result<(Header, Vec<u8>), RpcError> {
    let header = Header::parse(packet)?;
    let length = usize::from(header.length);
    if length < HEADER_LEN || length > packet.len() {
        return Err(RpcError::Protocol(format!(
            "length field {length} does not match packet of {} bytes",
            packet.len()
        )));
    }

    let encrypted = &packet[HEADER_LEN..length];
    if encrypted.is_empty() {
        return Ok((header, Vec::new()));
    }
    if checksum(&header.prefix(), token, encrypted) != header.checksum {
        return Err(RpcError::Protocol("checksum mismatch".into()));
    }

    let mut payload = token.decrypt(encrypted)?;
    // Some firmware terminates the JSON with NULs.
    while payload.last() == Some(&0) {
        payload.pop();
    }
    Ok((header, payload))
}

fn checksum(prefix: &[u8; 16], token: &MiioToken, encrypted: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(prefix);
    hasher.update(token.as_bytes());
    hasher.update(encrypted);
    hasher.finalize().into()
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
