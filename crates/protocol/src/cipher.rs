//! Write-command signing.
//!
//! A hub accepts a `write` only if its `key` field carries the current
//! session token encrypted with the hub's 16-character password:
//! AES-128-CBC, the vendor's fixed IV, one block, no padding.

use aes::Aes128;
use aes::cipher::{BlockEncryptMut, KeyIvInit, block_padding::NoPadding};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;

/// Fixed initialization vector published with the LAN protocol.
pub const GATEWAY_IV: [u8; 16] = [
    0x17, 0x99, 0x6d, 0x09, 0x3d, 0x28, 0xdd, 0xb3, 0xba, 0x69, 0x5a, 0x2e, 0x6f, 0x58, 0x56, 0x2e,
];

/// Required length of both the hub key and the token.
pub const BLOCK_LEN: usize = 16;

/// Errors from the command cipher.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("invalid {what} length: expected {BLOCK_LEN} bytes, got {len}")]
    InvalidKey { what: &'static str, len: usize },
}

/// Encrypts `token` with `gateway_key`.
pub fn encrypt_token(gateway_key: &[u8], token: &[u8]) -> Result<[u8; BLOCK_LEN], CipherError> {
    if gateway_key.len() != BLOCK_LEN {
        return Err(CipherError::InvalidKey {
            what: "key",
            len: gateway_key.len(),
        });
    }
    if token.len() != BLOCK_LEN {
        return Err(CipherError::InvalidKey {
            what: "token",
            len: token.len(),
        });
    }

    let mut block = [0u8; BLOCK_LEN];
    block.copy_from_slice(token);

    let encryptor = Aes128CbcEnc::new_from_slices(gateway_key, &GATEWAY_IV).map_err(|_| {
        CipherError::InvalidKey {
            what: "key",
            len: gateway_key.len(),
        }
    })?;
    encryptor
        .encrypt_padded_mut::<NoPadding>(&mut block, BLOCK_LEN)
        .map_err(|_| CipherError::InvalidKey {
            what: "token",
            len: token.len(),
        })?;

    Ok(block)
}

/// Returns the lowercase hex signature placed in a write's `key` field.
pub fn signed_key(gateway_key: &str, token: &str) -> Result<String, CipherError> {
    encrypt_token(gateway_key.as_bytes(), token.as_bytes()).map(hex::encode)
}
