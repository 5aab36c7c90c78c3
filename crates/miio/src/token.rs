//! Device token and the payload cipher derived from it.

use aes::Aes128;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};

use crate::error::RpcError;

/// Token length in bytes (32 hex characters).
pub const TOKEN_LEN: usize = 16;

type Encryptor = cbc::Encryptor<Aes128>;
type Decryptor = cbc::Decryptor<Aes128>;

/// A 16-byte device token with its derived AES key and IV.
///
/// `key = md5(token)`, `iv = md5(key || token)`.
#[derive(Clone, PartialEq, Eq)]
pub struct MiioToken {
    token: [u8; TOKEN_LEN],
    key: [u8; 16],
    iv: [u8; 16],
}

impl MiioToken {
    /// Parses the 32-character hex form.
    pub fn from_hex(token: &str) -> Result<Self, RpcError> {
        let bytes = hex::decode(token.trim()).map_err(|e| RpcError::Token(e.to_string()))?;
        let token: [u8; TOKEN_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            RpcError::Token(format!("expected {TOKEN_LEN} bytes, got {}", b.len()))
        })?;
        Ok(Self::new(token))
    }

    pub fn new(token: [u8; TOKEN_LEN]) -> Self {
        let key: [u8; 16] = Md5::digest(token).into();
        let mut hasher = Md5::new();
        hasher.update(key);
        hasher.update(token);
        let iv: [u8; 16] = hasher.finalize().into();
        Self { token, key, iv }
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.token
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.token)
    }

    /// AES-128-CBC with PKCS#7 padding.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Encryptor::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, RpcError> {
        Decryptor::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| RpcError::Protocol("cannot decrypt payload, wrong token?".into()))
    }
}

impl std::fmt::Debug for MiioToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MiioToken(..)")
    }
}
