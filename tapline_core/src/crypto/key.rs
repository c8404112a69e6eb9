use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use std::fmt;

use crate::error::{TunnelError, TunnelResult};

/// Length of the raw key material.
pub const KEY_SIZE: usize = 32;
/// Length of each half of the key.
pub const SUBKEY_SIZE: usize = 16;

/// Symmetric session key.
///
/// The first 16 bytes key AES-128, the last 16 bytes key HMAC-SHA256. The
/// split is fixed and both peers must hold the same 32 bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelKey {
    cipher: [u8; SUBKEY_SIZE],
    auth: [u8; SUBKEY_SIZE],
}

impl TunnelKey {
    /// Build a key from exactly [`KEY_SIZE`] raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> TunnelResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(TunnelError::KeyLength(bytes.len()));
        }
        let mut cipher = [0u8; SUBKEY_SIZE];
        let mut auth = [0u8; SUBKEY_SIZE];
        cipher.copy_from_slice(&bytes[..SUBKEY_SIZE]);
        auth.copy_from_slice(&bytes[SUBKEY_SIZE..]);
        Ok(TunnelKey { cipher, auth })
    }

    /// Parse a key stored as standard base64 text.
    pub fn from_base64(text: &str) -> TunnelResult<Self> {
        let bytes = STANDARD
            .decode(text.trim())
            .map_err(|e| TunnelError::Config(format!("key is not valid base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        let mut cipher = [0u8; SUBKEY_SIZE];
        let mut auth = [0u8; SUBKEY_SIZE];
        cipher.copy_from_slice(&bytes[..SUBKEY_SIZE]);
        auth.copy_from_slice(&bytes[SUBKEY_SIZE..]);
        TunnelKey { cipher, auth }
    }

    /// Encode the full key as standard base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    /// The full 32 bytes, cipher half first.
    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        let mut bytes = [0u8; KEY_SIZE];
        bytes[..SUBKEY_SIZE].copy_from_slice(&self.cipher);
        bytes[SUBKEY_SIZE..].copy_from_slice(&self.auth);
        bytes
    }

    /// AES subkey (bytes 0..16).
    pub fn cipher_key(&self) -> &[u8; SUBKEY_SIZE] {
        &self.cipher
    }

    /// HMAC subkey (bytes 16..32).
    pub fn auth_key(&self) -> &[u8; SUBKEY_SIZE] {
        &self.auth
    }
}

impl fmt::Debug for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelKey")
            .field("cipher", &"[redacted]")
            .field("auth", &"[redacted]")
            .finish()
    }
}
