//! Per-packet encryption for tunnel frames.
//!
//! Every frame is sealed independently into a text envelope:
//!
//! ```text
//! base64( IV (16) | AES-128-CBC ciphertext, PKCS7 (16*n) | HMAC-SHA256 tag (32) )
//! ```
//!
//! The tag covers `IV | ciphertext` and is checked before any decryption is
//! attempted. There is no sequence number and no replay window.

mod envelope;
mod key;

pub use envelope::{
    decrypt, encrypt, TunnelCipher, BLOCK_SIZE, IV_SIZE, MIN_ENVELOPE_SIZE, TAG_SIZE,
};
pub use key::{TunnelKey, KEY_SIZE, SUBKEY_SIZE};
