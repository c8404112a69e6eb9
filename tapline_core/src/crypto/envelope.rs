use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::key::TunnelKey;
use crate::error::{TunnelError, TunnelResult};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// AES block size
pub const BLOCK_SIZE: usize = 16;
/// Initialization vector length, one block
pub const IV_SIZE: usize = 16;
/// HMAC-SHA256 output length
pub const TAG_SIZE: usize = 32;
/// Smallest decoded envelope: IV, one padded block and the tag
pub const MIN_ENVELOPE_SIZE: usize = IV_SIZE + BLOCK_SIZE + TAG_SIZE;

/// Seal `frame` under a raw 32-byte `key`.
///
/// The key length is checked before any cipher work happens.
pub fn encrypt(frame: &[u8], key: &[u8]) -> TunnelResult<String> {
    TunnelCipher::from_slice(key)?.encrypt(frame)
}

/// Open an envelope produced by [`encrypt`] with the same raw `key`.
pub fn decrypt(envelope: &[u8], key: &[u8]) -> TunnelResult<Vec<u8>> {
    TunnelCipher::from_slice(key)?.decrypt(envelope)
}

/// Envelope sealer bound to one session key.
///
/// Holds no mutable state; a single instance is shared by both pump loops.
#[derive(Debug, Clone)]
pub struct TunnelCipher {
    key: TunnelKey,
}

impl TunnelCipher {
    pub fn new(key: TunnelKey) -> Self {
        Self { key }
    }

    /// Build a cipher from raw key bytes, failing with `KeyLength` unless
    /// exactly 32 bytes are given.
    pub fn from_slice(key: &[u8]) -> TunnelResult<Self> {
        Ok(Self::new(TunnelKey::from_bytes(key)?))
    }

    pub fn key(&self) -> &TunnelKey {
        &self.key
    }

    /// Encrypt and authenticate one frame, returning base64 envelope text.
    pub fn encrypt(&self, frame: &[u8]) -> TunnelResult<String> {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let cipher_key = *self.key.cipher_key();
        let ciphertext =
            Aes128CbcEnc::new(&cipher_key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(frame);

        let mut sealed = Vec::with_capacity(IV_SIZE + ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(&iv);
        sealed.extend_from_slice(&ciphertext);
        let tag = self.tag(&sealed)?;
        sealed.extend_from_slice(&tag);

        Ok(STANDARD.encode(sealed))
    }

    /// Verify and decrypt one envelope.
    ///
    /// The tag is checked first; a mismatch returns `Authentication` without
    /// touching the ciphertext. Length, base64 and padding problems return
    /// `Format`.
    pub fn decrypt(&self, envelope: impl AsRef<[u8]>) -> TunnelResult<Vec<u8>> {
        let decoded = STANDARD
            .decode(envelope.as_ref())
            .map_err(|e| TunnelError::Format(format!("invalid base64: {}", e)))?;

        if decoded.len() < MIN_ENVELOPE_SIZE {
            return Err(TunnelError::Format(format!(
                "envelope is {} bytes, need at least {}",
                decoded.len(),
                MIN_ENVELOPE_SIZE
            )));
        }

        let (sealed, received_tag) = decoded.split_at(decoded.len() - TAG_SIZE);
        let expected_tag = self.tag(sealed)?;
        if !bool::from(received_tag.ct_eq(&expected_tag[..])) {
            return Err(TunnelError::Authentication);
        }

        let (iv, ciphertext) = sealed.split_at(IV_SIZE);
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(TunnelError::Format(format!(
                "ciphertext length {} is not a multiple of {}",
                ciphertext.len(),
                BLOCK_SIZE
            )));
        }

        let mut iv_block = [0u8; IV_SIZE];
        iv_block.copy_from_slice(iv);
        let cipher_key = *self.key.cipher_key();
        Aes128CbcDec::new(&cipher_key.into(), &iv_block.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| TunnelError::Format("invalid PKCS7 padding".to_string()))
    }

    fn tag(&self, iv_and_ciphertext: &[u8]) -> TunnelResult<[u8; TAG_SIZE]> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.key.auth_key())
            .map_err(|_| TunnelError::KeyLength(self.key.auth_key().len()))?;
        mac.update(iv_and_ciphertext);
        Ok(mac.finalize().into_bytes().into())
    }
}
