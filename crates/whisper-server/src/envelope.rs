//! Client-side envelope encryption.
//!
//! AES-256-GCM with a fresh 96-bit IV per message. Everything that crosses the
//! wire is standard base64, so envelopes produced here are interchangeable with
//! the browser's Web Crypto flow (raw key export + `btoa`).
//!
//! The server only ever sees `ciphertext` and `iv`. The key travels in the
//! link fragment and nowhere else.

use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
/// GCM authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("key must be base64 encoding {KEY_LEN} bytes")]
    KeyFormat,
    #[error("cannot decrypt: wrong key or corrupted data")]
    Decryption,
    #[error("encryption failed")]
    Encryption,
}

/// 256-bit symmetric key for a single secret.
#[derive(Clone, ZeroizeOnDrop)]
pub struct EnvelopeKey([u8; KEY_LEN]);

impl EnvelopeKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EnvelopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EnvelopeKey(..)")
    }
}

/// Output of [`encrypt`]: the two fields uploaded to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: String,
    pub iv: String,
}

/// Generate a fresh key from the OS CSPRNG.
pub fn generate_key() -> EnvelopeKey {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    EnvelopeKey(key)
}

/// Base64 of the raw key bytes, for the link fragment.
pub fn export_key(key: &EnvelopeKey) -> String {
    STANDARD.encode(key.as_bytes())
}

pub fn import_key(encoded: &str) -> Result<EnvelopeKey, EnvelopeError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|_| EnvelopeError::KeyFormat)?;
    let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| EnvelopeError::KeyFormat)?;
    Ok(EnvelopeKey(key))
}

/// Encrypt `plaintext` under `key` with a freshly drawn IV.
pub fn encrypt(plaintext: &str, key: &EnvelopeKey) -> Result<Sealed, EnvelopeError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
        .map_err(|_| EnvelopeError::Encryption)?;

    Ok(Sealed {
        ciphertext: STANDARD.encode(ciphertext),
        iv: STANDARD.encode(iv),
    })
}

/// Decrypt and authenticate. Any failure, including malformed encodings,
/// collapses to [`EnvelopeError::Decryption`] and yields no plaintext.
pub fn decrypt(ciphertext: &str, iv: &str, key: &EnvelopeKey) -> Result<String, EnvelopeError> {
    let ciphertext = STANDARD
        .decode(ciphertext)
        .map_err(|_| EnvelopeError::Decryption)?;
    let iv = STANDARD.decode(iv).map_err(|_| EnvelopeError::Decryption)?;
    if iv.len() != IV_LEN {
        return Err(EnvelopeError::Decryption);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
        .map_err(|_| EnvelopeError::Decryption)?;

    String::from_utf8(plaintext).map_err(|_| EnvelopeError::Decryption)
}
