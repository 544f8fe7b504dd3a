//! Authenticated encryption of whole store files.
//!
//! A sealed blob is self-contained: it carries its own format tag and nonce,
//! so opening it needs nothing but the blob and the key.
//!
//! ```text
//! +----------------+------------------+------------------------------+
//! | magic (8)      | nonce (24)       | ciphertext + Poly1305 tag    |
//! +----------------+------------------+------------------------------+
//! ```

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key as CipherKey, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
pub const BLOB_MAGIC: &[u8; 8] = b"DSENC01\0";
pub const BLOB_HEADER_LEN: usize = BLOB_MAGIC.len() + NONCE_LEN;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("malformed ciphertext blob: {0}")]
    Malformed(&'static str),
    #[error("authentication tag mismatch")]
    Authentication,
    #[error("encryption failed")]
    Encrypt,
}

pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext` into a sealed blob under a fresh random nonce.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    seal_with_nonce(key, &generate_nonce(), plaintext)
}

fn seal_with_nonce(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(CipherKey::from_slice(key));
    let body = cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: BLOB_MAGIC,
            },
        )
        .map_err(|_| CryptoError::Encrypt)?;

    let mut blob = Vec::with_capacity(BLOB_HEADER_LEN + body.len());
    blob.extend_from_slice(BLOB_MAGIC);
    blob.extend_from_slice(nonce);
    blob.extend_from_slice(&body);
    Ok(blob)
}

/// Verify and decrypt a sealed blob.
pub fn open(key: &[u8; KEY_LEN], blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < BLOB_HEADER_LEN + TAG_LEN {
        return Err(CryptoError::Malformed("truncated"));
    }
    let (magic, rest) = blob.split_at(BLOB_MAGIC.len());
    if magic != BLOB_MAGIC {
        return Err(CryptoError::Malformed("unknown format tag"));
    }
    let (nonce, body) = rest.split_at(NONCE_LEN);

    let cipher = XChaCha20Poly1305::new(CipherKey::from_slice(key));
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: body,
                aad: BLOB_MAGIC,
            },
        )
        .map_err(|_| CryptoError::Authentication)
}
