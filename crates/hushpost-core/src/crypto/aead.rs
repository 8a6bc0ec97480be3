//! ChaCha20-Poly1305 authenticated encryption.
//!
//! Post payloads are sealed under a fresh random per-post key; that key is
//! then wrapped for each recipient (see `wrap`). Nonces are random and
//! prepended to the ciphertext, so a sealed blob is self-contained.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key};

use crate::crypto::KEY_SIZE;
use crate::error::{Error, Result};

/// ChaCha20-Poly1305 nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// A 96-bit AEAD nonce.
pub type Nonce = [u8; NONCE_SIZE];

/// Encrypt plaintext with an explicit nonce and associated data.
pub fn encrypt(key: &[u8; KEY_SIZE], nonce: &Nonce, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            chacha20poly1305::Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Crypto("encryption failed".into()))
}

/// Decrypt ciphertext with an explicit nonce and associated data.
pub fn decrypt(key: &[u8; KEY_SIZE], nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            chacha20poly1305::Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::Crypto("decryption failed".into()))
}

/// Encrypt with a fresh random nonce, returning `nonce || ciphertext`.
pub fn encrypt_with_random_nonce(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let nonce: Nonce = crate::crypto::random_bytes();
    let ciphertext = encrypt(key, &nonce, plaintext, aad)?;
    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a `nonce || ciphertext` blob produced by
/// [`encrypt_with_random_nonce`].
pub fn decrypt_with_prepended_nonce(key: &[u8; KEY_SIZE], blob: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Crypto("ciphertext too short".into()));
    }
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&blob[..NONCE_SIZE]);
    decrypt(key, &nonce, &blob[NONCE_SIZE..], aad)
}
