//! Cryptographic primitives for hushpost.
//!
//! All cryptography uses well-audited primitives:
//!
//! - **secp256k1 (ECDSA)**: authorship signatures over digests
//! - **secp256k1 (ECDH)**: per-recipient wrapping of the post key
//! - **ChaCha20-Poly1305**: authenticated encryption of post payloads
//! - **HKDF-SHA256**: wrap-key derivation
//! - **double SHA-256**: identifier derivation and content fingerprints
//!
//! Secret key material is zeroized on drop. No custom constructions.

mod aead;
mod keys;
mod wrap;

pub use aead::{
    decrypt, decrypt_with_prepended_nonce, encrypt, encrypt_with_random_nonce, Nonce, NONCE_SIZE,
    TAG_SIZE,
};
pub use keys::{KeyPair, PublicKey, SecretKey, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE};
pub use wrap::{unwrap_key, wrap_key, WRAPPED_KEY_SIZE};

use sha2::{Digest, Sha256};

/// Key size for ChaCha20-Poly1305 and for the per-post symmetric key.
pub const KEY_SIZE: usize = 32;

/// Compute SHA-256 twice over the input.
///
/// The double hash is the crate-wide one-way function: identifiers derived
/// from public keys, signature digests, and duplicate fingerprints all use
/// it, so no implemented function can recover key material from an id.
pub fn double_hash(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}
