//! Per-recipient key wrapping via ephemeral ECDH.
//!
//! Each encrypted post carries its symmetric key once per recipient,
//! sealed to that recipient's public key. The construction is
//! ECIES-shaped: a fresh ephemeral keypair per wrap, ECDH against the
//! recipient, HKDF-SHA256 to a wrap key, then ChaCha20-Poly1305.
//!
//! Wire form: `ephemeral_pub(33) || nonce(12) || ciphertext(32+16)`.

use hkdf::Hkdf;
use k256::ecdh::{diffie_hellman, EphemeralSecret};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::{aead, KEY_SIZE, PUBLIC_KEY_SIZE};
use crate::crypto::{PublicKey, SecretKey};
use crate::error::{Error, Result};

/// Total size of a wrapped key blob.
pub const WRAPPED_KEY_SIZE: usize = PUBLIC_KEY_SIZE + aead::NONCE_SIZE + KEY_SIZE + aead::TAG_SIZE;

const WRAP_INFO: &[u8] = b"hushpost-key-wrap-v1";

fn derive_wrap_key(shared: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    hk.expand(WRAP_INFO, &mut key[..])
        .map_err(|_| Error::Crypto("hkdf expand failed".into()))?;
    Ok(key)
}

/// Wrap a post key for one recipient.
pub fn wrap_key(post_key: &[u8; KEY_SIZE], recipient: &PublicKey) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random(&mut rand::rngs::OsRng);
    let ephemeral_pub = ephemeral.public_key().to_encoded_point(true);

    let shared = ephemeral.diffie_hellman(recipient.inner());
    let wrap = derive_wrap_key(shared.raw_secret_bytes())?;

    let nonce: aead::Nonce = crate::crypto::random_bytes();
    let ciphertext = aead::encrypt(&wrap, &nonce, post_key, b"")?;

    let mut out = Vec::with_capacity(WRAPPED_KEY_SIZE);
    out.extend_from_slice(ephemeral_pub.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    debug_assert_eq!(out.len(), WRAPPED_KEY_SIZE);
    Ok(out)
}

/// Unwrap a post key sealed to our identity.
pub fn unwrap_key(blob: &[u8], secret: &SecretKey) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    if blob.len() != WRAPPED_KEY_SIZE {
        return Err(Error::Crypto("wrapped key has wrong size".into()));
    }

    let ephemeral_pub = k256::PublicKey::from_sec1_bytes(&blob[..PUBLIC_KEY_SIZE])
        .map_err(|_| Error::Crypto("invalid ephemeral point".into()))?;

    let shared = diffie_hellman(secret.inner().to_nonzero_scalar(), ephemeral_pub.as_affine());
    let wrap = derive_wrap_key(shared.raw_secret_bytes())?;

    let mut nonce = [0u8; aead::NONCE_SIZE];
    nonce.copy_from_slice(&blob[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + aead::NONCE_SIZE]);

    let plain = aead::decrypt(&wrap, &nonce, &blob[PUBLIC_KEY_SIZE + aead::NONCE_SIZE..], b"")?;
    if plain.len() != KEY_SIZE {
        return Err(Error::Crypto("unwrapped key has wrong size".into()));
    }

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&plain);
    Ok(key)
}
