//! secp256k1 key types with validation, redaction, and zeroization.
//!
//! Public keys travel on the wire in 33-byte compressed SEC1 form; private
//! keys are imported as raw 32-byte scalars. Both imports validate eagerly
//! so malformed key material is rejected at load time rather than at first
//! use.

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use std::cmp::Ordering;
use std::fmt;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Raw private scalar size in bytes.
pub const SECRET_KEY_SIZE: usize = 32;

/// Compressed SEC1 public key size in bytes.
pub const PUBLIC_KEY_SIZE: usize = 33;

/// A secp256k1 public key in compressed form.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(k256::PublicKey);

impl PublicKey {
    /// Import a 33-byte compressed SEC1 public key.
    ///
    /// Rejects wrong lengths, uncompressed encodings, and points not on
    /// the curve.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(Error::InvalidKey(format!(
                "public key must be {} bytes, got {}",
                PUBLIC_KEY_SIZE,
                bytes.len()
            )));
        }
        let key = k256::PublicKey::from_sec1_bytes(bytes)
            .map_err(|_| Error::InvalidKey("not a valid curve point".into()))?;
        Ok(Self(key))
    }

    /// The compressed SEC1 encoding. This is the canonical wire and
    /// identifier-derivation form of a public key.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let point = self.0.to_encoded_point(true);
        let mut out = [0u8; PUBLIC_KEY_SIZE];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Verify a DER-encoded ECDSA signature over a precomputed digest.
    pub fn verify(&self, digest: &[u8; 32], signature: &[u8]) -> bool {
        let Ok(sig) = Signature::from_der(signature) else {
            return false;
        };
        VerifyingKey::from(&self.0).verify_prehash(digest, &sig).is_ok()
    }

    pub(crate) fn inner(&self) -> &k256::PublicKey {
        &self.0
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered by compressed encoding. Participant lists are sorted in this
/// order before any identifier derivation, so every member computes the
/// same chat id and author index.
impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        write!(f, "PublicKey({}...)", hex::encode(&bytes[..8]))
    }
}

/// A secp256k1 private key. Never logged, zeroized on drop.
#[derive(Clone)]
pub struct SecretKey(k256::SecretKey);

impl SecretKey {
    /// Import a raw 32-byte private scalar. Rejects wrong lengths, zero,
    /// and scalars at or above the group order.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SECRET_KEY_SIZE {
            return Err(Error::InvalidKey(format!(
                "secret key must be {} bytes, got {}",
                SECRET_KEY_SIZE,
                bytes.len()
            )));
        }
        let key = k256::SecretKey::from_slice(bytes)
            .map_err(|_| Error::InvalidKey("scalar out of range".into()))?;
        Ok(Self(key))
    }

    /// The raw private scalar, zeroized when the guard drops.
    pub fn to_bytes(&self) -> Zeroizing<[u8; SECRET_KEY_SIZE]> {
        let mut out = Zeroizing::new([0u8; SECRET_KEY_SIZE]);
        out.copy_from_slice(&self.0.to_bytes());
        out
    }

    pub(crate) fn inner(&self) -> &k256::SecretKey {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// A full signing identity: private scalar plus its public point.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let secret = k256::SecretKey::random(&mut rand::rngs::OsRng);
        let public = PublicKey(secret.public_key());
        Self {
            secret: SecretKey(secret),
            public,
        }
    }

    /// Reconstruct an identity from a stored 32-byte private scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret = SecretKey::from_bytes(bytes)?;
        let public = PublicKey(secret.0.public_key());
        Ok(Self { secret, public })
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    /// Produce a DER-encoded ECDSA signature over a precomputed digest.
    ///
    /// DER signatures vary in length (70 to 72 bytes), which is why the
    /// envelope carries an explicit signature length byte.
    pub fn sign(&self, digest: &[u8; 32]) -> Result<Vec<u8>> {
        let signing = SigningKey::from(self.secret.inner());
        let sig: Signature = signing
            .sign_prehash(digest)
            .map_err(|_| Error::Crypto("signing failed".into()))?;
        Ok(sig.to_der().to_bytes().to_vec())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("secret", &self.secret)
            .finish()
    }
}
