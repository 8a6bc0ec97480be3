//! Error types for hushpost.
//!
//! Cryptographic verification failures are absorbed at the decode boundary
//! and never propagate as panics: a hostile router can inject arbitrary
//! bytes, so every parse path terminates in a typed error.

use thiserror::Error;

/// Core error type for hushpost operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Cryptographic operation failed.
    /// Details are intentionally vague to prevent oracle attacks.
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Key validation or import failed. Raised synchronously at load time.
    #[error("invalid key material")]
    InvalidKey(String),

    /// Frame-level wire error (bad length, oversized frame).
    /// Connection-fatal: triggers disconnect and retry.
    #[error("framing error")]
    Framing(String),

    /// Unknown command byte. The frame is dropped, the connection lives on.
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    /// Post envelope decode failure. The post is dropped, never surfaced.
    #[error("post decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// Network-level failure. Recovered via the spooler/reconnect loop.
    #[error("connectivity error: {0}")]
    Connectivity(#[from] ConnectivityError),

    /// Local persistence failure. Fatal to the operation that needed it.
    #[error("storage error")]
    Storage(String),

    /// Post envelope could not be built from the given inputs.
    #[error("encoding error")]
    Encoding(String),
}

/// Typed failures of the post envelope decoder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Zero-length input.
    #[error("empty post")]
    EmptyPost,

    /// Envelope shorter than its declared structure.
    #[error("truncated post")]
    Truncated,

    /// Version byte above what this implementation understands.
    #[error("unsupported post version {0}")]
    UnsupportedVersion(u8),

    /// Participant table absent, empty, or inconsistent with the envelope.
    #[error("malformed participant list")]
    MalformedParticipants,

    /// The local identity has no wrapped key in this envelope. Also the
    /// signal for "my key was rotated" or "I am not in this chat".
    #[error("local identity is not a participant")]
    NotAParticipant,

    /// Symmetric or asymmetric decryption failed an integrity check.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Signature did not verify against the claimed author. The core
    /// defense against impersonation on the relay.
    #[error("forged authorship")]
    ForgedAuthorship,

    /// Unencrypted post without a chat context and not a bootstrap contact.
    #[error("missing chat context")]
    MissingChatContext,
}

/// Network failures surfaced as diagnostics, never as delivery failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityError {
    /// Hostname resolution failed.
    #[error("dns resolution failed: {0}")]
    DnsFailure(String),

    /// No address accepted a connection within the per-attempt timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    /// An established connection dropped or timed out.
    #[error("connection lost: {0}")]
    LostConnection(String),

    /// A write to the router failed.
    #[error("send failed: {0}")]
    SendFailure(String),
}

/// Result type alias using hushpost's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error should cause a silent drop of the offending
    /// input. Decode failures and unknown commands are absorbed locally;
    /// everything else propagates.
    pub fn should_silent_drop(&self) -> bool {
        matches!(self, Error::Decode(_) | Error::UnsupportedCommand(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Connectivity(ConnectivityError::LostConnection(e.to_string()))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
