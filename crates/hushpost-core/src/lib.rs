//! # Hushpost Core Library
//!
//! An end-to-end encrypted, server-anonymous messaging transport. Peers
//! are addressed by one-way hashes of their public keys, conversations
//! by a pure function of their membership, and the router in the middle
//! forwards opaque frames without ever learning who talks to whom.
//!
//! ## Security Model
//!
//! The router is untrusted:
//! - It sees only hash-derived identifiers, never keys or plaintext
//! - Every post is multi-recipient encrypted and author-signed
//! - Forged or tampered posts are dropped before they reach the
//!   application
//!
//! Confidentiality lives entirely in the post envelope; the TCP link
//! itself is deliberately plain.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Application                │
//! ├─────────────────────────────────────────┤
//! │    router (session)   │    storage      │
//! ├─────────────────────────────────────────┤
//! │           protocol (wire)               │
//! ├─────────────────────────────────────────┤
//! │    crypto    │       identity           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Outbound posts flow through the persistent spooler, which delivers
//! them at-least-once, in order, one in flight at a time, across
//! reconnects and process restarts. Inbound frames are deduplicated,
//! persisted, decrypted and verified before the application sees them.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod crypto;
pub mod error;
pub mod identity;
pub mod logging;
pub mod protocol;
pub mod router;
pub mod storage;

pub use error::{ConnectivityError, DecodeError, Error, Result};
pub use identity::{ChatId, PostId, UserId};
pub use protocol::{DecodedPost, PostType};
pub use router::{ConnectionConfig, ConnectivityMonitor, RouterConnection, RouterEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
