//! Hash-derived identifiers.
//!
//! Users, chats and posts are identified by short hashes rather than by
//! anything the router could resolve back to key material or content. All
//! derivations go through [`double_hash`](crate::crypto::double_hash) and
//! truncate to eight bytes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{double_hash, PublicKey};

/// Identifier size shared by users, chats and posts.
pub const ID_SIZE: usize = 8;

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; ID_SIZE]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
                &self.0
            }

            /// Parse from an 8-byte slice.
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                let arr: [u8; ID_SIZE] = bytes.try_into().ok()?;
                Some(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), hex::encode(self.0))
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

id_newtype! {
    /// A user identity: truncated double hash of the compressed public key.
    /// The router sees only this, never the key itself.
    UserId
}

id_newtype! {
    /// A chat identity derived from its full participant set (and name,
    /// for group chats). Every member computes the same value locally.
    ChatId
}

id_newtype! {
    /// A post identity derived from the envelope bytes. Stable across
    /// redelivery, used for reply references and duplicate detection keys.
    PostId
}

/// Derive the user id for a public key.
pub fn derive_user_id(key: &PublicKey) -> UserId {
    let digest = double_hash(&key.to_bytes());
    let mut id = [0u8; ID_SIZE];
    id.copy_from_slice(&digest[..ID_SIZE]);
    UserId(id)
}

/// Derive the chat id for a participant set and optional group name.
///
/// Participants are sorted by compressed encoding before hashing, so the
/// result is invariant under permutation. The name contributes to the
/// derivation only for group chats (more than two participants): two
/// people have exactly one chat, however either of them labels it.
pub fn derive_chat_id(participants: &[PublicKey], name: Option<&str>) -> ChatId {
    let mut sorted: Vec<[u8; 33]> = participants.iter().map(|p| p.to_bytes()).collect();
    sorted.sort_unstable();

    let mut input = Vec::with_capacity(sorted.len() * 33);
    for key in &sorted {
        input.extend_from_slice(key);
    }
    if participants.len() > 2 {
        if let Some(name) = name {
            input.extend_from_slice(&utf16le_bytes(name));
        }
    }

    let digest = double_hash(&input);
    let mut id = [0u8; ID_SIZE];
    id.copy_from_slice(&digest[..ID_SIZE]);
    ChatId(id)
}

/// Derive the post id from encoded envelope bytes.
///
/// XOR of the head and the reversed tail of the envelope, each taken as
/// eight bytes and zero-padded when the envelope is shorter. Cheap enough
/// to run on every received post and stable across redelivery because it
/// covers the envelope, not the decrypted content.
pub fn post_id_for(envelope: &[u8]) -> PostId {
    let mut head = [0u8; ID_SIZE];
    for (i, b) in envelope.iter().take(ID_SIZE).enumerate() {
        head[i] = *b;
    }
    let mut tail = [0u8; ID_SIZE];
    for (i, b) in envelope.iter().rev().take(ID_SIZE).enumerate() {
        tail[i] = *b;
    }
    let mut id = [0u8; ID_SIZE];
    for i in 0..ID_SIZE {
        id[i] = head[i] ^ tail[i];
    }
    PostId(id)
}

/// Encode a string as UTF-16LE bytes, the form group names take in chat
/// derivation and contact bootstrap messages.
pub fn utf16le_bytes(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

/// Decode UTF-16LE bytes back to a string. Returns `None` on odd length
/// or invalid surrogate pairs.
pub fn utf16le_string(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_user_id_deterministic() {
        let pair = KeyPair::generate();
        assert_eq!(derive_user_id(pair.public()), derive_user_id(pair.public()));

        let other = KeyPair::generate();
        assert_ne!(derive_user_id(pair.public()), derive_user_id(other.public()));
    }

    #[test]
    fn test_chat_id_permutation_invariant() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let c = KeyPair::generate();

        let forward = vec![a.public().clone(), b.public().clone(), c.public().clone()];
        let backward = vec![c.public().clone(), a.public().clone(), b.public().clone()];

        assert_eq!(
            derive_chat_id(&forward, Some("team")),
            derive_chat_id(&backward, Some("team"))
        );
    }

    #[test]
    fn test_chat_id_name_only_matters_for_groups() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let pair_chat = vec![a.public().clone(), b.public().clone()];

        assert_eq!(
            derive_chat_id(&pair_chat, Some("alice")),
            derive_chat_id(&pair_chat, Some("bob"))
        );
        assert_eq!(
            derive_chat_id(&pair_chat, Some("alice")),
            derive_chat_id(&pair_chat, None)
        );

        let c = KeyPair::generate();
        let group = vec![a.public().clone(), b.public().clone(), c.public().clone()];
        assert_ne!(
            derive_chat_id(&group, Some("work")),
            derive_chat_id(&group, Some("play"))
        );
    }

    #[test]
    fn test_post_id_short_envelope() {
        // shorter than 8 bytes: head and tail overlap, zero padding fills
        let id = post_id_for(&[0x01, 0x02]);
        // head = 01 02 00.., tail (reversed) = 02 01 00..
        assert_eq!(id.0, [0x03, 0x03, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_post_id_stable() {
        let envelope: Vec<u8> = (0..100u8).collect();
        assert_eq!(post_id_for(&envelope), post_id_for(&envelope));

        let mut changed = envelope.clone();
        changed[0] ^= 0xff;
        assert_ne!(post_id_for(&envelope), post_id_for(&changed));
    }

    #[test]
    fn test_utf16le_roundtrip() {
        let s = "groupe \u{00e9}t\u{00e9} \u{1f512}";
        let bytes = utf16le_bytes(s);
        assert_eq!(utf16le_string(&bytes).as_deref(), Some(s));
        assert!(utf16le_string(&bytes[..bytes.len() - 1]).is_none());
    }

    #[test]
    fn test_id_display_is_hex() {
        let id = UserId([0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0]);
        assert_eq!(id.to_string(), "deadbeef00000000");
    }
}
