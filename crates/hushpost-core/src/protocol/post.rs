//! The post envelope: multi-recipient encryption and authorship signing.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! [version:1]            bit 7 set = unencrypted
//! [created:4]            unix seconds
//! [type:1]
//! [count:1]
//! [count x 8]            participant user ids, sorted key order
//! -- unencrypted --
//! [author_index:1][payload]
//! -- encrypted --
//! { [len:1][wrapped key] }* [0x00]
//! [nonce:12][aead( payload || author_index:1 || signature || sig_len:1 )]
//! ```
//!
//! The signature covers `double_hash(payload)` and is DER-encoded, hence
//! variable length and the trailing length byte. Replies wrap the payload
//! before everything else, so a reply is indistinguishable on the wire
//! from any other post.

use zeroize::Zeroizing;

use crate::crypto::{
    self, double_hash, unwrap_key, wrap_key, KeyPair, PublicKey, KEY_SIZE, PUBLIC_KEY_SIZE,
};
use crate::error::{DecodeError, Error, Result};
use crate::identity::{
    derive_chat_id, derive_user_id, post_id_for, utf16le_bytes, utf16le_string, ChatId, PostId,
    UserId,
};

/// Current envelope version. Envelopes carrying a higher version are
/// rejected; this implementation never emits anything else.
pub const POST_VERSION: u8 = 1;

const UNENCRYPTED_FLAG: u8 = 0x80;
const HEADER_FIXED: usize = 7; // version + created + type + count

/// Application-level post type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostType {
    Text,
    /// Bootstrap contact message carrying the full participant key list.
    Contact,
    /// Wrapper type for replies; unwrapped transparently during decode.
    ReplyToMessage,
    /// Cloud backup traffic, permitted unencrypted.
    Cloud,
    /// Unknown tag carried through opaquely.
    Other(u8),
}

impl PostType {
    pub fn to_byte(self) -> u8 {
        match self {
            PostType::Text => 0,
            PostType::Contact => 1,
            PostType::ReplyToMessage => 2,
            PostType::Cloud => 3,
            PostType::Other(b) => b,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => PostType::Text,
            1 => PostType::Contact,
            2 => PostType::ReplyToMessage,
            3 => PostType::Cloud,
            other => PostType::Other(other),
        }
    }
}

/// Participant list carried by a bootstrap contact post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactInfo {
    pub participants: Vec<PublicKey>,
    pub group_name: Option<String>,
}

/// A successfully decoded and verified post.
#[derive(Debug, Clone)]
pub struct DecodedPost {
    pub post_id: PostId,
    pub post_type: PostType,
    /// Signature-verified author key for encrypted posts. Resolved
    /// best-effort and unverified for unencrypted posts.
    pub author: Option<PublicKey>,
    pub author_index: u8,
    pub participants: Vec<UserId>,
    pub payload: Vec<u8>,
    /// Creation time embedded by the sender, unix seconds.
    pub created_at: u32,
    /// Local reception time supplied by the caller.
    pub received_at: i64,
    pub reply_to: Option<PostId>,
    /// Present only for verified contact bootstrap posts.
    pub contact: Option<ContactInfo>,
}

/// Build a post envelope.
///
/// `participants` must include the local identity's public key; it is
/// sorted internally, so callers may pass it in any order. Returns the
/// envelope bytes and the embedded creation timestamp.
pub fn encode_post(
    post_type: PostType,
    payload: &[u8],
    participants: &[PublicKey],
    reply_to: Option<PostId>,
    encrypted: bool,
    local: &KeyPair,
) -> Result<(Vec<u8>, u32)> {
    if participants.is_empty() || participants.len() > u8::MAX as usize {
        return Err(Error::Encoding(format!(
            "participant count {} out of range",
            participants.len()
        )));
    }

    let mut sorted: Vec<PublicKey> = participants.to_vec();
    sorted.sort_unstable();

    let author_index = sorted
        .iter()
        .position(|p| p == local.public())
        .ok_or_else(|| Error::Encoding("local identity is not a participant".into()))?
        as u8;

    // reply wrapping happens before everything else
    let (wire_type, payload) = match reply_to {
        Some(ref_id) => {
            let mut wrapped = Vec::with_capacity(9 + payload.len());
            wrapped.push(post_type.to_byte());
            wrapped.extend_from_slice(ref_id.as_bytes());
            wrapped.extend_from_slice(payload);
            (PostType::ReplyToMessage.to_byte(), wrapped)
        }
        None => (post_type.to_byte(), payload.to_vec()),
    };

    let created = chrono::Utc::now().timestamp() as u32;

    let mut out = Vec::with_capacity(HEADER_FIXED + sorted.len() * 8 + payload.len() + 128);
    let version = if encrypted {
        POST_VERSION
    } else {
        POST_VERSION | UNENCRYPTED_FLAG
    };
    out.push(version);
    out.extend_from_slice(&created.to_le_bytes());
    out.push(wire_type);
    out.push(sorted.len() as u8);
    for key in &sorted {
        out.extend_from_slice(derive_user_id(key).as_bytes());
    }

    if !encrypted {
        out.push(author_index);
        out.extend_from_slice(&payload);
        return Ok((out, created));
    }

    let post_key = Zeroizing::new(crypto::random_bytes::<KEY_SIZE>());
    for key in &sorted {
        let wrapped = wrap_key(&post_key, key)?;
        out.push(wrapped.len() as u8);
        out.extend_from_slice(&wrapped);
    }
    out.push(0x00);

    let digest = double_hash(&payload);
    let signature = local.sign(&digest)?;
    if signature.is_empty() || signature.len() > u8::MAX as usize {
        return Err(Error::Encoding("signature length out of range".into()));
    }

    let mut plaintext = Zeroizing::new(Vec::with_capacity(payload.len() + signature.len() + 2));
    plaintext.extend_from_slice(&payload);
    plaintext.push(author_index);
    plaintext.extend_from_slice(&signature);
    plaintext.push(signature.len() as u8);

    let blob = crypto::encrypt_with_random_nonce(&post_key, &plaintext, b"")?;
    out.extend_from_slice(&blob);

    Ok((out, created))
}

/// Parse, decrypt and verify a post envelope.
///
/// `chat_id` is the chat the transport delivered this post under; it may
/// be absent only for unencrypted bootstrap traffic. `known_participants`
/// are the public keys the caller already holds for that chat and are
/// used to resolve the claimed author. All failure paths return a typed
/// [`DecodeError`]; hostile input never panics.
pub fn decode_post(
    bytes: &[u8],
    chat_id: Option<ChatId>,
    known_participants: &[PublicKey],
    local: &KeyPair,
    received_at: i64,
) -> Result<DecodedPost> {
    if bytes.is_empty() {
        return Err(DecodeError::EmptyPost.into());
    }

    let version_byte = bytes[0];
    let encrypted = version_byte & UNENCRYPTED_FLAG == 0;
    let version = version_byte & !UNENCRYPTED_FLAG;
    if version != POST_VERSION {
        return Err(DecodeError::UnsupportedVersion(version).into());
    }

    if bytes.len() < HEADER_FIXED {
        return Err(DecodeError::Truncated.into());
    }
    let post_id = post_id_for(bytes);
    let created_at = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    let wire_type = bytes[5];
    let count = bytes[6] as usize;
    if count == 0 {
        return Err(DecodeError::MalformedParticipants.into());
    }

    let ids_end = HEADER_FIXED + count * 8;
    if bytes.len() < ids_end {
        return Err(DecodeError::MalformedParticipants.into());
    }
    let participants: Vec<UserId> = bytes[HEADER_FIXED..ids_end]
        .chunks_exact(8)
        .filter_map(UserId::from_slice)
        .collect();

    let local_user_id = derive_user_id(local.public());
    let body = &bytes[ids_end..];

    let (author_index, payload, signature) = if encrypted {
        let (index, payload, signature) = decrypt_body(body, &participants, &local_user_id, local)?;
        (index, payload, Some(signature))
    } else {
        // unencrypted posts are limited to administrative traffic and a
        // chat context is required unless this bootstraps one
        if chat_id.is_none() && PostType::from_byte(wire_type) != PostType::Contact {
            return Err(DecodeError::MissingChatContext.into());
        }
        let (&index, payload) = body
            .split_first()
            .ok_or(DecodeError::Truncated)?;
        (index, payload.to_vec(), None)
    };

    if author_index as usize >= count {
        return Err(DecodeError::MalformedParticipants.into());
    }

    let wire_post_type = PostType::from_byte(wire_type);
    let contact = if wire_post_type == PostType::Contact {
        Some(parse_contact(&payload, chat_id, &local_user_id)?)
    } else {
        None
    };

    // resolve and verify the claimed author for encrypted posts
    let author_uid = participants[author_index as usize];
    let author = match &signature {
        Some(signature) => {
            let candidates = known_participants.iter().chain(
                contact
                    .iter()
                    .flat_map(|c: &ContactInfo| c.participants.iter()),
            );
            let key =
                resolve_author(candidates, &author_uid).ok_or(DecodeError::ForgedAuthorship)?;
            if !key.verify(&double_hash(&payload), signature) {
                return Err(DecodeError::ForgedAuthorship.into());
            }
            Some(key)
        }
        None => resolve_author(known_participants.iter(), &author_uid),
    };

    // unwrap the reply envelope after all validation
    let (post_type, payload, reply_to) = if wire_post_type == PostType::ReplyToMessage {
        if payload.len() < 9 {
            return Err(DecodeError::Truncated.into());
        }
        let inner = PostType::from_byte(payload[0]);
        let reference = PostId::from_slice(&payload[1..9]).ok_or(DecodeError::Truncated)?;
        (inner, payload[9..].to_vec(), Some(reference))
    } else {
        (wire_post_type, payload, None)
    };

    Ok(DecodedPost {
        post_id,
        post_type,
        author,
        author_index,
        participants,
        payload,
        created_at,
        received_at,
        reply_to,
        contact,
    })
}

/// Decrypt the wrapped-key table and AEAD blob, returning the author
/// index, the plain payload and the embedded signature.
fn decrypt_body(
    body: &[u8],
    participants: &[UserId],
    local_user_id: &UserId,
    local: &KeyPair,
) -> Result<(u8, Vec<u8>, Vec<u8>)> {
    let local_position = participants
        .iter()
        .position(|p| p == local_user_id)
        .ok_or(DecodeError::NotAParticipant)?;

    // walk the length-prefixed wrapped key table to the sentinel
    let mut offset = 0usize;
    let mut our_wrapped: Option<&[u8]> = None;
    let mut index = 0usize;
    loop {
        let len = *body.get(offset).ok_or(DecodeError::Truncated)? as usize;
        offset += 1;
        if len == 0 {
            break;
        }
        let entry = body
            .get(offset..offset + len)
            .ok_or(DecodeError::Truncated)?;
        if index == local_position {
            our_wrapped = Some(entry);
        }
        offset += len;
        index += 1;
    }
    let wrapped = our_wrapped.ok_or(DecodeError::NotAParticipant)?;

    let post_key = unwrap_key(wrapped, local.secret())
        .map_err(|_| DecodeError::DecryptionFailed)?;
    let plaintext = crypto::decrypt_with_prepended_nonce(&post_key, &body[offset..], b"")
        .map_err(|_| DecodeError::DecryptionFailed)?;

    // peel sig_len, signature and author index from the tail
    let (&sig_len, rest) = plaintext.split_last().ok_or(DecodeError::Truncated)?;
    let sig_len = sig_len as usize;
    if rest.len() < sig_len + 1 {
        return Err(DecodeError::Truncated.into());
    }
    let signature = &rest[rest.len() - sig_len..];
    let author_index = rest[rest.len() - sig_len - 1];
    let payload = &rest[..rest.len() - sig_len - 1];

    Ok((author_index, payload.to_vec(), signature.to_vec()))
}

fn resolve_author<'a, I>(candidates: I, author_uid: &UserId) -> Option<PublicKey>
where
    I: Iterator<Item = &'a PublicKey>,
{
    let mut found = None;
    for key in candidates {
        if derive_user_id(key) == *author_uid {
            found = Some(key.clone());
            break;
        }
    }
    found
}

/// Parse and validate a contact bootstrap sub-message:
/// `[count:1][count x 33-byte compressed key][UTF-16LE group name...]`.
fn parse_contact(
    payload: &[u8],
    chat_id: Option<ChatId>,
    local_user_id: &UserId,
) -> Result<ContactInfo> {
    let (&count, rest) = payload
        .split_first()
        .ok_or(DecodeError::MalformedParticipants)?;
    let count = count as usize;
    if count == 0 || rest.len() < count * PUBLIC_KEY_SIZE {
        return Err(DecodeError::MalformedParticipants.into());
    }

    let mut participants = Vec::with_capacity(count);
    for chunk in rest[..count * PUBLIC_KEY_SIZE].chunks_exact(PUBLIC_KEY_SIZE) {
        let key =
            PublicKey::from_bytes(chunk).map_err(|_| DecodeError::MalformedParticipants)?;
        participants.push(key);
    }

    let name_bytes = &rest[count * PUBLIC_KEY_SIZE..];
    let group_name = if name_bytes.is_empty() {
        None
    } else {
        Some(utf16le_string(name_bytes).ok_or(DecodeError::MalformedParticipants)?)
    };

    // the embedded membership must reproduce the chat this arrived under
    // and must include us, otherwise the bootstrap is rejected
    let derived = derive_chat_id(&participants, group_name.as_deref());
    if let Some(expected) = chat_id {
        if derived != expected {
            return Err(DecodeError::MalformedParticipants.into());
        }
    }
    if !participants
        .iter()
        .any(|p| derive_user_id(p) == *local_user_id)
    {
        return Err(DecodeError::NotAParticipant.into());
    }

    Ok(ContactInfo {
        participants,
        group_name,
    })
}

/// Build the payload of a contact bootstrap post for a participant set.
pub fn contact_payload(participants: &[PublicKey], group_name: Option<&str>) -> Vec<u8> {
    let mut sorted: Vec<PublicKey> = participants.to_vec();
    sorted.sort_unstable();
    let mut out = Vec::with_capacity(1 + sorted.len() * PUBLIC_KEY_SIZE);
    out.push(sorted.len() as u8);
    for key in &sorted {
        out.extend_from_slice(&key.to_bytes());
    }
    if let Some(name) = group_name {
        out.extend_from_slice(&utf16le_bytes(name));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_of(keys: &[&KeyPair]) -> (Vec<PublicKey>, ChatId) {
        let participants: Vec<PublicKey> = keys.iter().map(|k| k.public().clone()).collect();
        let chat_id = derive_chat_id(&participants, None);
        (participants, chat_id)
    }

    #[test]
    fn test_encrypted_roundtrip() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (participants, chat_id) = chat_of(&[&alice, &bob]);

        let (bytes, created) =
            encode_post(PostType::Text, b"hello bob", &participants, None, true, &alice).unwrap();

        let decoded = decode_post(&bytes, Some(chat_id), &participants, &bob, 1234).unwrap();
        assert_eq!(decoded.payload, b"hello bob");
        assert_eq!(decoded.post_type, PostType::Text);
        assert_eq!(decoded.author.as_ref(), Some(alice.public()));
        assert_eq!(decoded.created_at, created);
        assert_eq!(decoded.received_at, 1234);
        assert_eq!(decoded.post_id, post_id_for(&bytes));
        assert!(decoded.reply_to.is_none());

        // the author can decode their own copy too
        let own = decode_post(&bytes, Some(chat_id), &participants, &alice, 0).unwrap();
        assert_eq!(own.payload, b"hello bob");
    }

    #[test]
    fn test_empty_and_large_payloads() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (participants, chat_id) = chat_of(&[&alice, &bob]);

        for payload in [vec![], vec![0x5a; 200_000]] {
            let (bytes, _) =
                encode_post(PostType::Text, &payload, &participants, None, true, &alice).unwrap();
            let decoded = decode_post(&bytes, Some(chat_id), &participants, &bob, 0).unwrap();
            assert_eq!(decoded.payload, payload);
        }
    }

    #[test]
    fn test_outsider_is_not_a_participant() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let eve = KeyPair::generate();
        let (participants, chat_id) = chat_of(&[&alice, &bob]);

        let (bytes, _) =
            encode_post(PostType::Text, b"secret", &participants, None, true, &alice).unwrap();

        match decode_post(&bytes, Some(chat_id), &participants, &eve, 0) {
            Err(Error::Decode(DecodeError::NotAParticipant)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_tampering_is_detected() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (participants, chat_id) = chat_of(&[&alice, &bob]);

        let (bytes, _) =
            encode_post(PostType::Text, b"do not touch", &participants, None, true, &alice)
                .unwrap();

        // flip a byte anywhere in the encrypted region
        let ids_end = HEADER_FIXED + 2 * 8;
        for pos in [ids_end + 2, bytes.len() / 2, bytes.len() - 1] {
            let mut tampered = bytes.clone();
            tampered[pos] ^= 0x01;
            let err = decode_post(&tampered, Some(chat_id), &participants, &bob, 0)
                .expect_err("tampered envelope accepted");
            match err {
                Error::Decode(DecodeError::DecryptionFailed)
                | Error::Decode(DecodeError::ForgedAuthorship)
                | Error::Decode(DecodeError::Truncated)
                | Error::Decode(DecodeError::NotAParticipant)
                | Error::Decode(DecodeError::MalformedParticipants) => {}
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_unknown_author_is_forged() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (participants, chat_id) = chat_of(&[&alice, &bob]);

        let (bytes, _) =
            encode_post(PostType::Text, b"hi", &participants, None, true, &alice).unwrap();

        // bob holds no keys for this chat, so the author cannot be resolved
        match decode_post(&bytes, Some(chat_id), &[], &bob, 0) {
            Err(Error::Decode(DecodeError::ForgedAuthorship)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_reply_roundtrip() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (participants, chat_id) = chat_of(&[&alice, &bob]);

        let (first, _) =
            encode_post(PostType::Text, b"question?", &participants, None, true, &alice).unwrap();
        let first_decoded = decode_post(&first, Some(chat_id), &participants, &bob, 0).unwrap();

        let (reply, _) = encode_post(
            PostType::Text,
            b"answer!",
            &participants,
            Some(first_decoded.post_id),
            true,
            &bob,
        )
        .unwrap();

        let decoded = decode_post(&reply, Some(chat_id), &participants, &alice, 0).unwrap();
        assert_eq!(decoded.post_type, PostType::Text);
        assert_eq!(decoded.payload, b"answer!");
        assert_eq!(decoded.reply_to, Some(first_decoded.post_id));
        assert_eq!(decoded.author.as_ref(), Some(bob.public()));
    }

    #[test]
    fn test_contact_bootstrap() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();
        let participants = vec![
            alice.public().clone(),
            bob.public().clone(),
            carol.public().clone(),
        ];
        let chat_id = derive_chat_id(&participants, Some("trio"));

        let payload = contact_payload(&participants, Some("trio"));
        let (bytes, _) = encode_post(
            PostType::Contact,
            &payload,
            &participants,
            None,
            true,
            &alice,
        )
        .unwrap();

        // bob knows only alice so far; the embedded list resolves the rest
        let decoded = decode_post(
            &bytes,
            Some(chat_id),
            &[alice.public().clone()],
            &bob,
            0,
        )
        .unwrap();
        let contact = decoded.contact.expect("contact info missing");
        assert_eq!(contact.participants.len(), 3);
        assert_eq!(contact.group_name.as_deref(), Some("trio"));
        assert_eq!(decoded.author.as_ref(), Some(alice.public()));
    }

    #[test]
    fn test_contact_chat_id_mismatch_rejected() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (participants, _) = chat_of(&[&alice, &bob]);
        let payload = contact_payload(&participants, None);
        let (bytes, _) = encode_post(
            PostType::Contact,
            &payload,
            &participants,
            None,
            true,
            &alice,
        )
        .unwrap();

        let wrong_chat = ChatId([0xee; 8]);
        assert!(decode_post(&bytes, Some(wrong_chat), &participants, &bob, 0).is_err());
    }

    #[test]
    fn test_unencrypted_requires_chat_context() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (participants, chat_id) = chat_of(&[&alice, &bob]);

        let (bytes, _) =
            encode_post(PostType::Cloud, b"admin", &participants, None, false, &alice).unwrap();

        match decode_post(&bytes, None, &participants, &bob, 0) {
            Err(Error::Decode(DecodeError::MissingChatContext)) => {}
            other => panic!("unexpected: {:?}", other),
        }

        let decoded = decode_post(&bytes, Some(chat_id), &participants, &bob, 0).unwrap();
        assert_eq!(decoded.payload, b"admin");
        // unencrypted authorship is never verified
        assert_eq!(decoded.post_type, PostType::Cloud);
    }

    #[test]
    fn test_malformed_inputs_never_panic() {
        let bob = KeyPair::generate();
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![POST_VERSION],
            vec![0x05, 0, 0, 0, 0, 0, 2],
            vec![POST_VERSION, 0, 0, 0, 0, 0, 0],
            vec![POST_VERSION, 0, 0, 0, 0, 0, 200],
            {
                let mut v = vec![POST_VERSION, 0, 0, 0, 0, 0, 1];
                v.extend_from_slice(&[0u8; 8]);
                v.push(40); // wrapped key length overruns
                v
            },
        ];
        for bytes in cases {
            assert!(decode_post(&bytes, None, &[], &bob, 0).is_err());
        }
    }

    #[test]
    fn test_future_version_rejected() {
        let bob = KeyPair::generate();
        let mut bytes = vec![2u8, 0, 0, 0, 0, 0, 1];
        bytes.extend_from_slice(&[0u8; 8]);
        match decode_post(&bytes, None, &[], &bob, 0) {
            Err(Error::Decode(DecodeError::UnsupportedVersion(2))) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
