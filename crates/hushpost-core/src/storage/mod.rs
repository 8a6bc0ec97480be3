//! Local persistence: the outbound spooler, the duplicate filter, and
//! the collaborator seams the transport calls into.
//!
//! Post retention, pagination and contact books live outside this crate;
//! the transport only needs the narrow traits below. In-memory
//! implementations are provided for embedders that keep their own
//! storage, and for tests.

mod dedup;
mod spool;

pub use dedup::{DuplicateFilter, DEDUP_CAPACITY};
pub use spool::{Completion, SpoolEntry, Spooler};

use std::collections::HashMap;
use std::sync::Mutex;

use crate::crypto::PublicKey;
use crate::error::{Error, Result};
use crate::identity::ChatId;
use crate::protocol::ContactInfo;

/// Local post log, appended once a post has decoded and verified.
pub trait PostStore: Send + Sync {
    /// Append raw post bytes under a chat, returning the reception
    /// timestamp in unix milliseconds.
    fn append_post(&self, chat_id: &ChatId, bytes: &[u8]) -> Result<i64>;

    /// Read the most recent posts for a chat, oldest first, as
    /// (bytes, reception timestamp) pairs.
    fn read_posts(&self, chat_id: &ChatId, limit: usize) -> Result<Vec<(Vec<u8>, i64)>>;
}

/// Chat membership lookup, fed by contact bootstrap posts.
pub trait ContactResolver: Send + Sync {
    /// Public keys known for a chat's participants. Empty when the chat
    /// is unknown; decoding then relies on an embedded contact list.
    fn participants_for(&self, chat_id: &ChatId) -> Vec<PublicKey>;

    /// Record membership learned from a verified contact bootstrap post.
    fn register_contact(&self, chat_id: &ChatId, info: &ContactInfo);
}

/// Hash-map backed post log.
#[derive(Default)]
pub struct MemoryPostStore {
    posts: Mutex<HashMap<ChatId, Vec<(Vec<u8>, i64)>>>,
}

impl MemoryPostStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PostStore for MemoryPostStore {
    fn append_post(&self, chat_id: &ChatId, bytes: &[u8]) -> Result<i64> {
        let received_at = chrono::Utc::now().timestamp_millis();
        let mut posts = self
            .posts
            .lock()
            .map_err(|_| Error::Storage("post store lock poisoned".into()))?;
        posts
            .entry(*chat_id)
            .or_default()
            .push((bytes.to_vec(), received_at));
        Ok(received_at)
    }

    fn read_posts(&self, chat_id: &ChatId, limit: usize) -> Result<Vec<(Vec<u8>, i64)>> {
        let posts = self
            .posts
            .lock()
            .map_err(|_| Error::Storage("post store lock poisoned".into()))?;
        let entries = posts.get(chat_id).map(Vec::as_slice).unwrap_or(&[]);
        let skip = entries.len().saturating_sub(limit);
        Ok(entries[skip..].to_vec())
    }
}

/// Hash-map backed contact book.
#[derive(Default)]
pub struct MemoryContacts {
    chats: Mutex<HashMap<ChatId, Vec<PublicKey>>>,
}

impl MemoryContacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a known chat membership, e.g. from a QR exchange.
    pub fn insert(&self, chat_id: ChatId, participants: Vec<PublicKey>) {
        if let Ok(mut chats) = self.chats.lock() {
            chats.insert(chat_id, participants);
        }
    }
}

impl ContactResolver for MemoryContacts {
    fn participants_for(&self, chat_id: &ChatId) -> Vec<PublicKey> {
        self.chats
            .lock()
            .ok()
            .and_then(|chats| chats.get(chat_id).cloned())
            .unwrap_or_default()
    }

    fn register_contact(&self, chat_id: &ChatId, info: &ContactInfo) {
        if let Ok(mut chats) = self.chats.lock() {
            chats.insert(*chat_id, info.participants.clone());
        }
    }
}
