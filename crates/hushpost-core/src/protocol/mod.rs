//! Wire protocol: framed commands exchanged with the router.
//!
//! Every frame payload starts with a one-byte command code. The router
//! stores and forwards these opaquely; only `ConnectionEstablished` and
//! `DataReceivedConfirmation` are interpreted by it, the rest flow
//! between clients.

mod frame;
mod post;

pub use frame::{encode_frame, read_frame, write_frame, Frame, FrameReader, HEADER_SIZE, MAX_FRAME_SIZE};
pub use post::{
    contact_payload, decode_post, encode_post, ContactInfo, DecodedPost, PostType, POST_VERSION,
};

use crate::error::{Error, Result};
use crate::identity::{ChatId, UserId};

/// Size of a delivery confirmation identifier.
pub const DATA_ID_SIZE: usize = 4;

const CMD_CONNECTION_ESTABLISHED: u8 = 0;
const CMD_DATA_RECEIVED: u8 = 1;
const CMD_PING: u8 = 2;
const CMD_SET_NEWPOST: u8 = 3;
const CMD_MESSAGES: u8 = 4;

/// A parsed command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Login announcement: routing domain plus the sender's user id.
    ConnectionEstablished { domain: [u8; 4], user_id: UserId },
    /// Receiver-side acknowledgement of a previously sent frame.
    DataReceivedConfirmation { data_id: [u8; DATA_ID_SIZE] },
    /// Liveness probe. Carries nothing, expects nothing.
    Ping,
    /// A single new post addressed to a chat.
    SetNewpost { chat_id: ChatId, post: Vec<u8> },
    /// A batch of posts for one chat, each length-prefixed.
    Messages { chat_id: ChatId, posts: Vec<Vec<u8>> },
}

impl Command {
    /// Parse a frame payload into a command.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (&code, body) = payload
            .split_first()
            .ok_or_else(|| Error::Framing("empty command payload".into()))?;
        match code {
            CMD_CONNECTION_ESTABLISHED => {
                if body.len() != 12 {
                    return Err(Error::Framing("bad login payload length".into()));
                }
                let mut domain = [0u8; 4];
                domain.copy_from_slice(&body[..4]);
                let user_id = UserId::from_slice(&body[4..12])
                    .ok_or_else(|| Error::Framing("bad user id".into()))?;
                Ok(Command::ConnectionEstablished { domain, user_id })
            }
            CMD_DATA_RECEIVED => {
                if body.len() != DATA_ID_SIZE {
                    return Err(Error::Framing("bad confirmation payload length".into()));
                }
                let mut data_id = [0u8; DATA_ID_SIZE];
                data_id.copy_from_slice(body);
                Ok(Command::DataReceivedConfirmation { data_id })
            }
            CMD_PING => Ok(Command::Ping),
            CMD_SET_NEWPOST => {
                if body.len() < 8 {
                    return Err(Error::Framing("newpost payload too short".into()));
                }
                let chat_id = ChatId::from_slice(&body[..8])
                    .ok_or_else(|| Error::Framing("bad chat id".into()))?;
                Ok(Command::SetNewpost {
                    chat_id,
                    post: body[8..].to_vec(),
                })
            }
            CMD_MESSAGES => {
                if body.len() < 8 {
                    return Err(Error::Framing("messages payload too short".into()));
                }
                let chat_id = ChatId::from_slice(&body[..8])
                    .ok_or_else(|| Error::Framing("bad chat id".into()))?;
                let mut posts = Vec::new();
                let mut rest = &body[8..];
                while !rest.is_empty() {
                    if rest.len() < 4 {
                        return Err(Error::Framing("truncated post length".into()));
                    }
                    let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
                    rest = &rest[4..];
                    if rest.len() < len {
                        return Err(Error::Framing("truncated post body".into()));
                    }
                    posts.push(rest[..len].to_vec());
                    rest = &rest[len..];
                }
                Ok(Command::Messages { chat_id, posts })
            }
            other => Err(Error::UnsupportedCommand(other)),
        }
    }

    /// Serialize to a frame payload.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::ConnectionEstablished { domain, user_id } => {
                let mut out = Vec::with_capacity(13);
                out.push(CMD_CONNECTION_ESTABLISHED);
                out.extend_from_slice(domain);
                out.extend_from_slice(user_id.as_bytes());
                out
            }
            Command::DataReceivedConfirmation { data_id } => {
                let mut out = Vec::with_capacity(1 + DATA_ID_SIZE);
                out.push(CMD_DATA_RECEIVED);
                out.extend_from_slice(data_id);
                out
            }
            Command::Ping => vec![CMD_PING],
            Command::SetNewpost { chat_id, post } => {
                let mut out = Vec::with_capacity(9 + post.len());
                out.push(CMD_SET_NEWPOST);
                out.extend_from_slice(chat_id.as_bytes());
                out.extend_from_slice(post);
                out
            }
            Command::Messages { chat_id, posts } => {
                let total: usize = posts.iter().map(|p| 4 + p.len()).sum();
                let mut out = Vec::with_capacity(9 + total);
                out.push(CMD_MESSAGES);
                out.extend_from_slice(chat_id.as_bytes());
                for post in posts {
                    out.extend_from_slice(&(post.len() as u32).to_le_bytes());
                    out.extend_from_slice(post);
                }
                out
            }
        }
    }
}

/// Delivery-confirmation identifier of a frame payload: its last four
/// bytes, left-padded with zeros for shorter payloads.
pub fn data_id_for(payload: &[u8]) -> [u8; DATA_ID_SIZE] {
    let mut id = [0u8; DATA_ID_SIZE];
    let n = payload.len().min(DATA_ID_SIZE);
    id[DATA_ID_SIZE - n..].copy_from_slice(&payload[payload.len() - n..]);
    id
}
