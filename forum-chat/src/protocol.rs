//! Chat wire format.
//!
//! Inbound (client → server), JSON:
//! ```text
//! { "userID": 1, "username": "alice", "content": "hello" }
//! ```
//! Identity fields in a structured frame are used as sent; missing ones
//! come from the connection. Any frame that does not parse as that object
//! is taken verbatim as the content of a message from the connection's
//! known identity.
//!
//! Outbound (server → client), JSON:
//! ```text
//! { "userID": 1, "username": "alice", "content": "hello",
//!   "timestamp": "2025-04-22T23:51:38.843016900Z" }
//! ```
//! The timestamp is always assigned by the server (RFC 3339). History
//! replay keeps the timestamp the message was stored with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::Identity;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Decode error: {0}")]
    Decode(#[source] serde_json::Error),
}

/// A chat message as broadcast to clients and kept in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "userID")]
    pub user_id: i64,
    pub username: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        user_id: i64,
        username: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            username: username.into(),
            content: content.into(),
            timestamp,
        }
    }

    /// Create a message from `sender`, stamped with the current server time.
    pub fn stamped(sender: &Identity, content: impl Into<String>) -> Self {
        Self::new(sender.user_id, sender.username.clone(), content, Utc::now())
    }

    /// Serialize to the outbound JSON frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Encode)
    }

    /// Parse an outbound JSON frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
    }
}

/// A frame as sent by a client.
///
/// Every field is optional on the wire; see [`InboundFrame::into_message`]
/// for how missing identity fields are filled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub content: String,
}

impl InboundFrame {
    /// A frame carrying only content.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Decode a raw frame, falling back to raw text.
    ///
    /// Never fails: bytes that are not a structured frame become the
    /// content verbatim (lossy UTF-8).
    pub fn parse(raw: &[u8]) -> Self {
        match serde_json::from_slice::<InboundFrame>(raw) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("Inbound frame is not structured ({e}), using raw text");
                Self::text(String::from_utf8_lossy(raw).into_owned())
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Encode)
    }

    /// Turn the frame into a message from `sender`'s connection.
    ///
    /// Returns `None` for blank content. `userID` and `username` carried by
    /// the frame are kept; missing ones are filled from `sender`. The
    /// timestamp is always the server's.
    pub fn into_message(self, sender: &Identity) -> Option<ChatMessage> {
        if self.content.trim().is_empty() {
            return None;
        }
        let user_id = self.user_id.unwrap_or(sender.user_id);
        let username = match self.username {
            Some(name) if !name.trim().is_empty() => name,
            _ => sender.username.clone(),
        };
        Some(ChatMessage::new(user_id, username, self.content, Utc::now()))
    }
}
