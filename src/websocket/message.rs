use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// A frame that has already been serialized for the wire.
///
/// One broadcast encodes once; every outbound queue holds a clone of the same allocation.
pub type EncodedFrame = Arc<str>;

/// A chat message relayed between connected peers.
///
/// Duplicates carry no identity and are broadcast like any other message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(alias = "user", alias = "User")]
    sender: String,
    #[serde(alias = "message", alias = "Message")]
    body: String,
}

impl ChatMessage {
    pub fn new(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Converts between wire payloads and [`ChatMessage`] values.
///
/// Stateless apart from the size limit, so one codec is shared by every read loop.
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_frame_bytes: usize,
}

impl MessageCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    /// Decode one inbound payload. Unknown fields are ignored; missing
    /// `sender` or `body` is an error.
    pub fn decode(&self, raw: &[u8]) -> Result<ChatMessage, DecodeError> {
        if raw.len() > self.max_frame_bytes {
            return Err(DecodeError::TooLarge {
                size: raw.len(),
                limit: self.max_frame_bytes,
            });
        }
        Ok(serde_json::from_slice(raw)?)
    }

    /// Always `{"sender":…,"body":…}` in that order.
    pub fn encode(message: &ChatMessage) -> EncodedFrame {
        json!({ "sender": message.sender, "body": message.body })
            .to_string()
            .into()
    }
}
