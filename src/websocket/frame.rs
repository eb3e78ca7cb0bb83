//! Transport-neutral frames exchanged with a connected peer.

use std::sync::Arc;

use axum::extract::ws::Message;

use crate::error::StreamError;

/// One discrete unit read from or written to a peer's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Arc<str>),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Frame::Text(Arc::from(text.as_str())),
            Message::Binary(data) => Frame::Binary(data.to_vec()),
            Message::Ping(data) => Frame::Ping(data.to_vec()),
            Message::Pong(data) => Frame::Pong(data.to_vec()),
            Message::Close(_) => Frame::Close,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text.to_string().into()),
            Frame::Binary(data) => Message::Binary(data.into()),
            Frame::Ping(data) => Message::Ping(data.into()),
            Frame::Pong(data) => Message::Pong(data.into()),
            Frame::Close => Message::Close(None),
        }
    }
}

impl From<axum::Error> for StreamError {
    fn from(err: axum::Error) -> Self {
        StreamError::new(err.to_string())
    }
}
