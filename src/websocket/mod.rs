mod frame;
mod handler;
mod message;

pub use frame::Frame;
pub use handler::{ws_handler, WsQuery, DISPLAY_NAME_HEADER};
pub use message::{ChatMessage, DecodeError, EncodedFrame, MessageCodec};
