//! Fixed-layout binary control frames.
//!
//! Every control frame starts with the same 9-byte header:
//! - A 1-byte message type (ordinal of [`MessageType`])
//! - An 8-byte little-endian session id
//!
//! followed by a fixed-width, type-specific body. No delimiters, no
//! variable-length encodings beyond the explicit channel length in CONNECT.

pub mod codec;
pub mod error;
pub mod message_type;

pub use codec::{
    connect_ack_body, connect_body, decode_frame, decode_header, disconnect_body, encode_frame,
    encode_header, heartbeat_body, ControlFrame, Frame, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use message_type::MessageType;
