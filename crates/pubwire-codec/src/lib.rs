//! JSON envelope codec for pub/sub messages.
//!
//! An application message travels as a JSON-compatible object with optional
//! keys `q` (qualifier), `sid` (stream id) and `d` (data). Binary data is
//! spliced into the envelope verbatim after the `"d":` token instead of being
//! re-encoded, and decoding hands it back as a zero-copy slice of the input.
//!
//! Decoding is a single forward pass that only tracks byte offsets of the
//! data value, so large payloads are never parsed or copied.

pub mod codec;
pub mod error;
pub mod message;
mod scanner;

pub use codec::MessageCodec;
pub use error::{CodecError, Result};
pub use message::{
    MessageBuilder, MessageData, PubSubMessage, DATA_FIELD, ERROR_QUALIFIER, QUALIFIER_FIELD,
    STREAM_ID_FIELD,
};
