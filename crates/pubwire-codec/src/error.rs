use crate::message::PubSubMessage;

/// Errors that can occur while encoding or decoding a message envelope.
///
/// The offending message is rejected as a whole; no partial message is ever
/// produced.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The first token of the envelope is not `{`.
    #[error("root must be an object")]
    RootNotObject,

    /// The buffer ends before the closing `}` of the envelope.
    #[error("root must be an object: envelope ends before closing '}}'")]
    UnexpectedEnd,

    /// The envelope structure is invalid at `offset`.
    #[error("malformed envelope at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: String },

    /// A known field holds a value of the wrong type.
    #[error("invalid value for field '{field}': {source}")]
    InvalidField {
        field: &'static str,
        source: serde_json::Error,
    },

    /// Serializing a message failed.
    #[error("failed to encode message {message}: {source}")]
    Encode {
        message: Box<PubSubMessage>,
        source: serde_json::Error,
    },

    /// Converting an application value into a structured value failed.
    #[error("failed to serialize data value: {0}")]
    Serialize(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;
