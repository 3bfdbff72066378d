/// Errors that can occur during control frame decoding.
///
/// Every variant means the frame is malformed: the frame is dropped and the
/// session it claims to belong to is unaffected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer ends before the fixed layout does.
    #[error("malformed frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// The type tag is not a known message type.
    #[error("malformed frame: unknown message type {0}")]
    UnknownType(u8),

    /// A length field is negative.
    #[error("malformed frame: invalid length field {0}")]
    InvalidLength(i32),

    /// The client channel is not valid UTF-8.
    #[error("malformed frame: client channel is not valid UTF-8")]
    InvalidUtf8,

    /// Bytes remain after the fixed body layout.
    #[error("malformed frame: {0} trailing bytes after body")]
    TrailingBytes(usize),
}

pub type Result<T> = std::result::Result<T, FrameError>;
