/// Errors surfaced by the publish/subscribe layer.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] pubwire_transport::TransportError),

    /// Session-level error.
    #[error("session error: {0}")]
    Session(#[from] pubwire_session::SessionError),

    /// Envelope encode/decode error.
    #[error("codec error: {0}")]
    Codec(#[from] pubwire_codec::CodecError),
}

pub type Result<T> = std::result::Result<T, PubSubError>;
