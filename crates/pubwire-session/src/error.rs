use std::time::Duration;

/// Errors that can occur while establishing or running a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] pubwire_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] pubwire_frame::FrameError),

    /// No CONNECT or CONNECT_ACK got through within the configured window.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The control destination was permanently closed.
    #[error("destination {0} has been closed")]
    DestinationClosed(String),

    /// The session was disposed before the operation completed.
    #[error("session disposed")]
    Disposed,

    /// The remote side went away.
    #[error("peer disconnected: {0}")]
    Disconnected(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
