use std::net::SocketAddr;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The channel address could not be parsed for this transport.
    #[error("invalid channel address '{channel}': {reason}")]
    InvalidChannel { channel: String, reason: String },

    /// Failed to bind the subscription endpoint.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// An I/O error occurred on the transport socket.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A subscription for this channel and stream already exists.
    #[error("stream {stream_id} on channel '{channel}' already has a subscription")]
    AlreadySubscribed { channel: String, stream_id: i32 },

    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;
