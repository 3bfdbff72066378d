//! Session-oriented publish/subscribe over unreliable datagram transports.
//!
//! pubwire layers liveness-checked sessions and a JSON message envelope on
//! top of a fire-and-forget datagram medium such as UDP.
//!
//! # Crate Structure
//!
//! - [`transport`]: datagram transport abstraction (in-memory, UDP)
//! - [`frame`]: binary control frames (CONNECT, CONNECT_ACK, HEARTBEAT, DISCONNECT)
//! - [`codec`]: JSON envelope codec with zero-copy binary payloads
//! - [`session`]: handshake, retry, heartbeat and teardown
//! - [`pubsub`]: topic publisher and subscriber built on sessions
//! - `logging`: stderr `tracing` setup (behind the `logging` feature)

pub mod error;
#[cfg(feature = "logging")]
pub mod logging;
pub mod pubsub;

pub use error::{PubSubError, Result};
pub use pubsub::{PubSubClient, PubSubConfig, PubSubServer, TopicPublisher, TopicSubscriber};

/// Re-export transport types.
pub mod transport {
    pub use pubwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use pubwire_frame::*;
}

/// Re-export envelope codec types.
pub mod codec {
    pub use pubwire_codec::*;
}

/// Re-export session types.
pub mod session {
    pub use pubwire_session::*;
}
