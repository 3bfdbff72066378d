//! Session layer over an unreliable datagram transport.
//!
//! Turns a fire-and-forget [`Transport`](pubwire_transport::Transport) into
//! liveness-checked sessions:
//! - a CONNECT / CONNECT_ACK handshake driven by a retry-with-timeout loop
//! - periodic HEARTBEAT frames in both directions
//! - teardown on request, on DISCONNECT or when heartbeats stop
//!
//! [`SessionListener`] is the responder, [`ClientConnector`] the initiator.

pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod heartbeat;
pub mod listener;
pub mod liveness;
pub mod retry;
pub mod state;

#[cfg(test)]
mod testing;

pub use client::{ClientConnector, ClientSession, SessionHandle};
pub use config::SessionConfig;
pub use connector::{ConnectRequest, ServerConnector};
pub use error::{Result, SessionError};
pub use heartbeat::{HeartbeatHandle, HeartbeatSender};
pub use listener::{ServerSession, SessionListener};
pub use liveness::LivenessMonitor;
pub use retry::{spawn_retry, RetryError, RetryTask};
pub use state::SessionState;
