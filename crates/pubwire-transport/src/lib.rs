//! Datagram publication/subscription transport abstraction.
//!
//! Provides the minimal medium the session layer runs on:
//! - "send a datagram on a named channel + stream" ([`Publication::offer`])
//! - "receive datagrams with sender identity" ([`Subscription::recv`])
//!
//! Delivery is unreliable and unordered. Two implementations ship here:
//! an in-process [`MemoryTransport`] and a [`UdpTransport`].
//!
//! This is the lowest layer of pubwire. Everything else builds on top of
//! the [`Transport`] trait provided here.

pub mod error;
pub mod memory;
pub mod traits;
pub mod udp;

pub use error::{Result, TransportError};
pub use memory::MemoryTransport;
pub use traits::{Inbound, Publication, SendOutcome, Subscription, Transport};
pub use udp::UdpTransport;
