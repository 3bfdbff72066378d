use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// Default number of datagrams buffered per subscription before new ones are dropped.
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 1024;

/// Result of a non-blocking [`Publication::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The datagram was handed to the medium.
    Sent,
    /// The publication is permanently closed. Retrying is pointless.
    Closed,
    /// Not sent right now (no receiver yet, full buffer, socket busy). May succeed later.
    Backpressured,
}

impl SendOutcome {
    /// True if the datagram was handed to the medium.
    pub fn is_sent(self) -> bool {
        matches!(self, SendOutcome::Sent)
    }
}

impl fmt::Display for SendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendOutcome::Sent => f.write_str("sent"),
            SendOutcome::Closed => f.write_str("closed"),
            SendOutcome::Backpressured => f.write_str("backpressured"),
        }
    }
}

/// A send handle bound to one channel + stream.
///
/// Implementations must serialize concurrent `offer` calls themselves; the
/// session layer may share one publication between a retry task and a
/// heartbeat task.
pub trait Publication: Send + Sync + fmt::Debug {
    /// Offer one datagram without blocking.
    fn offer(&self, payload: &[u8]) -> SendOutcome;

    /// Close the publication. Idempotent; later offers report [`SendOutcome::Closed`].
    fn close(&self);

    /// Whether [`Publication::close`] has been called.
    fn is_closed(&self) -> bool;

    /// Channel address this publication sends to.
    fn channel(&self) -> &str;

    /// Stream id this publication sends on.
    fn stream_id(&self) -> i32;
}

/// One received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Opaque identity of the sending endpoint.
    pub sender: String,
    /// Datagram payload (stream id already stripped).
    pub payload: Bytes,
}

impl Inbound {
    pub fn new(sender: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            sender: sender.into(),
            payload: payload.into(),
        }
    }
}

/// Receive side of one channel + stream.
///
/// Yields `None` once the owning transport stops delivering to it.
pub struct Subscription {
    channel: String,
    stream_id: i32,
    rx: mpsc::Receiver<Inbound>,
}

impl Subscription {
    /// Wrap the receiving half of a delivery channel.
    pub fn new(channel: impl Into<String>, stream_id: i32, rx: mpsc::Receiver<Inbound>) -> Self {
        Self {
            channel: channel.into(),
            stream_id,
            rx,
        }
    }

    /// Wait for the next datagram.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }

    /// Take the next datagram if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Inbound> {
        self.rx.try_recv().ok()
    }

    /// Channel address this subscription listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Stream id this subscription listens on.
    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// An unreliable, unordered, multiplexed datagram medium.
pub trait Transport: Send + Sync {
    /// Open a send handle toward `channel` on `stream_id`.
    fn open_publication(&self, channel: &str, stream_id: i32) -> Result<Arc<dyn Publication>>;

    /// Start receiving datagrams addressed to `channel` on `stream_id`.
    fn subscribe(&self, channel: &str, stream_id: i32) -> Result<Subscription>;
}

/// Human-readable `channel/stream` label for logs.
pub fn describe(publication: &dyn Publication) -> String {
    format!("{}#{}", publication.channel(), publication.stream_id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_outcome_display() {
        assert_eq!(SendOutcome::Sent.to_string(), "sent");
        assert_eq!(SendOutcome::Closed.to_string(), "closed");
        assert_eq!(SendOutcome::Backpressured.to_string(), "backpressured");
        assert!(SendOutcome::Sent.is_sent());
        assert!(!SendOutcome::Backpressured.is_sent());
    }

    #[tokio::test]
    async fn subscription_yields_buffered_then_none() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new("mem:a", 7, rx);
        tx.send(Inbound::new("peer", Bytes::from_static(b"x")))
            .await
            .unwrap();
        drop(tx);

        let first = sub.recv().await.unwrap();
        assert_eq!(first.sender, "peer");
        assert_eq!(first.payload.as_ref(), b"x");
        assert!(sub.recv().await.is_none());
        assert_eq!(sub.channel(), "mem:a");
        assert_eq!(sub.stream_id(), 7);
    }
}
