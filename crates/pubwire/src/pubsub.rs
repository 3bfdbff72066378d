//! Topic publish/subscribe on top of sessions.
//!
//! The server encodes each published message once and fans the envelope out
//! to every connected session through a broadcast channel it owns. Each
//! subscriber is one client session.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use pubwire_codec::{MessageCodec, PubSubMessage};
use pubwire_session::{
    ClientConnector, ClientSession, ServerSession, SessionConfig, SessionHandle, SessionListener,
};
use pubwire_transport::{SendOutcome, Transport};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::Result;

/// Envelopes buffered per session before a slow session starts losing them.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Configuration for [`PubSubServer`] and [`PubSubClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubConfig {
    /// Session timing and addressing.
    pub session: SessionConfig,
    /// Capacity of the server's fan-out channel.
    pub broadcast_capacity: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

impl PubSubConfig {
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity.max(1);
        self
    }
}

/// Accepts subscriber sessions and forwards published messages to them.
pub struct PubSubServer {
    sender: broadcast::Sender<Bytes>,
    codec: MessageCodec,
    token: CancellationToken,
}

impl PubSubServer {
    /// Start listening on the configured server channel.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(transport: Arc<dyn Transport>, config: PubSubConfig) -> Result<Self> {
        let (sender, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self::with_sender(transport, config.session, sender)
    }

    /// Start listening and fan out through `sender`.
    ///
    /// Lets the caller own the broadcast channel, e.g. to observe published
    /// envelopes with extra receivers.
    pub fn with_sender(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        sender: broadcast::Sender<Bytes>,
    ) -> Result<Self> {
        let listener = SessionListener::bind(transport, config)?;
        let token = CancellationToken::new();
        tokio::spawn(accept_loop(listener, sender.clone(), token.clone()));

        Ok(Self {
            sender,
            codec: MessageCodec::new(),
            token,
        })
    }

    /// A handle for publishing messages to every subscriber.
    pub fn publisher(&self) -> TopicPublisher {
        TopicPublisher {
            sender: self.sender.clone(),
            codec: self.codec,
        }
    }

    /// Stop accepting and tear down all sessions.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

impl Drop for PubSubServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for PubSubServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubServer")
            .field("receivers", &self.sender.receiver_count())
            .field("shutdown", &self.token.is_cancelled())
            .finish()
    }
}

async fn accept_loop(
    mut listener: SessionListener,
    sender: broadcast::Sender<Bytes>,
    token: CancellationToken,
) {
    loop {
        let session = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            session = listener.accept() => session,
        };
        let Some(session) = session else {
            break;
        };

        debug!(session_id = session.session_id(), client = %session.client(), "subscriber joined");
        let envelopes = sender.subscribe();
        tokio::spawn(forward(session, envelopes, token.child_token()));
    }
    listener.shutdown();
}

async fn forward(
    session: ServerSession,
    mut envelopes: broadcast::Receiver<Bytes>,
    token: CancellationToken,
) {
    let session_id = session.session_id();
    loop {
        let envelope = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = session.disposed() => break,
            envelope = envelopes.recv() => envelope,
        };

        match envelope {
            Ok(envelope) => match session.offer(&envelope) {
                SendOutcome::Sent => trace!(session_id, len = envelope.len(), "forwarded"),
                SendOutcome::Backpressured => {
                    warn!(session_id, len = envelope.len(), "subscriber backpressured, dropping message");
                }
                SendOutcome::Closed => break,
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(session_id, skipped, "subscriber lagging, messages skipped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    session.dispose();
    debug!(session_id, "subscriber left");
}

/// Publishes messages to every session of one [`PubSubServer`].
#[derive(Clone)]
pub struct TopicPublisher {
    sender: broadcast::Sender<Bytes>,
    codec: MessageCodec,
}

impl TopicPublisher {
    /// Encode `message` once and hand it to every connected subscriber.
    ///
    /// Returns how many subscribers it was queued for. Having none is not an
    /// error.
    pub fn next(&self, message: &PubSubMessage) -> Result<usize> {
        let envelope = self.codec.encode(message)?;
        Ok(self.sender.send(envelope).unwrap_or(0))
    }

    /// Number of sessions currently receiving.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl fmt::Debug for TopicPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicPublisher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Opens subscriber sessions toward a [`PubSubServer`].
#[derive(Debug)]
pub struct PubSubClient {
    connector: ClientConnector,
}

impl PubSubClient {
    pub fn new(transport: Arc<dyn Transport>, config: PubSubConfig) -> Self {
        Self {
            connector: ClientConnector::new(transport, config.session),
        }
    }

    /// Shorthand for `PubSubClient::new(..).subscribe()`.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        config: PubSubConfig,
    ) -> Result<TopicSubscriber> {
        Self::new(transport, config).subscribe().await
    }

    /// Open a session and start receiving.
    ///
    /// Only one subscriber per configured client channel and stream can be
    /// live at a time.
    pub async fn subscribe(&self) -> Result<TopicSubscriber> {
        let session = self.connector.connect().await?;
        Ok(TopicSubscriber {
            session,
            codec: MessageCodec::new(),
        })
    }
}

/// Receives published messages over one session.
#[derive(Debug)]
pub struct TopicSubscriber {
    session: ClientSession,
    codec: MessageCodec,
}

impl TopicSubscriber {
    /// Wait for the next message.
    ///
    /// An envelope that fails to decode is surfaced as
    /// [`PubSubMessage::error`] instead of ending the stream. Returns `None`
    /// once the session is gone.
    pub async fn next(&mut self) -> Option<PubSubMessage> {
        let inbound = self.session.recv().await?;
        match self.codec.decode(&inbound.payload) {
            Ok(message) => Some(message),
            Err(err) => Some(PubSubMessage::error(&err)),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session.session_id()
    }

    /// Control over the underlying session from other tasks.
    pub fn handle(&self) -> SessionHandle {
        self.session.handle()
    }

    /// Tear the session down. Returns `true` for the call that did it.
    pub fn dispose(&self) -> bool {
        self.session.dispose()
    }
}
