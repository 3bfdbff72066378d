//! Responder side of the session handshake.
//!
//! A [`ServerConnector`] owns the control destination toward one initiator.
//! It keeps offering CONNECT_ACK until the destination accepts it, then
//! heartbeats on the same destination until disposed.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pubwire_frame::{ControlFrame, Frame};
use pubwire_transport::{traits::describe, Publication, SendOutcome};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::heartbeat::{HeartbeatHandle, HeartbeatSender};
use crate::retry::{RetryError, RetryTask};
use crate::state::SessionState;

/// What an initiator asked for in its CONNECT frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Correlates the CONNECT with its CONNECT_ACK.
    pub connect_request_id: Uuid,
    /// Where the initiator listens.
    pub client_channel: String,
    /// Initiator stream for control frames.
    pub client_control_stream_id: i32,
    /// Initiator stream for session data.
    pub client_session_stream_id: i32,
}

impl ConnectRequest {
    /// Extract the request from a CONNECT body.
    pub fn from_frame(body: &ControlFrame) -> Option<Self> {
        match body {
            ControlFrame::Connect {
                connect_request_id,
                client_channel,
                client_control_stream_id,
                client_session_stream_id,
            } => Some(Self {
                connect_request_id: *connect_request_id,
                client_channel: client_channel.clone(),
                client_control_stream_id: *client_control_stream_id,
                client_session_stream_id: *client_session_stream_id,
            }),
            _ => None,
        }
    }
}

/// Handshake and teardown state machine for one responder-side session.
///
/// Cheap to clone; clones drive the same session.
#[derive(Clone)]
pub struct ServerConnector {
    shared: Arc<Shared>,
}

struct Shared {
    session_id: u64,
    server_session_stream_id: i32,
    connect_request_id: Uuid,
    control: Arc<dyn Publication>,
    config: SessionConfig,
    heartbeat: HeartbeatSender,
    lifetime: CancellationToken,
    inner: Mutex<Inner>,
}

struct Inner {
    state: SessionState,
    heartbeat: Option<HeartbeatHandle>,
}

impl ServerConnector {
    /// Bind a connector to `control`, the destination toward the initiator's
    /// control stream. Starts in [`SessionState::Handshaking`].
    pub fn new(
        control: Arc<dyn Publication>,
        request: &ConnectRequest,
        session_id: u64,
        server_session_stream_id: i32,
        config: &SessionConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                session_id,
                server_session_stream_id,
                connect_request_id: request.connect_request_id,
                control,
                config: config.clone(),
                heartbeat: HeartbeatSender::new(config.heartbeat_interval),
                lifetime: CancellationToken::new(),
                inner: Mutex::new(Inner {
                    state: SessionState::Handshaking,
                    heartbeat: None,
                }),
            }),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.shared.session_id
    }

    pub fn server_session_stream_id(&self) -> i32 {
        self.shared.server_session_stream_id
    }

    pub fn connect_request_id(&self) -> Uuid {
        self.shared.connect_request_id
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    /// Deliver CONNECT_ACK and move to [`SessionState::Connected`].
    ///
    /// Resolves once the destination accepts the ACK. Fails with
    /// [`SessionError::DestinationClosed`] as soon as the destination reports
    /// closed, or [`SessionError::HandshakeTimeout`] once
    /// [`SessionConfig::ack_timeout`] has passed. Either failure disposes the
    /// session. Calling this on a connected session is a no-op.
    ///
    /// The state change and heartbeat start happen on the retry task, so the
    /// handshake still completes if this future is dropped early.
    pub async fn connect(&self) -> Result<()> {
        match self.state() {
            SessionState::Handshaking => {}
            SessionState::Connected => return Ok(()),
            SessionState::Disposed => return Err(SessionError::Disposed),
        }

        let shared = &self.shared;
        let ack = Frame::new(
            shared.session_id,
            ControlFrame::ConnectAck {
                server_session_stream_id: shared.server_session_stream_id,
                connect_request_id: shared.connect_request_id,
            },
        )
        .to_bytes()?;

        let (tx, rx) = oneshot::channel::<Result<()>>();
        let completion = Arc::new(Mutex::new(Some(tx)));
        let on_failure = Arc::clone(&completion);
        let destination = describe(shared.control.as_ref());
        let connector = self.clone();
        let failed = self.clone();

        let _task = RetryTask::schedule(
            shared.config.retry_interval,
            shared.config.ack_timeout(),
            shared.lifetime.child_token(),
            move || match connector.shared.control.offer(&ack) {
                SendOutcome::Sent => {
                    debug!(session_id = connector.session_id(), %destination, "sent CONNECT_ACK");
                    complete(&completion, connector.establish());
                    Ok(true)
                }
                SendOutcome::Closed => Err(SessionError::DestinationClosed(destination.clone())),
                SendOutcome::Backpressured => Ok(false),
            },
            move |err| {
                let err = match err {
                    RetryError::TimedOut(timeout) => SessionError::HandshakeTimeout(timeout),
                    RetryError::Failed(err) => err,
                };
                warn!(
                    session_id = failed.session_id(),
                    destination = %describe(failed.shared.control.as_ref()),
                    error = %err,
                    "failed to send CONNECT_ACK"
                );
                failed.dispose();
                complete(&on_failure, Err(err));
            },
        );

        // A cancelled retry drops its sender without completing.
        rx.await.unwrap_or(Err(SessionError::Disposed))
    }

    /// Enter [`SessionState::Connected`] and start heartbeats, unless the
    /// session was disposed while the ACK was in flight.
    fn establish(&self) -> Result<()> {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if !inner.state.can_transition_to(SessionState::Connected) {
            return match inner.state {
                SessionState::Disposed => Err(SessionError::Disposed),
                _ => Ok(()),
            };
        }

        inner.state = SessionState::Connected;
        inner.heartbeat = Some(
            shared
                .heartbeat
                .schedule_heartbeats(Arc::clone(&shared.control), shared.session_id),
        );
        info!(session_id = shared.session_id, "session connected");
        Ok(())
    }

    /// Stop heartbeats and release the control destination.
    ///
    /// Safe to call concurrently from any number of tasks. Returns `true`
    /// only for the call that actually released the resources.
    pub fn dispose(&self) -> bool {
        let shared = &self.shared;
        let heartbeat = {
            let mut inner = shared.lock();
            if !inner.state.can_transition_to(SessionState::Disposed) {
                return false;
            }
            inner.state = SessionState::Disposed;
            inner.heartbeat.take()
        };

        shared.lifetime.cancel();
        if let Some(heartbeat) = heartbeat {
            heartbeat.dispose();
        }
        shared.control.close();
        debug!(session_id = shared.session_id, "session disposed");
        true
    }

    /// Resolves once the session has been disposed.
    pub async fn disposed(&self) {
        self.shared.lifetime.cancelled().await;
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ServerConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnector")
            .field("session_id", &self.shared.session_id)
            .field("server_session_stream_id", &self.shared.server_session_stream_id)
            .field("connect_request_id", &self.shared.connect_request_id)
            .field("control", &describe(self.shared.control.as_ref()))
            .field("state", &self.state())
            .finish()
    }
}

fn complete(slot: &Mutex<Option<oneshot::Sender<Result<()>>>>, outcome: Result<()>) {
    let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(sender) = sender {
        let _ = sender.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pubwire_frame::{decode_frame, MessageType};
    use tokio::time;

    use super::*;
    use crate::testing::ScriptedPublication;

    fn request() -> ConnectRequest {
        ConnectRequest {
            connect_request_id: Uuid::from_u64_pair(0xA, 0xB),
            client_channel: "mem:client".to_string(),
            client_control_stream_id: 3,
            client_session_stream_id: 4,
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::default()
            .with_connect_timeout(Duration::from_millis(300))
            .with_control_backpressure_timeout(Duration::from_millis(200))
            .with_retry_interval(Duration::from_millis(100))
            .with_heartbeat_interval(Duration::from_secs(1))
    }

    fn connector(publication: &Arc<ScriptedPublication>) -> ServerConnector {
        ServerConnector::new(publication.clone(), &request(), 11, 2, &config())
    }

    #[test]
    fn request_from_connect_frame() {
        let body = ControlFrame::Connect {
            connect_request_id: Uuid::from_u64_pair(0xA, 0xB),
            client_channel: "mem:client".to_string(),
            client_control_stream_id: 3,
            client_session_stream_id: 4,
        };
        assert_eq!(ConnectRequest::from_frame(&body), Some(request()));
        assert_eq!(ConnectRequest::from_frame(&ControlFrame::Heartbeat), None);
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_past_deadline_times_out() {
        let publication = ScriptedPublication::always(SendOutcome::Backpressured);
        let connector = connector(&publication);

        let result = connector.connect().await;
        assert!(matches!(
            result,
            Err(SessionError::HandshakeTimeout(timeout)) if timeout == Duration::from_millis(500)
        ));
        assert_eq!(connector.state(), SessionState::Disposed);
        assert!(publication.sent().is_empty());
        assert_eq!(publication.close_calls(), 1);

        let attempts = publication.attempts();
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(publication.attempts(), attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_third_attempt_resolves_once() {
        let publication = ScriptedPublication::new(
            [SendOutcome::Backpressured, SendOutcome::Backpressured],
            SendOutcome::Sent,
        );
        let connector = connector(&publication);

        connector.connect().await.unwrap();
        assert_eq!(connector.state(), SessionState::Connected);
        assert_eq!(publication.attempts(), 3);

        time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(publication.sent_of(MessageType::ConnectAck), 1);
        assert_eq!(publication.sent_of(MessageType::Heartbeat), 3);

        let ack = decode_frame(&publication.sent()[0]).unwrap();
        assert_eq!(ack.session_id, 11);
        assert_eq!(
            ack.body,
            ControlFrame::ConnectAck {
                server_session_stream_id: 2,
                connect_request_id: Uuid::from_u64_pair(0xA, 0xB),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_connect_still_completes_handshake() {
        let publication = ScriptedPublication::new(
            [SendOutcome::Backpressured, SendOutcome::Backpressured],
            SendOutcome::Sent,
        );
        let connector = connector(&publication);

        let abandoned = time::timeout(Duration::from_millis(50), connector.connect()).await;
        assert!(abandoned.is_err());

        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(connector.state(), SessionState::Connected);
        assert_eq!(publication.sent_of(MessageType::ConnectAck), 1);
        assert_eq!(publication.sent_of(MessageType::Heartbeat), 2);
        assert!(connector.connect().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_connect_still_disposes_on_timeout() {
        let publication = ScriptedPublication::always(SendOutcome::Backpressured);
        let connector = connector(&publication);

        let abandoned = time::timeout(Duration::from_millis(50), connector.connect()).await;
        assert!(abandoned.is_err());

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.state(), SessionState::Disposed);
        assert_eq!(publication.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_destination_fails_without_retry() {
        let publication = ScriptedPublication::always(SendOutcome::Closed);
        let connector = connector(&publication);

        let result = connector.connect().await;
        assert!(matches!(result, Err(SessionError::DestinationClosed(_))));
        assert_eq!(publication.attempts(), 1);
        assert_eq!(connector.state(), SessionState::Disposed);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_during_handshake_fails_connect() {
        let publication = ScriptedPublication::always(SendOutcome::Backpressured);
        let connector = connector(&publication);

        let pending = tokio::spawn({
            let connector = connector.clone();
            async move { connector.connect().await }
        });
        time::sleep(Duration::from_millis(150)).await;
        assert!(connector.dispose());

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(SessionError::Disposed)));
        assert_eq!(publication.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_stops_heartbeats() {
        let publication = ScriptedPublication::always(SendOutcome::Sent);
        let connector = connector(&publication);
        connector.connect().await.unwrap();

        time::sleep(Duration::from_millis(2_500)).await;
        assert!(connector.dispose());
        let heartbeats = publication.sent_of(MessageType::Heartbeat);
        assert_eq!(heartbeats, 2);

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(publication.sent_of(MessageType::Heartbeat), heartbeats);
        assert!(matches!(connector.connect().await, Err(SessionError::Disposed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dispose_releases_once() {
        let publication = ScriptedPublication::always(SendOutcome::Sent);
        let connector = connector(&publication);
        connector.connect().await.unwrap();

        let racers: Vec<_> = (0..8)
            .map(|_| {
                let connector = connector.clone();
                tokio::spawn(async move { connector.dispose() })
            })
            .collect();

        let mut released = 0;
        for racer in racers {
            if racer.await.unwrap() {
                released += 1;
            }
        }

        assert_eq!(released, 1);
        assert_eq!(publication.close_calls(), 1);
        assert_eq!(connector.state(), SessionState::Disposed);
        assert!(!connector.dispose());
    }

    #[tokio::test(start_paused = true)]
    async fn disposed_future_resolves() {
        let publication = ScriptedPublication::always(SendOutcome::Sent);
        let connector = connector(&publication);
        let watcher = tokio::spawn({
            let connector = connector.clone();
            async move { connector.disposed().await }
        });

        connector.dispose();
        time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
    }
}
