//! Initiator side of the session handshake.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pubwire_frame::{decode_frame, ControlFrame, Frame};
use pubwire_transport::{traits::describe, Inbound, Publication, SendOutcome, Subscription, Transport};
use tokio::sync::oneshot;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::heartbeat::{HeartbeatHandle, HeartbeatSender};
use crate::liveness::LivenessMonitor;
use crate::retry::{RetryError, RetryTask};
use crate::state::SessionState;

/// Opens sessions toward a responder.
pub struct ClientConnector {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
}

impl ClientConnector {
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run the handshake.
    ///
    /// Subscribes to the configured client control and data streams, sends
    /// CONNECT with a fresh correlation id until the server control stream
    /// takes it, then waits for the matching CONNECT_ACK. Unrelated or
    /// malformed control frames are dropped. Gives up with
    /// [`SessionError::HandshakeTimeout`] after `connect_timeout`.
    pub async fn connect(&self) -> Result<ClientSession> {
        let config = &self.config;
        let connect_request_id = Uuid::new_v4();

        let mut control = self
            .transport
            .subscribe(&config.client_channel, config.client_control_stream_id)?;
        let data = self
            .transport
            .subscribe(&config.client_channel, config.client_session_stream_id)?;
        let server_control = self
            .transport
            .open_publication(&config.server_channel, config.server_control_stream_id)?;
        let destination = describe(server_control.as_ref());

        let connect = Frame::new(
            0,
            ControlFrame::Connect {
                connect_request_id,
                client_channel: config.client_channel.clone(),
                client_control_stream_id: config.client_control_stream_id,
                client_session_stream_id: config.client_session_stream_id,
            },
        )
        .to_bytes()?;

        debug!(%connect_request_id, %destination, "connecting");

        let token = CancellationToken::new();
        let (failed_tx, failed_rx) = oneshot::channel();
        let publication = Arc::clone(&server_control);
        let _retry = RetryTask::schedule(
            config.retry_interval,
            config.connect_timeout,
            token.clone(),
            move || match publication.offer(&connect) {
                SendOutcome::Sent => {
                    debug!(%connect_request_id, destination = %describe(publication.as_ref()), "sent CONNECT");
                    Ok(true)
                }
                SendOutcome::Closed => Err(SessionError::DestinationClosed(describe(
                    publication.as_ref(),
                ))),
                SendOutcome::Backpressured => Ok(false),
            },
            move |err| {
                let err = match err {
                    RetryError::TimedOut(timeout) => SessionError::HandshakeTimeout(timeout),
                    RetryError::Failed(err) => err,
                };
                let _ = failed_tx.send(err);
            },
        );

        let awaited = time::timeout(
            config.connect_timeout,
            await_ack(&mut control, connect_request_id, failed_rx),
        )
        .await;
        token.cancel();

        let (session_id, server_session_stream_id) = match awaited {
            Ok(Ok(ack)) => ack,
            Ok(Err(err)) => {
                warn!(%connect_request_id, %destination, error = %err, "handshake failed");
                server_control.close();
                return Err(err);
            }
            Err(_) => {
                warn!(%connect_request_id, %destination, "no CONNECT_ACK received");
                server_control.close();
                return Err(SessionError::HandshakeTimeout(config.connect_timeout));
            }
        };

        let shared = Arc::new(ClientShared {
            session_id,
            server_session_stream_id,
            connect_request_id,
            server_control: Arc::clone(&server_control),
            lifetime: CancellationToken::new(),
            inner: Mutex::new(ClientInner {
                state: SessionState::Connected,
                heartbeat: None,
                liveness: None,
            }),
        });

        let heartbeat = HeartbeatSender::new(config.heartbeat_interval)
            .schedule_heartbeats(server_control, session_id);
        let liveness = LivenessMonitor::start(config.heartbeat_timeout, {
            let shared = Arc::downgrade(&shared);
            move || {
                if let Some(shared) = shared.upgrade() {
                    shared.dispose("server heartbeat lost");
                }
            }
        });
        {
            let mut inner = shared.lock();
            inner.heartbeat = Some(heartbeat);
            inner.liveness = Some(liveness.clone());
        }
        tokio::spawn(control_loop(control, Arc::clone(&shared), liveness));

        info!(session_id, server_session_stream_id, "session connected");
        Ok(ClientSession {
            handle: SessionHandle { shared },
            data,
        })
    }
}

impl fmt::Debug for ClientConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn await_ack(
    control: &mut Subscription,
    connect_request_id: Uuid,
    mut send_failed: oneshot::Receiver<SessionError>,
) -> Result<(u64, i32)> {
    let mut sending = true;
    loop {
        tokio::select! {
            failed = &mut send_failed, if sending => {
                sending = false;
                if let Ok(err) = failed {
                    return Err(err);
                }
            }
            inbound = control.recv() => {
                let Some(inbound) = inbound else {
                    return Err(SessionError::Disconnected(
                        "control subscription closed".to_string(),
                    ));
                };
                match decode_frame(&inbound.payload) {
                    Ok(Frame {
                        session_id,
                        body:
                            ControlFrame::ConnectAck {
                                server_session_stream_id,
                                connect_request_id: acked,
                            },
                    }) if acked == connect_request_id => {
                        debug!(session_id, sender = %inbound.sender, "received CONNECT_ACK");
                        return Ok((session_id, server_session_stream_id));
                    }
                    Ok(frame) => {
                        debug!(
                            session_id = frame.session_id,
                            message_type = %frame.message_type(),
                            "ignoring control frame while handshaking"
                        );
                    }
                    Err(err) => {
                        warn!(sender = %inbound.sender, error = %err, "dropping control frame");
                    }
                }
            }
        }
    }
}

async fn control_loop(mut control: Subscription, shared: Arc<ClientShared>, liveness: LivenessMonitor) {
    loop {
        let inbound = tokio::select! {
            biased;
            _ = shared.lifetime.cancelled() => break,
            inbound = control.recv() => inbound,
        };
        let Some(inbound) = inbound else {
            shared.dispose("control subscription closed");
            break;
        };

        let frame = match decode_frame(&inbound.payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(sender = %inbound.sender, error = %err, "dropping control frame");
                continue;
            }
        };
        if frame.session_id != shared.session_id {
            trace!(session_id = frame.session_id, "control frame for another session");
            continue;
        }

        match frame.body {
            ControlFrame::Heartbeat => liveness.touch(),
            ControlFrame::Disconnect { .. } => {
                shared.dispose("server disconnected");
                break;
            }
            ControlFrame::ConnectAck { .. } => trace!("duplicate CONNECT_ACK"),
            ControlFrame::Connect { .. } => {
                debug!(sender = %inbound.sender, "unexpected CONNECT on client control stream");
            }
        }
    }
}

struct ClientShared {
    session_id: u64,
    server_session_stream_id: i32,
    connect_request_id: Uuid,
    server_control: Arc<dyn Publication>,
    lifetime: CancellationToken,
    inner: Mutex<ClientInner>,
}

struct ClientInner {
    state: SessionState,
    heartbeat: Option<HeartbeatHandle>,
    liveness: Option<LivenessMonitor>,
}

impl ClientShared {
    fn lock(&self) -> MutexGuard<'_, ClientInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        if let Some(liveness) = &self.lock().liveness {
            liveness.touch();
        }
    }

    fn dispose(&self, reason: &str) -> bool {
        let (heartbeat, liveness) = {
            let mut inner = self.lock();
            if !inner.state.can_transition_to(SessionState::Disposed) {
                return false;
            }
            inner.state = SessionState::Disposed;
            (inner.heartbeat.take(), inner.liveness.take())
        };

        self.lifetime.cancel();
        if let Some(heartbeat) = heartbeat {
            heartbeat.dispose();
        }
        if let Some(liveness) = liveness {
            liveness.stop();
        }

        let session_id = self.session_id;
        match Frame::new(session_id, ControlFrame::Disconnect { session_id }).to_bytes() {
            Ok(frame) => {
                let outcome = self.server_control.offer(&frame);
                debug!(session_id, %outcome, "sent DISCONNECT");
            }
            Err(err) => warn!(session_id, error = %err, "failed to encode DISCONNECT"),
        }
        self.server_control.close();

        info!(session_id, reason, "session disposed");
        true
    }
}

/// Shareable control over a [`ClientSession`].
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<ClientShared>,
}

impl SessionHandle {
    pub fn session_id(&self) -> u64 {
        self.shared.session_id
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    /// Tear the session down and send a best-effort DISCONNECT.
    ///
    /// Returns `true` only for the call that performed the teardown.
    pub fn dispose(&self) -> bool {
        self.shared.dispose("disposed by caller")
    }

    /// Resolves once the session has been disposed for any reason.
    pub async fn disposed(&self) {
        self.shared.lifetime.cancelled().await;
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.shared.session_id)
            .field("state", &self.state())
            .finish()
    }
}

/// An established session, as seen by the initiator.
///
/// Dropping the session disposes it.
pub struct ClientSession {
    handle: SessionHandle,
    data: Subscription,
}

impl ClientSession {
    pub fn session_id(&self) -> u64 {
        self.handle.shared.session_id
    }

    /// Data stream the responder assigned to this session.
    pub fn server_session_stream_id(&self) -> i32 {
        self.handle.shared.server_session_stream_id
    }

    pub fn connect_request_id(&self) -> Uuid {
        self.handle.shared.connect_request_id
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Next datagram on the session data stream.
    ///
    /// Returns `None` once the session is disposed.
    pub async fn recv(&mut self) -> Option<Inbound> {
        let inbound = tokio::select! {
            biased;
            _ = self.handle.shared.lifetime.cancelled() => None,
            inbound = self.data.recv() => inbound,
        }?;
        self.handle.shared.touch();
        Some(inbound)
    }

    /// See [`SessionHandle::dispose`].
    pub fn dispose(&self) -> bool {
        self.handle.dispose()
    }

    pub async fn disposed(&self) {
        self.handle.disposed().await;
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.handle.shared.dispose("session dropped");
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("session_id", &self.session_id())
            .field("server_session_stream_id", &self.server_session_stream_id())
            .field("connect_request_id", &self.connect_request_id())
            .field("state", &self.state())
            .finish()
    }
}
