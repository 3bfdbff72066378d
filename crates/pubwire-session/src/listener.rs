use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pubwire_frame::{decode_frame, ControlFrame, Frame};
use pubwire_transport::{Inbound, Publication, SendOutcome, Subscription, Transport};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::connector::{ConnectRequest, ServerConnector};
use crate::error::Result;
use crate::liveness::LivenessMonitor;
use crate::state::SessionState;

const ACCEPT_BACKLOG: usize = 64;

/// Accepts sessions on the server control stream.
///
/// A background task reads control frames, runs one [`ServerConnector`] per
/// CONNECT, feeds HEARTBEATs to each session's liveness monitor and disposes
/// sessions on DISCONNECT or heartbeat loss. Malformed frames are dropped.
pub struct SessionListener {
    shared: Arc<ListenerShared>,
    incoming: mpsc::Receiver<ServerSession>,
}

struct ListenerShared {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    next_session_id: AtomicU64,
    next_stream_id: AtomicI32,
    registry: Mutex<Registry>,
    token: CancellationToken,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<u64, Entry>,
    requests: HashMap<Uuid, u64>,
}

struct Entry {
    session: ServerSession,
    liveness: Option<LivenessMonitor>,
}

impl SessionListener {
    /// Subscribe to the configured server control stream and start accepting.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(transport: Arc<dyn Transport>, config: SessionConfig) -> Result<Self> {
        let control =
            transport.subscribe(&config.server_channel, config.server_control_stream_id)?;
        info!(
            channel = %config.server_channel,
            stream_id = config.server_control_stream_id,
            "session listener bound"
        );

        let shared = Arc::new(ListenerShared {
            next_session_id: AtomicU64::new(1),
            next_stream_id: AtomicI32::new(config.server_session_stream_id_base),
            transport,
            config,
            registry: Mutex::new(Registry::default()),
            token: CancellationToken::new(),
        });
        let (tx, incoming) = mpsc::channel(ACCEPT_BACKLOG);
        tokio::spawn(control_loop(control, Arc::clone(&shared), tx));

        Ok(Self { shared, incoming })
    }

    /// Wait for the next session to finish its handshake.
    ///
    /// Returns `None` after [`shutdown`](Self::shutdown).
    pub async fn accept(&mut self) -> Option<ServerSession> {
        self.incoming.recv().await
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Sessions that are handshaking or connected.
    pub fn session_count(&self) -> usize {
        self.shared.lock().sessions.len()
    }

    /// Stop accepting and dispose every live session.
    pub fn shutdown(&self) {
        if self.shared.token.is_cancelled() {
            return;
        }
        self.shared.token.cancel();

        let entries: Vec<Entry> = {
            let mut registry = self.shared.lock();
            registry.requests.clear();
            registry.sessions.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.stop();
        }
        info!("session listener shut down");
    }
}

impl Drop for SessionListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for SessionListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionListener")
            .field("channel", &self.shared.config.server_channel)
            .field("stream_id", &self.shared.config.server_control_stream_id)
            .field("sessions", &self.session_count())
            .finish()
    }
}

impl ListenerShared {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove `session_id` and dispose it. No-op if it is already gone.
    fn forget(&self, session_id: u64, reason: &str) {
        let entry = {
            let mut registry = self.lock();
            let entry = registry.sessions.remove(&session_id);
            if let Some(entry) = &entry {
                registry
                    .requests
                    .remove(&entry.session.connector.connect_request_id());
            }
            entry
        };
        if let Some(entry) = entry {
            debug!(session_id, reason, "removing session");
            entry.stop();
        }
    }

    fn on_connect(self: &Arc<Self>, request: ConnectRequest, sender: &str, accept: &mpsc::Sender<ServerSession>) {
        if let Some(session_id) = self.lock().requests.get(&request.connect_request_id) {
            trace!(session_id, %sender, "duplicate CONNECT");
            return;
        }

        let config = &self.config;
        let control = match self
            .transport
            .open_publication(&request.client_channel, request.client_control_stream_id)
        {
            Ok(control) => control,
            Err(err) => {
                warn!(%sender, error = %err, "cannot reach client control stream");
                return;
            }
        };
        let data = match self
            .transport
            .open_publication(&request.client_channel, request.client_session_stream_id)
        {
            Ok(data) => data,
            Err(err) => {
                control.close();
                warn!(%sender, error = %err, "cannot reach client session stream");
                return;
            }
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let connector = ServerConnector::new(control, &request, session_id, stream_id, config);
        let session = ServerSession {
            connector,
            data,
            client: sender.to_string(),
        };

        {
            let mut registry = self.lock();
            registry
                .requests
                .insert(request.connect_request_id, session_id);
            registry.sessions.insert(
                session_id,
                Entry {
                    session: session.clone(),
                    liveness: None,
                },
            );
        }
        debug!(
            session_id,
            stream_id,
            %sender,
            connect_request_id = %request.connect_request_id,
            "handshaking"
        );

        tokio::spawn(handshake(Arc::clone(self), session, accept.clone()));
    }

    /// DISCONNECT is honored only from the initiator that opened the session.
    fn on_disconnect(&self, session_id: u64, sender: &str) {
        let owned = match self.lock().sessions.get(&session_id) {
            Some(entry) => entry.session.client() == sender,
            None => {
                trace!(session_id, %sender, "DISCONNECT for unknown session");
                return;
            }
        };
        if owned {
            self.forget(session_id, "client disconnected");
        } else {
            warn!(session_id, %sender, "ignoring DISCONNECT from a different sender");
        }
    }

    fn on_heartbeat(&self, session_id: u64) {
        match self.lock().sessions.get(&session_id) {
            Some(Entry {
                liveness: Some(liveness),
                ..
            }) => liveness.touch(),
            Some(_) => trace!(session_id, "heartbeat before handshake completed"),
            None => trace!(session_id, "heartbeat for unknown session"),
        }
    }
}

impl Entry {
    fn stop(self) {
        if let Some(liveness) = &self.liveness {
            liveness.stop();
        }
        self.session.dispose();
    }
}

async fn handshake(
    shared: Arc<ListenerShared>,
    session: ServerSession,
    accept: mpsc::Sender<ServerSession>,
) {
    let session_id = session.session_id();
    if let Err(err) = session.connector.connect().await {
        shared.forget(session_id, "handshake failed");
        debug!(session_id, error = %err, "handshake failed");
        return;
    }

    let liveness = LivenessMonitor::start(shared.config.heartbeat_timeout, {
        let shared = Arc::downgrade(&shared);
        move || {
            if let Some(shared) = shared.upgrade() {
                shared.forget(session_id, "client heartbeat lost");
            }
        }
    });
    {
        let mut registry = shared.lock();
        match registry.sessions.get_mut(&session_id) {
            Some(entry) => entry.liveness = Some(liveness.clone()),
            None => {
                liveness.stop();
                return;
            }
        }
    }

    // Sessions disposed through their own handle leave the registry too.
    tokio::spawn({
        let shared = Arc::downgrade(&shared);
        let session = session.clone();
        async move {
            session.disposed().await;
            if let Some(shared) = shared.upgrade() {
                shared.forget(session_id, "disposed");
            }
        }
    });

    if accept.send(session).await.is_err() {
        shared.forget(session_id, "listener closed");
    }
}

async fn control_loop(
    mut control: Subscription,
    shared: Arc<ListenerShared>,
    accept: mpsc::Sender<ServerSession>,
) {
    loop {
        let inbound = tokio::select! {
            biased;
            _ = shared.token.cancelled() => break,
            inbound = control.recv() => inbound,
        };
        let Some(Inbound { sender, payload }) = inbound else {
            warn!("server control subscription closed");
            break;
        };

        let Frame { session_id, body } = match decode_frame(&payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%sender, error = %err, "dropping control frame");
                continue;
            }
        };

        match body {
            ControlFrame::Connect { .. } => {
                if let Some(request) = ConnectRequest::from_frame(&body) {
                    shared.on_connect(request, &sender, &accept);
                }
            }
            ControlFrame::Heartbeat => shared.on_heartbeat(session_id),
            ControlFrame::Disconnect { session_id } => shared.on_disconnect(session_id, &sender),
            ControlFrame::ConnectAck { .. } => {
                debug!(%sender, session_id, "unexpected CONNECT_ACK on server control stream");
            }
        }
    }
    debug!("session listener control loop stopped");
}

/// A session accepted by a [`SessionListener`].
///
/// Cheap to clone; clones refer to the same session.
#[derive(Clone)]
pub struct ServerSession {
    connector: ServerConnector,
    data: Arc<dyn Publication>,
    client: String,
}

impl ServerSession {
    pub fn session_id(&self) -> u64 {
        self.connector.session_id()
    }

    pub fn server_session_stream_id(&self) -> i32 {
        self.connector.server_session_stream_id()
    }

    /// Sender identity of the initiator's CONNECT.
    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn state(&self) -> SessionState {
        self.connector.state()
    }

    pub fn connector(&self) -> &ServerConnector {
        &self.connector
    }

    /// Offer one datagram on the initiator's session data stream.
    pub fn offer(&self, payload: &[u8]) -> SendOutcome {
        if self.connector.state().is_disposed() {
            return SendOutcome::Closed;
        }
        self.data.offer(payload)
    }

    /// Dispose the connector and release the data destination.
    ///
    /// The data destination is closed even when the connector was already
    /// disposed on its own. Returns `true` only for the call that disposed
    /// the connector.
    pub fn dispose(&self) -> bool {
        let released = self.connector.dispose();
        self.data.close();
        released
    }

    pub async fn disposed(&self) {
        self.connector.disposed().await;
    }
}

impl fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("session_id", &self.session_id())
            .field("client", &self.client)
            .field("state", &self.state())
            .finish()
    }
}
