use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, TransportError};
use crate::traits::{
    Inbound, Publication, SendOutcome, Subscription, Transport, DEFAULT_SUBSCRIPTION_CAPACITY,
};

/// Stream id prefix: 4 bytes, little-endian.
pub const STREAM_HEADER_SIZE: usize = 4;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

type StreamRoutes = Arc<Mutex<HashMap<i32, mpsc::Sender<Inbound>>>>;

/// UDP datagram transport.
///
/// A channel is a `host:port` endpoint (an optional `udp://` prefix is accepted).
/// Subscribing binds the endpoint once and demultiplexes datagrams by stream id,
/// so several streams can share one port. The endpoint is unbound again once
/// its last subscription is dropped. Datagram layout:
///
/// ```text
/// ┌────────────────┬──────────────────────┐
/// │ Stream (4B LE) │ Payload              │
/// └────────────────┴──────────────────────┘
/// ```
///
/// Publications share one non-blocking send socket; a busy socket reports
/// [`SendOutcome::Backpressured`]. Fragmentation is not provided: payloads that
/// do not fit one datagram are refused.
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    send_socket: Arc<StdUdpSocket>,
    endpoints: Mutex<HashMap<SocketAddr, Endpoint>>,
    capacity: usize,
}

struct Endpoint {
    streams: StreamRoutes,
    task: JoinHandle<()>,
}

impl UdpTransport {
    /// Create a transport whose publications send from an ephemeral IPv4 port.
    pub fn new() -> Result<Self> {
        Self::with_send_addr(SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    /// Create a transport whose publications send from `addr`.
    pub fn with_send_addr(addr: SocketAddr) -> Result<Self> {
        let socket =
            StdUdpSocket::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        socket.set_nonblocking(true)?;
        debug!(local = ?socket.local_addr().ok(), "udp send socket ready");

        Ok(Self {
            inner: Arc::new(Inner {
                send_socket: Arc::new(socket),
                endpoints: Mutex::new(HashMap::new()),
                capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
            }),
        })
    }

    /// Local address of the shared send socket.
    pub fn send_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.send_socket.local_addr()?)
    }
}

impl Transport for UdpTransport {
    fn open_publication(&self, channel: &str, stream_id: i32) -> Result<Arc<dyn Publication>> {
        let target = parse_channel(channel)?;
        debug!(channel, stream_id, %target, "opened udp publication");
        Ok(Arc::new(UdpPublication {
            socket: Arc::clone(&self.inner.send_socket),
            target,
            channel: channel.to_string(),
            stream_id,
            closed: AtomicBool::new(false),
        }))
    }

    /// Bind (or reuse) the endpoint for `channel`.
    ///
    /// Must be called from within a Tokio runtime: the first subscription on an
    /// endpoint spawns its receive loop.
    fn subscribe(&self, channel: &str, stream_id: i32) -> Result<Subscription> {
        let addr = parse_channel(channel)?;
        let mut endpoints = self
            .inner
            .endpoints
            .lock()
            .map_err(|_| TransportError::Shutdown)?;

        if !endpoints.contains_key(&addr) {
            let socket =
                StdUdpSocket::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
            socket.set_nonblocking(true)?;
            let socket = UdpSocket::from_std(socket)?;
            let streams: StreamRoutes = Arc::new(Mutex::new(HashMap::new()));
            let task = tokio::spawn(receive_loop(socket, addr, Arc::clone(&streams)));
            info!(%addr, "listening on udp endpoint");
            endpoints.insert(addr, Endpoint { streams, task });
        }

        let endpoint = endpoints.get(&addr).ok_or(TransportError::Shutdown)?;
        let mut streams = endpoint
            .streams
            .lock()
            .map_err(|_| TransportError::Shutdown)?;
        if let Some(existing) = streams.get(&stream_id) {
            if !existing.is_closed() {
                return Err(TransportError::AlreadySubscribed {
                    channel: channel.to_string(),
                    stream_id,
                });
            }
        }

        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let route = tx.clone();
        streams.insert(stream_id, tx);
        debug!(%addr, stream_id, "subscribed to udp stream");

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            route.closed().await;
            if let Some(inner) = inner.upgrade() {
                inner.release(addr, stream_id, &route);
            }
        });
        Ok(Subscription::new(channel, stream_id, rx))
    }
}

impl Inner {
    /// Drop the route of a finished subscription, and the endpoint with it
    /// once no routes remain.
    fn release(&self, addr: SocketAddr, stream_id: i32, route: &mpsc::Sender<Inbound>) {
        let Ok(mut endpoints) = self.endpoints.lock() else {
            return;
        };
        let Some(endpoint) = endpoints.get(&addr) else {
            return;
        };
        let idle = match endpoint.streams.lock() {
            Ok(mut streams) => {
                if streams
                    .get(&stream_id)
                    .is_some_and(|current| current.same_channel(route))
                {
                    streams.remove(&stream_id);
                    debug!(%addr, stream_id, "unsubscribed from udp stream");
                }
                streams.is_empty()
            }
            Err(_) => return,
        };

        if idle {
            if let Some(endpoint) = endpoints.remove(&addr) {
                endpoint.task.abort();
                info!(%addr, "released udp endpoint");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(endpoints) = self.endpoints.get_mut() {
            for (addr, endpoint) in endpoints.drain() {
                endpoint.task.abort();
                debug!(%addr, "stopped udp endpoint");
            }
        }
    }
}

async fn receive_loop(socket: UdpSocket, addr: SocketAddr, streams: StreamRoutes) {
    let mut buf = vec![0u8; MAX_DATAGRAM + STREAM_HEADER_SIZE];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!(%addr, error = %err, "udp receive failed");
                continue;
            }
        };

        if len < STREAM_HEADER_SIZE {
            trace!(%addr, %from, len, "dropping runt datagram");
            continue;
        }

        let mut stream = [0u8; STREAM_HEADER_SIZE];
        stream.copy_from_slice(&buf[..STREAM_HEADER_SIZE]);
        let stream_id = i32::from_le_bytes(stream);

        let sender = match streams.lock() {
            Ok(routes) => routes.get(&stream_id).cloned(),
            Err(_) => return,
        };
        let Some(sender) = sender else {
            trace!(%addr, %from, stream_id, "no subscription for stream");
            continue;
        };

        let inbound = Inbound::new(from.to_string(), buf[STREAM_HEADER_SIZE..len].to_vec());
        match sender.try_send(inbound) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                trace!(%addr, stream_id, "subscription full, dropping datagram");
            }
            Err(TrySendError::Closed(_)) => {
                if let Ok(mut routes) = streams.lock() {
                    routes.remove(&stream_id);
                }
            }
        }
    }
}

#[derive(Debug)]
struct UdpPublication {
    socket: Arc<StdUdpSocket>,
    target: SocketAddr,
    channel: String,
    stream_id: i32,
    closed: AtomicBool,
}

impl Publication for UdpPublication {
    fn offer(&self, payload: &[u8]) -> SendOutcome {
        if self.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        if payload.len() > MAX_DATAGRAM - STREAM_HEADER_SIZE {
            error!(
                channel = %self.channel,
                size = payload.len(),
                max = MAX_DATAGRAM - STREAM_HEADER_SIZE,
                "payload does not fit one datagram"
            );
            return SendOutcome::Backpressured;
        }

        let mut datagram = Vec::with_capacity(STREAM_HEADER_SIZE + payload.len());
        datagram.extend_from_slice(&self.stream_id.to_le_bytes());
        datagram.extend_from_slice(payload);

        match self.socket.send_to(&datagram, self.target) {
            Ok(_) => SendOutcome::Sent,
            Err(err) if err.kind() == ErrorKind::WouldBlock => SendOutcome::Backpressured,
            Err(err) if err.kind() == ErrorKind::Interrupted => SendOutcome::Backpressured,
            Err(err) => {
                warn!(channel = %self.channel, error = %err, "udp send failed");
                SendOutcome::Backpressured
            }
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(channel = %self.channel, stream_id = self.stream_id, "closed udp publication");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    fn stream_id(&self) -> i32 {
        self.stream_id
    }
}

/// Resolve a `host:port` (or `udp://host:port`) channel to one socket address.
pub fn parse_channel(channel: &str) -> Result<SocketAddr> {
    let endpoint = channel.strip_prefix("udp://").unwrap_or(channel);
    let invalid = |reason: String| TransportError::InvalidChannel {
        channel: channel.to_string(),
        reason,
    };

    let mut addrs = endpoint
        .to_socket_addrs()
        .map_err(|err| invalid(err.to_string()))?;
    addrs
        .next()
        .ok_or_else(|| invalid("no address resolved".to_string()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn free_channel() -> String {
        let probe = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);
        format!("udp://{addr}")
    }

    #[test]
    fn parse_channel_accepts_prefix_and_plain() {
        let plain = parse_channel("127.0.0.1:4000").unwrap();
        let prefixed = parse_channel("udp://127.0.0.1:4000").unwrap();
        assert_eq!(plain, prefixed);
        assert_eq!(plain.port(), 4000);
    }

    #[test]
    fn parse_channel_rejects_garbage() {
        assert!(matches!(
            parse_channel("not a channel"),
            Err(TransportError::InvalidChannel { .. })
        ));
    }

    #[tokio::test]
    async fn datagrams_are_routed_by_stream() {
        let transport = UdpTransport::new().unwrap();
        let channel = free_channel();

        let mut control = transport.subscribe(&channel, 1).unwrap();
        let mut data = transport.subscribe(&channel, 2).unwrap();

        let to_data = transport.open_publication(&channel, 2).unwrap();
        let to_control = transport.open_publication(&channel, 1).unwrap();

        assert_eq!(to_data.offer(b"payload"), SendOutcome::Sent);
        assert_eq!(to_control.offer(b"control"), SendOutcome::Sent);

        let got_data = tokio::time::timeout(Duration::from_secs(2), data.recv())
            .await
            .unwrap()
            .unwrap();
        let got_control = tokio::time::timeout(Duration::from_secs(2), control.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(got_data.payload.as_ref(), b"payload");
        assert_eq!(got_control.payload.as_ref(), b"control");
        let send_port = transport.send_addr().unwrap().port();
        assert!(got_data.sender.ends_with(&format!(":{send_port}")));
    }

    #[tokio::test]
    async fn oversized_payload_is_refused() {
        let transport = UdpTransport::new().unwrap();
        let publication = transport.open_publication("127.0.0.1:9", 1).unwrap();
        let payload = vec![0u8; MAX_DATAGRAM];
        assert_eq!(publication.offer(&payload), SendOutcome::Backpressured);
    }

    #[tokio::test]
    async fn endpoint_is_released_after_last_subscription() {
        let transport = UdpTransport::new().unwrap();
        let channel = free_channel();
        let addr = parse_channel(&channel).unwrap();

        let first = transport.subscribe(&channel, 1).unwrap();
        let second = transport.subscribe(&channel, 2).unwrap();

        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(StdUdpSocket::bind(addr).is_err());

        drop(second);
        let rebound = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(socket) = StdUdpSocket::bind(addr) {
                    return socket;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("endpoint should be unbound once idle");
        drop(rebound);

        let mut again = transport.subscribe(&channel, 1).unwrap();
        let publication = transport.open_publication(&channel, 1).unwrap();
        assert_eq!(publication.offer(b"back"), SendOutcome::Sent);
        let inbound = tokio::time::timeout(Duration::from_secs(2), again.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.payload.as_ref(), b"back");
    }

    #[tokio::test]
    async fn duplicate_stream_subscription_rejected() {
        let transport = UdpTransport::new().unwrap();
        let channel = free_channel();
        let _first = transport.subscribe(&channel, 5).unwrap();
        assert!(matches!(
            transport.subscribe(&channel, 5),
            Err(TransportError::AlreadySubscribed { stream_id: 5, .. })
        ));
    }
}
