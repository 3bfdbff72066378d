use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::traits::{
    Inbound, Publication, SendOutcome, Subscription, Transport, DEFAULT_SUBSCRIPTION_CAPACITY,
};

type Routes = HashMap<(String, i32), mpsc::Sender<Inbound>>;

/// In-process loopback transport.
///
/// All handles created from one `MemoryTransport` (and its [`MemoryTransport::peer`]s)
/// share a routing table. A publication whose channel + stream has no live
/// subscription reports [`SendOutcome::Backpressured`], mirroring a real medium
/// with no connected receiver.
#[derive(Clone)]
pub struct MemoryTransport {
    identity: String,
    routes: Arc<Mutex<Routes>>,
    capacity: usize,
}

impl MemoryTransport {
    /// Create a fresh routing table with sender identity `identity`.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            routes: Arc::new(Mutex::new(HashMap::new())),
            capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
        }
    }

    /// Another endpoint on the same routing table, sending as `identity`.
    pub fn peer(&self, identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            routes: Arc::clone(&self.routes),
            capacity: self.capacity,
        }
    }

    /// Override the per-subscription buffer size.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Sender identity attached to datagrams offered through this endpoint.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Drop every subscription route. Pending `recv` calls return `None`.
    pub fn shutdown(&self) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.clear();
        }
    }
}

impl Transport for MemoryTransport {
    fn open_publication(&self, channel: &str, stream_id: i32) -> Result<Arc<dyn Publication>> {
        debug!(channel, stream_id, identity = %self.identity, "opened memory publication");
        Ok(Arc::new(MemoryPublication {
            identity: self.identity.clone(),
            channel: channel.to_string(),
            stream_id,
            routes: Arc::clone(&self.routes),
            closed: AtomicBool::new(false),
        }))
    }

    fn subscribe(&self, channel: &str, stream_id: i32) -> Result<Subscription> {
        let mut routes = self.routes.lock().map_err(|_| TransportError::Shutdown)?;
        let key = (channel.to_string(), stream_id);
        if let Some(existing) = routes.get(&key) {
            if !existing.is_closed() {
                return Err(TransportError::AlreadySubscribed {
                    channel: channel.to_string(),
                    stream_id,
                });
            }
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        routes.insert(key, tx);
        debug!(channel, stream_id, "subscribed to memory channel");
        Ok(Subscription::new(channel, stream_id, rx))
    }
}

#[derive(Debug)]
struct MemoryPublication {
    identity: String,
    channel: String,
    stream_id: i32,
    routes: Arc<Mutex<Routes>>,
    closed: AtomicBool,
}

impl Publication for MemoryPublication {
    fn offer(&self, payload: &[u8]) -> SendOutcome {
        if self.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }

        let sender = {
            let Ok(routes) = self.routes.lock() else {
                return SendOutcome::Closed;
            };
            match routes.get(&(self.channel.clone(), self.stream_id)) {
                Some(sender) => sender.clone(),
                None => return SendOutcome::Backpressured,
            }
        };

        let inbound = Inbound::new(self.identity.clone(), payload.to_vec());
        match sender.try_send(inbound) {
            Ok(()) => SendOutcome::Sent,
            Err(TrySendError::Full(_)) => {
                trace!(channel = %self.channel, stream_id = self.stream_id, "memory subscription full");
                SendOutcome::Backpressured
            }
            Err(TrySendError::Closed(_)) => SendOutcome::Backpressured,
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(channel = %self.channel, stream_id = self.stream_id, "closed memory publication");
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
