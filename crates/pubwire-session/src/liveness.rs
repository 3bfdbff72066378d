use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Watches for inbound frames and reports when they stop arriving.
///
/// Every received HEARTBEAT or data frame should call [`touch`](Self::touch).
/// If `timeout` passes without one, the callback runs once and the monitor
/// stops. Clones observe the same peer.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    last_seen: Arc<Mutex<Instant>>,
    timeout: Duration,
    token: CancellationToken,
}

impl LivenessMonitor {
    /// Start monitoring from now.
    pub fn start<F>(timeout: Duration, on_lost: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let monitor = Self {
            last_seen: Arc::new(Mutex::new(Instant::now())),
            timeout,
            token: CancellationToken::new(),
        };
        tokio::spawn(watch(monitor.clone(), on_lost));
        monitor
    }

    /// Record that the peer just showed a sign of life.
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop without invoking the callback.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    fn deadline(&self) -> Instant {
        self.last_seen() + self.timeout
    }
}

async fn watch<F: FnOnce()>(monitor: LivenessMonitor, on_lost: F) {
    loop {
        let deadline = monitor.deadline();
        tokio::select! {
            biased;
            _ = monitor.token.cancelled() => return,
            _ = time::sleep_until(deadline) => {}
        }

        if Instant::now() >= monitor.deadline() {
            break;
        }
    }

    debug!(timeout = ?monitor.timeout, "peer went silent");
    monitor.token.cancel();
    on_lost();
}
