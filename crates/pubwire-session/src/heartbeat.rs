use std::sync::Arc;
use std::time::Duration;

use pubwire_frame::{ControlFrame, Frame};
use pubwire_transport::{traits::describe, Publication, SendOutcome};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Sends HEARTBEAT frames on a fixed period.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Start heartbeating `session_id` on `publication`.
    ///
    /// The first frame goes out one interval from now. Failed sends are
    /// logged and skipped; the loop only ends through the returned handle.
    pub fn schedule_heartbeats(
        &self,
        publication: Arc<dyn Publication>,
        session_id: u64,
    ) -> HeartbeatHandle {
        let token = CancellationToken::new();
        tokio::spawn(run(self.interval, publication, session_id, token.clone()));
        HeartbeatHandle { token }
    }
}

/// Stops a heartbeat loop. Clones share the same loop.
#[derive(Debug, Clone)]
pub struct HeartbeatHandle {
    token: CancellationToken,
}

impl HeartbeatHandle {
    /// Stop the loop. Safe from any task or thread, idempotent.
    pub fn dispose(&self) {
        self.token.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.token.is_cancelled()
    }
}

async fn run(
    interval: Duration,
    publication: Arc<dyn Publication>,
    session_id: u64,
    token: CancellationToken,
) {
    let destination = describe(publication.as_ref());
    let frame = match Frame::new(session_id, ControlFrame::Heartbeat).to_bytes() {
        Ok(frame) => frame,
        Err(err) => {
            warn!(session_id, error = %err, "failed to encode heartbeat");
            return;
        }
    };

    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(session_id, %destination, ?interval, "heartbeats scheduled");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match publication.offer(&frame) {
            SendOutcome::Sent => trace!(session_id, %destination, "sent heartbeat"),
            outcome => warn!(session_id, %destination, %outcome, "failed to send heartbeat"),
        }
    }

    debug!(session_id, %destination, "heartbeats stopped");
}

#[cfg(test)]
mod tests {
    use pubwire_frame::{decode_frame, MessageType};

    use super::*;
    use crate::testing::ScriptedPublication;

    const INTERVAL: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn sends_heartbeat_every_interval() {
        let publication = ScriptedPublication::always(SendOutcome::Sent);
        let handle =
            HeartbeatSender::new(INTERVAL).schedule_heartbeats(publication.clone(), 42);

        time::sleep(Duration::from_millis(350)).await;
        handle.dispose();

        let sent = publication.sent();
        assert_eq!(sent.len(), 3);
        for payload in sent {
            let frame = decode_frame(&payload).unwrap();
            assert_eq!(frame.message_type(), MessageType::Heartbeat);
            assert_eq!(frame.session_id, 42);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_loop() {
        let publication = ScriptedPublication::new(
            [SendOutcome::Backpressured, SendOutcome::Closed],
            SendOutcome::Sent,
        );
        let handle =
            HeartbeatSender::new(INTERVAL).schedule_heartbeats(publication.clone(), 1);

        time::sleep(Duration::from_millis(450)).await;
        handle.dispose();

        assert_eq!(publication.attempts(), 4);
        assert_eq!(publication.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_from_another_task_stops_sending() {
        let publication = ScriptedPublication::always(SendOutcome::Sent);
        let handle =
            HeartbeatSender::new(INTERVAL).schedule_heartbeats(publication.clone(), 7);

        time::sleep(Duration::from_millis(150)).await;
        let remote = handle.clone();
        tokio::spawn(async move { remote.dispose() }).await.unwrap();
        assert!(handle.is_disposed());

        let before = publication.attempts();
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(publication.attempts(), before);
        assert_eq!(before, 1);
    }
}
