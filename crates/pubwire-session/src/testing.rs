//! Scripted transport doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use pubwire_frame::{decode_frame, MessageType};
use pubwire_transport::{Publication, SendOutcome};

/// A publication that answers offers from a script, then with a fallback.
#[derive(Debug)]
pub(crate) struct ScriptedPublication {
    script: Mutex<VecDeque<SendOutcome>>,
    fallback: SendOutcome,
    attempts: AtomicUsize,
    sent: Mutex<Vec<Bytes>>,
    close_calls: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptedPublication {
    pub(crate) fn new(
        script: impl IntoIterator<Item = SendOutcome>,
        fallback: SendOutcome,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            attempts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn always(outcome: SendOutcome) -> Arc<Self> {
        Self::new([], outcome)
    }

    /// Number of `offer` calls made while open.
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Payloads that were reported as sent.
    pub(crate) fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    /// Sent payloads of the given frame type.
    pub(crate) fn sent_of(&self, message_type: MessageType) -> usize {
        self.sent()
            .iter()
            .filter(|payload| {
                decode_frame(payload).map(|f| f.message_type()).ok() == Some(message_type)
            })
            .count()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl Publication for ScriptedPublication {
    fn offer(&self, payload: &[u8]) -> SendOutcome {
        if self.closed.load(Ordering::SeqCst) {
            return SendOutcome::Closed;
        }
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        if outcome == SendOutcome::Sent {
            self.sent
                .lock()
                .unwrap()
                .push(Bytes::copy_from_slice(payload));
        }
        outcome
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn channel(&self) -> &str {
        "scripted"
    }

    fn stream_id(&self) -> i32 {
        9
    }
}
