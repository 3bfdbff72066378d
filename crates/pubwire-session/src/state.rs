use std::fmt;

/// Lifecycle of one session.
///
/// Transitions only move forward: `Handshaking -> Connected -> Disposed`,
/// or straight from `Handshaking` to `Disposed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// CONNECT_ACK not yet delivered.
    Handshaking,
    /// Handshake done, heartbeats running.
    Connected,
    /// Terminal.
    Disposed,
}

impl SessionState {
    pub fn is_disposed(self) -> bool {
        matches!(self, SessionState::Disposed)
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Handshaking, SessionState::Connected)
                | (SessionState::Handshaking, SessionState::Disposed)
                | (SessionState::Connected, SessionState::Disposed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Handshaking => f.write_str("handshaking"),
            SessionState::Connected => f.write_str("connected"),
            SessionState::Disposed => f.write_str("disposed"),
        }
    }
}
