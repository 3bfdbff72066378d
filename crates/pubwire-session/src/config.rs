use std::time::Duration;

/// Channel the responder listens on by default.
pub const DEFAULT_SERVER_CHANNEL: &str = "127.0.0.1:13000";
/// Channel the initiator listens on by default.
pub const DEFAULT_CLIENT_CHANNEL: &str = "127.0.0.1:12000";

/// Timing and addressing for both ends of a session.
///
/// Stream ids are `i32` to match the transport. Each session on the
/// responder gets its own data stream, allocated upward from
/// `server_session_stream_id_base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long the initiator waits for CONNECT_ACK.
    pub connect_timeout: Duration,
    /// Extra time granted to a backpressured control destination.
    pub control_backpressure_timeout: Duration,
    /// Delay between two attempts of a retried send.
    pub retry_interval: Duration,
    /// Period of outgoing HEARTBEAT frames.
    pub heartbeat_interval: Duration,
    /// Silence after which the remote side is considered gone.
    pub heartbeat_timeout: Duration,
    /// Responder address.
    pub server_channel: String,
    /// Stream the responder receives control frames on.
    pub server_control_stream_id: i32,
    /// First stream id handed out for per-session data.
    pub server_session_stream_id_base: i32,
    /// Initiator address.
    pub client_channel: String,
    /// Stream the initiator receives control frames on.
    pub client_control_stream_id: i32,
    /// Stream the initiator receives session data on.
    pub client_session_stream_id: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            control_backpressure_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(5),
            server_channel: DEFAULT_SERVER_CHANNEL.to_string(),
            server_control_stream_id: 1,
            server_session_stream_id_base: 2,
            client_channel: DEFAULT_CLIENT_CHANNEL.to_string(),
            client_control_stream_id: 3,
            client_session_stream_id: 4,
        }
    }
}

impl SessionConfig {
    /// Deadline for the responder's CONNECT_ACK retries.
    pub fn ack_timeout(&self) -> Duration {
        self.connect_timeout + self.control_backpressure_timeout
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_control_backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.control_backpressure_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Override the responder address and control stream.
    pub fn with_server(mut self, channel: impl Into<String>, control_stream_id: i32) -> Self {
        self.server_channel = channel.into();
        self.server_control_stream_id = control_stream_id;
        self
    }

    /// Override the initiator address and its control/data streams.
    pub fn with_client(
        mut self,
        channel: impl Into<String>,
        control_stream_id: i32,
        session_stream_id: i32,
    ) -> Self {
        self.client_channel = channel.into();
        self.client_control_stream_id = control_stream_id;
        self.client_session_stream_id = session_stream_id;
        self
    }

    pub fn with_server_session_stream_id_base(mut self, base: i32) -> Self {
        self.server_session_stream_id_base = base;
        self
    }
}
