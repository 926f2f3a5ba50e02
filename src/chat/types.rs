use std::time::Duration;

use super::parser::MsgKind;

/// Role of a connection inside a session. The kind decides which pool
/// owns the connection, what traffic it carries and which inbound lines
/// it forwards downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnKind {
    /// Receives channel traffic for a bounded set of joined channels.
    Read,
    /// Carries outbound chat messages, rotated to spread rate load.
    Send,
    /// Single dedicated connection for whisper traffic.
    Whisper,
}

impl ConnKind {
    /// Forwarding filter: whisper connections forward only whispers,
    /// read connections everything but whispers (the whisper connection
    /// already delivers those), send connections nothing.
    pub fn forwards(self, kind: MsgKind) -> bool {
        match self {
            ConnKind::Read => kind != MsgKind::Whisper,
            ConnKind::Send => false,
            ConnKind::Whisper => kind == MsgKind::Whisper,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ConnKind::Read => "read",
            ConnKind::Send => "send",
            ConnKind::Whisper => "whisper",
        }
    }
}

/// One logical chat account.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Case-normalized account id (keys the broker's session map).
    pub account: String,
    /// Upstream credential; empty means an anonymous read-only login.
    pub credential: String,
    pub nick: String,
}

impl Identity {
    pub fn new(credential: impl Into<String>, nick: impl Into<String>) -> Self {
        let nick = nick.into();
        Self {
            account: nick.to_lowercase(),
            credential: credential.into(),
            nick,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.credential.is_empty()
    }
}

/// Upstream throughput and capacity limits. These mirror externally
/// imposed (and occasionally changing) server-side constraints, so they
/// are configuration rather than hard-coded literals.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Channels a single read connection may serve.
    pub channels_per_conn: usize,
    /// Messages one send connection may carry per rate window.
    pub msgs_per_window: i32,
    /// Sliding window for the per-connection message counter.
    pub rate_window: Duration,
    /// Minimum interval between dispatched joins, process-wide.
    pub join_interval: Duration,
    /// Period of the liveness probe cycle.
    pub probe_period: Duration,
    /// Grace window after a probe PING before a connection is declared dead.
    pub probe_grace: Duration,
    /// Send connections idle longer than this are pruned...
    pub send_idle_cutoff: Duration,
    /// ...unless the send pool is already at or below this floor.
    pub send_pool_floor: usize,
    /// Attempts for an outbound message before giving up.
    pub say_attempts: u32,
    /// Poll interval while waiting for a fresh connection to become active.
    pub active_poll_interval: Duration,
    /// Upper bound on that wait.
    pub active_wait_max: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            channels_per_conn: 50,
            msgs_per_window: 15,
            rate_window: Duration::from_secs(30),
            join_interval: Duration::from_millis(300),
            probe_period: Duration::from_secs(60),
            probe_grace: Duration::from_secs(10),
            send_idle_cutoff: Duration::from_secs(600),
            send_pool_floor: 2,
            say_attempts: 3,
            active_poll_interval: Duration::from_millis(100),
            active_wait_max: Duration::from_secs(15),
        }
    }
}
