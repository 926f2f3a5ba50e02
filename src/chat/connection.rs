use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use super::error::{ChatError, Result};
use super::parser;
use super::session::SessionMsg;
use super::types::{ConnKind, Identity, Limits};

const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
const BASE_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Handle to one transport session. Cheap to clone; all clones share the
/// same flags, counter and writer. The transport itself is owned by the
/// read task (read half) and the writer slot (write half); taking the
/// writer and signaling shutdown together close it.
#[derive(Clone)]
pub struct Connection {
    pub id: Uuid,
    pub kind: ConnKind,
    /// Logged in without a credential; outbound chat is rejected.
    pub anon: bool,
    active: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    msg_count: Arc<AtomicI32>,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    shutdown: Arc<watch::Sender<bool>>,
    limits: Limits,
}

impl Connection {
    /// Creates the connection and spawns its task: dial (with backoff),
    /// login handshake, then the read loop. When the read loop exits for
    /// any reason other than an explicit shutdown, `ConnDied` is reported
    /// to the owning session before the task ends.
    pub fn spawn(
        kind: ConnKind,
        identity: &Identity,
        upstream_addr: String,
        limits: Limits,
        events_tx: mpsc::UnboundedSender<String>,
        session_tx: mpsc::Sender<SessionMsg>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let conn = Self {
            id: Uuid::new_v4(),
            kind,
            anon: identity.is_anonymous(),
            active: Arc::new(AtomicBool::new(false)),
            alive: Arc::new(AtomicBool::new(false)),
            msg_count: Arc::new(AtomicI32::new(0)),
            writer: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(shutdown_tx),
            limits,
        };
        tokio::spawn(run_connection(
            conn.clone(),
            identity.clone(),
            upstream_addr,
            shutdown_rx,
            events_tx,
            session_tx,
        ));
        conn
    }

    /// True once the server acknowledged the login.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Cleared at the start of a liveness probe; the next PONG sets it.
    pub fn reset_alive(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Messages routed through this connection within the current window.
    pub fn msg_count(&self) -> i32 {
        self.msg_count.load(Ordering::SeqCst)
    }

    /// Counts one outbound message and schedules the matching decrement
    /// one rate window later. The decrement is cancelled if the
    /// connection shuts down first, so a torn-down connection never
    /// leaks a pending decrement.
    pub fn count_msg(&self) {
        self.msg_count.fetch_add(1, Ordering::SeqCst);
        let count = Arc::clone(&self.msg_count);
        let mut shutdown_rx = self.shutdown.subscribe();
        let window = self.limits.rate_window;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(window) => {
                    count.fetch_sub(1, Ordering::SeqCst);
                }
                _ = shutdown_rx.changed() => {}
            }
        });
    }

    /// Writes one CRLF-terminated protocol line. The writer mutex
    /// serializes concurrent writers (router, liveness prober, read
    /// task answering PING).
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(ChatError::Inactive);
        };
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Writes a chat command, rejecting anonymous connections (terminal
    /// for the message) and connections whose login is not yet
    /// acknowledged (transient; the caller may retry or replace).
    pub async fn send_chat(&self, line: &str) -> Result<()> {
        if self.anon {
            return Err(ChatError::Anonymous);
        }
        if !self.is_active() {
            return Err(ChatError::Inactive);
        }
        self.send_line(line).await
    }

    /// Bounded poll until the login is acknowledged. Returns false if the
    /// wait times out or the connection shuts down first.
    pub async fn wait_active(&self) -> bool {
        let deadline = Instant::now() + self.limits.active_wait_max;
        let shutdown_rx = self.shutdown.subscribe();
        while Instant::now() < deadline {
            if self.is_active() {
                return true;
            }
            if *shutdown_rx.borrow() {
                return false;
            }
            tokio::time::sleep(self.limits.active_poll_interval).await;
        }
        self.is_active()
    }

    /// Terminal: stops the read task, drops the write half and cancels
    /// pending rate decrements. Safe to call more than once.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        self.writer.lock().await.take();
    }

    #[cfg(test)]
    pub(crate) fn stub(kind: ConnKind, anon: bool, limits: Limits) -> Self {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            kind,
            anon,
            active: Arc::new(AtomicBool::new(false)),
            alive: Arc::new(AtomicBool::new(false)),
            msg_count: Arc::new(AtomicI32::new(0)),
            writer: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(shutdown_tx),
            limits,
        }
    }
}

async fn run_connection(
    conn: Connection,
    identity: Identity,
    upstream_addr: String,
    mut shutdown_rx: watch::Receiver<bool>,
    events_tx: mpsc::UnboundedSender<String>,
    session_tx: mpsc::Sender<SessionMsg>,
) {
    tracing::debug!(
        conn.id = %conn.id,
        kind = conn.kind.label(),
        "connection task started"
    );

    let Some(stream) = dial(&conn, &upstream_addr, &mut shutdown_rx).await else {
        return;
    };
    let (read_half, write_half) = stream.into_split();
    *conn.writer.lock().await = Some(write_half);

    if let Err(e) = login(&conn, &identity).await {
        tracing::warn!(conn.id = %conn.id, error = %e, "login handshake failed");
        let _ = session_tx
            .send(SessionMsg::ConnDied { conn_id: conn.id })
            .await;
        return;
    }

    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                tracing::debug!(conn.id = %conn.id, "connection task shut down");
                return;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        tracing::info!(conn.id = %conn.id, "connection closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(conn.id = %conn.id, error = %e, "read error on connection");
                        break;
                    }
                };
                let line = line.trim_end_matches(['\r', '\n']);
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = handle_line(&conn, line, &events_tx).await {
                    tracing::warn!(conn.id = %conn.id, error = %e, "write failed while handling line");
                    break;
                }
            }
        }
    }

    // Any read or write failure is connection death; the session removes
    // this connection from its pool and requeues its channels.
    let _ = session_tx
        .send(SessionMsg::ConnDied { conn_id: conn.id })
        .await;
}

/// Dials the upstream server, backing off exponentially between failed
/// attempts so an unreachable server is not busy-looped against.
async fn dial(
    conn: &Connection,
    upstream_addr: &str,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<TcpStream> {
    let mut backoff = BASE_BACKOFF;
    loop {
        match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(upstream_addr)).await {
            Ok(Ok(stream)) => {
                tracing::debug!(
                    conn.id = %conn.id,
                    kind = conn.kind.label(),
                    addr = %upstream_addr,
                    "connected to chat server"
                );
                return Some(stream);
            }
            Ok(Err(e)) => {
                tracing::warn!(conn.id = %conn.id, error = %e, "dial failed");
            }
            Err(_) => {
                tracing::warn!(conn.id = %conn.id, timeout = ?DIAL_TIMEOUT, "dial timed out");
            }
        }
        tokio::select! {
            _ = shutdown_rx.changed() => return None,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Login sequence: PASS/NICK for credentialed sessions, a guest nick for
/// anonymous ones, then the capability requests.
async fn login(conn: &Connection, identity: &Identity) -> Result<()> {
    if conn.anon {
        let guest_nick = format!("justinfan{}", rand::random::<u32>() % 80000 + 1000);
        conn.send_line(&format!("{} {}", parser::CMD_NICK, guest_nick))
            .await?;
    } else {
        conn.send_line(&format!("{} {}", parser::CMD_PASS, identity.credential))
            .await?;
        conn.send_line(&format!("{} {}", parser::CMD_NICK, identity.nick))
            .await?;
    }
    conn.send_line(parser::CAP_REQ_TAGS).await?;
    conn.send_line(parser::CAP_REQ_COMMANDS).await?;
    Ok(())
}

async fn handle_line(
    conn: &Connection,
    line: &str,
    events_tx: &mpsc::UnboundedSender<String>,
) -> Result<()> {
    // PONG must go out promptly: liveness on the server side depends on
    // it, so it bypasses rate accounting and routing entirely.
    if parser::is_ping(line) {
        conn.send_line(&format!("PONG {}", parser::SERVER_HOST))
            .await?;
        return Ok(());
    }
    // PONGs are the liveness signal and are never forwarded.
    if parser::is_pong(line) {
        conn.alive.store(true, Ordering::SeqCst);
        return Ok(());
    }
    if parser::is_welcome(line) {
        tracing::debug!(conn.id = %conn.id, kind = conn.kind.label(), "login acknowledged");
        conn.active.store(true, Ordering::SeqCst);
    }
    if conn.kind.forwards(parser::classify(line)) {
        // Downstream gone means the session is about to close; nothing
        // useful to do with the line.
        let _ = events_tx.send(line.to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::testutil::spawn_fake_upstream;

    fn fast_limits() -> Limits {
        Limits {
            active_poll_interval: Duration::from_millis(5),
            active_wait_max: Duration::from_secs(2),
            ..Limits::default()
        }
    }

    fn dummy_session_tx() -> (mpsc::Sender<SessionMsg>, mpsc::Receiver<SessionMsg>) {
        mpsc::channel(16)
    }

    #[tokio::test(start_paused = true)]
    async fn rate_counter_decays_after_window() {
        let conn = Connection::stub(ConnKind::Send, false, Limits::default());
        conn.count_msg();
        conn.count_msg();
        conn.count_msg();
        assert_eq!(conn.msg_count(), 3);

        tokio::time::sleep(Duration::from_secs(29)).await;
        tokio::task::yield_now().await;
        assert_eq!(conn.msg_count(), 3, "window has not elapsed yet");

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(conn.msg_count(), 0, "all decrements fired");
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_decrements() {
        let conn = Connection::stub(ConnKind::Send, false, Limits::default());
        conn.count_msg();
        assert_eq!(conn.msg_count(), 1);

        conn.close().await;
        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert_eq!(conn.msg_count(), 1, "decrement was cancelled by shutdown");
    }

    #[tokio::test]
    async fn handshake_and_welcome_activate_connection() {
        let upstream = spawn_fake_upstream(true).await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (session_tx, _session_rx) = dummy_session_tx();
        let identity = Identity::new("oauth:secret", "somebot");

        let conn = Connection::spawn(
            ConnKind::Read,
            &identity,
            upstream.addr.clone(),
            fast_limits(),
            events_tx,
            session_tx,
        );

        assert!(conn.wait_active().await, "welcome line should activate");
        let lines = upstream.received_lines().await;
        assert!(lines.contains(&"PASS oauth:secret".to_string()));
        assert!(lines.contains(&"NICK somebot".to_string()));
        assert!(lines.contains(&parser::CAP_REQ_TAGS.to_string()));
        assert!(lines.contains(&parser::CAP_REQ_COMMANDS.to_string()));

        conn.close().await;
    }

    #[tokio::test]
    async fn anonymous_login_uses_guest_nick() {
        let upstream = spawn_fake_upstream(true).await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (session_tx, _session_rx) = dummy_session_tx();
        let identity = Identity::new("", "whoever");

        let conn = Connection::spawn(
            ConnKind::Read,
            &identity,
            upstream.addr.clone(),
            fast_limits(),
            events_tx,
            session_tx,
        );
        assert!(conn.wait_active().await);

        let lines = upstream.received_lines().await;
        assert!(
            lines.iter().any(|l| l.starts_with("NICK justinfan")),
            "anonymous login should use a guest nick, got {lines:?}"
        );
        assert!(
            !lines.iter().any(|l| l.starts_with("PASS")),
            "anonymous login must not send PASS"
        );

        assert!(matches!(
            conn.send_chat("PRIVMSG #chan :hi").await,
            Err(ChatError::Anonymous)
        ));

        conn.close().await;
    }

    #[tokio::test]
    async fn server_ping_is_answered_and_consumed() {
        let upstream = spawn_fake_upstream(true).await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (session_tx, _session_rx) = dummy_session_tx();
        let identity = Identity::new("oauth:secret", "somebot");

        let conn = Connection::spawn(
            ConnKind::Read,
            &identity,
            upstream.addr.clone(),
            fast_limits(),
            events_tx,
            session_tx,
        );
        assert!(conn.wait_active().await);

        upstream.push_line("PING :tmi.twitch.tv").await;
        upstream
            .wait_for_line(|l| l.starts_with("PONG"), Duration::from_secs(2))
            .await
            .expect("PING must be answered with PONG");

        // Neither the PING nor any PONG reaches the downstream stream;
        // the welcome line and the privmsg do.
        upstream
            .push_line(":someone!someone@someone.tmi.twitch.tv PRIVMSG #chan :after")
            .await;
        loop {
            let forwarded = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
                .await
                .expect("privmsg is forwarded")
                .expect("events channel open");
            assert!(!forwarded.contains("PING "), "PING must be consumed");
            assert!(!forwarded.starts_with("PONG"), "PONG must be consumed");
            if forwarded.contains("PRIVMSG #chan :after") {
                break;
            }
        }

        conn.close().await;
    }

    #[tokio::test]
    async fn read_connection_filters_whispers() {
        let upstream = spawn_fake_upstream(true).await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (session_tx, _session_rx) = dummy_session_tx();
        let identity = Identity::new("oauth:secret", "somebot");

        let conn = Connection::spawn(
            ConnKind::Read,
            &identity,
            upstream.addr.clone(),
            fast_limits(),
            events_tx,
            session_tx,
        );
        assert!(conn.wait_active().await);

        upstream
            .push_line(":someone!someone@someone.tmi.twitch.tv WHISPER somebot :psst")
            .await;
        upstream
            .push_line(":someone!someone@someone.tmi.twitch.tv PRIVMSG #chan :visible")
            .await;

        loop {
            let forwarded = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
                .await
                .expect("privmsg is forwarded")
                .expect("events channel open");
            assert!(
                !forwarded.contains("WHISPER"),
                "whisper must be filtered on a read connection, got {forwarded}"
            );
            if forwarded.contains("PRIVMSG #chan :visible") {
                break;
            }
        }

        conn.close().await;
    }

    #[tokio::test]
    async fn read_loop_exit_reports_connection_death() {
        let upstream = spawn_fake_upstream(true).await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (session_tx, mut session_rx) = dummy_session_tx();
        let identity = Identity::new("oauth:secret", "somebot");

        let conn = Connection::spawn(
            ConnKind::Read,
            &identity,
            upstream.addr.clone(),
            fast_limits(),
            events_tx,
            session_tx,
        );
        assert!(conn.wait_active().await);

        upstream.drop_connections();

        let msg = tokio::time::timeout(Duration::from_secs(2), session_rx.recv())
            .await
            .expect("death must be reported")
            .expect("sender still alive");
        match msg {
            SessionMsg::ConnDied { conn_id } => assert_eq!(conn_id, conn.id),
            other => panic!("expected ConnDied, got {other:?}"),
        }
    }
}
