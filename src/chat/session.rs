//! Session actor: owns the connection pools and channel map for one chat
//! account and routes every outward command (join, part, say, whisper).
//!
//! All pool and channel-map mutation happens on the actor task, which is
//! the single exclusion mechanism; connection read loops, probe timers
//! and send tasks report back through the actor's mailbox.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use super::connection::Connection;
use super::error::{ChatError, Result};
use super::parser;
use super::scheduler::JoinSchedulerHandle;
use super::types::{ConnKind, Identity, Limits};

const SESSION_MAILBOX: usize = 64;

#[derive(Debug)]
pub enum SessionMsg {
    /// External join request; replies once the channel is mapped.
    QueueJoin {
        channel: String,
        respond_to: Option<oneshot::Sender<Result<()>>>,
    },
    /// A queued join arriving from the scheduler at the throttled rate.
    DispatchJoin { channel: String },
    Part {
        channel: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Say {
        line: String,
        respond_to: Option<oneshot::Sender<Result<()>>>,
    },
    Whisper {
        text: String,
        respond_to: Option<oneshot::Sender<Result<()>>>,
    },
    /// A spawned send task hit a write failure; the connection is retired
    /// and the line re-routed through normal selection.
    SendFailed {
        conn_id: Uuid,
        line: String,
        attempts: u32,
        respond_to: Option<oneshot::Sender<Result<()>>>,
        kind: ConnKind,
    },
    /// JOIN could not be written; teardown requeues the reserved channel.
    JoinFailed { conn_id: Uuid, channel: String },
    /// Read loop exited (read error, EOF, failed dial or handshake).
    ConnDied { conn_id: Uuid },
    /// Grace window after a probe PING elapsed for this connection.
    ProbeExpired { conn_id: Uuid },
    Snapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

/// Point-in-time view of the session's pools, used by tests and
/// diagnostics.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub read_conns: Vec<ConnInfo>,
    pub send_conns: Vec<ConnInfo>,
    pub whisper_conn: Option<ConnInfo>,
    pub channels: HashMap<String, Vec<Uuid>>,
}

#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub id: Uuid,
    pub active: bool,
    pub msg_count: i32,
    pub joins: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionMsg>,
    pub account: String,
}

impl SessionHandle {
    pub fn spawn(
        identity: Identity,
        upstream_addr: String,
        limits: Limits,
        scheduler: JoinSchedulerHandle,
        events_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(SESSION_MAILBOX);
        let account = identity.account.clone();
        let actor = SessionActor::new(
            identity,
            upstream_addr,
            limits,
            scheduler,
            events_tx,
            receiver,
            sender.clone(),
        );
        tokio::spawn(run_session_actor(actor));
        Self { sender, account }
    }

    /// Joins a channel, resolving once it is mapped to a connection.
    /// Idempotent: a second call for an already-served channel succeeds
    /// immediately.
    pub async fn join(&self, channel: &str) -> Result<()> {
        let (respond_tx, respond_rx) = oneshot::channel();
        self.send(SessionMsg::QueueJoin {
            channel: parser::normalize_channel(channel),
            respond_to: Some(respond_tx),
        })
        .await?;
        recv_response(respond_rx).await?
    }

    /// Queues a join without waiting for it to be dispatched. Used by the
    /// downstream command loop so a burst of joins does not serialize
    /// command handling behind the global join throttle.
    pub async fn enqueue_join(&self, channel: &str) -> Result<()> {
        self.send(SessionMsg::QueueJoin {
            channel: parser::normalize_channel(channel),
            respond_to: None,
        })
        .await
    }

    pub async fn part(&self, channel: &str) -> Result<()> {
        let (respond_tx, respond_rx) = oneshot::channel();
        self.send(SessionMsg::Part {
            channel: parser::normalize_channel(channel),
            respond_to: respond_tx,
        })
        .await?;
        recv_response(respond_rx).await?
    }

    /// Sends a complete chat command line (e.g. `PRIVMSG #chan :text`)
    /// through the least-loaded send connection.
    pub async fn say(&self, line: &str) -> Result<()> {
        let (respond_tx, respond_rx) = oneshot::channel();
        self.send(SessionMsg::Say {
            line: line.to_string(),
            respond_to: Some(respond_tx),
        })
        .await?;
        recv_response(respond_rx).await?
    }

    pub async fn whisper(&self, text: &str) -> Result<()> {
        let (respond_tx, respond_rx) = oneshot::channel();
        self.send(SessionMsg::Whisper {
            text: text.to_string(),
            respond_to: Some(respond_tx),
        })
        .await?;
        recv_response(respond_rx).await?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (respond_tx, respond_rx) = oneshot::channel();
        self.send(SessionMsg::Snapshot {
            respond_to: respond_tx,
        })
        .await?;
        recv_response(respond_rx).await
    }

    /// One-shot, irreversible teardown of every connection in every pool.
    pub async fn close(&self) {
        let (respond_tx, respond_rx) = oneshot::channel();
        if self
            .send(SessionMsg::Close {
                respond_to: respond_tx,
            })
            .await
            .is_ok()
        {
            let _ = respond_rx.await;
        }
    }

    async fn send(&self, msg: SessionMsg) -> Result<()> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| ChatError::SessionClosed)
    }
}

async fn recv_response<T>(rx: oneshot::Receiver<T>) -> Result<T> {
    rx.await.map_err(|_| ChatError::SessionClosed)
}

struct ConnEntry {
    conn: Connection,
    /// Channels this connection currently serves (read connections only).
    joins: Vec<String>,
    last_used: Instant,
}

struct SessionActor {
    identity: Identity,
    upstream_addr: String,
    limits: Limits,
    scheduler: JoinSchedulerHandle,
    events_tx: mpsc::UnboundedSender<String>,
    receiver: mpsc::Receiver<SessionMsg>,
    self_tx: mpsc::Sender<SessionMsg>,
    read_pool: Vec<ConnEntry>,
    send_pool: Vec<ConnEntry>,
    whisper_conn: Option<ConnEntry>,
    channels: HashMap<String, Vec<Uuid>>,
    /// Channels queued with the scheduler; values are callers waiting for
    /// the dispatch.
    pending_joins: HashMap<String, Vec<oneshot::Sender<Result<()>>>>,
    open: bool,
}

impl SessionActor {
    #[allow(clippy::too_many_arguments)]
    fn new(
        identity: Identity,
        upstream_addr: String,
        limits: Limits,
        scheduler: JoinSchedulerHandle,
        events_tx: mpsc::UnboundedSender<String>,
        receiver: mpsc::Receiver<SessionMsg>,
        self_tx: mpsc::Sender<SessionMsg>,
    ) -> Self {
        Self {
            identity,
            upstream_addr,
            limits,
            scheduler,
            events_tx,
            receiver,
            self_tx,
            read_pool: Vec::new(),
            send_pool: Vec::new(),
            whisper_conn: None,
            channels: HashMap::new(),
            pending_joins: HashMap::new(),
            open: true,
        }
    }

    fn handle_message(&mut self, msg: SessionMsg) {
        match msg {
            SessionMsg::QueueJoin {
                channel,
                respond_to,
            } => self.queue_join(channel, respond_to),
            SessionMsg::DispatchJoin { channel } => self.dispatch_join(channel),
            SessionMsg::Part {
                channel,
                respond_to,
            } => self.handle_part(channel, respond_to),
            SessionMsg::Say { line, respond_to } => self.handle_say(line, 0, respond_to),
            SessionMsg::Whisper { text, respond_to } => {
                let line = format!(
                    "{} {} :{}",
                    parser::CMD_PRIVMSG,
                    parser::WHISPER_TARGET,
                    text
                );
                self.handle_whisper(line, 0, respond_to);
            }
            SessionMsg::SendFailed {
                conn_id,
                line,
                attempts,
                respond_to,
                kind,
            } => {
                self.teardown(conn_id, "send failure");
                match kind {
                    ConnKind::Whisper => self.handle_whisper(line, attempts, respond_to),
                    _ => self.handle_say(line, attempts, respond_to),
                }
            }
            SessionMsg::JoinFailed { conn_id, channel } => {
                tracing::debug!(
                    conn.id = %conn_id,
                    channel.name = %channel,
                    "join write failed"
                );
                // Teardown requeues the reserved channel with the rest.
                self.teardown(conn_id, "join failure");
            }
            SessionMsg::ConnDied { conn_id } => self.teardown(conn_id, "read loop exited"),
            SessionMsg::ProbeExpired { conn_id } => self.handle_probe_expired(conn_id),
            SessionMsg::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            SessionMsg::Close { respond_to } => {
                self.shutdown_pools();
                let _ = respond_to.send(());
            }
        }
    }

    /// Records a join request: no-op when already served, deduplicated
    /// when already queued, otherwise handed to the global scheduler.
    fn queue_join(&mut self, channel: String, respond_to: Option<oneshot::Sender<Result<()>>>) {
        if !self.open {
            respond(respond_to, Err(ChatError::SessionClosed));
            return;
        }
        if self
            .channels
            .get(&channel)
            .is_some_and(|serving| !serving.is_empty())
        {
            tracing::debug!(channel.name = %channel, "already joined");
            respond(respond_to, Ok(()));
            return;
        }
        match self.pending_joins.entry(channel.clone()) {
            Entry::Occupied(mut waiting) => {
                if let Some(tx) = respond_to {
                    waiting.get_mut().push(tx);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(respond_to.into_iter().collect());
                self.scheduler.enqueue(self.self_tx.clone(), channel);
            }
        }
    }

    /// Assigns the channel to a read connection with spare capacity
    /// (creating one when every connection is full) and spawns the JOIN
    /// write against it.
    fn dispatch_join(&mut self, channel: String) {
        let responders = self.pending_joins.remove(&channel).unwrap_or_default();
        if !self.open {
            for tx in responders {
                let _ = tx.send(Err(ChatError::SessionClosed));
            }
            return;
        }
        if self
            .channels
            .get(&channel)
            .is_some_and(|serving| !serving.is_empty())
        {
            tracing::debug!(channel.name = %channel, "already joined, dropping queued join");
            for tx in responders {
                let _ = tx.send(Ok(()));
            }
            return;
        }

        let idx = match self
            .read_pool
            .iter()
            .position(|e| e.joins.len() < self.limits.channels_per_conn)
        {
            Some(idx) => idx,
            None => {
                self.create_connection(ConnKind::Read);
                self.read_pool.len() - 1
            }
        };
        let entry = &mut self.read_pool[idx];
        entry.joins.push(channel.clone());
        let serving = self.channels.entry(channel.clone()).or_default();
        serving.clear();
        serving.push(entry.conn.id);
        for tx in responders {
            let _ = tx.send(Ok(()));
        }

        let conn = entry.conn.clone();
        let session_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let sent = if conn.wait_active().await {
                conn.send_line(&format!("{} {}", parser::CMD_JOIN, channel))
                    .await
            } else {
                Err(ChatError::Inactive)
            };
            match sent {
                Ok(()) => {
                    tracing::debug!(conn.id = %conn.id, channel.name = %channel, "joined channel");
                }
                Err(e) => {
                    tracing::warn!(
                        conn.id = %conn.id,
                        channel.name = %channel,
                        error = %e,
                        "JOIN failed, retiring connection"
                    );
                    let _ = session_tx
                        .send(SessionMsg::JoinFailed {
                            conn_id: conn.id,
                            channel,
                        })
                        .await;
                }
            }
        });
    }

    fn handle_part(&mut self, channel: String, respond_to: oneshot::Sender<Result<()>>) {
        if !self.open {
            let _ = respond_to.send(Err(ChatError::SessionClosed));
            return;
        }
        let Some(serving) = self.channels.remove(&channel) else {
            let _ = respond_to.send(Ok(()));
            return;
        };
        for conn_id in serving {
            let Some(entry) = self.read_pool.iter_mut().find(|e| e.conn.id == conn_id) else {
                continue;
            };
            entry.joins.retain(|c| c != &channel);
            let conn = entry.conn.clone();
            let session_tx = self.self_tx.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                if let Err(e) = conn
                    .send_line(&format!("{} {}", parser::CMD_PART, channel))
                    .await
                {
                    tracing::warn!(
                        conn.id = %conn.id,
                        channel.name = %channel,
                        error = %e,
                        "PART failed, retiring connection"
                    );
                    // The channel is already out of this entry's join
                    // list, so the teardown will not resubmit it, and
                    // closing the transport clears its membership on the
                    // server side. The PART itself is never resent.
                    let _ = session_tx
                        .send(SessionMsg::ConnDied { conn_id: conn.id })
                        .await;
                }
            });
        }
        let _ = respond_to.send(Ok(()));
    }

    /// Routes an outbound chat line through the send connection with the
    /// fewest in-window messages, opening a new one when every connection
    /// is at the rate ceiling.
    fn handle_say(
        &mut self,
        line: String,
        attempts: u32,
        respond_to: Option<oneshot::Sender<Result<()>>>,
    ) {
        if !self.open {
            respond(respond_to, Err(ChatError::SessionClosed));
            return;
        }
        if self.identity.is_anonymous() {
            respond(respond_to, Err(ChatError::Anonymous));
            return;
        }
        if attempts >= self.limits.say_attempts {
            tracing::warn!(attempts, "dropping outbound message after repeated send failures");
            respond(respond_to, Err(ChatError::RetriesExhausted(attempts)));
            return;
        }

        let idx = self
            .send_pool
            .iter()
            .enumerate()
            .filter(|(_, e)| e.conn.msg_count() < self.limits.msgs_per_window)
            .min_by_key(|(_, e)| e.conn.msg_count())
            .map(|(idx, _)| idx);
        let idx = match idx {
            Some(idx) => idx,
            None => {
                self.create_connection(ConnKind::Send);
                self.send_pool.len() - 1
            }
        };
        let entry = &mut self.send_pool[idx];
        entry.last_used = Instant::now();
        let conn = entry.conn.clone();
        // Count before the active wait so a burst of concurrent messages
        // does not pile onto one under-counted connection.
        conn.count_msg();
        self.spawn_send(conn, line, attempts, respond_to, ConnKind::Send);
    }

    /// Whisper sends always go through the dedicated whisper connection,
    /// creating one when it is missing.
    fn handle_whisper(
        &mut self,
        line: String,
        attempts: u32,
        respond_to: Option<oneshot::Sender<Result<()>>>,
    ) {
        if !self.open {
            respond(respond_to, Err(ChatError::SessionClosed));
            return;
        }
        if self.identity.is_anonymous() {
            respond(respond_to, Err(ChatError::Anonymous));
            return;
        }
        if attempts >= self.limits.say_attempts {
            respond(respond_to, Err(ChatError::RetriesExhausted(attempts)));
            return;
        }
        if self.whisper_conn.is_none() {
            self.create_connection(ConnKind::Whisper);
        }
        let Some(entry) = self.whisper_conn.as_mut() else {
            respond(
                respond_to,
                Err(ChatError::ActorComm("whisper connection unavailable".into())),
            );
            return;
        };
        entry.last_used = Instant::now();
        let conn = entry.conn.clone();
        conn.count_msg();
        self.spawn_send(conn, line, attempts, respond_to, ConnKind::Whisper);
    }

    fn spawn_send(
        &self,
        conn: Connection,
        line: String,
        attempts: u32,
        respond_to: Option<oneshot::Sender<Result<()>>>,
        kind: ConnKind,
    ) {
        let session_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let sent = if conn.wait_active().await {
                conn.send_chat(&line).await
            } else {
                Err(ChatError::Inactive)
            };
            match sent {
                Ok(()) => respond(respond_to, Ok(())),
                // Anonymous is terminal for the message: a replacement
                // connection would be just as anonymous.
                Err(ChatError::Anonymous) => respond(respond_to, Err(ChatError::Anonymous)),
                Err(e) => {
                    tracing::warn!(conn.id = %conn.id, error = %e, "send failed, retiring connection");
                    let _ = session_tx
                        .send(SessionMsg::SendFailed {
                            conn_id: conn.id,
                            line,
                            attempts: attempts + 1,
                            respond_to,
                            kind,
                        })
                        .await;
                }
            }
        });
    }

    /// Removes the connection from its pool, requeues any channels left
    /// without a serving connection, then closes the transport. Safe to
    /// call for an id that was already retired.
    fn teardown(&mut self, conn_id: Uuid, reason: &str) {
        let entry = if let Some(pos) = self.read_pool.iter().position(|e| e.conn.id == conn_id) {
            Some(self.read_pool.remove(pos))
        } else if let Some(pos) = self.send_pool.iter().position(|e| e.conn.id == conn_id) {
            Some(self.send_pool.remove(pos))
        } else if self
            .whisper_conn
            .as_ref()
            .is_some_and(|e| e.conn.id == conn_id)
        {
            self.whisper_conn.take()
        } else {
            None
        };
        let Some(entry) = entry else {
            return;
        };

        tracing::info!(
            conn.id = %conn_id,
            kind = entry.conn.kind.label(),
            reason,
            joined = entry.joins.len(),
            "retiring connection"
        );

        let mut requeue = Vec::new();
        for channel in &entry.joins {
            if let Some(serving) = self.channels.get_mut(channel) {
                serving.retain(|id| *id != conn_id);
                if serving.is_empty() {
                    requeue.push(channel.clone());
                }
            }
        }
        // Requeue before the transport closes so no channel is left
        // silently unserved.
        if self.open {
            for channel in requeue {
                self.queue_join(channel, None);
            }
        }

        let was_whisper = entry.conn.kind == ConnKind::Whisper;
        let conn = entry.conn;
        tokio::spawn(async move { conn.close().await });

        if self.open && was_whisper {
            self.create_connection(ConnKind::Whisper);
        }
    }

    fn handle_probe_expired(&mut self, conn_id: Uuid) {
        let Some(conn) = self.find_conn(conn_id) else {
            return;
        };
        if conn.is_alive() {
            tracing::trace!(conn.id = %conn_id, "probe answered");
        } else {
            self.teardown(conn_id, "liveness probe timed out");
        }
    }

    /// One liveness cycle: sweep unserved channels back through the
    /// scheduler, prune idle send connections above the pool floor, and
    /// probe every active connection independently.
    fn run_probe_cycle(&mut self) {
        if !self.open {
            return;
        }

        let unserved: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, serving)| serving.is_empty())
            .map(|(channel, _)| channel.clone())
            .collect();
        for channel in unserved {
            tracing::debug!(channel.name = %channel, "channel has no serving connection, requeueing");
            self.queue_join(channel, None);
        }

        let now = Instant::now();
        let idle: Vec<Uuid> = self
            .send_pool
            .iter()
            .filter(|e| now.duration_since(e.last_used) >= self.limits.send_idle_cutoff)
            .map(|e| e.conn.id)
            .collect();
        for conn_id in idle {
            if self.send_pool.len() > self.limits.send_pool_floor {
                self.teardown(conn_id, "idle send connection");
            } else if let Some(entry) = self.send_pool.iter_mut().find(|e| e.conn.id == conn_id) {
                entry.last_used = now;
            }
        }

        let probes: Vec<Connection> = self
            .read_pool
            .iter()
            .map(|e| &e.conn)
            .chain(self.send_pool.iter().map(|e| &e.conn))
            .chain(self.whisper_conn.iter().map(|e| &e.conn))
            .filter(|c| c.is_active())
            .cloned()
            .collect();
        for conn in probes {
            conn.reset_alive();
            let session_tx = self.self_tx.clone();
            let grace = self.limits.probe_grace;
            tokio::spawn(async move {
                // A failed write needs no special handling: the missing
                // PONG flags the connection when the grace window ends.
                let _ = conn
                    .send_line(&format!("PING :{}", parser::SERVER_HOST))
                    .await;
                tokio::time::sleep(grace).await;
                let _ = session_tx
                    .send(SessionMsg::ProbeExpired { conn_id: conn.id })
                    .await;
            });
        }
    }

    fn create_connection(&mut self, kind: ConnKind) {
        let conn = Connection::spawn(
            kind,
            &self.identity,
            self.upstream_addr.clone(),
            self.limits.clone(),
            self.events_tx.clone(),
            self.self_tx.clone(),
        );
        tracing::info!(
            conn.id = %conn.id,
            kind = kind.label(),
            read = self.read_pool.len(),
            send = self.send_pool.len(),
            "opening new connection"
        );
        let entry = ConnEntry {
            conn,
            joins: Vec::new(),
            last_used: Instant::now(),
        };
        match kind {
            ConnKind::Read => self.read_pool.push(entry),
            ConnKind::Send => self.send_pool.push(entry),
            ConnKind::Whisper => {
                // At most one whisper connection; replacing closes the
                // previous one.
                if let Some(old) = self.whisper_conn.replace(entry) {
                    let conn = old.conn;
                    tokio::spawn(async move { conn.close().await });
                }
            }
        }
    }

    fn find_conn(&self, conn_id: Uuid) -> Option<&Connection> {
        self.read_pool
            .iter()
            .chain(self.send_pool.iter())
            .chain(self.whisper_conn.iter())
            .map(|e| &e.conn)
            .find(|c| c.id == conn_id)
    }

    fn snapshot(&self) -> SessionSnapshot {
        let info = |e: &ConnEntry| ConnInfo {
            id: e.conn.id,
            active: e.conn.is_active(),
            msg_count: e.conn.msg_count(),
            joins: e.joins.clone(),
        };
        SessionSnapshot {
            read_conns: self.read_pool.iter().map(info).collect(),
            send_conns: self.send_pool.iter().map(info).collect(),
            whisper_conn: self.whisper_conn.as_ref().map(info),
            channels: self.channels.clone(),
        }
    }

    /// One-shot teardown: closes every transport, clears the channel map
    /// and fails every pending join.
    fn shutdown_pools(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        tracing::info!(account = %self.identity.account, "closing session");
        for entry in self
            .read_pool
            .drain(..)
            .chain(self.send_pool.drain(..))
            .chain(self.whisper_conn.take())
        {
            let conn = entry.conn;
            tokio::spawn(async move { conn.close().await });
        }
        self.channels.clear();
        for (_, responders) in self.pending_joins.drain() {
            for tx in responders {
                let _ = tx.send(Err(ChatError::SessionClosed));
            }
        }
    }
}

fn respond(respond_to: Option<oneshot::Sender<Result<()>>>, result: Result<()>) {
    if let Some(tx) = respond_to {
        let _ = tx.send(result);
    }
}

async fn run_session_actor(mut actor: SessionActor) {
    tracing::info!(
        account = %actor.identity.account,
        anonymous = actor.identity.is_anonymous(),
        "session started"
    );
    // The whisper connection exists for the session's whole lifetime so
    // inbound whispers are received even before the first whisper send.
    actor.create_connection(ConnKind::Whisper);

    let mut probe = tokio::time::interval(actor.limits.probe_period);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
    probe.tick().await;

    loop {
        tokio::select! {
            _ = probe.tick() => actor.run_probe_cycle(),
            msg = actor.receiver.recv() => match msg {
                Some(msg) => {
                    actor.handle_message(msg);
                    if !actor.open {
                        break;
                    }
                }
                None => {
                    actor.shutdown_pools();
                    break;
                }
            }
        }
    }
    tracing::info!(account = %actor.identity.account, "session stopped");
}
