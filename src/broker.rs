//! Broker actor: the registry of live sessions, keyed by account. Each
//! downstream client login opens (or replaces) the session for its
//! account; disconnecting closes it.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use crate::chat::{Identity, JoinSchedulerHandle, Limits, SessionHandle};

const BROKER_MAILBOX: usize = 32;

enum BrokerMsg {
    OpenSession {
        identity: Identity,
        events_tx: mpsc::UnboundedSender<String>,
        respond_to: oneshot::Sender<SessionHandle>,
    },
    CloseSession {
        account: String,
        respond_to: oneshot::Sender<()>,
    },
    SessionCount {
        respond_to: oneshot::Sender<usize>,
    },
}

#[derive(Clone)]
pub struct BrokerHandle {
    sender: mpsc::Sender<BrokerMsg>,
}

impl BrokerHandle {
    pub fn new(upstream_addr: String, limits: Limits, scheduler: JoinSchedulerHandle) -> Self {
        let (sender, receiver) = mpsc::channel(BROKER_MAILBOX);
        let actor = BrokerActor {
            receiver,
            upstream_addr,
            limits,
            scheduler,
            sessions: HashMap::new(),
        };
        tokio::spawn(run_broker_actor(actor));
        Self { sender }
    }

    /// Opens a session for the identity, replacing (and closing) any
    /// session already registered for the same account.
    pub async fn open_session(
        &self,
        identity: Identity,
        events_tx: mpsc::UnboundedSender<String>,
    ) -> Option<SessionHandle> {
        let (respond_tx, respond_rx) = oneshot::channel();
        self.sender
            .send(BrokerMsg::OpenSession {
                identity,
                events_tx,
                respond_to: respond_tx,
            })
            .await
            .ok()?;
        respond_rx.await.ok()
    }

    /// Closes and unregisters the account's session, if any.
    pub async fn close_session(&self, account: &str) {
        let (respond_tx, respond_rx) = oneshot::channel();
        if self
            .sender
            .send(BrokerMsg::CloseSession {
                account: account.to_string(),
                respond_to: respond_tx,
            })
            .await
            .is_ok()
        {
            let _ = respond_rx.await;
        }
    }

    pub async fn session_count(&self) -> usize {
        let (respond_tx, respond_rx) = oneshot::channel();
        if self
            .sender
            .send(BrokerMsg::SessionCount {
                respond_to: respond_tx,
            })
            .await
            .is_err()
        {
            return 0;
        }
        respond_rx.await.unwrap_or(0)
    }
}

struct BrokerActor {
    receiver: mpsc::Receiver<BrokerMsg>,
    upstream_addr: String,
    limits: Limits,
    scheduler: JoinSchedulerHandle,
    sessions: HashMap<String, SessionHandle>,
}

impl BrokerActor {
    fn handle_message(&mut self, msg: BrokerMsg) {
        match msg {
            BrokerMsg::OpenSession {
                identity,
                events_tx,
                respond_to,
            } => {
                // A reconnecting client supersedes its previous session;
                // the old one is torn down in the background.
                if let Some(old) = self.sessions.remove(&identity.account) {
                    tracing::info!(account = %identity.account, "replacing existing session");
                    tokio::spawn(async move { old.close().await });
                }
                let session = SessionHandle::spawn(
                    identity,
                    self.upstream_addr.clone(),
                    self.limits.clone(),
                    self.scheduler.clone(),
                    events_tx,
                );
                self.sessions
                    .insert(session.account.clone(), session.clone());
                tracing::info!(
                    account = %session.account,
                    sessions = self.sessions.len(),
                    "session registered"
                );
                let _ = respond_to.send(session);
            }
            BrokerMsg::CloseSession {
                account,
                respond_to,
            } => {
                if let Some(session) = self.sessions.remove(&account) {
                    tracing::info!(
                        account = %account,
                        sessions = self.sessions.len(),
                        "session unregistered"
                    );
                    tokio::spawn(async move {
                        session.close().await;
                        let _ = respond_to.send(());
                    });
                } else {
                    let _ = respond_to.send(());
                }
            }
            BrokerMsg::SessionCount { respond_to } => {
                let _ = respond_to.send(self.sessions.len());
            }
        }
    }
}

async fn run_broker_actor(mut actor: BrokerActor) {
    tracing::info!(upstream = %actor.upstream_addr, "broker started");
    while let Some(msg) = actor.receiver.recv().await {
        actor.handle_message(msg);
    }
    // Process shutdown path: close whatever sessions remain.
    for (_, session) in actor.sessions.drain() {
        tokio::spawn(async move { session.close().await });
    }
    tracing::info!("broker stopped");
}

// Keeps the variant names readable in logs emitted by the mailbox.
impl std::fmt::Debug for BrokerMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerMsg::OpenSession { identity, .. } => f
                .debug_struct("OpenSession")
                .field("account", &identity.account)
                .finish(),
            BrokerMsg::CloseSession { account, .. } => f
                .debug_struct("CloseSession")
                .field("account", account)
                .finish(),
            BrokerMsg::SessionCount { .. } => f.debug_struct("SessionCount").finish(),
        }
    }
}
