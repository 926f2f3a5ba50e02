//! Process-wide join scheduler. The upstream server rate-limits joins by
//! source address, not by account, so a single queue is shared by every
//! session and drained at a fixed minimum interval.
//!
//! The queue is unbounded: reconnect storms requeue entire channel lists
//! at once and producers must never block on the failure path.

use std::time::Duration;

use tokio::sync::mpsc;

use super::session::SessionMsg;

#[derive(Debug)]
struct JoinRequest {
    session: mpsc::Sender<SessionMsg>,
    channel: String,
}

#[derive(Clone, Debug)]
pub struct JoinSchedulerHandle {
    sender: mpsc::UnboundedSender<JoinRequest>,
}

impl JoinSchedulerHandle {
    pub fn spawn(interval: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_join_scheduler(receiver, interval));
        Self { sender }
    }

    /// Queues a join for dispatch back to the session. Never blocks.
    pub fn enqueue(&self, session: mpsc::Sender<SessionMsg>, channel: String) {
        if self
            .sender
            .send(JoinRequest { session, channel })
            .is_err()
        {
            tracing::warn!("join scheduler is gone, dropping join request");
        }
    }
}

async fn run_join_scheduler(mut receiver: mpsc::UnboundedReceiver<JoinRequest>, interval: Duration) {
    tracing::info!(interval = ?interval, "join scheduler started");
    while let Some(request) = receiver.recv().await {
        let channel = request.channel.clone();
        if request
            .session
            .send(SessionMsg::DispatchJoin {
                channel: request.channel,
            })
            .await
            .is_err()
        {
            // Session closed while the join was queued; nothing to do.
            tracing::debug!(channel.name = %channel, "dropping join for closed session");
            continue;
        }
        tokio::time::sleep(interval).await;
    }
    tracing::info!("join scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test]
    async fn dispatches_in_fifo_order() {
        let scheduler = JoinSchedulerHandle::spawn(Duration::from_millis(1));
        let (tx, mut rx) = mpsc::channel(16);

        for name in ["#a", "#b", "#c"] {
            scheduler.enqueue(tx.clone(), name.to_string());
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                SessionMsg::DispatchJoin { channel } => seen.push(channel),
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(seen, vec!["#a", "#b", "#c"]);
    }

    #[tokio::test]
    async fn spaces_dispatches_by_at_least_the_interval() {
        let interval = Duration::from_millis(40);
        let scheduler = JoinSchedulerHandle::spawn(interval);
        let (tx, mut rx) = mpsc::channel(16);

        scheduler.enqueue(tx.clone(), "#one".to_string());
        scheduler.enqueue(tx.clone(), "#two".to_string());
        scheduler.enqueue(tx.clone(), "#three".to_string());

        let start = Instant::now();
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        // Two full intervals must elapse between the first and the third
        // dispatch; allow some slack for scheduling jitter.
        assert!(
            start.elapsed() >= interval,
            "joins were dispatched without throttling"
        );
    }

    #[tokio::test]
    async fn closed_session_does_not_stall_the_queue() {
        let scheduler = JoinSchedulerHandle::spawn(Duration::from_millis(1));
        let (dead_tx, dead_rx) = mpsc::channel::<SessionMsg>(1);
        drop(dead_rx);
        let (live_tx, mut live_rx) = mpsc::channel(16);

        scheduler.enqueue(dead_tx, "#gone".to_string());
        scheduler.enqueue(live_tx, "#here".to_string());

        match tokio::time::timeout(Duration::from_secs(1), live_rx.recv())
            .await
            .expect("queue must keep draining past dead sessions")
            .unwrap()
        {
            SessionMsg::DispatchJoin { channel } => assert_eq!(channel, "#here"),
            other => panic!("unexpected message {other:?}"),
        }
    }
}
