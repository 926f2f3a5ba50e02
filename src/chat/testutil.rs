//! In-process fake chat server for tests: accepts connections, sends the
//! welcome line, optionally answers PINGs, records every received line
//! and can inject lines or drop all live connections on demand.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;

pub struct FakeUpstream {
    pub addr: String,
    lines: Arc<Mutex<Vec<String>>>,
    kill_tx: broadcast::Sender<()>,
    inject_tx: broadcast::Sender<String>,
}

impl FakeUpstream {
    pub async fn received_lines(&self) -> Vec<String> {
        self.lines.lock().await.clone()
    }

    pub async fn count_lines(&self, pred: impl Fn(&str) -> bool) -> usize {
        self.lines.lock().await.iter().filter(|l| pred(l)).count()
    }

    /// Drops every currently live connection, as a silently dying server
    /// would. Connections accepted afterwards are unaffected.
    pub fn drop_connections(&self) {
        let _ = self.kill_tx.send(());
    }

    /// Writes a line to every live connection.
    pub async fn push_line(&self, line: &str) {
        let _ = self.inject_tx.send(line.to_string());
        // Give the per-connection tasks a moment to flush the write.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    pub async fn wait_for_line(
        &self,
        pred: impl Fn(&str) -> bool,
        timeout: Duration,
    ) -> Option<String> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(line) = self.lines.lock().await.iter().find(|l| pred(l)) {
                return Some(line.clone());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }
}

pub async fn spawn_fake_upstream(answer_pings: bool) -> FakeUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let (kill_tx, _) = broadcast::channel(16);
    let (inject_tx, _) = broadcast::channel(64);

    let accept_lines = Arc::clone(&lines);
    let accept_kill = kill_tx.clone();
    let accept_inject = inject_tx.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let lines = Arc::clone(&accept_lines);
            let mut kill_rx = accept_kill.subscribe();
            let mut inject_rx = accept_inject.subscribe();
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let _ = write_half
                    .write_all(b":tmi.twitch.tv 001 relaybroker :Welcome, GLHF!\r\n")
                    .await;
                let mut reader = BufReader::new(read_half).lines();
                loop {
                    tokio::select! {
                        _ = kill_rx.recv() => return,
                        injected = inject_rx.recv() => {
                            if let Ok(line) = injected {
                                if write_half
                                    .write_all(format!("{line}\r\n").as_bytes())
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                        }
                        line = reader.next_line() => {
                            let Ok(Some(line)) = line else { return };
                            let line = line.trim_end_matches(['\r', '\n']).to_string();
                            let is_ping = line.starts_with("PING");
                            lines.lock().await.push(line);
                            if is_ping && answer_pings {
                                let _ = write_half.write_all(b"PONG tmi.twitch.tv\r\n").await;
                            }
                        }
                    }
                }
            });
        }
    });

    FakeUpstream {
        addr,
        lines,
        kill_tx,
        inject_tx,
    }
}
