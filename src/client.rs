//! Downstream line-protocol server. Each accepted client logs in with
//! PASS/NICK, gets a session from the broker, and then speaks plain IRC:
//! JOIN/PART/PRIVMSG/WHISPER go upstream through the session's pools,
//! and everything the session's connections forward comes back down the
//! same socket.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::broker::BrokerHandle;
use crate::chat::{parser, Identity, SessionHandle};

pub async fn run_listener(listener: TcpListener, broker: BrokerHandle, broker_pass: Option<String>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "failed to accept client connection");
                continue;
            }
        };
        tracing::info!(client.addr = %peer, "client connected");
        let broker = broker.clone();
        let broker_pass = broker_pass.clone();
        tokio::spawn(async move {
            handle_client(stream, broker, broker_pass).await;
            tracing::info!(client.addr = %peer, "client disconnected");
        });
    }
}

async fn handle_client(stream: TcpStream, broker: BrokerHandle, broker_pass: Option<String>) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).lines();

    // Everything going to the client flows through one channel so session
    // traffic and our own replies cannot interleave mid-line.
    let (events_tx, events_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(write_events(events_rx, write_half));

    let Some(login) = read_login(&mut reader, &events_tx, broker_pass.as_deref()).await else {
        drop(events_tx);
        let _ = writer_task.await;
        return;
    };

    let account = login.identity.account.clone();
    let Some(session) = broker.open_session(login.identity, events_tx.clone()).await else {
        notice(&events_tx, "service unavailable");
        drop(events_tx);
        let _ = writer_task.await;
        return;
    };
    let _ = events_tx.send(format!(
        ":{} 001 {} :Welcome, GLHF!",
        parser::SERVER_HOST,
        login.nick
    ));

    command_loop(&mut reader, &events_tx, &session).await;

    broker.close_session(&account).await;
    drop(events_tx);
    let _ = writer_task.await;
}

async fn write_events(mut events_rx: mpsc::UnboundedReceiver<String>, mut write_half: OwnedWriteHalf) {
    while let Some(line) = events_rx.recv().await {
        if write_half.write_all(line.as_bytes()).await.is_err() {
            return;
        }
        if write_half.write_all(b"\r\n").await.is_err() {
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

struct Login {
    identity: Identity,
    nick: String,
}

/// Reads the PASS/NICK login preamble. With a broker password configured,
/// the client's PASS must be `<broker_pass>` or `<broker_pass>;<credential>`;
/// without one, PASS carries the upstream credential directly. A login
/// without PASS (or without a credential part) is anonymous.
async fn read_login(
    reader: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>,
    events_tx: &mpsc::UnboundedSender<String>,
    broker_pass: Option<&str>,
) -> Option<Login> {
    let mut pass: Option<String> = None;
    let nick = loop {
        let line = reader.next_line().await.ok()??;
        let line = line.trim_end_matches(['\r', '\n']);
        match split_command(line) {
            (parser::CMD_PASS, rest) => pass = Some(rest.to_string()),
            (parser::CMD_NICK, rest) if !rest.is_empty() => break rest.to_string(),
            // CAP negotiation and anything else before NICK is ignored.
            _ => {}
        }
    };

    let credential = match broker_pass {
        Some(expected) => {
            let Some(given) = pass else {
                notice(events_tx, "login required");
                return None;
            };
            let (given_pass, credential) = match given.split_once(';') {
                Some((p, c)) => (p.to_string(), c.to_string()),
                None => (given, String::new()),
            };
            if given_pass != expected {
                tracing::warn!(nick = %nick, "client sent wrong broker password");
                notice(events_tx, "login unsuccessful");
                return None;
            }
            credential
        }
        None => pass.unwrap_or_default(),
    };

    Some(Login {
        identity: Identity::new(credential, nick.clone()),
        nick,
    })
}

async fn command_loop(
    reader: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>,
    events_tx: &mpsc::UnboundedSender<String>,
    session: &SessionHandle,
) {
    while let Ok(Some(line)) = reader.next_line().await {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }
        match split_command(line) {
            (parser::CMD_JOIN, rest) => {
                // JOIN accepts a comma-separated channel list.
                for channel in rest.split(',').filter(|c| !c.trim().is_empty()) {
                    if session.enqueue_join(channel).await.is_err() {
                        notice(events_tx, "session is closed");
                        return;
                    }
                }
            }
            (parser::CMD_PART, rest) => {
                spawn_command(session.clone(), events_tx.clone(), {
                    let channel = rest.to_string();
                    move |s| async move { s.part(&channel).await }
                });
            }
            (parser::CMD_PRIVMSG, rest) => {
                // A message to the whisper service channel goes over the
                // whisper connection, everything else over the send pool.
                if let Some(text) = rest
                    .strip_prefix(parser::WHISPER_TARGET)
                    .and_then(|r| r.strip_prefix(" :"))
                {
                    let text = text.to_string();
                    spawn_command(session.clone(), events_tx.clone(), move |s| async move {
                        s.whisper(&text).await
                    });
                } else {
                    let full = line.to_string();
                    spawn_command(session.clone(), events_tx.clone(), move |s| async move {
                        s.say(&full).await
                    });
                }
            }
            (parser::CMD_WHISPER, rest) => {
                // `WHISPER <user> <message>` is sugar for the service
                // channel form.
                let Some((user, text)) = rest.split_once(' ') else {
                    notice(events_tx, "usage: WHISPER <user> <message>");
                    continue;
                };
                let text = format!("/w {} {}", user, text.trim_start_matches(':'));
                spawn_command(session.clone(), events_tx.clone(), move |s| async move {
                    s.whisper(&text).await
                });
            }
            ("PING", rest) => {
                let reply = if rest.is_empty() {
                    format!("PONG {}", parser::SERVER_HOST)
                } else {
                    format!("PONG {rest}")
                };
                let _ = events_tx.send(reply);
            }
            ("QUIT", _) => return,
            // Repeated PASS/NICK and unknown commands are ignored.
            _ => {}
        }
    }
}

/// Runs a session command off the read loop so a slow upstream send never
/// blocks the client's next command; failures come back as NOTICEs.
fn spawn_command<F, Fut>(session: SessionHandle, events_tx: mpsc::UnboundedSender<String>, f: F)
where
    F: FnOnce(SessionHandle) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = crate::chat::Result<()>> + Send,
{
    tokio::spawn(async move {
        if let Err(e) = f(session).await {
            notice(&events_tx, &e.to_string());
        }
    });
}

fn notice(events_tx: &mpsc::UnboundedSender<String>, text: &str) {
    let _ = events_tx.send(format!(":{} NOTICE * :{}", parser::SERVER_HOST, text));
}

/// Splits a client line into its command token and the remainder.
fn split_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((cmd, rest)) => (cmd, rest.trim_start()),
        None => (line, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::testutil::{FakeUpstream, spawn_fake_upstream};
    use crate::chat::{JoinSchedulerHandle, Limits};
    use std::time::Duration;

    struct TestClient {
        reader: tokio::io::Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: &str) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, writer) = stream.into_split();
            Self {
                reader: BufReader::new(read_half).lines(),
                writer,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> String {
            tokio::time::timeout(Duration::from_secs(2), self.reader.next_line())
                .await
                .expect("timed out waiting for a line")
                .unwrap()
                .expect("connection closed")
        }
    }

    async fn start_stack(broker_pass: Option<&str>) -> (FakeUpstream, BrokerHandle, String) {
        let upstream = spawn_fake_upstream(true).await;
        let limits = Limits {
            join_interval: Duration::from_millis(2),
            active_poll_interval: Duration::from_millis(5),
            active_wait_max: Duration::from_secs(2),
            ..Limits::default()
        };
        let scheduler = JoinSchedulerHandle::spawn(limits.join_interval);
        let broker = BrokerHandle::new(upstream.addr.clone(), limits, scheduler);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(run_listener(
            listener,
            broker.clone(),
            broker_pass.map(String::from),
        ));
        (upstream, broker, addr)
    }

    #[tokio::test]
    async fn login_join_and_privmsg_reach_the_upstream() {
        let (upstream, _broker, addr) = start_stack(Some("brokerpw")).await;
        let mut client = TestClient::connect(&addr).await;

        client.send("PASS brokerpw;oauth:secret").await;
        client.send("NICK SomeBot").await;
        let welcome = client.recv().await;
        assert!(welcome.contains("001 SomeBot"), "got {welcome}");

        client.send("JOIN #chan").await;
        upstream
            .wait_for_line(|l| l == "JOIN #chan", Duration::from_secs(2))
            .await
            .expect("join must reach the upstream");

        client.send("PRIVMSG #chan :hello there").await;
        upstream
            .wait_for_line(|l| l == "PRIVMSG #chan :hello there", Duration::from_secs(2))
            .await
            .expect("privmsg must reach the upstream");
        assert!(
            upstream
                .wait_for_line(|l| l == "PASS oauth:secret", Duration::from_secs(2))
                .await
                .is_some(),
            "upstream login must use the credential from the broker password"
        );
    }

    #[tokio::test]
    async fn wrong_broker_password_is_rejected() {
        let (_upstream, broker, addr) = start_stack(Some("brokerpw")).await;
        let mut client = TestClient::connect(&addr).await;

        client.send("PASS nope;oauth:secret").await;
        client.send("NICK somebot").await;
        let reply = client.recv().await;
        assert!(reply.contains("NOTICE"), "got {reply}");
        assert!(reply.contains("login unsuccessful"), "got {reply}");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.session_count().await, 0);
    }

    #[tokio::test]
    async fn nick_without_pass_gets_an_anonymous_session() {
        let (upstream, _broker, addr) = start_stack(None).await;
        let mut client = TestClient::connect(&addr).await;

        client.send("NICK lurker").await;
        let welcome = client.recv().await;
        assert!(welcome.contains("001 lurker"));

        client.send("JOIN #watched").await;
        upstream
            .wait_for_line(|l| l == "JOIN #watched", Duration::from_secs(2))
            .await
            .expect("anonymous join must work");
        assert!(
            upstream
                .wait_for_line(|l| l.starts_with("NICK justinfan"), Duration::from_secs(2))
                .await
                .is_some(),
            "anonymous upstream login must use a guest nick"
        );

        // Sending chat on an anonymous session fails with a NOTICE.
        // Forwarded upstream lines (e.g. the connection's own welcome)
        // may arrive in between.
        client.send("PRIVMSG #watched :nope").await;
        loop {
            let reply = client.recv().await;
            if reply.contains("NOTICE") {
                assert!(reply.contains("anonymous"), "got {reply}");
                break;
            }
        }
    }

    #[tokio::test]
    async fn whisper_command_is_wrapped_for_the_service_channel() {
        let (upstream, _broker, addr) = start_stack(None).await;
        let mut client = TestClient::connect(&addr).await;

        client.send("PASS oauth:secret").await;
        client.send("NICK somebot").await;
        client.recv().await;

        client.send("WHISPER friend :hi there").await;
        upstream
            .wait_for_line(
                |l| l == "PRIVMSG #jtv :/w friend hi there",
                Duration::from_secs(2),
            )
            .await
            .expect("whisper must be wrapped onto the service channel");
    }

    #[tokio::test]
    async fn upstream_traffic_is_forwarded_to_the_client() {
        let (upstream, _broker, addr) = start_stack(None).await;
        let mut client = TestClient::connect(&addr).await;

        client.send("PASS oauth:secret").await;
        client.send("NICK somebot").await;
        client.recv().await;

        client.send("JOIN #chan").await;
        upstream
            .wait_for_line(|l| l == "JOIN #chan", Duration::from_secs(2))
            .await
            .unwrap();

        upstream
            .push_line(":other!other@other.tmi.twitch.tv PRIVMSG #chan :hello")
            .await;
        loop {
            let line = client.recv().await;
            if line.contains("PRIVMSG #chan :hello") {
                break;
            }
        }
    }

    #[tokio::test]
    async fn disconnect_closes_the_session() {
        let (_upstream, broker, addr) = start_stack(None).await;
        let mut client = TestClient::connect(&addr).await;

        client.send("PASS oauth:secret").await;
        client.send("NICK somebot").await;
        client.recv().await;
        assert_eq!(broker.session_count().await, 1);

        client.send("QUIT").await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while broker.session_count().await != 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "session must be closed after QUIT"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
