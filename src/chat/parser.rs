//! Minimal line-level handling for the upstream chat protocol.
//!
//! The broker never fully parses inbound traffic; it only needs to know
//! which lines to answer (PING), which to swallow (PONG), which mark a
//! finished login (001 welcome), and whether a line is a whisper or a
//! channel message so each connection can apply its forwarding filter.
//! Everything else is relayed verbatim to the downstream client.

pub const CMD_PASS: &str = "PASS";
pub const CMD_NICK: &str = "NICK";
pub const CMD_JOIN: &str = "JOIN";
pub const CMD_PART: &str = "PART";
pub const CMD_PRIVMSG: &str = "PRIVMSG";
pub const CMD_WHISPER: &str = "WHISPER";

pub const CAP_REQ_TAGS: &str = "CAP REQ :twitch.tv/tags";
pub const CAP_REQ_COMMANDS: &str = "CAP REQ :twitch.tv/commands";

pub const SERVER_HOST: &str = "tmi.twitch.tv";
/// Whisper sends are addressed to this reserved service channel.
pub const WHISPER_TARGET: &str = "#jtv";

/// Present in the login acknowledgment line (RPL_WELCOME).
const WELCOME_MARKER: &str = "tmi.twitch.tv 001";
/// Separates the server hostname from the command token in routed lines.
const HOST_MARKER: &str = ".tmi.twitch.tv ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Privmsg,
    Whisper,
    Other,
}

/// Classifies a routed line by the command token following the server
/// hostname. Lines without the host marker (PING, numerics sent before
/// login, ...) are `Other`.
pub fn classify(line: &str) -> MsgKind {
    let Some((_, rest)) = line.split_once(HOST_MARKER) else {
        return MsgKind::Other;
    };
    match rest.split(' ').next() {
        Some(CMD_WHISPER) => MsgKind::Whisper,
        Some(CMD_PRIVMSG) => MsgKind::Privmsg,
        _ => MsgKind::Other,
    }
}

/// Returns the IRC command token of a line, skipping an optional
/// `@tags` block and `:prefix`.
pub fn command_token(line: &str) -> Option<&str> {
    let mut remainder = line.trim_end_matches(['\r', '\n']);
    if remainder.starts_with('@') {
        remainder = remainder.split_once(' ').map(|(_, r)| r)?;
    }
    if remainder.starts_with(':') {
        remainder = remainder.split_once(' ').map(|(_, r)| r)?;
    }
    remainder.split(' ').next().filter(|s| !s.is_empty())
}

pub fn is_ping(line: &str) -> bool {
    command_token(line) == Some("PING")
}

pub fn is_pong(line: &str) -> bool {
    command_token(line) == Some("PONG")
}

pub fn is_welcome(line: &str) -> bool {
    line.contains(WELCOME_MARKER)
}

/// Channel names are compared and stored lowercased with a leading `#`.
pub fn normalize_channel(name: &str) -> String {
    let name = name.trim().to_lowercase();
    if name.starts_with('#') {
        name
    } else {
        format!("#{name}")
    }
}
