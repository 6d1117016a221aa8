//! Outbound Twitch chat commands.
//!
//! Every command is a single `\r\n`-terminated line.

use crate::common::types::normalize_channel;

/// Capabilities unlocking tag metadata and membership events on inbound lines.
pub const CAPABILITIES: &str = "twitch.tv/membership twitch.tv/tags";

pub fn cap_req() -> String {
    format!("CAP REQ :{}\r\n", CAPABILITIES)
}

/// `PASS` line; the `oauth:` prefix is added unless the token already has it.
pub fn pass(token: &str) -> String {
    if token.starts_with("oauth:") {
        format!("PASS {}\r\n", token)
    } else {
        format!("PASS oauth:{}\r\n", token)
    }
}

pub fn nick(username: &str) -> String {
    format!("NICK {}\r\n", username)
}

pub fn join(channel: &str) -> String {
    format!("JOIN #{}\r\n", normalize_channel(channel))
}

/// Chat message. Line breaks in `text` would start a new command, so they are flattened.
pub fn privmsg(channel: &str, text: &str) -> String {
    let text = text.replace(['\r', '\n'], " ");
    format!("PRIVMSG #{} :{}\r\n", normalize_channel(channel), text)
}

pub fn pong(server: &str) -> String {
    format!("PONG :{}\r\n", server)
}
