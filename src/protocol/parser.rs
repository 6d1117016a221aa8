//! Twitch chat line parser.
//!
//! Two line shapes are recognized:
//!
//! - tagged chat lines: `@<tags> <prefix> <COMMAND> <channel> :<text>`
//! - keepalives: `PING :<server>`
//!
//! Everything else is dropped. The parser never strips the `#` channel marker.

/// Command carried by a parsed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Privmsg,
    Ping,
    Other(String),
}

impl Command {
    fn from_token(token: &str) -> Self {
        match token {
            "PRIVMSG" => Self::Privmsg,
            "PING" => Self::Ping,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One structured event parsed from a chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    /// Raw IRCv3 tag block, including the leading `@`.
    pub tags: String,
    pub username: String,
    pub command: Command,
    /// Channel token as received, with its `#` marker.
    pub channel: String,
    pub message: String,
}

/// Parse one raw line into an event, or `None` if it matches neither shape.
pub fn parse(line: &str) -> Option<ChatEvent> {
    let line = line.trim_end_matches(['\r', '\n']);

    if line.starts_with('@') {
        parse_tagged(line)
    } else if line.starts_with("PING") {
        Some(parse_ping(line))
    } else {
        None
    }
}

fn parse_tagged(line: &str) -> Option<ChatEvent> {
    let mut tokens = line.splitn(5, ' ');
    let tags = tokens.next()?;
    let prefix = tokens.next()?;
    let command = tokens.next()?;
    let channel = tokens.next()?;

    // A doubled space leaves an empty header token; the line is not trustworthy.
    if [tags, prefix, command, channel].iter().any(|t| t.is_empty()) {
        return None;
    }

    let rest = tokens.next().unwrap_or("");
    let message = rest.strip_prefix(':').unwrap_or(rest);

    let username = prefix
        .strip_prefix(':')
        .unwrap_or(prefix)
        .split('!')
        .next()
        .unwrap_or_default();

    Some(ChatEvent {
        tags: tags.to_string(),
        username: username.to_string(),
        command: Command::from_token(command),
        channel: channel.to_string(),
        message: message.to_string(),
    })
}

fn parse_ping(line: &str) -> ChatEvent {
    let server = match line.split_once(':') {
        Some((_, server)) => server,
        None => line["PING".len()..].trim(),
    };

    ChatEvent {
        tags: String::new(),
        username: String::new(),
        command: Command::Ping,
        channel: String::new(),
        message: server.to_string(),
    }
}
