//! Twitch chat line protocol.

pub mod commands;
pub mod parser;

pub use parser::{parse, ChatEvent, Command};
