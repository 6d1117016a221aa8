//! Configuration type definitions.

use serde::Deserialize;

use crate::common::types::{ChatAccount, RoomMapping};

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub matrix: MatrixConfig,
    pub twitch: TwitchConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    /// Room mappings seeded into the directory at startup.
    #[serde(default)]
    pub rooms: Vec<RoomConfig>,
}

impl Config {
    pub fn room_mappings(&self) -> Vec<RoomMapping> {
        self.rooms
            .iter()
            .map(|room| RoomMapping::new(room.room_id.clone(), &room.channel))
            .collect()
    }

    /// The bot's chat account, if configured here rather than in the directory.
    pub fn bot_account(&self) -> Option<ChatAccount> {
        self.twitch
            .bot
            .as_ref()
            .map(|bot| ChatAccount::new(bot.username.to_lowercase(), bot.token.clone()))
    }
}

/// Homeserver and appservice registration settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MatrixConfig {
    pub homeserver_url: String,
    /// Token the bridge presents to the homeserver.
    pub as_token: String,
    /// Token the homeserver presents to the bridge.
    pub hs_token: String,
    pub bot_user_id: String,
    /// User namespace regex from the registration, e.g. `@twitch_.+:example\.org`.
    pub user_namespace: String,
    /// Address of the appservice transaction listener.
    #[serde(default = "default_appservice_listen")]
    pub listen: String,
}

/// Twitch application and bot account settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TwitchConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Public URL of the OAuth callback, as registered with Twitch.
    pub redirect_uri: String,
    /// Address of the OAuth callback listener.
    #[serde(default = "default_callback_listen")]
    pub callback_listen: String,
    pub bot: Option<BotConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotConfig {
    pub username: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_directory_path")]
    pub path: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            path: default_directory_path(),
        }
    }
}

/// One room to channel mapping.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomConfig {
    pub room_id: String,
    /// Twitch channel login, with or without `#`.
    pub channel: String,
}

fn default_appservice_listen() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_callback_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_directory_path() -> String {
    "twitch-bridge.json".to_string()
}
