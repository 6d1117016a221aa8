//! Shared types used across the application.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Strip the `#` channel marker and normalize case.
///
/// Twitch logins are case-insensitive and always delivered lowercase on the wire.
pub fn normalize_channel(channel: &str) -> String {
    channel.trim().trim_start_matches('#').to_lowercase()
}

/// Credentials for one Twitch chat account.
#[derive(Clone)]
pub struct ChatAccount {
    pub username: String,
    /// OAuth token, zeroized on drop.
    pub token: Zeroizing<String>,
}

impl ChatAccount {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: Zeroizing::new(token.into()),
        }
    }
}

impl fmt::Debug for ChatAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatAccount")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Application-identity assertion for acting as one Matrix user.
///
/// Combined with the appservice token by the Matrix client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    pub user_id: String,
}

impl Credential {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// A provisioned Matrix account representing one Twitch user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeIdentity {
    pub user_id: String,
    pub twitch_name: String,
    pub credential: Credential,
}

impl BridgeIdentity {
    pub fn new(user_id: impl Into<String>, twitch_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            credential: Credential::new(user_id.clone()),
            user_id,
            twitch_name: twitch_name.into(),
        }
    }
}

/// Association between one Matrix room and one Twitch channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMapping {
    pub room_id: String,
    /// Channel login without the `#` marker.
    pub channel: String,
}

impl RoomMapping {
    pub fn new(room_id: impl Into<String>, channel: &str) -> Self {
        Self {
            room_id: room_id.into(),
            channel: normalize_channel(channel),
        }
    }
}

/// Public profile data for a Twitch user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub display_name: String,
    pub avatar_url: Option<String>,
}
