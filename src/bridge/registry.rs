//! Shared in-memory index of rooms, identities and real users.
//!
//! One [`SessionRegistry`] is built at startup and shared by reference with
//! every session, the login callback and the appservice intake. Lookups take
//! the read lock; identity creation and token attachment take the write lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::bridge::directory::{DirectorySnapshot, RealUserRecord};
use crate::common::types::{normalize_channel, BridgeIdentity, ChatAccount, RoomMapping};
use crate::twitch::api::user_client;
use crate::twitch::session::SessionHandle;

/// A Matrix user known to the bridge, possibly linked to a Twitch account.
#[derive(Clone, Default)]
pub struct RealUserSession {
    pub user_id: String,
    pub twitch_name: Option<String>,
    pub token: Option<Zeroizing<String>>,
    /// Client bound to `token`, built with a short timeout.
    pub http: Option<reqwest::Client>,
    pub dm_room: Option<String>,
    pub linked_at: Option<DateTime<Utc>>,
    /// The user's own chat session, once opened.
    pub connection: Option<SessionHandle>,
}

impl std::fmt::Debug for RealUserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealUserSession")
            .field("user_id", &self.user_id)
            .field("twitch_name", &self.twitch_name)
            .field("has_token", &self.token.is_some())
            .field("dm_room", &self.dm_room)
            .field("connection", &self.connection)
            .finish()
    }
}

impl RealUserSession {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// Chat credentials, available once both login name and token are known.
    pub fn chat_account(&self) -> Option<ChatAccount> {
        match (&self.twitch_name, &self.token) {
            (Some(name), Some(token)) => Some(ChatAccount::new(name.clone(), token.as_str())),
            _ => None,
        }
    }

    pub fn to_record(&self) -> RealUserRecord {
        RealUserRecord {
            user_id: self.user_id.clone(),
            twitch_name: self.twitch_name.clone(),
            twitch_token: self.token.as_ref().map(|t| t.to_string()),
            dm_room: self.dm_room.clone(),
            linked_at: self.linked_at,
        }
    }

    fn from_record(record: &RealUserRecord) -> Self {
        let token = record.twitch_token.clone().map(Zeroizing::new);
        let http = if token.is_some() {
            user_client()
                .map_err(|e| warn!(user_id = %record.user_id, "Failed to build HTTP client: {}", e))
                .ok()
        } else {
            None
        };
        Self {
            user_id: record.user_id.clone(),
            twitch_name: record.twitch_name.clone(),
            token,
            http,
            dm_room: record.dm_room.clone(),
            linked_at: record.linked_at,
            connection: None,
        }
    }
}

/// Result of [`SessionRegistry::attach_token`].
#[derive(Debug)]
pub struct TokenAttachment {
    pub user: RealUserSession,
    /// Session still running on the previous Twitch credentials.
    pub replaced: Option<SessionHandle>,
}

#[derive(Default)]
struct RegistryInner {
    identities_by_name: HashMap<String, Arc<BridgeIdentity>>,
    identities_by_id: HashMap<String, Arc<BridgeIdentity>>,
    real_users: HashMap<String, RealUserSession>,
    room_by_channel: HashMap<String, String>,
    channel_by_room: HashMap<String, String>,
}

impl RegistryInner {
    fn insert_mapping(&mut self, mapping: &RoomMapping) {
        // Directory files may be edited by hand.
        let channel = normalize_channel(&mapping.channel);
        if let Some(old_room) = self.room_by_channel.remove(&channel) {
            self.channel_by_room.remove(&old_room);
        }
        if let Some(old_channel) = self.channel_by_room.remove(&mapping.room_id) {
            self.room_by_channel.remove(&old_channel);
        }
        self.room_by_channel
            .insert(channel.clone(), mapping.room_id.clone());
        self.channel_by_room.insert(mapping.room_id.clone(), channel);
    }

    fn insert_identity(&mut self, identity: BridgeIdentity) -> Arc<BridgeIdentity> {
        let key = identity.twitch_name.to_lowercase();
        if let Some(existing) = self.identities_by_name.get(&key) {
            return existing.clone();
        }
        let identity = Arc::new(identity);
        self.identities_by_id
            .insert(identity.user_id.clone(), identity.clone());
        self.identities_by_name.insert(key, identity.clone());
        identity
    }
}

/// Shared registry guarded by one reader/writer lock.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the registry from durable storage.
    pub fn from_snapshot(snapshot: &DirectorySnapshot) -> Self {
        let mut inner = RegistryInner::default();
        for mapping in &snapshot.rooms {
            inner.insert_mapping(mapping);
        }
        for record in &snapshot.bridged {
            inner.insert_identity(BridgeIdentity::new(&record.user_id, &record.twitch_name));
        }
        for record in &snapshot.real_users {
            inner
                .real_users
                .insert(record.user_id.clone(), RealUserSession::from_record(record));
        }
        debug!(
            "Registry loaded: {} rooms, {} bridged identities, {} real users",
            inner.room_by_channel.len(),
            inner.identities_by_name.len(),
            inner.real_users.len()
        );
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Add or replace a room mapping. Used while seeding at startup.
    pub async fn add_room_mapping(&self, mapping: &RoomMapping) {
        self.inner.write().await.insert_mapping(mapping);
    }

    pub async fn room_for_channel(&self, channel: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .room_by_channel
            .get(&normalize_channel(channel))
            .cloned()
    }

    pub async fn channel_for_room(&self, room_id: &str) -> Option<String> {
        self.inner.read().await.channel_by_room.get(room_id).cloned()
    }

    pub async fn room_mappings(&self) -> Vec<RoomMapping> {
        let inner = self.inner.read().await;
        let mut mappings: Vec<RoomMapping> = inner
            .room_by_channel
            .iter()
            .map(|(channel, room_id)| RoomMapping::new(room_id.clone(), channel))
            .collect();
        mappings.sort_by(|a, b| a.channel.cmp(&b.channel));
        mappings
    }

    /// Bridged identity for a Twitch username, if already provisioned.
    pub async fn identity(&self, username: &str) -> Option<Arc<BridgeIdentity>> {
        self.inner
            .read()
            .await
            .identities_by_name
            .get(&username.to_lowercase())
            .cloned()
    }

    pub async fn is_bridged_user(&self, user_id: &str) -> bool {
        self.inner.read().await.identities_by_id.contains_key(user_id)
    }

    /// Index a freshly provisioned identity under both keys in one step.
    ///
    /// If the username is already registered the existing identity is
    /// returned and `identity` is discarded.
    pub async fn register_identity(&self, identity: BridgeIdentity) -> Arc<BridgeIdentity> {
        self.inner.write().await.insert_identity(identity)
    }

    /// Whether any real user is linked to this Twitch login.
    pub async fn is_linked_twitch_name(&self, username: &str) -> bool {
        self.inner.read().await.real_users.values().any(|user| {
            user.twitch_name
                .as_deref()
                .is_some_and(|name| name.eq_ignore_ascii_case(username))
        })
    }

    pub async fn real_user(&self, user_id: &str) -> Option<RealUserSession> {
        self.inner.read().await.real_users.get(user_id).cloned()
    }

    /// Insert a new real user. Returns `false` if one already exists.
    pub async fn insert_real_user(&self, session: RealUserSession) -> bool {
        let mut inner = self.inner.write().await;
        if inner.real_users.contains_key(&session.user_id) {
            return false;
        }
        inner.real_users.insert(session.user_id.clone(), session);
        true
    }

    /// Bind a delivered token (and its client) to a known real user.
    ///
    /// A session opened with different credentials is detached from the user
    /// and handed back in [`TokenAttachment::replaced`] for the caller to close.
    pub async fn attach_token(
        &self,
        user_id: &str,
        twitch_name: &str,
        token: Zeroizing<String>,
        http: reqwest::Client,
    ) -> Option<TokenAttachment> {
        let mut inner = self.inner.write().await;
        let user = inner.real_users.get_mut(user_id)?;
        let twitch_name = twitch_name.to_lowercase();

        let credentials_changed = !user
            .twitch_name
            .as_deref()
            .is_some_and(|name| name.eq_ignore_ascii_case(&twitch_name))
            || user.token.as_deref().map(String::as_str) != Some(token.as_str());
        let replaced = match user.connection.take() {
            Some(handle) if credentials_changed || !handle.username().eq_ignore_ascii_case(&twitch_name) => {
                Some(handle)
            }
            kept => {
                user.connection = kept;
                None
            }
        };

        user.twitch_name = Some(twitch_name);
        user.token = Some(token);
        user.http = Some(http);
        user.linked_at = Some(Utc::now());
        Some(TokenAttachment {
            user: user.clone(),
            replaced,
        })
    }

    pub async fn set_dm_room(&self, user_id: &str, room_id: &str) -> Option<RealUserSession> {
        let mut inner = self.inner.write().await;
        let user = inner.real_users.get_mut(user_id)?;
        user.dm_room = Some(room_id.to_string());
        Some(user.clone())
    }

    /// Record the user's own session. Returns `false` if one is already set.
    pub async fn attach_connection(&self, user_id: &str, handle: SessionHandle) -> bool {
        let mut inner = self.inner.write().await;
        match inner.real_users.get_mut(user_id) {
            Some(user) if user.connection.is_none() => {
                user.connection = Some(handle);
                true
            }
            _ => false,
        }
    }

    /// Linked real users whose own session has not been opened yet.
    pub async fn users_ready_to_connect(&self) -> Vec<RealUserSession> {
        self.inner
            .read()
            .await
            .real_users
            .values()
            .filter(|user| user.connection.is_none() && user.chat_account().is_some())
            .cloned()
            .collect()
    }
}
