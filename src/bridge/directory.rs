//! Durable storage for room mappings and known identities.
//!
//! The production [`JsonDirectory`] keeps everything in one JSON document and
//! rewrites it atomically (temp file + rename) on every save.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::common::error::{PersistenceError, PersistenceResult};
use crate::common::types::RoomMapping;

/// A provisioned bridged identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgedRecord {
    pub user_id: String,
    pub twitch_name: String,
    pub created_at: DateTime<Utc>,
}

/// A Matrix user who talked to the bridge, linked or not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealUserRecord {
    pub user_id: String,
    #[serde(default)]
    pub twitch_name: Option<String>,
    #[serde(default)]
    pub twitch_token: Option<String>,
    #[serde(default)]
    pub dm_room: Option<String>,
    #[serde(default)]
    pub linked_at: Option<DateTime<Utc>>,
}

/// The bridge's own chat account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotRecord {
    pub twitch_name: String,
    pub twitch_token: String,
}

/// Everything the directory knows, as loaded at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    #[serde(default)]
    pub rooms: Vec<RoomMapping>,
    #[serde(default)]
    pub bridged: Vec<BridgedRecord>,
    #[serde(default)]
    pub real_users: Vec<RealUserRecord>,
    #[serde(default)]
    pub bot: Option<BotRecord>,
}

impl DirectorySnapshot {
    pub(crate) fn upsert_room(&mut self, mapping: &RoomMapping) {
        self.rooms
            .retain(|m| m.room_id != mapping.room_id && m.channel != mapping.channel);
        self.rooms.push(mapping.clone());
    }

    pub(crate) fn upsert_bridged(&mut self, record: &BridgedRecord) {
        match self.bridged.iter_mut().find(|r| r.twitch_name == record.twitch_name) {
            Some(existing) => *existing = record.clone(),
            None => self.bridged.push(record.clone()),
        }
    }

    pub(crate) fn upsert_real_user(&mut self, record: &RealUserRecord) {
        match self.real_users.iter_mut().find(|r| r.user_id == record.user_id) {
            Some(existing) => *existing = record.clone(),
            None => self.real_users.push(record.clone()),
        }
    }
}

/// Persistence collaborator.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn load(&self) -> PersistenceResult<DirectorySnapshot>;

    async fn save_room(&self, mapping: &RoomMapping) -> PersistenceResult<()>;

    async fn save_bridged(&self, record: &BridgedRecord) -> PersistenceResult<()>;

    async fn save_real_user(&self, record: &RealUserRecord) -> PersistenceResult<()>;

    async fn save_bot(&self, record: &BotRecord) -> PersistenceResult<()>;
}

/// Single-file JSON directory.
pub struct JsonDirectory {
    path: PathBuf,
    /// Cached document; `None` until first load.
    doc: Mutex<Option<DirectorySnapshot>>,
}

impl JsonDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            doc: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    async fn read_file(&self) -> PersistenceResult<DirectorySnapshot> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| PersistenceError::Serde {
                path: self.path.display().to_string(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Directory {} does not exist yet, starting empty", self.path.display());
                Ok(DirectorySnapshot::default())
            }
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn write_file(&self, snapshot: &DirectorySnapshot) -> PersistenceResult<()> {
        let json = serde_json::to_vec_pretty(snapshot).map_err(|source| PersistenceError::Serde {
            path: self.path.display().to_string(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))
    }

    /// Apply `change` to the cached document and write it back.
    async fn update<F>(&self, change: F) -> PersistenceResult<()>
    where
        F: FnOnce(&mut DirectorySnapshot),
    {
        let mut doc = self.doc.lock().await;
        let mut snapshot = match doc.take() {
            Some(snapshot) => snapshot,
            None => self.read_file().await?,
        };
        change(&mut snapshot);
        let result = self.write_file(&snapshot).await;
        // Memory keeps the change even when the write fails.
        *doc = Some(snapshot);
        result
    }
}

#[async_trait]
impl Directory for JsonDirectory {
    async fn load(&self) -> PersistenceResult<DirectorySnapshot> {
        let mut doc = self.doc.lock().await;
        let snapshot = self.read_file().await?;
        *doc = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn save_room(&self, mapping: &RoomMapping) -> PersistenceResult<()> {
        self.update(|snapshot| snapshot.upsert_room(mapping)).await
    }

    async fn save_bridged(&self, record: &BridgedRecord) -> PersistenceResult<()> {
        self.update(|snapshot| snapshot.upsert_bridged(record)).await
    }

    async fn save_real_user(&self, record: &RealUserRecord) -> PersistenceResult<()> {
        self.update(|snapshot| snapshot.upsert_real_user(record)).await
    }

    async fn save_bot(&self, record: &BotRecord) -> PersistenceResult<()> {
        self.update(|snapshot| snapshot.bot = Some(record.clone())).await
    }
}
