//! Delivery of chat messages into Matrix rooms.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::common::error::RelayError;
use crate::common::types::{BridgeIdentity, Credential, RoomMapping};
use crate::matrix::RoomMessenger;

/// Joins a bridged identity to its room when needed, then posts as it.
pub struct RoomRelay {
    messenger: Arc<dyn RoomMessenger>,
    /// Bot credential used to read room membership.
    bot: Credential,
}

impl RoomRelay {
    pub fn new(messenger: Arc<dyn RoomMessenger>, bot: Credential) -> Self {
        Self { messenger, bot }
    }

    /// Join the bot to every mapped room; membership can only be read from inside.
    /// Returns how many joins succeeded.
    pub async fn join_rooms(&self, mappings: &[RoomMapping]) -> usize {
        let mut joined = 0;
        for mapping in mappings {
            match self.messenger.join_room(&self.bot, &mapping.room_id).await {
                Ok(()) => joined += 1,
                Err(e) => warn!(
                    room_id = %mapping.room_id,
                    channel = %mapping.channel,
                    "Bot failed to join mapped room: {}",
                    e
                ),
            }
        }
        joined
    }

    /// Deliver `text` into `room_id` as `identity`. No retry, no queueing.
    pub async fn deliver(&self, identity: &BridgeIdentity, room_id: &str, text: &str) -> Result<String, RelayError> {
        let members = self
            .messenger
            .joined_members(&self.bot, room_id)
            .await
            .map_err(|source| RelayError::Membership {
                room_id: room_id.to_string(),
                source,
            })?;

        if !members.contains(&identity.user_id) {
            debug!(user_id = %identity.user_id, room_id, "Joining room before relaying");
            self.messenger
                .join_room(&identity.credential, room_id)
                .await
                .map_err(|source| RelayError::Join {
                    room_id: room_id.to_string(),
                    user_id: identity.user_id.clone(),
                    source,
                })?;
        }

        self.messenger
            .send_text(&identity.credential, room_id, text)
            .await
            .map_err(|source| RelayError::Send {
                room_id: room_id.to_string(),
                user_id: identity.user_id.clone(),
                source,
            })
    }
}
