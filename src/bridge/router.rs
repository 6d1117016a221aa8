//! Dispatch of parsed chat events from one session.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::bridge::provisioner::IdentityProvisioner;
use crate::bridge::registry::SessionRegistry;
use crate::bridge::relay::RoomRelay;
use crate::common::types::normalize_channel;
use crate::protocol::{ChatEvent, Command};
use crate::twitch::session::SessionHandle;
use crate::twitch::supervisor::EventHandler;

/// What a router does with chat messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterRole {
    /// Relay chat messages into mapped rooms.
    Relay,
    /// Answer keepalives only; chat is relayed by another session.
    KeepaliveOnly,
}

/// Result of routing one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Ponged,
    Relayed { room_id: String },
    /// Sender is a linked real user who already sees their own message.
    EchoSuppressed,
    /// No room is mapped to the channel.
    Unmapped,
    Ignored,
    Failed,
}

pub struct EventRouter {
    registry: Arc<SessionRegistry>,
    provisioner: Arc<IdentityProvisioner>,
    relay: Arc<RoomRelay>,
    role: RouterRole,
}

impl EventRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        provisioner: Arc<IdentityProvisioner>,
        relay: Arc<RoomRelay>,
        role: RouterRole,
    ) -> Self {
        Self {
            registry,
            provisioner,
            relay,
            role,
        }
    }

    pub async fn route(&self, session: &SessionHandle, event: ChatEvent) -> RouteOutcome {
        match event.command {
            Command::Ping => match session.pong(&event.message).await {
                Ok(()) => RouteOutcome::Ponged,
                Err(e) => {
                    warn!(username = %session.username(), "Failed to answer PING: {}", e);
                    RouteOutcome::Failed
                }
            },
            Command::Privmsg => match self.role {
                RouterRole::Relay => self.relay_message(event).await,
                RouterRole::KeepaliveOnly => RouteOutcome::Ignored,
            },
            Command::Other(command) => {
                debug!(username = %session.username(), "Ignoring {} from {}", command, event.username);
                RouteOutcome::Ignored
            }
        }
    }

    async fn relay_message(&self, event: ChatEvent) -> RouteOutcome {
        if self.registry.is_linked_twitch_name(&event.username).await {
            debug!(twitch = %event.username, "Suppressing echo of linked user");
            return RouteOutcome::EchoSuppressed;
        }

        let channel = normalize_channel(&event.channel);
        let Some(room_id) = self.registry.room_for_channel(&channel).await else {
            return RouteOutcome::Unmapped;
        };

        let identity = match self.provisioner.resolve(&event.username).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(twitch = %event.username, channel = %channel, "Failed to provision identity: {}", e);
                return RouteOutcome::Failed;
            }
        };

        match self.relay.deliver(&identity, &room_id, &event.message).await {
            Ok(event_id) => {
                debug!(room_id = %room_id, event_id = %event_id, "Relayed message from {}", event.username);
                RouteOutcome::Relayed { room_id }
            }
            Err(e) => {
                error!(channel = %channel, "Failed to relay message: {}", e);
                RouteOutcome::Failed
            }
        }
    }
}

#[async_trait]
impl EventHandler for EventRouter {
    async fn handle(&self, session: &SessionHandle, event: ChatEvent) {
        self.route(session, event).await;
    }
}
