//! Bridge coordinator: owns every chat session and their shutdown.
//!
//! Each session runs under a [`SessionSupervisor`] with a child of the
//! coordinator's root [`CancellationToken`], so one session can be stopped
//! alone and cancelling the root stops them all.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::provisioner::IdentityProvisioner;
use crate::bridge::registry::SessionRegistry;
use crate::bridge::relay::RoomRelay;
use crate::bridge::router::{EventRouter, RouterRole};
use crate::common::reconnect::ReconnectConfig;
use crate::common::types::ChatAccount;
use crate::twitch::login::SessionOpener;
use crate::twitch::session::{Dialer, SessionHandle};
use crate::twitch::supervisor::SessionSupervisor;

/// The main bridge that supervises every chat session.
pub struct Bridge {
    registry: Arc<SessionRegistry>,
    provisioner: Arc<IdentityProvisioner>,
    relay: Arc<RoomRelay>,
    dialer: Arc<dyn Dialer>,
    reconnect: ReconnectConfig,
    /// Root of every session's cancellation token.
    cancel: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    /// Running user sessions with their own stop token, by Matrix ID.
    user_sessions: StdMutex<HashMap<String, (SessionHandle, CancellationToken)>>,
}

impl Bridge {
    pub fn new(
        registry: Arc<SessionRegistry>,
        provisioner: Arc<IdentityProvisioner>,
        relay: Arc<RoomRelay>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            registry,
            provisioner,
            relay,
            dialer,
            reconnect: ReconnectConfig::default(),
            cancel: CancellationToken::new(),
            tasks: StdMutex::new(Vec::new()),
            user_sessions: StdMutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Supervise `handle` under a fresh child token, returned so the session can be stopped alone.
    fn spawn_session(&self, handle: SessionHandle, role: RouterRole) -> CancellationToken {
        let router = Arc::new(EventRouter::new(
            self.registry.clone(),
            self.provisioner.clone(),
            self.relay.clone(),
            role,
        ));
        let cancel = self.cancel.child_token();
        let task = SessionSupervisor::new(handle, self.dialer.clone(), router, cancel.clone())
            .with_reconnect(self.reconnect.clone())
            .spawn();
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(task);
        cancel
    }

    /// One bot session per mapped channel, each joined to its channel and relaying into its room.
    pub async fn start_bot_sessions(&self, bot: &ChatAccount) -> Vec<SessionHandle> {
        let mappings = self.registry.room_mappings().await;
        if mappings.is_empty() {
            warn!("No room mappings configured, the bot will not join any channel");
        }

        mappings
            .iter()
            .map(|mapping| {
                let handle = SessionHandle::for_channel(bot.clone(), &mapping.channel);
                info!(
                    "Starting bot session for #{} -> {}",
                    mapping.channel, mapping.room_id
                );
                self.spawn_session(handle.clone(), RouterRole::Relay);
                handle
            })
            .collect()
    }

    /// Reopen the own sessions of users linked before the last restart.
    pub async fn resume_user_sessions(&self) -> usize {
        let users = self.registry.users_ready_to_connect().await;
        let mut resumed = 0;
        for user in users {
            if let Some(account) = user.chat_account() {
                if self.open_user_session(&user.user_id, account).await.is_some() {
                    resumed += 1;
                }
            }
        }
        if resumed > 0 {
            info!("Resumed {} linked user session(s)", resumed);
        }
        resumed
    }

    /// Cancel every session and wait up to `grace` for them to close.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        let count = tasks.len();

        match tokio::time::timeout(grace, futures::future::join_all(tasks)).await {
            Ok(_) => info!("All {} chat session(s) closed", count),
            Err(_) => warn!("Chat sessions did not close within {:?}", grace),
        }
    }
}

#[async_trait]
impl SessionOpener for Bridge {
    async fn open_user_session(&self, user_id: &str, account: ChatAccount) -> Option<SessionHandle> {
        if self.cancel.is_cancelled() {
            return None;
        }

        let username = account.username.clone();
        let handle = SessionHandle::new(account);
        if !self.registry.attach_connection(user_id, handle.clone()).await {
            // Either unknown, or another caller opened it first.
            return self
                .registry
                .real_user(user_id)
                .await
                .and_then(|user| user.connection);
        }

        info!(user_id, twitch = %username, "Opening linked user's chat session");
        let cancel = self.spawn_session(handle.clone(), RouterRole::KeepaliveOnly);
        self.user_sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id.to_string(), (handle.clone(), cancel));
        Some(handle)
    }

    async fn close_user_session(&self, user_id: &str, handle: &SessionHandle) {
        let mut sessions = self.user_sessions.lock().unwrap_or_else(|e| e.into_inner());
        let running = sessions
            .get(user_id)
            .is_some_and(|(current, _)| current.same_session(handle));
        if !running {
            return;
        }
        if let Some((_, cancel)) = sessions.remove(user_id) {
            info!(user_id, twitch = %handle.username(), "Stopping user's chat session");
            cancel.cancel();
        }
    }
}
