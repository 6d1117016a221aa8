//! Linking a Matrix user to their own Twitch account.
//!
//! The user is sent an authorize URL whose `state` is their Matrix ID. Twitch
//! redirects back to `GET /callback?code=&state=`, the code is exchanged for a
//! token, and the user's own chat session is opened.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::bridge::directory::Directory;
use crate::bridge::registry::{SessionRegistry, TokenAttachment};
use crate::common::error::{LoginError, MatrixResult, TwitchApiError};
use crate::common::types::{ChatAccount, Credential};
use crate::matrix::RoomMessenger;
use crate::twitch::api::user_client;
use crate::twitch::session::SessionHandle;

/// Name of the private room the bot uses to talk to a user.
pub const DM_ROOM_NAME: &str = "Twitch Bot";

const DM_ROOM_PRESET: &str = "trusted_private_chat";

/// Twitch OAuth authorization-code flow.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Authorize URL that carries `state` back to the callback.
    fn authorize_url(&self, state: &str) -> String;

    async fn exchange_code(&self, code: &str) -> Result<Zeroizing<String>, TwitchApiError>;

    /// Login name of the account that owns `token`.
    async fn token_owner(&self, http: &reqwest::Client, token: &str) -> Result<String, TwitchApiError>;
}

/// Opens and closes linked users' own chat sessions.
#[async_trait]
pub trait SessionOpener: Send + Sync {
    async fn open_user_session(&self, user_id: &str, account: ChatAccount) -> Option<SessionHandle>;

    /// Stop `handle` if it is still the user's running session.
    async fn close_user_session(&self, user_id: &str, handle: &SessionHandle);
}

pub struct LoginService {
    registry: Arc<SessionRegistry>,
    oauth: Arc<dyn OAuthProvider>,
    messenger: Arc<dyn RoomMessenger>,
    directory: Arc<dyn Directory>,
    opener: Arc<dyn SessionOpener>,
    bot: Credential,
}

impl LoginService {
    pub fn new(
        registry: Arc<SessionRegistry>,
        oauth: Arc<dyn OAuthProvider>,
        messenger: Arc<dyn RoomMessenger>,
        directory: Arc<dyn Directory>,
        opener: Arc<dyn SessionOpener>,
        bot: Credential,
    ) -> Self {
        Self {
            registry,
            oauth,
            messenger,
            directory,
            opener,
            bot,
        }
    }

    /// Send the login URL to `user_id`, creating the bot's private room first if needed.
    ///
    /// The user is re-invited on every prompt in case they left the room.
    pub async fn prompt_login(&self, user_id: &str) -> MatrixResult<()> {
        let existing = self
            .registry
            .real_user(user_id)
            .await
            .and_then(|user| user.dm_room);

        let room_id = match existing {
            Some(room_id) => room_id,
            None => {
                let room_id = self
                    .messenger
                    .create_room(&self.bot, DM_ROOM_NAME, DM_ROOM_PRESET, &[])
                    .await?;

                if let Some(user) = self.registry.set_dm_room(user_id, &room_id).await {
                    if let Err(e) = self.directory.save_real_user(&user.to_record()).await {
                        warn!(user_id, "Failed to persist private room: {}", e);
                    }
                }
                room_id
            }
        };

        // Fails harmlessly when the user is already a member.
        if let Err(e) = self.messenger.invite_user(&self.bot, &room_id, user_id).await {
            debug!(user_id, room_id = %room_id, "Invite not delivered: {}", e);
        }

        let body = format!(
            "Please login to Twitch using the following URL: {}\n\
             You will be redirected to a page you can close as soon as it has loaded.",
            self.oauth.authorize_url(user_id)
        );
        self.messenger.send_notice(&self.bot, &room_id, &body).await?;
        info!(user_id, room_id = %room_id, "Sent Twitch login link");
        Ok(())
    }

    /// Handle one OAuth redirect. Returns the linked Twitch login.
    pub async fn complete(&self, code: Option<&str>, state: Option<&str>) -> Result<String, LoginError> {
        let code = code.ok_or(LoginError::MissingParameter { name: "code" })?;
        let user_id = state.ok_or(LoginError::MissingParameter { name: "state" })?;

        if self.registry.real_user(user_id).await.is_none() {
            return Err(LoginError::UnknownUser {
                user_id: user_id.to_string(),
            });
        }

        let token = self.oauth.exchange_code(code).await.map_err(LoginError::Exchange)?;
        let http = user_client().map_err(LoginError::Exchange)?;
        let login = self
            .oauth
            .token_owner(&http, &token)
            .await
            .map_err(LoginError::Owner)?;

        let TokenAttachment { user, replaced } = self
            .registry
            .attach_token(user_id, &login, token, http)
            .await
            .ok_or_else(|| LoginError::UnknownUser {
                user_id: user_id.to_string(),
            })?;
        info!(user_id, twitch = %login, "Linked Twitch account");

        if let Err(e) = self.directory.save_real_user(&user.to_record()).await {
            warn!(user_id, "Failed to persist Twitch token: {}", e);
        }

        if let Some(stale) = replaced {
            info!(user_id, previous = %stale.username(), "Twitch credentials changed, replacing chat session");
            self.opener.close_user_session(user_id, &stale).await;
        }

        if user.connection.is_none() {
            if let Some(account) = user.chat_account() {
                self.opener.open_user_session(user_id, account).await;
            }
        }
        Ok(login)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
}

/// HTTP routes for the OAuth redirect.
pub fn router(service: Arc<LoginService>) -> Router {
    Router::new()
        .route("/callback", get(callback))
        .with_state(service)
}

async fn callback(State(service): State<Arc<LoginService>>, Query(params): Query<CallbackParams>) -> Response {
    match service
        .complete(params.code.as_deref(), params.state.as_deref())
        .await
    {
        Ok(login) => Html(format!(
            "<h1>Logged in as {}</h1><p>You can close this window.</p>",
            login
        ))
        .into_response(),
        Err(e) => {
            error!("Twitch login failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Twitch login failed").into_response()
        }
    }
}
