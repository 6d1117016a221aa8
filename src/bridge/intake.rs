//! Appservice transaction endpoint: Matrix-side events pushed by the homeserver.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::put;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::bridge::directory::Directory;
use crate::bridge::registry::{RealUserSession, SessionRegistry};
use crate::twitch::login::{LoginService, SessionOpener};
use crate::twitch::session::SessionHandle;

/// How many recent transaction IDs are remembered to drop homeserver retries.
const SEEN_TRANSACTIONS: usize = 128;

#[derive(Debug, Default, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub sender: String,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub content: Value,
}

impl RoomEvent {
    fn body(&self) -> Option<&str> {
        self.content.get("body").and_then(Value::as_str)
    }
}

/// What happened to one pushed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    Ignored,
    /// First contact: the sender was sent a login link.
    Prompted,
    /// Linked sender whose own session was just opened.
    Connected,
    /// Message forwarded to the mapped channel through the sender's session.
    Forwarded { channel: String },
    /// Known sender that has not finished logging in.
    AwaitingLogin,
    Failed,
}

pub struct MatrixIntake {
    registry: Arc<SessionRegistry>,
    login: Arc<LoginService>,
    opener: Arc<dyn SessionOpener>,
    directory: Arc<dyn Directory>,
    bot_user_id: String,
    /// SECURITY: homeserver token is zeroized on drop.
    hs_token: Zeroizing<String>,
    seen: StdMutex<VecDeque<String>>,
}

impl MatrixIntake {
    pub fn new(
        registry: Arc<SessionRegistry>,
        login: Arc<LoginService>,
        opener: Arc<dyn SessionOpener>,
        directory: Arc<dyn Directory>,
        bot_user_id: &str,
        hs_token: &str,
    ) -> Self {
        Self {
            registry,
            login,
            opener,
            directory,
            bot_user_id: bot_user_id.to_string(),
            hs_token: Zeroizing::new(hs_token.to_string()),
            seen: StdMutex::new(VecDeque::with_capacity(SEEN_TRANSACTIONS)),
        }
    }

    fn authorized(&self, query_token: Option<&str>, headers: &HeaderMap) -> bool {
        let header_token = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        query_token
            .or(header_token)
            .is_some_and(|token| token == self.hs_token.as_str())
    }

    /// Returns `false` if this transaction was already handled.
    fn first_delivery(&self, txn_id: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if seen.iter().any(|id| id == txn_id) {
            return false;
        }
        if seen.len() == SEEN_TRANSACTIONS {
            seen.pop_front();
        }
        seen.push_back(txn_id.to_string());
        true
    }

    pub async fn handle_transaction(&self, txn_id: &str, transaction: Transaction) {
        if !self.first_delivery(txn_id) {
            debug!(txn_id, "Skipping repeated transaction");
            return;
        }
        for event in transaction.events {
            self.handle_event(&event).await;
        }
    }

    pub async fn handle_event(&self, event: &RoomEvent) -> IntakeOutcome {
        if event.kind != "m.room.message" {
            return IntakeOutcome::Ignored;
        }
        if event.sender == self.bot_user_id || self.registry.is_bridged_user(&event.sender).await {
            return IntakeOutcome::Ignored;
        }

        let Some(user) = self.registry.real_user(&event.sender).await else {
            return self.first_contact(&event.sender).await;
        };

        if let Some(handle) = user.connection.as_ref() {
            return self.forward(&user, handle, event).await;
        }

        match user.chat_account() {
            Some(account) => match self.opener.open_user_session(&user.user_id, account).await {
                Some(_) => IntakeOutcome::Connected,
                None => IntakeOutcome::Failed,
            },
            None => IntakeOutcome::AwaitingLogin,
        }
    }

    async fn first_contact(&self, user_id: &str) -> IntakeOutcome {
        let user = RealUserSession::new(user_id);
        let record = user.to_record();
        if !self.registry.insert_real_user(user).await {
            return IntakeOutcome::AwaitingLogin;
        }
        info!(user_id, "New Matrix user, sending Twitch login link");

        if let Err(e) = self.directory.save_real_user(&record).await {
            warn!(user_id, "Failed to persist new user: {}", e);
        }
        match self.login.prompt_login(user_id).await {
            Ok(()) => IntakeOutcome::Prompted,
            Err(e) => {
                warn!(user_id, "Failed to send login link: {}", e);
                IntakeOutcome::Failed
            }
        }
    }

    async fn forward(
        &self,
        user: &RealUserSession,
        handle: &SessionHandle,
        event: &RoomEvent,
    ) -> IntakeOutcome {
        let Some(room_id) = event.room_id.as_deref() else {
            return IntakeOutcome::Ignored;
        };
        let Some(channel) = self.registry.channel_for_room(room_id).await else {
            return IntakeOutcome::Ignored;
        };
        let Some(body) = event.body() else {
            return IntakeOutcome::Ignored;
        };

        if handle.joined_channel().as_deref() != Some(channel.as_str()) {
            if let Err(e) = handle.join(&channel).await {
                warn!(user_id = %user.user_id, channel = %channel, "Failed to join channel: {}", e);
                return IntakeOutcome::Failed;
            }
        }
        match handle.send(&channel, body).await {
            Ok(()) => IntakeOutcome::Forwarded { channel },
            Err(e) => {
                warn!(user_id = %user.user_id, channel = %channel, "Failed to forward message: {}", e);
                IntakeOutcome::Failed
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthParams {
    pub access_token: Option<String>,
}

/// HTTP routes the homeserver pushes transactions to.
pub fn router(intake: Arc<MatrixIntake>) -> Router {
    Router::new()
        .route("/_matrix/app/v1/transactions/{txn_id}", put(transaction))
        .with_state(intake)
}

async fn transaction(
    State(intake): State<Arc<MatrixIntake>>,
    Path(txn_id): Path<String>,
    Query(auth): Query<AuthParams>,
    headers: HeaderMap,
    Json(body): Json<Transaction>,
) -> Response {
    if !intake.authorized(auth.access_token.as_deref(), &headers) {
        warn!(txn_id = %txn_id, "Rejected transaction with bad homeserver token");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "errcode": "M_FORBIDDEN" })),
        )
            .into_response();
    }

    intake.handle_transaction(&txn_id, body).await;
    Json(json!({})).into_response()
}
