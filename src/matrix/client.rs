//! Matrix client-server API access for the application service.
//!
//! All requests authenticate with the appservice token; acting as a specific
//! user is done by attaching that user's [`Credential`] as the `user_id`
//! query parameter.

use std::collections::HashSet;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;
use zeroize::Zeroizing;

use crate::common::error::{MatrixError, MatrixResult};
use crate::common::types::Credential;

/// Room operations the bridge needs from the homeserver.
#[async_trait]
pub trait RoomMessenger: Send + Sync {
    /// Create a private room and invite `invite`. Returns the new room ID.
    async fn create_room(&self, as_user: &Credential, name: &str, preset: &str, invite: &[String]) -> MatrixResult<String>;

    async fn invite_user(&self, as_user: &Credential, room_id: &str, user_id: &str) -> MatrixResult<()>;

    async fn send_notice(&self, as_user: &Credential, room_id: &str, body: &str) -> MatrixResult<String>;

    async fn send_text(&self, as_user: &Credential, room_id: &str, body: &str) -> MatrixResult<String>;

    async fn join_room(&self, as_user: &Credential, room_id: &str) -> MatrixResult<()>;

    async fn joined_members(&self, as_user: &Credential, room_id: &str) -> MatrixResult<HashSet<String>>;

    /// Register a virtual user in the appservice namespace. An existing account counts as success.
    async fn register_user(&self, localpart: &str) -> MatrixResult<()>;

    async fn set_display_name(&self, as_user: &Credential, display_name: &str) -> MatrixResult<()>;

    async fn set_avatar_url(&self, as_user: &Credential, content_uri: &str) -> MatrixResult<()>;

    /// Fetch an external image and store it in the media repository. Returns its `mxc://` URI.
    async fn upload_from_url(&self, as_user: &Credential, source: &str) -> MatrixResult<String>;
}

#[derive(Deserialize)]
struct RoomIdResponse {
    room_id: String,
}

#[derive(Deserialize)]
struct EventIdResponse {
    event_id: String,
}

#[derive(Deserialize)]
struct JoinedMembersResponse {
    joined: std::collections::HashMap<String, Value>,
}

#[derive(Deserialize)]
struct UploadResponse {
    content_uri: String,
}

/// Client-server API client authenticated as the appservice.
pub struct MatrixClient {
    homeserver: Url,
    /// SECURITY: appservice token is zeroized on drop.
    as_token: Zeroizing<String>,
    http: reqwest::Client,
}

impl MatrixClient {
    pub fn new(homeserver_url: &str, as_token: &str) -> MatrixResult<Self> {
        Ok(Self {
            homeserver: Url::parse(homeserver_url)?,
            as_token: Zeroizing::new(as_token.to_string()),
            http: reqwest::Client::new(),
        })
    }

    fn endpoint(&self, segments: &[&str], as_user: Option<&Credential>) -> MatrixResult<Url> {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|_| MatrixError::Response {
                message: format!("homeserver URL '{}' cannot carry a path", self.homeserver),
            })?
            .pop_if_empty()
            .extend(segments);
        if let Some(credential) = as_user {
            url.query_pairs_mut().append_pair("user_id", &credential.user_id);
        }
        Ok(url)
    }

    fn client_endpoint(&self, segments: &[&str], as_user: Option<&Credential>) -> MatrixResult<Url> {
        let mut path = vec!["_matrix", "client", "v3"];
        path.extend_from_slice(segments);
        self.endpoint(&path, as_user)
    }

    async fn execute<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> MatrixResult<T> {
        let response = request.bearer_auth(self.as_token.as_str()).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MatrixError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }

    async fn send_message(&self, as_user: &Credential, room_id: &str, msgtype: &str, body: &str) -> MatrixResult<String> {
        let txn_id = transaction_id();
        let url = self.client_endpoint(
            &["rooms", room_id, "send", "m.room.message", &txn_id],
            Some(as_user),
        )?;
        let payload = json!({ "msgtype": msgtype, "body": body });
        let response: EventIdResponse = self.execute(self.http.put(url).json(&payload)).await?;
        debug!(room_id, sender = %as_user.user_id, event_id = %response.event_id, "Sent {}", msgtype);
        Ok(response.event_id)
    }
}

fn transaction_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

#[async_trait]
impl RoomMessenger for MatrixClient {
    async fn create_room(&self, as_user: &Credential, name: &str, preset: &str, invite: &[String]) -> MatrixResult<String> {
        let url = self.client_endpoint(&["createRoom"], Some(as_user))?;
        let payload = json!({
            "name": name,
            "preset": preset,
            "invite": invite,
            "is_direct": true,
        });
        let response: RoomIdResponse = self.execute(self.http.post(url).json(&payload)).await?;
        Ok(response.room_id)
    }

    async fn invite_user(&self, as_user: &Credential, room_id: &str, user_id: &str) -> MatrixResult<()> {
        let url = self.client_endpoint(&["rooms", room_id, "invite"], Some(as_user))?;
        let _: IgnoredAny = self
            .execute(self.http.post(url).json(&json!({ "user_id": user_id })))
            .await?;
        Ok(())
    }

    async fn send_notice(&self, as_user: &Credential, room_id: &str, body: &str) -> MatrixResult<String> {
        self.send_message(as_user, room_id, "m.notice", body).await
    }

    async fn send_text(&self, as_user: &Credential, room_id: &str, body: &str) -> MatrixResult<String> {
        self.send_message(as_user, room_id, "m.text", body).await
    }

    async fn join_room(&self, as_user: &Credential, room_id: &str) -> MatrixResult<()> {
        let url = self.client_endpoint(&["join", room_id], Some(as_user))?;
        let _: RoomIdResponse = self.execute(self.http.post(url).json(&json!({}))).await?;
        Ok(())
    }

    async fn joined_members(&self, as_user: &Credential, room_id: &str) -> MatrixResult<HashSet<String>> {
        let url = self.client_endpoint(&["rooms", room_id, "joined_members"], Some(as_user))?;
        let response: JoinedMembersResponse = self.execute(self.http.get(url)).await?;
        Ok(response.joined.into_keys().collect())
    }

    async fn register_user(&self, localpart: &str) -> MatrixResult<()> {
        let url = self.client_endpoint(&["register"], None)?;
        let payload = json!({
            "type": "m.login.application_service",
            "username": localpart,
        });
        match self.execute::<IgnoredAny>(self.http.post(url).json(&payload)).await {
            Ok(_) => Ok(()),
            Err(MatrixError::Api { body, .. }) if body.contains("M_USER_IN_USE") => {
                debug!(localpart, "Matrix account already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_display_name(&self, as_user: &Credential, display_name: &str) -> MatrixResult<()> {
        let url = self.client_endpoint(&["profile", &as_user.user_id, "displayname"], Some(as_user))?;
        let _: IgnoredAny = self
            .execute(self.http.put(url).json(&json!({ "displayname": display_name })))
            .await?;
        Ok(())
    }

    async fn set_avatar_url(&self, as_user: &Credential, content_uri: &str) -> MatrixResult<()> {
        let url = self.client_endpoint(&["profile", &as_user.user_id, "avatar_url"], Some(as_user))?;
        let _: IgnoredAny = self
            .execute(self.http.put(url).json(&json!({ "avatar_url": content_uri })))
            .await?;
        Ok(())
    }

    async fn upload_from_url(&self, as_user: &Credential, source: &str) -> MatrixResult<String> {
        let download = self.http.get(source).send().await?.error_for_status()?;
        let content_type = download
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = download.bytes().await?;

        let url = self.endpoint(&["_matrix", "media", "v3", "upload"], Some(as_user))?;
        let response: UploadResponse = self
            .execute(self.http.post(url).header(CONTENT_TYPE, content_type).body(data))
            .await?;
        Ok(response.content_uri)
    }
}
