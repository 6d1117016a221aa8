//! Twitch Helix and OAuth endpoints.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;
use zeroize::Zeroizing;

use crate::common::error::TwitchApiError;
use crate::common::types::Profile;
use crate::twitch::login::OAuthProvider;

pub const HELIX_URL: &str = "https://api.twitch.tv/helix/";
pub const OAUTH_URL: &str = "https://id.twitch.tv/oauth2/";

/// Scopes needed to read and write chat as the linked user.
pub const CHAT_SCOPES: &str = "chat:read chat:edit";

/// Request timeout for clients bound to a linked user's token.
pub const USER_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client used on behalf of one linked user.
pub fn user_client() -> Result<reqwest::Client, TwitchApiError> {
    Ok(reqwest::Client::builder().timeout(USER_CLIENT_TIMEOUT).build()?)
}

/// Looks up Twitch users by login name.
#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn user_exists(&self, login: &str) -> Result<bool, TwitchApiError>;

    async fn fetch_profile(&self, login: &str) -> Result<Option<Profile>, TwitchApiError>;
}

#[derive(Debug, Deserialize)]
struct HelixUsers {
    data: Vec<HelixUser>,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
    login: String,
    display_name: String,
    #[serde(default)]
    profile_image_url: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Helix client authenticated with an app access token (client-credentials grant).
pub struct TwitchApi {
    client_id: String,
    /// SECURITY: client secret is zeroized on drop.
    client_secret: Zeroizing<String>,
    redirect_uri: String,
    helix: Url,
    oauth: Url,
    http: reqwest::Client,
    app_token: RwLock<Option<Zeroizing<String>>>,
}

impl TwitchApi {
    pub fn new(client_id: &str, client_secret: &str, redirect_uri: &str) -> Result<Self, TwitchApiError> {
        Ok(Self {
            client_id: client_id.to_string(),
            client_secret: Zeroizing::new(client_secret.to_string()),
            redirect_uri: redirect_uri.to_string(),
            helix: Url::parse(HELIX_URL)?,
            oauth: Url::parse(OAUTH_URL)?,
            http: reqwest::Client::new(),
            app_token: RwLock::new(None),
        })
    }

    async fn app_token(&self) -> Result<Zeroizing<String>, TwitchApiError> {
        if let Some(token) = self.app_token.read().await.as_ref() {
            return Ok(token.clone());
        }

        let mut slot = self.app_token.write().await;
        if let Some(token) = slot.as_ref() {
            return Ok(token.clone());
        }

        let url = self.oauth.join("token")?;
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ];
        let response: TokenResponse = read_json(self.http.post(url).form(&params)).await?;
        info!("Obtained Twitch app access token");

        let token = Zeroizing::new(response.access_token);
        *slot = Some(token.clone());
        Ok(token)
    }

    async fn users(&self, login: &str) -> Result<Vec<HelixUser>, TwitchApiError> {
        let mut url = self.helix.join("users")?;
        url.query_pairs_mut().append_pair("login", login);

        let token = self.app_token().await?;
        let request = self
            .http
            .get(url.clone())
            .header("Client-Id", &self.client_id)
            .bearer_auth(token.as_str());

        match read_json::<HelixUsers>(request).await {
            Err(TwitchApiError::Api { status: 401, .. }) => {
                // App tokens expire; fetch a fresh one once.
                debug!("Twitch app token rejected, refreshing");
                self.app_token.write().await.take();
                let token = self.app_token().await?;
                let request = self
                    .http
                    .get(url)
                    .header("Client-Id", &self.client_id)
                    .bearer_auth(token.as_str());
                Ok(read_json::<HelixUsers>(request).await?.data)
            }
            other => Ok(other?.data),
        }
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T, TwitchApiError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TwitchApiError::Api {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json::<T>().await?)
}

fn to_profile(user: HelixUser) -> Profile {
    let avatar_url = Some(user.profile_image_url).filter(|url| !url.is_empty());
    Profile {
        display_name: user.display_name,
        avatar_url,
    }
}

#[async_trait]
impl ProfileLookup for TwitchApi {
    async fn user_exists(&self, login: &str) -> Result<bool, TwitchApiError> {
        Ok(!self.users(login).await?.is_empty())
    }

    async fn fetch_profile(&self, login: &str) -> Result<Option<Profile>, TwitchApiError> {
        Ok(self.users(login).await?.into_iter().next().map(to_profile))
    }
}

#[async_trait]
impl OAuthProvider for TwitchApi {
    fn authorize_url(&self, state: &str) -> String {
        let mut url = self.oauth.clone();
        url.set_path("/oauth2/authorize");
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", CHAT_SCOPES)
            .append_pair("state", state);
        url.to_string()
    }

    async fn exchange_code(&self, code: &str) -> Result<Zeroizing<String>, TwitchApiError> {
        let url = self.oauth.join("token")?;
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];
        let response: TokenResponse = read_json(self.http.post(url).form(&params)).await?;
        Ok(Zeroizing::new(response.access_token))
    }

    async fn token_owner(&self, http: &reqwest::Client, token: &str) -> Result<String, TwitchApiError> {
        let url = self.helix.join("users")?;
        let request = http
            .get(url)
            .header("Client-Id", &self.client_id)
            .bearer_auth(token);
        let users: HelixUsers = read_json(request).await?;
        users
            .data
            .into_iter()
            .next()
            .map(|user| user.login)
            .ok_or(TwitchApiError::Api {
                status: 404,
                body: "token has no owner".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> TwitchApi {
        TwitchApi::new("cid", "secret", "https://bridge.example.org/callback").unwrap()
    }

    #[test]
    fn test_authorize_url_carries_state() {
        let url = Url::parse(&api().authorize_url("@alice:example.org")).unwrap();
        assert_eq!(url.host_str(), Some("id.twitch.tv"));
        assert_eq!(url.path(), "/oauth2/authorize");

        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "cid");
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["scope"], CHAT_SCOPES);
        assert_eq!(pairs["state"], "@alice:example.org");
        assert_eq!(pairs["redirect_uri"], "https://bridge.example.org/callback");
    }

    #[test]
    fn test_helix_user_to_profile() {
        let users: HelixUsers = serde_json::from_str(
            r#"{"data":[{"id":"1","login":"foo","display_name":"Foo","profile_image_url":""}]}"#,
        )
        .unwrap();
        let user = users.data.into_iter().next().unwrap();
        assert_eq!(user.login, "foo");

        let profile = to_profile(user);
        assert_eq!(profile.display_name, "Foo");
        assert_eq!(profile.avatar_url, None);
    }

    #[test]
    fn test_helix_avatar_kept_when_present() {
        let profile = to_profile(HelixUser {
            login: "foo".to_string(),
            display_name: "Foo".to_string(),
            profile_image_url: "https://static-cdn.jtvnw.net/foo.png".to_string(),
        });
        assert_eq!(profile.avatar_url.as_deref(), Some("https://static-cdn.jtvnw.net/foo.png"));
    }
}
