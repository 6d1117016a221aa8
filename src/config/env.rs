//! Environment variable overrides for configuration.
//!
//! Supports overriding config values with environment variables:
//! - `TWITCH_BRIDGE_HOMESERVER_URL` - Matrix homeserver base URL
//! - `TWITCH_BRIDGE_AS_TOKEN` - appservice token
//! - `TWITCH_BRIDGE_HS_TOKEN` - homeserver token
//! - `TWITCH_BRIDGE_CLIENT_ID` - Twitch application client ID
//! - `TWITCH_BRIDGE_CLIENT_SECRET` - Twitch application client secret
//! - `TWITCH_BRIDGE_BOT_USERNAME` - bot account login
//! - `TWITCH_BRIDGE_BOT_TOKEN` - bot account OAuth token

use std::env;

use crate::config::types::{BotConfig, Config};

/// Environment variable prefix for all config overrides.
const ENV_PREFIX: &str = "TWITCH_BRIDGE";

/// Apply environment variable overrides to a config.
///
/// This allows secrets to be provided via environment variables instead of
/// the config file.
pub fn apply_env_overrides(config: Config) -> Config {
    apply_overrides(config, |name| env::var(name).ok())
}

fn apply_overrides(mut config: Config, lookup: impl Fn(&str) -> Option<String>) -> Config {
    let var = |suffix: &str| lookup(&format!("{}_{}", ENV_PREFIX, suffix));

    if let Some(url) = var("HOMESERVER_URL") {
        config.matrix.homeserver_url = url;
    }
    if let Some(token) = var("AS_TOKEN") {
        config.matrix.as_token = token;
    }
    if let Some(token) = var("HS_TOKEN") {
        config.matrix.hs_token = token;
    }
    if let Some(client_id) = var("CLIENT_ID") {
        config.twitch.client_id = client_id;
    }
    if let Some(secret) = var("CLIENT_SECRET") {
        config.twitch.client_secret = secret;
    }

    // Bot credentials may come entirely from the environment.
    let username = var("BOT_USERNAME");
    let token = var("BOT_TOKEN");
    if username.is_some() || token.is_some() {
        let bot = config.twitch.bot.get_or_insert_with(BotConfig::default);
        if let Some(username) = username {
            bot.username = username;
        }
        if let Some(token) = token {
            bot.token = token;
        }
    }

    config
}

/// Check if any secret environment variables are set but empty.
///
/// Returns a list of variable names that are set but empty.
pub fn check_empty_env_vars() -> Vec<String> {
    let vars = ["AS_TOKEN", "HS_TOKEN", "CLIENT_SECRET", "BOT_TOKEN"].map(|suffix| format!("{}_{}", ENV_PREFIX, suffix));

    vars.into_iter()
        .filter(|var| env::var(var).map(|v| v.is_empty()).unwrap_or(false))
        .collect()
}

/// Get the config file path from environment or use default.
///
/// Checks `TWITCH_BRIDGE_CONFIG` environment variable, otherwise returns "twitch-bridge.conf".
pub fn get_config_path() -> String {
    env::var(format!("{}_CONFIG", ENV_PREFIX)).unwrap_or_else(|_| "twitch-bridge.conf".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::config::types::*;

    fn make_test_config() -> Config {
        Config {
            matrix: MatrixConfig {
                homeserver_url: "https://matrix.example.org".to_string(),
                as_token: "original_as".to_string(),
                hs_token: "original_hs".to_string(),
                bot_user_id: "@twitchbot:example.org".to_string(),
                user_namespace: "@twitch_.+:example.org".to_string(),
                listen: "127.0.0.1:9000".to_string(),
            },
            twitch: TwitchConfig {
                client_id: "cid".to_string(),
                client_secret: "csecret".to_string(),
                redirect_uri: "https://bridge.example.org/callback".to_string(),
                callback_listen: "0.0.0.0:8080".to_string(),
                bot: None,
            },
            directory: DirectoryConfig::default(),
            rooms: Vec::new(),
        }
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(ENV_PREFIX, "TWITCH_BRIDGE");
    }

    #[test]
    fn test_overrides_without_vars_keep_config() {
        let result = apply_overrides(make_test_config(), lookup(&[]));
        assert_eq!(result.matrix.as_token, "original_as");
        assert!(result.twitch.bot.is_none());
    }

    #[test]
    fn test_secret_overrides() {
        let result = apply_overrides(
            make_test_config(),
            lookup(&[
                ("TWITCH_BRIDGE_AS_TOKEN", "env_as"),
                ("TWITCH_BRIDGE_HS_TOKEN", "env_hs"),
                ("TWITCH_BRIDGE_CLIENT_SECRET", "env_secret"),
            ]),
        );
        assert_eq!(result.matrix.as_token, "env_as");
        assert_eq!(result.matrix.hs_token, "env_hs");
        assert_eq!(result.twitch.client_secret, "env_secret");
        assert_eq!(result.twitch.client_id, "cid");
    }

    #[test]
    fn test_bot_created_from_env() {
        let result = apply_overrides(
            make_test_config(),
            lookup(&[
                ("TWITCH_BRIDGE_BOT_USERNAME", "bridgebot"),
                ("TWITCH_BRIDGE_BOT_TOKEN", "oauth:xyz"),
            ]),
        );
        let bot = result.twitch.bot.unwrap();
        assert_eq!(bot.username, "bridgebot");
        assert_eq!(bot.token, "oauth:xyz");
    }

    #[test]
    fn test_bot_token_override_keeps_file_username() {
        let mut config = make_test_config();
        config.twitch.bot = Some(BotConfig {
            username: "filebot".to_string(),
            token: "old".to_string(),
        });
        let result = apply_overrides(config, lookup(&[("TWITCH_BRIDGE_BOT_TOKEN", "new")]));
        let bot = result.twitch.bot.unwrap();
        assert_eq!(bot.username, "filebot");
        assert_eq!(bot.token, "new");
    }
}
