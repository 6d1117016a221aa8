//! Configuration validation.
//!
//! Validates configuration values and provides helpful error messages.

use std::net::SocketAddr;

use url::Url;

use crate::bridge::provisioner::Namespace;
use crate::common::error::ConfigError;
use crate::config::types::Config;

/// Placeholder values shipped in the sample configuration.
const PLACEHOLDERS: &[&str] = &["CHANGE_ME", "YOUR_TOKEN_HERE", "YOUR_CLIENT_SECRET_HERE"];

fn check_secret(errors: &mut Vec<String>, name: &str, value: &str) {
    if value.is_empty() {
        errors.push(format!("{} is required", name));
    } else if PLACEHOLDERS.contains(&value) {
        errors.push(format!("{} has not been configured (still using placeholder)", name));
    }
}

fn check_url(errors: &mut Vec<String>, name: &str, value: &str) {
    match Url::parse(value) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
        Ok(url) => errors.push(format!("{} must be an http(s) URL (got scheme '{}')", name, url.scheme())),
        Err(e) => errors.push(format!("{} is not a valid URL: '{}' ({})", name, value, e)),
    }
}

fn check_listen(errors: &mut Vec<String>, name: &str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(format!("{} is not a valid listen address: '{}'", name, value));
    }
}

/// Validate a configuration and return detailed errors.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    // Validate Matrix config
    check_url(&mut errors, "matrix.homeserver_url", &config.matrix.homeserver_url);
    check_secret(&mut errors, "matrix.as_token", &config.matrix.as_token);
    check_secret(&mut errors, "matrix.hs_token", &config.matrix.hs_token);
    if !config.matrix.bot_user_id.starts_with('@') || !config.matrix.bot_user_id.contains(':') {
        errors.push(format!(
            "matrix.bot_user_id must be a full Matrix ID like '@bot:example.org' (got '{}')",
            config.matrix.bot_user_id
        ));
    }
    match Namespace::parse(&config.matrix.user_namespace) {
        Ok(_) => {}
        Err(ConfigError::Validation { message }) => errors.push(format!("matrix.user_namespace: {}", message)),
        Err(e) => errors.push(format!("matrix.user_namespace: {}", e)),
    }
    check_listen(&mut errors, "matrix.listen", &config.matrix.listen);

    // Validate Twitch config
    check_secret(&mut errors, "twitch.client_id", &config.twitch.client_id);
    check_secret(&mut errors, "twitch.client_secret", &config.twitch.client_secret);
    check_url(&mut errors, "twitch.redirect_uri", &config.twitch.redirect_uri);
    check_listen(&mut errors, "twitch.callback_listen", &config.twitch.callback_listen);
    if let Some(ref bot) = config.twitch.bot {
        if bot.username.is_empty() {
            errors.push("twitch.bot.username is required".to_string());
        }
        check_secret(&mut errors, "twitch.bot.token", &bot.token);
    }

    // Validate room mappings
    for (i, room) in config.rooms.iter().enumerate() {
        if !room.room_id.starts_with('!') || !room.room_id.contains(':') {
            errors.push(format!("rooms[{}].room_id '{}' is not a room ID", i, room.room_id));
        }
        if room.channel.trim_start_matches('#').is_empty() {
            errors.push(format!("rooms[{}].channel is required", i));
        }
    }

    if config.directory.path.is_empty() {
        errors.push("directory.path is required".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation {
            message: errors.join("\n"),
        })
    }
}
