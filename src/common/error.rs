//! Error types for the application.

use thiserror::Error;

/// Top-level application error.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Startup failed: {message}")]
    Startup { message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse config: {message}")]
    Parse { message: String },

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Chat transport errors. Any of these on a live session triggers reconnection.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Failed to dial {url}: {message}")]
    Dial { url: String, message: String },

    #[error("Write failed: {message}")]
    Write { message: String },

    #[error("Write deadline of {seconds}s exceeded")]
    WriteTimeout { seconds: u64 },

    #[error("Read failed: {message}")]
    Read { message: String },

    #[error("Session is not connected")]
    NotConnected,
}

/// Errors from the Matrix client-server API.
#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Matrix API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Unexpected response: {message}")]
    Response { message: String },
}

/// Errors from the Twitch Helix and OAuth endpoints.
#[derive(Debug, Error)]
pub enum TwitchApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Twitch API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Failure to create a bridged identity. Cloneable so every caller waiting on
/// the same provisioning attempt receives the same outcome.
#[derive(Debug, Clone, Error)]
pub enum ProvisioningError {
    #[error("Twitch user '{username}' does not exist")]
    UnknownUser { username: String },

    #[error("Twitch user lookup for '{username}' failed: {message}")]
    Lookup { username: String, message: String },

    #[error("Identity '{user_id}' is outside the registered namespace")]
    Namespace { user_id: String },

    #[error("Failed to create Matrix account '{user_id}': {message}")]
    AccountCreation { user_id: String, message: String },
}

/// Failure to deliver one message into a room.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to query members of {room_id}: {source}")]
    Membership {
        room_id: String,
        #[source]
        source: MatrixError,
    },

    #[error("Failed to join {room_id} as {user_id}: {source}")]
    Join {
        room_id: String,
        user_id: String,
        #[source]
        source: MatrixError,
    },

    #[error("Failed to send into {room_id} as {user_id}: {source}")]
    Send {
        room_id: String,
        user_id: String,
        #[source]
        source: MatrixError,
    },
}

/// Directory (durable storage) errors.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Failed to access directory '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt directory '{path}': {source}")]
    Serde {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors surfaced by the OAuth callback handler.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("Missing '{name}' query parameter")]
    MissingParameter { name: &'static str },

    #[error("No pending login for {user_id}")]
    UnknownUser { user_id: String },

    #[error("Token exchange failed: {0}")]
    Exchange(#[source] TwitchApiError),

    #[error("Token owner lookup failed: {0}")]
    Owner(#[source] TwitchApiError),
}

/// Result type alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Result type alias for Matrix operations.
pub type MatrixResult<T> = std::result::Result<T, MatrixError>;

/// Result type alias for directory operations.
pub type PersistenceResult<T> = std::result::Result<T, PersistenceError>;
