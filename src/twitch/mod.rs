//! Twitch chat sessions, Helix API and the OAuth login flow.

pub mod api;
pub mod login;
pub mod session;
pub mod supervisor;

pub use session::WebSocketDialer;
