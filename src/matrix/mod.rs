//! Matrix homeserver access.

pub mod client;

pub use client::{MatrixClient, RoomMessenger};
