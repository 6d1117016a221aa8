//! Bridge core: who is who, where chat goes, and the sessions that carry it.
//!
//! ## Module Structure
//!
//! - `registry`: Shared identity, room and real-user maps (`SessionRegistry`)
//! - `provisioner`: Creates bridged Matrix accounts for Twitch users
//! - `relay`: Posts chat lines into Matrix rooms
//! - `router`: Dispatches parsed chat events from a session
//! - `intake`: Appservice transaction endpoint for Matrix-side messages
//! - `directory`: Durable storage of mappings and identities
//! - `orchestrator`: Session coordinator (`Bridge` struct)

pub mod directory;
pub mod intake;
pub mod orchestrator;
pub mod provisioner;
pub mod registry;
pub mod relay;
pub mod router;

pub use intake::MatrixIntake;
pub use orchestrator::Bridge;
pub use registry::SessionRegistry;
pub use relay::RoomRelay;
