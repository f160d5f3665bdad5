//! Shared vocabulary of playfulbot: game and wire types, the error taxonomy,
//! strict JSON Patch application, the ordered async channel and the transport
//! contract the engine drives.

pub mod channel;
pub mod errors;
pub mod game;
pub mod ids;
pub mod messages;
pub mod patch;
pub mod status;
pub mod transport;
pub mod update;

pub use errors::{BotError, PatchError};
pub use game::{Action, BasicGameState, BasicPlayerState, GameRef, GameState, PlayerState};
pub use ids::{Endpoint, GameId, SessionId};
pub use status::{Code, Status};
pub use update::VersionedUpdate;
