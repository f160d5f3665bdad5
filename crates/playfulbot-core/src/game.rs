use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{Endpoint, GameId};

/// Per-player slice of a game state the engine needs to read.
pub trait PlayerState {
    /// Whether it is this player's turn.
    fn playing(&self) -> bool;
}

/// Minimal view of a game state: whether it ended and whose turn it is.
///
/// Game-specific fields live on the implementing type and are never touched
/// by the engine.
pub trait GameState: DeserializeOwned + Send + Sync + 'static {
    type Player: PlayerState;

    fn end(&self) -> bool;
    fn players(&self) -> &[Self::Player];

    /// `None` when the state has no such player.
    fn is_playing(&self, player: usize) -> Option<bool> {
        self.players().get(player).map(PlayerState::playing)
    }
}

/// Game state with only the fields the engine interprets; everything else is
/// kept verbatim in `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicGameState {
    pub end: bool,
    pub players: Vec<BasicPlayerState>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicPlayerState {
    pub playing: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PlayerState for BasicPlayerState {
    fn playing(&self) -> bool {
        self.playing
    }
}

impl GameState for BasicGameState {
    type Player = BasicPlayerState;

    fn end(&self) -> bool {
        self.end
    }

    fn players(&self) -> &[BasicPlayerState] {
        &self.players
    }
}

/// A game assigned to the player and the runner hosting it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GameRef {
    pub id: GameId,
    pub url: Endpoint,
}

impl GameRef {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: GameId::from_raw(id),
            url: Endpoint::from_raw(url),
        }
    }
}

/// One decision of the AI for one turn. Sent verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    pub data: Value,
}

impl Action {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}
