use serde_json::Value;

use crate::errors::BotError;
use crate::messages::FollowGameResponse;
use crate::patch::{parse_patch, PatchOperation};

/// Decoded follow-stream message.
#[derive(Clone, Debug, PartialEq)]
pub enum VersionedUpdate {
    /// Full state, the player number assigned to this bot and the version
    /// patches continue from.
    Snapshot {
        state: Value,
        player: usize,
        version: u64,
    },
    Patch {
        operations: Vec<PatchOperation>,
        version: u64,
    },
    Canceled,
}

impl VersionedUpdate {
    pub fn version(&self) -> Option<u64> {
        match self {
            Self::Snapshot { version, .. } | Self::Patch { version, .. } => Some(*version),
            Self::Canceled => None,
        }
    }
}

impl TryFrom<FollowGameResponse> for VersionedUpdate {
    type Error = BotError;

    fn try_from(response: FollowGameResponse) -> Result<Self, BotError> {
        match response {
            FollowGameResponse::Game(game) if game.canceled => Ok(Self::Canceled),
            FollowGameResponse::Game(game) => {
                let state: Value = serde_json::from_str(&game.game_state).map_err(|e| {
                    BotError::protocol(format!("game {} has an unreadable state: {e}", game.id))
                })?;
                if !state.is_object() {
                    return Err(BotError::protocol(format!(
                        "game {} state is not an object",
                        game.id
                    )));
                }
                let player = usize::try_from(game.player)
                    .map_err(|_| BotError::protocol("player number out of range"))?;
                Ok(Self::Snapshot {
                    state,
                    player,
                    version: game.version,
                })
            }
            FollowGameResponse::Patch(patch) => Ok(Self::Patch {
                operations: parse_patch(&patch.patch)?,
                version: patch.version,
            }),
            FollowGameResponse::Canceled(_) => Ok(Self::Canceled),
        }
    }
}
