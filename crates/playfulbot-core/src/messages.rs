//! Wire messages of the backend and runner services.
//!
//! Game states and patches travel as serialized JSON strings inside these
//! messages; they are only decoded by [`crate::update::VersionedUpdate`].

use serde::{Deserialize, Serialize};

use crate::game::GameRef;
use crate::ids::GameId;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowPlayerGamesRequest {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowPlayerGamesResponse {
    pub games: Vec<GameRef>,
}

/// Written by the client on a follow stream to (re)subscribe to a game.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowGameRequest {
    pub game_id: GameId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FollowGameResponse {
    Game(Game),
    Patch(GamePatch),
    Canceled(GameCanceled),
}

/// Full game snapshot plus the player number assigned to this bot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    pub id: GameId,
    pub game_state: String,
    pub player: u32,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default)]
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GamePatch {
    pub game_id: GameId,
    pub version: u64,
    pub patch: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameCanceled {
    pub game_id: GameId,
    #[serde(default)]
    pub version: u64,
}

/// One serialized [`crate::game::Action`] for one game.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayGameRequest {
    pub game_id: GameId,
    pub data: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayGameResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn follow_game_response_is_tagged_by_field() {
        let resp: FollowGameResponse = serde_json::from_value(json!({
            "patch": {"gameId": "game0", "version": 1, "patch": "[]"}
        }))
        .unwrap();
        assert!(matches!(resp, FollowGameResponse::Patch(ref p) if p.version == 1));

        let resp: FollowGameResponse =
            serde_json::from_value(json!({"canceled": {"gameId": "game0", "version": 2}})).unwrap();
        assert!(matches!(resp, FollowGameResponse::Canceled(_)));
    }

    #[test]
    fn snapshot_defaults_missing_flags() {
        let resp: FollowGameResponse = serde_json::from_value(json!({
            "game": {"id": "game0", "gameState": "{}", "player": 1}
        }))
        .unwrap();
        let FollowGameResponse::Game(game) = resp else {
            panic!("expected snapshot");
        };
        assert!(!game.canceled);
        assert_eq!(game.version, 0);
        assert_eq!(game.player, 1);
    }

    #[test]
    fn play_request_uses_camel_case() {
        let req = PlayGameRequest {
            game_id: GameId::from("game0"),
            data: "{}".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, json!({"gameId": "game0", "data": "{}"}));
    }
}
