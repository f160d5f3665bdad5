//! Local copy of one game's state, kept in step with its update stream.

use std::marker::PhantomData;

use serde::Deserialize;
use serde_json::Value;

use playfulbot_core::patch::apply_patch;
use playfulbot_core::{BotError, GameId, GameState, VersionedUpdate};

/// What the session must do after an update went through the tracker.
#[derive(Debug)]
pub enum Step<S> {
    /// Applied, and it is the bot's turn on this state.
    Play(S),
    /// Applied, another player's turn.
    Wait,
    /// Applied, the game is over.
    End,
    Canceled,
    /// Version at or behind the local copy; nothing changed.
    Stale { version: u64 },
    /// Version ahead of a valid local copy. The copy is now invalid until a
    /// fresh snapshot arrives.
    Gap { expected: u64, received: u64 },
    /// Patch arriving on an invalid copy; ignored while the snapshot is
    /// outstanding.
    Dropped { version: u64 },
}

pub struct GameTracker<S> {
    game_id: GameId,
    document: Option<Value>,
    player: usize,
    version: u64,
    stale: bool,
    _state: PhantomData<fn() -> S>,
}

impl<S: GameState> GameTracker<S> {
    pub fn new(game_id: GameId) -> Self {
        Self {
            game_id,
            document: None,
            player: 0,
            version: 0,
            stale: false,
            _state: PhantomData,
        }
    }

    pub fn apply(&mut self, update: VersionedUpdate) -> Result<Step<S>, BotError> {
        match update {
            VersionedUpdate::Canceled => Ok(Step::Canceled),
            VersionedUpdate::Snapshot {
                state,
                player,
                version,
            } => {
                self.document = Some(state);
                self.player = player;
                self.version = version;
                self.stale = false;
                self.evaluate()
            }
            VersionedUpdate::Patch {
                operations,
                version,
            } => {
                let Some(document) = self.document.as_mut() else {
                    return Err(BotError::protocol(format!(
                        "patch {version} for game {} arrived before any snapshot",
                        self.game_id
                    )));
                };
                if version <= self.version {
                    return Ok(Step::Stale { version });
                }
                if self.stale {
                    return Ok(Step::Dropped { version });
                }
                let expected = self.version + 1;
                if version > expected {
                    self.stale = true;
                    return Ok(Step::Gap {
                        expected,
                        received: version,
                    });
                }
                apply_patch(document, &operations)?;
                self.version = version;
                self.evaluate()
            }
        }
    }

    /// Typed view of the current document and whose turn it is.
    fn evaluate(&self) -> Result<Step<S>, BotError> {
        let Some(document) = self.document.as_ref() else {
            return Err(BotError::protocol("no game state materialized"));
        };
        let state = S::deserialize(document)?;
        if state.end() {
            return Ok(Step::End);
        }
        match state.is_playing(self.player) {
            Some(true) => Ok(Step::Play(state)),
            Some(false) => Ok(Step::Wait),
            None => Err(BotError::protocol(format!(
                "player {} is not part of game {}",
                self.player, self.game_id
            ))),
        }
    }

    /// `None` until the first snapshot.
    pub fn version(&self) -> Option<u64> {
        self.document.as_ref().map(|_| self.version)
    }

    pub fn player(&self) -> Option<usize> {
        self.document.as_ref().map(|_| self.player)
    }

    /// Whether the local copy is invalid and awaits a snapshot.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn document(&self) -> Option<&Value> {
        self.document.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playfulbot_core::patch::PatchOperation;
    use playfulbot_core::{BasicGameState, PatchError};
    use serde_json::json;

    fn tracker() -> GameTracker<BasicGameState> {
        GameTracker::new(GameId::from("game0"))
    }

    fn snapshot(state: Value, player: usize, version: u64) -> VersionedUpdate {
        VersionedUpdate::Snapshot {
            state,
            player,
            version,
        }
    }

    fn patch(ops: Value, version: u64) -> VersionedUpdate {
        let operations: Vec<PatchOperation> = serde_json::from_value(ops).unwrap();
        VersionedUpdate::Patch {
            operations,
            version,
        }
    }

    fn two_players(first: bool, second: bool) -> Value {
        json!({"end": false, "players": [{"playing": first}, {"playing": second}]})
    }

    #[test]
    fn snapshot_on_our_turn_plays() {
        let mut t = tracker();
        let step = t.apply(snapshot(two_players(true, false), 0, 0)).unwrap();
        assert!(matches!(step, Step::Play(ref s) if s.players[0].playing));
        assert_eq!(t.version(), Some(0));
        assert_eq!(t.player(), Some(0));
    }

    #[test]
    fn turn_follows_the_patched_state() {
        let mut t = tracker();
        let step = t.apply(snapshot(two_players(false, true), 0, 0)).unwrap();
        assert!(matches!(step, Step::Wait));

        let step = t
            .apply(patch(
                json!([
                    {"op": "replace", "path": "/players/0/playing", "value": true},
                    {"op": "replace", "path": "/players/1/playing", "value": false},
                ]),
                1,
            ))
            .unwrap();
        let Step::Play(state) = step else {
            panic!("expected our turn");
        };
        assert!(state.players[0].playing);
        assert!(!state.players[1].playing);
        assert_eq!(t.version(), Some(1));
    }

    #[test]
    fn end_wins_over_turn() {
        let mut t = tracker();
        t.apply(snapshot(two_players(true, false), 0, 0)).unwrap();
        let step = t
            .apply(patch(json!([{"op": "replace", "path": "/end", "value": true}]), 1))
            .unwrap();
        assert!(matches!(step, Step::End));
    }

    #[test]
    fn stale_patch_is_a_no_op() {
        let mut t = tracker();
        t.apply(snapshot(two_players(false, true), 0, 3)).unwrap();
        let before = t.document().cloned();

        let step = t
            .apply(patch(
                json!([{"op": "replace", "path": "/players/0/playing", "value": true}]),
                3,
            ))
            .unwrap();
        assert!(matches!(step, Step::Stale { version: 3 }));
        assert_eq!(t.document().cloned(), before);
        assert_eq!(t.version(), Some(3));
    }

    #[test]
    fn gap_invalidates_until_next_snapshot() {
        let mut t = tracker();
        t.apply(snapshot(two_players(false, true), 0, 0)).unwrap();

        let step = t.apply(patch(json!([]), 2)).unwrap();
        assert!(matches!(
            step,
            Step::Gap {
                expected: 1,
                received: 2
            }
        ));
        assert!(t.is_stale());

        // Nothing is applied on an invalid copy, and no further gap is raised.
        let step = t.apply(patch(json!([]), 1)).unwrap();
        assert!(matches!(step, Step::Dropped { version: 1 }));
        let step = t.apply(patch(json!([]), 4)).unwrap();
        assert!(matches!(step, Step::Dropped { version: 4 }));
        assert_eq!(t.version(), Some(0));
        assert!(t.is_stale());

        let step = t.apply(snapshot(two_players(true, false), 0, 5)).unwrap();
        assert!(matches!(step, Step::Play(_)));
        assert!(!t.is_stale());

        let step = t.apply(patch(json!([]), 6)).unwrap();
        assert!(matches!(step, Step::Play(_)));
        assert_eq!(t.version(), Some(6));
    }

    #[test]
    fn patch_before_snapshot_is_protocol_error() {
        let mut t = tracker();
        let err = t.apply(patch(json!([]), 1)).unwrap_err();
        assert!(matches!(err, BotError::Protocol(_)));
    }

    #[test]
    fn inapplicable_patch_fails() {
        let mut t = tracker();
        t.apply(snapshot(two_players(true, false), 0, 0)).unwrap();
        let err = t
            .apply(patch(json!([{"op": "test", "path": "/end", "value": true}]), 1))
            .unwrap_err();
        assert!(matches!(err, BotError::Patch(PatchError::TestFailed(_))));
    }

    #[test]
    fn unknown_player_is_protocol_error() {
        let mut t = tracker();
        let err = t.apply(snapshot(two_players(true, false), 2, 0)).unwrap_err();
        assert!(matches!(err, BotError::Protocol(_)));
    }

    #[test]
    fn cancellation_passes_through() {
        let mut t = tracker();
        assert!(matches!(
            t.apply(VersionedUpdate::Canceled).unwrap(),
            Step::Canceled
        ));
    }
}
