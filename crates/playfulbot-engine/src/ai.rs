use playfulbot_core::{Action, GameState};

/// Decision strategy: a pure function of the game state and the player number
/// assigned to the bot.
pub trait BotAi<S: GameState>: Send + Sync {
    fn run(&self, state: &S, player: usize) -> Action;
}

impl<S, F> BotAi<S> for F
where
    S: GameState,
    F: Fn(&S, usize) -> Action + Send + Sync,
{
    fn run(&self, state: &S, player: usize) -> Action {
        self(state, player)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playfulbot_core::BasicGameState;
    use serde_json::json;

    #[test]
    fn closures_are_strategies() {
        let ai = |state: &BasicGameState, player: usize| {
            Action::new("move", json!({"player": player, "players": state.players.len()}))
        };
        let action = BotAi::run(&ai, &BasicGameState::default(), 1);
        assert_eq!(action.name, "move");
        assert_eq!(action.data, json!({"player": 1, "players": 0}));
    }
}
