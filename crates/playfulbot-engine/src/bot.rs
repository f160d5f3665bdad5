use std::sync::Arc;

use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use playfulbot_core::transport::Transport;
use playfulbot_core::{BotError, GameState};
use playfulbot_settings::BotSettings;

use crate::ai::BotAi;
use crate::orchestrator::{Orchestrator, OrchestratorConfig, RunSummary};

/// Entry point: a token, an AI and a transport, configured from settings.
pub struct PlayfulBot<S: GameState> {
    orchestrator: Orchestrator<S>,
}

impl<S: GameState> PlayfulBot<S> {
    pub fn new(
        token: impl Into<String>,
        ai: impl BotAi<S> + 'static,
        transport: Arc<dyn Transport>,
        settings: &BotSettings,
    ) -> Self {
        let token = SecretString::from(token.into());
        Self {
            orchestrator: Orchestrator::new(
                transport,
                Arc::new(ai),
                token,
                OrchestratorConfig::from(settings),
            ),
        }
    }

    pub fn with_cancellation(self, cancel: CancellationToken) -> Self {
        Self {
            orchestrator: self.orchestrator.with_cancellation(cancel),
        }
    }

    /// Play until the backend stops announcing games and every game is over.
    pub async fn run(&self) -> Result<RunSummary, BotError> {
        self.orchestrator.run().await
    }
}
