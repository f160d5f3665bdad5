//! Follows the player's game list and runs one session per announced game.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use playfulbot_core::messages::FollowPlayerGamesRequest;
use playfulbot_core::transport::{BackendClient, Metadata, Transport};
use playfulbot_core::{BotError, Endpoint, GameId, GameRef, GameState};
use playfulbot_settings::BotSettings;

use crate::ai::BotAi;
use crate::pool::ConnectionPool;
use crate::session::{GameSession, SessionConfig, SessionSummary};

type SessionResult = (GameId, Result<SessionSummary, BotError>);

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub backend_endpoint: Endpoint,
    /// Deadline for backend and runner connections to become ready.
    pub connect_timeout: Duration,
    pub session: SessionConfig,
}

impl From<&BotSettings> for OrchestratorConfig {
    fn from(settings: &BotSettings) -> Self {
        Self {
            backend_endpoint: Endpoint::from_raw(settings.backend.endpoint.clone()),
            connect_timeout: settings.connection.connect_timeout(),
            session: SessionConfig::from(&settings.session),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&BotSettings::default())
    }
}

/// What a completed run did.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunSummary {
    pub games_announced: usize,
    pub duplicates_skipped: usize,
    /// Finished sessions, in completion order.
    pub sessions: Vec<SessionSummary>,
}

pub struct Orchestrator<S: GameState> {
    transport: Arc<dyn Transport>,
    pool: Arc<ConnectionPool>,
    ai: Arc<dyn BotAi<S>>,
    token: SecretString,
    config: OrchestratorConfig,
    cancel: CancellationToken,
}

impl<S: GameState> Orchestrator<S> {
    pub fn new(
        transport: Arc<dyn Transport>,
        ai: Arc<dyn BotAi<S>>,
        token: SecretString,
        config: OrchestratorConfig,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&transport),
            config.connect_timeout,
        ));
        Self {
            transport,
            pool,
            ai,
            token,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the run from outside. Sessions close their calls and the run
    /// fails with [`BotError::Cancelled`].
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Play every game the backend announces until the backend ends its
    /// stream and every session has closed.
    ///
    /// The first failure of the backend stream or of any session fails the
    /// run at once; sessions still in flight keep running to their natural
    /// end but their results are not observed.
    #[instrument(skip_all, fields(backend = %self.config.backend_endpoint))]
    pub async fn run(&self) -> Result<RunSummary, BotError> {
        let backend = self.connect_backend().await?;
        let result = self.follow_games(backend.as_ref()).await;
        backend.close().await;
        match &result {
            Ok(summary) => info!(sessions = summary.sessions.len(), "run finished"),
            Err(e) => error!(error = %e, kind = e.error_kind(), "run failed"),
        }
        result
    }

    async fn connect_backend(&self) -> Result<Arc<dyn BackendClient>, BotError> {
        let endpoint = &self.config.backend_endpoint;
        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, self.transport.connect_backend(endpoint)).await {
            Ok(Ok(client)) => {
                info!(%endpoint, "connected to backend");
                Ok(client)
            }
            Ok(Err(status)) => Err(BotError::Connection {
                endpoint: endpoint.clone(),
                status,
            }),
            Err(_) => Err(BotError::ConnectTimeout {
                endpoint: endpoint.clone(),
                timeout,
            }),
        }
    }

    async fn follow_games(&self, backend: &dyn BackendClient) -> Result<RunSummary, BotError> {
        let metadata = Metadata::with_authorization(self.token.expose_secret());
        let mut games = backend
            .follow_player_games(FollowPlayerGamesRequest::default(), metadata.clone())
            .await?;

        let mut sessions: JoinSet<SessionResult> = JoinSet::new();
        let mut active: HashSet<GameId> = HashSet::new();
        let mut summary = RunSummary::default();
        let failed = CancellationToken::new();

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!(in_flight = sessions.len(), "run cancelled, closing sessions");
                    while sessions.join_next().await.is_some() {}
                    return Err(BotError::Cancelled);
                }

                _ = failed.cancelled() => {
                    debug!("a game session failed, no further games are started");
                    return Err(Self::first_failure(&mut sessions, &mut active, &mut summary).await);
                }

                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = Self::collect(joined, &mut active, &mut summary) {
                        sessions.detach_all();
                        return Err(e);
                    }
                }

                message = games.next() => match message {
                    Some(Ok(batch)) => {
                        info!(count = batch.games.len(), "receiving new game(s)");
                        for game in batch.games {
                            self.start(game, &metadata, &failed, &mut sessions, &mut active, &mut summary);
                        }
                    }
                    Some(Err(status)) => {
                        sessions.detach_all();
                        return Err(BotError::Stream(status));
                    }
                    None => {
                        debug!(in_flight = sessions.len(), "backend ended the game stream");
                        break;
                    }
                },
            }
        }

        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = Self::collect(joined, &mut active, &mut summary) {
                sessions.detach_all();
                return Err(e);
            }
        }
        Ok(summary)
    }

    fn start(
        &self,
        game: GameRef,
        metadata: &Metadata,
        failed: &CancellationToken,
        sessions: &mut JoinSet<SessionResult>,
        active: &mut HashSet<GameId>,
        summary: &mut RunSummary,
    ) {
        summary.games_announced += 1;
        if !active.insert(game.id.clone()) {
            warn!(game_id = %game.id, "game already has a live session, skipping");
            summary.duplicates_skipped += 1;
            return;
        }

        let session = GameSession::new(
            game,
            Arc::clone(&self.ai),
            metadata.clone(),
            self.config.session.clone(),
        )
        .with_cancellation(self.cancel.child_token())
        .with_failure_signal(failed.clone());
        let game_id = session.game().id.clone();
        let pool = Arc::clone(&self.pool);
        sessions.spawn(async move { (game_id, session.run(pool).await) });
    }

    /// Join sessions until the failed one reports, then stop observing the rest.
    async fn first_failure(
        sessions: &mut JoinSet<SessionResult>,
        active: &mut HashSet<GameId>,
        summary: &mut RunSummary,
    ) -> BotError {
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = Self::collect(joined, active, summary) {
                sessions.detach_all();
                return e;
            }
        }
        BotError::Internal("a game session signalled failure but none failed".into())
    }

    fn collect(
        joined: Result<SessionResult, JoinError>,
        active: &mut HashSet<GameId>,
        summary: &mut RunSummary,
    ) -> Result<(), BotError> {
        let (game_id, result) =
            joined.map_err(|e| BotError::Internal(format!("game session task failed: {e}")))?;
        active.remove(&game_id);
        summary.sessions.push(result?);
        Ok(())
    }
}
