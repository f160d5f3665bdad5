//! One game, from subscription to the closing of both of its calls.
//!
//! ```text
//! Following ──snapshot──▶ Active ◀──────────────┐
//!                           │ patch             │ snapshot
//!                           ▼                   │
//!                        Patching ──gap──▶ Resyncing
//!
//! any phase ──end / cancel / stream end / error──▶ Ending ──both calls closed──▶ Closed
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use playfulbot_core::messages::{
    FollowGameRequest, FollowGameResponse, PlayGameRequest, PlayGameResponse,
};
use playfulbot_core::transport::{
    ClientStreamingCall, DuplexCall, Metadata, ResponseFuture, ResponseStream, RunnerClient,
};
use playfulbot_core::{
    BotError, GameId, GameRef, GameState, PatchError, SessionId, Status, VersionedUpdate,
};
use playfulbot_settings::SessionSettings;

use crate::ai::BotAi;
use crate::pool::ConnectionPool;
use crate::tracker::{GameTracker, Step};

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Version gaps tolerated without an applied patch in between. Each one
    /// costs a resubscription.
    pub max_resync_requests: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            max_resync_requests: settings.max_resync_requests,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Following,
    Active,
    Patching,
    Resyncing,
    Ending,
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Following => "following",
            Self::Active => "active",
            Self::Patching => "patching",
            Self::Resyncing => "resyncing",
            Self::Ending => "ending",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a session ended without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The game state reported the end of the game.
    Finished,
    /// The runner canceled the game.
    Canceled,
    /// The runner ended the follow stream.
    FollowEnded,
    /// The runner answered the play call.
    PlayEnded,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionSummary {
    pub game_id: GameId,
    pub session_id: SessionId,
    pub outcome: SessionOutcome,
    pub turns_played: u32,
    pub updates_applied: u32,
    pub stale_discarded: u32,
    /// Patches ignored while a requested snapshot was outstanding.
    pub patches_dropped: u32,
    pub resync_requests: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Default)]
struct Counters {
    turns_played: u32,
    updates_applied: u32,
    stale_discarded: u32,
    patches_dropped: u32,
    resync_requests: u32,
    /// Resubscriptions since the last applied patch.
    pending_resyncs: u32,
}

pub struct GameSession<S: GameState> {
    game: GameRef,
    session_id: SessionId,
    ai: Arc<dyn BotAi<S>>,
    metadata: Metadata,
    config: SessionConfig,
    cancel: CancellationToken,
    failed: CancellationToken,
    phase: SessionPhase,
    tracker: GameTracker<S>,
    counters: Counters,
}

impl<S: GameState> GameSession<S> {
    pub fn new(
        game: GameRef,
        ai: Arc<dyn BotAi<S>>,
        metadata: Metadata,
        config: SessionConfig,
    ) -> Self {
        let tracker = GameTracker::new(game.id.clone());
        Self {
            game,
            session_id: SessionId::new(),
            ai,
            metadata,
            config,
            cancel: CancellationToken::new(),
            failed: CancellationToken::new(),
            phase: SessionPhase::Following,
            tracker,
            counters: Counters::default(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token cancelled as soon as this session fails, before its calls are
    /// torn down.
    pub fn with_failure_signal(mut self, failed: CancellationToken) -> Self {
        self.failed = failed;
        self
    }

    pub fn game(&self) -> &GameRef {
        &self.game
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Play the game to its end on a pooled connection, then release it.
    ///
    /// Returns once both calls are closed. The first error observed on
    /// either call, or while applying an update, fails the session.
    #[instrument(skip_all, fields(game_id = %self.game.id, endpoint = %self.game.url, session_id = %self.session_id))]
    pub async fn run(mut self, pool: Arc<ConnectionPool>) -> Result<SessionSummary, BotError> {
        let started_at = Utc::now();
        let client = match pool.acquire(&self.game.url, &self.game.id).await {
            Ok(client) => client,
            Err(e) => {
                self.signal_failure(&e);
                return Err(e);
            }
        };
        let result = self.play_on(client.as_ref()).await;
        pool.release(&self.game.url, &self.game.id).await;
        self.transition(SessionPhase::Closed);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.signal_failure(&e);
                warn!(
                    error = %e,
                    kind = e.error_kind(),
                    turns_played = self.counters.turns_played,
                    "game session failed"
                );
                return Err(e);
            }
        };

        let summary = SessionSummary {
            game_id: self.game.id.clone(),
            session_id: self.session_id.clone(),
            outcome,
            turns_played: self.counters.turns_played,
            updates_applied: self.counters.updates_applied,
            stale_discarded: self.counters.stale_discarded,
            patches_dropped: self.counters.patches_dropped,
            resync_requests: self.counters.resync_requests,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            outcome = ?summary.outcome,
            turns_played = summary.turns_played,
            updates_applied = summary.updates_applied,
            "game session closed"
        );
        Ok(summary)
    }

    async fn play_on(&mut self, client: &dyn RunnerClient) -> Result<SessionOutcome, BotError> {
        let mut follow = FollowCall::from(client.follow_game(self.metadata.clone()).await?);
        let mut play = match client.play_game(self.metadata.clone()).await {
            Ok(call) => PlayCall::from(call),
            Err(status) => {
                self.transition(SessionPhase::Ending);
                if let Err(e) = follow.close().await {
                    debug!(error = %e, "follow call failed while closing");
                }
                return Err(status.into());
            }
        };

        let driven = self.drive(&mut follow, &mut play).await;
        if let Err(e) = &driven {
            self.signal_failure(e);
        }
        self.transition(SessionPhase::Ending);

        let (follow_closed, play_closed) = tokio::join!(follow.close(), play.close());
        let outcome = driven?;
        follow_closed?;
        play_closed?;
        Ok(outcome)
    }

    async fn drive(
        &mut self,
        follow: &mut FollowCall,
        play: &mut PlayCall,
    ) -> Result<SessionOutcome, BotError> {
        follow.subscribe(&self.game.id).await?;
        debug!("subscribed to game");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("game session cancelled");
                    return Err(BotError::Cancelled);
                }

                response = play.response() => {
                    return match response {
                        Ok(_) => {
                            debug!("runner answered the play call");
                            Ok(SessionOutcome::PlayEnded)
                        }
                        Err(status) => Err(status.into()),
                    };
                }

                message = follow.next() => match message {
                    None => {
                        debug!("runner ended the follow stream");
                        return Ok(SessionOutcome::FollowEnded);
                    }
                    Some(Err(status)) => return Err(status.into()),
                    Some(Ok(response)) => {
                        if let Some(outcome) = self.handle(response, follow, play).await? {
                            return Ok(outcome);
                        }
                    }
                },
            }
        }
    }

    async fn handle(
        &mut self,
        response: FollowGameResponse,
        follow: &mut FollowCall,
        play: &mut PlayCall,
    ) -> Result<Option<SessionOutcome>, BotError> {
        let update = VersionedUpdate::try_from(response)?;
        let is_snapshot = matches!(update, VersionedUpdate::Snapshot { .. });
        let version = update.version();

        match self.tracker.apply(update)? {
            Step::Play(state) => {
                self.applied(is_snapshot, version);
                self.play_turn(&state, play).await?;
                Ok(None)
            }
            Step::Wait => {
                self.applied(is_snapshot, version);
                Ok(None)
            }
            Step::End => {
                self.applied(is_snapshot, version);
                info!("game ended");
                Ok(Some(SessionOutcome::Finished))
            }
            Step::Canceled => {
                info!("game canceled by the runner");
                Ok(Some(SessionOutcome::Canceled))
            }
            Step::Stale { version } => {
                self.counters.stale_discarded += 1;
                debug!(version, local = ?self.tracker.version(), "discarding stale patch");
                Ok(None)
            }
            Step::Gap { expected, received } => {
                self.resync(expected, received, follow).await?;
                Ok(None)
            }
            Step::Dropped { version } => {
                self.counters.patches_dropped += 1;
                debug!(version, "dropping patch while awaiting a snapshot");
                Ok(None)
            }
        }
    }

    fn applied(&mut self, is_snapshot: bool, version: Option<u64>) {
        self.counters.updates_applied += 1;
        if is_snapshot {
            self.transition(SessionPhase::Active);
        } else {
            self.counters.pending_resyncs = 0;
            self.transition(SessionPhase::Patching);
        }
        debug!(?version, "applied game update");
    }

    async fn play_turn(&mut self, state: &S, play: &mut PlayCall) -> Result<(), BotError> {
        let player = self.tracker.player().unwrap_or_default();
        let action = self.ai.run(state, player);
        let request = PlayGameRequest {
            game_id: self.game.id.clone(),
            data: serde_json::to_string(&action)?,
        };
        play.send(request).await?;
        self.counters.turns_played += 1;
        debug!(action = %action.name, turn = self.counters.turns_played, "played turn");
        Ok(())
    }

    async fn resync(
        &mut self,
        expected: u64,
        received: u64,
        follow: &mut FollowCall,
    ) -> Result<(), BotError> {
        if self.counters.pending_resyncs >= self.config.max_resync_requests {
            return Err(PatchError::VersionGap { expected, received }.into());
        }
        self.counters.pending_resyncs += 1;
        self.counters.resync_requests += 1;
        self.transition(SessionPhase::Resyncing);
        warn!(
            expected,
            received,
            attempt = self.counters.pending_resyncs,
            "version gap, requesting a fresh snapshot"
        );
        follow.subscribe(&self.game.id).await
    }

    fn signal_failure(&self, error: &BotError) {
        if !matches!(error, BotError::Cancelled) {
            self.failed.cancel();
        }
    }

    fn transition(&mut self, next: SessionPhase) {
        if self.phase != next {
            debug!(from = %self.phase, to = %next, "session phase");
            self.phase = next;
        }
    }
}

/// Client half of the follow stream.
struct FollowCall {
    requests: Option<mpsc::Sender<FollowGameRequest>>,
    responses: ResponseStream<FollowGameResponse>,
    finished: bool,
}

impl From<DuplexCall<FollowGameRequest, FollowGameResponse>> for FollowCall {
    fn from(call: DuplexCall<FollowGameRequest, FollowGameResponse>) -> Self {
        Self {
            requests: Some(call.requests),
            responses: call.responses,
            finished: false,
        }
    }
}

impl FollowCall {
    async fn subscribe(&mut self, game_id: &GameId) -> Result<(), BotError> {
        let request = FollowGameRequest {
            game_id: game_id.clone(),
        };
        match &self.requests {
            Some(requests) => requests
                .send(request)
                .await
                .map_err(|_| Status::unavailable("follow stream closed by the runner").into()),
            None => Err(BotError::Internal("follow stream already half-closed".into())),
        }
    }

    async fn next(&mut self) -> Option<Result<FollowGameResponse, Status>> {
        let message = self.responses.next().await;
        if !matches!(message, Some(Ok(_))) {
            self.finished = true;
        }
        message
    }

    /// Half-close, then wait for the runner to end the stream. Updates still
    /// in flight are discarded.
    async fn close(mut self) -> Result<(), BotError> {
        self.requests = None;
        if self.finished {
            return Ok(());
        }
        while let Some(message) = self.responses.next().await {
            message?;
        }
        Ok(())
    }
}

/// Client half of the play call.
struct PlayCall {
    requests: Option<mpsc::Sender<PlayGameRequest>>,
    response: Option<ResponseFuture<PlayGameResponse>>,
}

impl From<ClientStreamingCall<PlayGameRequest, PlayGameResponse>> for PlayCall {
    fn from(call: ClientStreamingCall<PlayGameRequest, PlayGameResponse>) -> Self {
        Self {
            requests: Some(call.requests),
            response: Some(call.response),
        }
    }
}

impl PlayCall {
    async fn send(&mut self, request: PlayGameRequest) -> Result<(), BotError> {
        match &self.requests {
            Some(requests) => requests
                .send(request)
                .await
                .map_err(|_| Status::unavailable("play stream closed by the runner").into()),
            None => Err(BotError::Internal("play stream already half-closed".into())),
        }
    }

    /// Resolves with the runner's answer; pending forever once consumed.
    async fn response(&mut self) -> Result<PlayGameResponse, Status> {
        match self.response.as_mut() {
            Some(response) => {
                let result = response.await;
                self.response = None;
                result
            }
            None => std::future::pending().await,
        }
    }

    /// Half-close, then wait for the runner's answer.
    async fn close(mut self) -> Result<(), BotError> {
        self.requests = None;
        match self.response.take() {
            Some(response) => response.await.map(|_| ()).map_err(BotError::from),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{
        canceled_snapshot, patch, snapshot, test_game_state, FollowGameCall, MockBackend,
        MockRunner, MockTransport, NoopAi, RecordingAi,
    };
    use playfulbot_core::{BasicGameState, Code};
    use serde_json::json;
    use std::time::Duration;

    const RUNNER: &str = "localhost:5001";

    fn setup(runner: MockRunner) -> (Arc<ConnectionPool>, Arc<MockRunner>) {
        let transport = MockTransport::new(MockBackend::new()).with_runner(RUNNER, runner);
        let runner = transport.runner(RUNNER).unwrap();
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(transport),
            Duration::from_secs(1),
        ));
        (pool, runner)
    }

    fn waiting_state() -> serde_json::Value {
        json!({"end": false, "players": [{"playing": false}, {"playing": true}]})
    }

    fn session(ai: Arc<dyn BotAi<BasicGameState>>) -> GameSession<BasicGameState> {
        GameSession::new(
            GameRef::new("game0", RUNNER),
            ai,
            Metadata::with_authorization("token"),
            SessionConfig::default(),
        )
    }

    #[tokio::test]
    async fn plays_snapshot_turn_and_closes_both_calls() {
        let (pool, runner) = setup(MockRunner::new());
        let summary = session(Arc::new(NoopAi)).run(Arc::clone(&pool)).await.unwrap();

        assert_eq!(summary.outcome, SessionOutcome::FollowEnded);
        assert_eq!(summary.turns_played, 1);
        assert_eq!(summary.updates_applied, 1);
        assert_eq!(runner.follow_closes(), 1);
        assert_eq!(runner.play_closes(), 1);
        assert_eq!(runner.closes(), 1);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn cancel_marker_ends_without_playing() {
        let runner = MockRunner::new().on_follow_game(|mut call: FollowGameCall| async move {
            if let Some(request) = call.requests.recv().await {
                call.responses.send(canceled_snapshot(&request.game_id));
            }
            while call.requests.recv().await.is_some() {}
        });
        let (pool, _runner) = setup(runner);
        let ai = Arc::new(RecordingAi::new());

        let summary = session(ai.clone()).run(pool).await.unwrap();
        assert_eq!(summary.outcome, SessionOutcome::Canceled);
        assert!(ai.calls().is_empty());
    }

    #[tokio::test]
    async fn end_of_game_stops_the_session() {
        let runner = MockRunner::new().on_follow_game(|mut call: FollowGameCall| async move {
            if let Some(request) = call.requests.recv().await {
                let id = request.game_id;
                call.responses.send(snapshot(&id, &test_game_state(), 0, 0));
                call.responses.send(patch(
                    &id,
                    1,
                    json!([{"op": "replace", "path": "/end", "value": true}]),
                ));
            }
            // Held open until the client half-closes.
            while call.requests.recv().await.is_some() {}
        });
        let (pool, runner) = setup(runner);

        let summary = session(Arc::new(NoopAi)).run(pool).await.unwrap();
        assert_eq!(summary.outcome, SessionOutcome::Finished);
        assert_eq!(summary.turns_played, 1);
        assert_eq!(summary.updates_applied, 2);
        assert_eq!(runner.follow_closes(), 1);
    }

    #[tokio::test]
    async fn unresolved_gap_fails_after_resync_budget() {
        let runner = MockRunner::new().on_follow_game(|mut call: FollowGameCall| async move {
            // Every snapshot is followed by a patch that skips ahead.
            while let Some(request) = call.requests.recv().await {
                let id = request.game_id;
                call.responses.send(snapshot(&id, &test_game_state(), 0, 0));
                call.responses.send(patch(&id, 5, json!([])));
            }
        });
        let (pool, runner) = setup(runner);

        let err = session(Arc::new(NoopAi)).run(pool).await.unwrap_err();
        assert!(matches!(
            err,
            BotError::Patch(PatchError::VersionGap {
                expected: 1,
                received: 5
            })
        ));
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert_eq!(runner.follow_closes(), 1);
        assert_eq!(runner.play_closes(), 1);
    }

    #[tokio::test]
    async fn applied_patch_restores_the_resync_budget() {
        let runner = MockRunner::new().on_follow_game(|mut call: FollowGameCall| async move {
            let mut subscriptions = 0;
            while let Some(request) = call.requests.recv().await {
                let id = request.game_id;
                subscriptions += 1;
                call.responses.send(snapshot(&id, &waiting_state(), 0, 0));
                if subscriptions <= 4 {
                    // In step, then a gap.
                    call.responses.send(patch(&id, 1, json!([])));
                    call.responses.send(patch(&id, 3, json!([])));
                } else {
                    call.responses.send(patch(
                        &id,
                        1,
                        json!([{"op": "replace", "path": "/end", "value": true}]),
                    ));
                }
            }
        });
        let (pool, _runner) = setup(runner);

        let summary = session(Arc::new(NoopAi)).run(pool).await.unwrap();
        assert_eq!(summary.outcome, SessionOutcome::Finished);
        assert_eq!(summary.resync_requests, 4);
        assert_eq!(summary.turns_played, 0);
    }

    #[tokio::test]
    async fn refused_play_call_closes_the_follow_call() {
        let runner = MockRunner::new()
            .on_follow_game(|mut call: FollowGameCall| async move {
                while call.requests.recv().await.is_some() {}
            })
            .with_play_error(Status::unavailable("no play for you"));
        let (pool, runner) = setup(runner);
        let failed = CancellationToken::new();

        let err = session(Arc::new(NoopAi))
            .with_failure_signal(failed.clone())
            .run(Arc::clone(&pool))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(err.message(), "no play for you");
        assert_eq!(runner.follow_closes(), 1);
        assert_eq!(runner.play_metadata().len(), 1);
        assert!(failed.is_cancelled());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn cancellation_closes_calls() {
        let runner = MockRunner::new().on_follow_game(|mut call: FollowGameCall| async move {
            while call.requests.recv().await.is_some() {}
        });
        let (pool, runner) = setup(runner);
        let cancel = CancellationToken::new();
        let failed = CancellationToken::new();
        let task = tokio::spawn(
            session(Arc::new(NoopAi))
                .with_cancellation(cancel.clone())
                .with_failure_signal(failed.clone())
                .run(pool),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, BotError::Cancelled));
        assert_eq!(runner.follow_closes(), 1);
        assert_eq!(runner.play_closes(), 1);
        assert_eq!(runner.closes(), 1);
        assert!(!failed.is_cancelled());
    }

    #[test]
    fn config_follows_settings() {
        let settings = SessionSettings {
            max_resync_requests: 7,
            ..SessionSettings::default()
        };
        assert_eq!(SessionConfig::from(&settings).max_resync_requests, 7);
        assert_eq!(SessionPhase::Resyncing.to_string(), "resyncing");
        assert_eq!(session(Arc::new(NoopAi)).phase(), SessionPhase::Following);
    }
}
