//! In-memory transport with scriptable backend and runner handlers.
//!
//! Server-to-client streams are fed through [`async_channel`], so handlers
//! push messages and the client side reads them in order. Every call records
//! the metadata it was opened with, and connection and call closures are
//! counted for assertions.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use playfulbot_core::channel::{async_channel, ChannelWriter};
use playfulbot_core::messages::{
    FollowGameRequest, FollowGameResponse, FollowPlayerGamesRequest, FollowPlayerGamesResponse,
    Game, GameCanceled, GamePatch, PlayGameRequest, PlayGameResponse,
};
use playfulbot_core::transport::{
    BackendClient, ClientStreamingCall, DuplexCall, Metadata, ResponseStream, RunnerClient,
    Transport,
};
use playfulbot_core::{Action, BasicGameState, Endpoint, GameId, GameRef, GameState, Status};

use crate::ai::BotAi;

/// Capacity of the client-to-server request channels.
const REQUEST_BUFFER: usize = 16;

type Handler<C> = Arc<dyn Fn(C) -> BoxFuture<'static, ()> + Send + Sync>;

fn handler<C, F, Fut>(f: F) -> Handler<C>
where
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |call| f(call).boxed())
}

// ── Server-side call halves ─────────────────────────────────────────────────

/// Server end of a response stream. Ends the stream when dropped.
pub struct ServerStream<T> {
    writer: Option<ChannelWriter<T, Status>>,
    closes: Arc<AtomicUsize>,
}

impl<T> ServerStream<T> {
    fn new(writer: ChannelWriter<T, Status>, closes: Arc<AtomicUsize>) -> Self {
        Self {
            writer: Some(writer),
            closes,
        }
    }

    /// Returns `false` once the client dropped the call.
    pub fn send(&self, message: T) -> bool {
        self.writer.as_ref().is_some_and(|w| w.push(message))
    }

    pub fn end(self) {}

    pub fn fail(mut self, status: Status) {
        if let Some(writer) = self.writer.take() {
            self.closes.fetch_add(1, Ordering::SeqCst);
            writer.fail(status);
        }
    }
}

impl<T> Drop for ServerStream<T> {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            self.closes.fetch_add(1, Ordering::SeqCst);
            writer.complete();
        }
    }
}

/// Server end of a single-response call. Dropping it without responding
/// resolves the client side with `CANCELLED`.
pub struct Responder<T> {
    sender: Option<oneshot::Sender<Result<T, Status>>>,
    closes: Arc<AtomicUsize>,
}

impl<T> Responder<T> {
    pub fn respond(mut self, result: Result<T, Status>) {
        if let Some(sender) = self.sender.take() {
            self.closes.fetch_add(1, Ordering::SeqCst);
            let _ = sender.send(result);
        }
    }
}

impl<T> Drop for Responder<T> {
    fn drop(&mut self) {
        if self.sender.take().is_some() {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub struct FollowPlayerGamesCall {
    pub metadata: Metadata,
    pub request: FollowPlayerGamesRequest,
    pub responses: ServerStream<FollowPlayerGamesResponse>,
}

pub struct FollowGameCall {
    pub metadata: Metadata,
    pub requests: mpsc::Receiver<FollowGameRequest>,
    pub responses: ServerStream<FollowGameResponse>,
}

pub struct PlayGameCall {
    pub metadata: Metadata,
    pub requests: mpsc::Receiver<PlayGameRequest>,
    pub response: Responder<PlayGameResponse>,
}

// ── Message builders ────────────────────────────────────────────────────────

/// One-player state where it is the bot's turn.
pub fn test_game_state() -> Value {
    json!({"end": false, "players": [{"playing": true}]})
}

pub fn snapshot(game_id: &GameId, state: &Value, player: u32, version: u64) -> FollowGameResponse {
    FollowGameResponse::Game(Game {
        id: game_id.clone(),
        game_state: state.to_string(),
        player,
        canceled: false,
        version,
    })
}

pub fn canceled_snapshot(game_id: &GameId) -> FollowGameResponse {
    FollowGameResponse::Game(Game {
        id: game_id.clone(),
        game_state: test_game_state().to_string(),
        player: 0,
        canceled: true,
        version: 0,
    })
}

pub fn patch(game_id: &GameId, version: u64, operations: Value) -> FollowGameResponse {
    FollowGameResponse::Patch(GamePatch {
        game_id: game_id.clone(),
        version,
        patch: operations.to_string(),
    })
}

pub fn canceled(game_id: &GameId, version: u64) -> FollowGameResponse {
    FollowGameResponse::Canceled(GameCanceled {
        game_id: game_id.clone(),
        version,
    })
}

// ── Backend ─────────────────────────────────────────────────────────────────

pub struct MockBackend {
    handler: Handler<FollowPlayerGamesCall>,
    connect_error: Option<Status>,
    metadata: Mutex<Vec<Metadata>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    stream_closes: Arc<AtomicUsize>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Backend announcing no games, then ending the stream.
    pub fn new() -> Self {
        Self::with_batches(vec![Vec::new()])
    }

    /// Backend sending each batch as one message, then ending the stream.
    pub fn with_batches(batches: Vec<Vec<GameRef>>) -> Self {
        let batches = Arc::new(batches);
        Self::with_handler(move |call: FollowPlayerGamesCall| {
            let batches = Arc::clone(&batches);
            async move {
                for games in batches.iter() {
                    call.responses.send(FollowPlayerGamesResponse {
                        games: games.clone(),
                    });
                }
            }
        })
    }

    pub fn with_handler<F, Fut>(f: F) -> Self
    where
        F: Fn(FollowPlayerGamesCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            handler: handler(f),
            connect_error: None,
            metadata: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            stream_closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_connect_error(mut self, status: Status) -> Self {
        self.connect_error = Some(status);
        self
    }

    /// Metadata of every follow call, in call order.
    pub fn metadata(&self) -> Vec<Metadata> {
        self.metadata.lock().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Follow streams the server side has finished.
    pub fn stream_closes(&self) -> usize {
        self.stream_closes.load(Ordering::SeqCst)
    }
}

struct MockBackendClient {
    backend: Arc<MockBackend>,
}

#[async_trait]
impl BackendClient for MockBackendClient {
    async fn follow_player_games(
        &self,
        request: FollowPlayerGamesRequest,
        metadata: Metadata,
    ) -> Result<ResponseStream<FollowPlayerGamesResponse>, Status> {
        self.backend.metadata.lock().push(metadata.clone());
        let (writer, reader) = async_channel();
        let call = FollowPlayerGamesCall {
            metadata,
            request,
            responses: ServerStream::new(writer, Arc::clone(&self.backend.stream_closes)),
        };
        tokio::spawn((self.backend.handler)(call));
        Ok(Box::pin(reader))
    }

    async fn close(&self) {
        self.backend.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Runner ──────────────────────────────────────────────────────────────────

pub struct MockRunner {
    follow_handler: Handler<FollowGameCall>,
    play_handler: Handler<PlayGameCall>,
    request_buffer: usize,
    connect_delay: Option<Duration>,
    connect_error: Option<Status>,
    play_error: Option<Status>,
    follow_metadata: Mutex<Vec<Metadata>>,
    play_metadata: Mutex<Vec<Metadata>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    follow_closes: Arc<AtomicUsize>,
    play_closes: Arc<AtomicUsize>,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    /// Runner that answers the first subscription with
    /// [`test_game_state`] and ends the follow stream, and that accepts
    /// actions until the client half-closes.
    pub fn new() -> Self {
        Self {
            follow_handler: handler(|mut call: FollowGameCall| async move {
                if let Some(request) = call.requests.recv().await {
                    call.responses
                        .send(snapshot(&request.game_id, &test_game_state(), 0, 0));
                }
            }),
            play_handler: handler(|mut call: PlayGameCall| async move {
                while call.requests.recv().await.is_some() {}
                call.response.respond(Ok(PlayGameResponse::default()));
            }),
            request_buffer: REQUEST_BUFFER,
            connect_delay: None,
            connect_error: None,
            play_error: None,
            follow_metadata: Mutex::new(Vec::new()),
            play_metadata: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            follow_closes: Arc::new(AtomicUsize::new(0)),
            play_closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn on_follow_game<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(FollowGameCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.follow_handler = handler(f);
        self
    }

    pub fn on_play_game<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PlayGameCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.play_handler = handler(f);
        self
    }

    pub fn with_request_buffer(mut self, capacity: usize) -> Self {
        self.request_buffer = capacity.max(1);
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn with_connect_error(mut self, status: Status) -> Self {
        self.connect_error = Some(status);
        self
    }

    /// Refuse every play call before a handler runs.
    pub fn with_play_error(mut self, status: Status) -> Self {
        self.play_error = Some(status);
        self
    }

    pub fn follow_metadata(&self) -> Vec<Metadata> {
        self.follow_metadata.lock().clone()
    }

    pub fn play_metadata(&self) -> Vec<Metadata> {
        self.play_metadata.lock().clone()
    }

    /// Successful connections.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Follow calls the server side has finished.
    pub fn follow_closes(&self) -> usize {
        self.follow_closes.load(Ordering::SeqCst)
    }

    /// Play calls the server side has finished.
    pub fn play_closes(&self) -> usize {
        self.play_closes.load(Ordering::SeqCst)
    }

    async fn connect(self: &Arc<Self>) -> Result<Arc<dyn RunnerClient>, Status> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = &self.connect_error {
            return Err(status.clone());
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockRunnerClient {
            runner: Arc::clone(self),
        }))
    }
}

struct MockRunnerClient {
    runner: Arc<MockRunner>,
}

#[async_trait]
impl RunnerClient for MockRunnerClient {
    async fn follow_game(
        &self,
        metadata: Metadata,
    ) -> Result<DuplexCall<FollowGameRequest, FollowGameResponse>, Status> {
        let runner = &self.runner;
        runner.follow_metadata.lock().push(metadata.clone());
        let (requests, incoming) = mpsc::channel(runner.request_buffer);
        let (writer, reader) = async_channel();
        let call = FollowGameCall {
            metadata,
            requests: incoming,
            responses: ServerStream::new(writer, Arc::clone(&runner.follow_closes)),
        };
        tokio::spawn((runner.follow_handler)(call));
        Ok(DuplexCall {
            requests,
            responses: Box::pin(reader),
        })
    }

    async fn play_game(
        &self,
        metadata: Metadata,
    ) -> Result<ClientStreamingCall<PlayGameRequest, PlayGameResponse>, Status> {
        let runner = &self.runner;
        runner.play_metadata.lock().push(metadata.clone());
        if let Some(status) = &runner.play_error {
            return Err(status.clone());
        }
        let (requests, incoming) = mpsc::channel(runner.request_buffer);
        let (sender, receiver) = oneshot::channel();
        let call = PlayGameCall {
            metadata,
            requests: incoming,
            response: Responder {
                sender: Some(sender),
                closes: Arc::clone(&runner.play_closes),
            },
        };
        tokio::spawn((runner.play_handler)(call));
        let response = async move {
            receiver
                .await
                .unwrap_or_else(|_| Err(Status::cancelled("play call ended without a response")))
        }
        .boxed();
        Ok(ClientStreamingCall { requests, response })
    }

    async fn close(&self) {
        self.runner.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Transport ───────────────────────────────────────────────────────────────

pub struct MockTransport {
    backend: Arc<MockBackend>,
    runners: DashMap<Endpoint, Arc<MockRunner>>,
}

impl MockTransport {
    pub fn new(backend: MockBackend) -> Self {
        Self {
            backend: Arc::new(backend),
            runners: DashMap::new(),
        }
    }

    pub fn with_runner(self, endpoint: impl Into<String>, runner: MockRunner) -> Self {
        self.runners
            .insert(Endpoint::from_raw(endpoint), Arc::new(runner));
        self
    }

    pub fn backend(&self) -> &Arc<MockBackend> {
        &self.backend
    }

    pub fn runner(&self, endpoint: &str) -> Option<Arc<MockRunner>> {
        self.runners
            .get(&Endpoint::from(endpoint))
            .map(|r| Arc::clone(r.value()))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect_backend(
        &self,
        _endpoint: &Endpoint,
    ) -> Result<Arc<dyn BackendClient>, Status> {
        if let Some(status) = &self.backend.connect_error {
            return Err(status.clone());
        }
        self.backend.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockBackendClient {
            backend: Arc::clone(&self.backend),
        }))
    }

    async fn connect_runner(&self, endpoint: &Endpoint) -> Result<Arc<dyn RunnerClient>, Status> {
        let runner = self
            .runners
            .get(endpoint)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| Status::unavailable(format!("no runner listening on {endpoint}")))?;
        runner.connect().await
    }
}

// ── AIs ─────────────────────────────────────────────────────────────────────

/// Always plays the same placeholder action.
pub struct NoopAi;

impl NoopAi {
    pub fn action() -> Action {
        Action::new("noop", json!({"noop": "testValue"}))
    }
}

impl<S: GameState> BotAi<S> for NoopAi {
    fn run(&self, _state: &S, _player: usize) -> Action {
        Self::action()
    }
}

/// Plays [`NoopAi::action`] and remembers every state it was asked about.
#[derive(Default)]
pub struct RecordingAi {
    calls: Mutex<Vec<(BasicGameState, usize)>>,
}

impl RecordingAi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(BasicGameState, usize)> {
        self.calls.lock().clone()
    }
}

impl BotAi<BasicGameState> for RecordingAi {
    fn run(&self, state: &BasicGameState, player: usize) -> Action {
        self.calls.lock().push((state.clone(), player));
        NoopAi::action()
    }
}
