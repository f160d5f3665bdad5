//! Client side of the backend and runner RPC services.
//!
//! The wire encoding is left to implementors. A call's request side is a
//! bounded `mpsc::Sender` (dropping it half-closes the call); its response
//! side is a stream or a single future of `Result<_, Status>`.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::Stream;
use tokio::sync::mpsc;

use crate::ids::Endpoint;
use crate::messages::{
    FollowGameRequest, FollowGameResponse, FollowPlayerGamesRequest, FollowPlayerGamesResponse,
    PlayGameRequest, PlayGameResponse,
};
use crate::status::Status;

pub const AUTHORIZATION: &str = "authorization";

pub type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;
pub type ResponseFuture<T> = BoxFuture<'static, Result<T, Status>>;

/// Per-call metadata (headers).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata carrying `authorization: <token>`, token forwarded verbatim.
    pub fn with_authorization(token: &str) -> Self {
        let mut metadata = Self::new();
        metadata.insert(AUTHORIZATION, token);
        metadata
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn authorization(&self) -> Option<&str> {
        self.get(AUTHORIZATION)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Bidirectional-streaming call.
pub struct DuplexCall<Req, Resp> {
    pub requests: mpsc::Sender<Req>,
    pub responses: ResponseStream<Resp>,
}

/// Client-streaming call resolved by a single server response.
pub struct ClientStreamingCall<Req, Resp> {
    pub requests: mpsc::Sender<Req>,
    pub response: ResponseFuture<Resp>,
}

/// Directory service listing the games assigned to a player.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn follow_player_games(
        &self,
        request: FollowPlayerGamesRequest,
        metadata: Metadata,
    ) -> Result<ResponseStream<FollowPlayerGamesResponse>, Status>;

    async fn close(&self) {}
}

/// Worker service hosting live games.
#[async_trait]
pub trait RunnerClient: Send + Sync {
    async fn follow_game(
        &self,
        metadata: Metadata,
    ) -> Result<DuplexCall<FollowGameRequest, FollowGameResponse>, Status>;

    async fn play_game(
        &self,
        metadata: Metadata,
    ) -> Result<ClientStreamingCall<PlayGameRequest, PlayGameResponse>, Status>;

    /// Tear down the underlying connection.
    async fn close(&self);
}

/// Establishes clients. Each method resolves once the connection is ready.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect_backend(&self, endpoint: &Endpoint)
        -> Result<Arc<dyn BackendClient>, Status>;

    async fn connect_runner(&self, endpoint: &Endpoint) -> Result<Arc<dyn RunnerClient>, Status>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_is_forwarded_verbatim() {
        let metadata = Metadata::with_authorization("Bearer mytoken");
        assert_eq!(metadata.authorization(), Some("Bearer mytoken"));
    }

    #[test]
    fn keys_are_case_insensitive() {
        let mut metadata = Metadata::new();
        metadata.insert("X-Trace", "abc");
        assert_eq!(metadata.get("x-trace"), Some("abc"));
        assert_eq!(metadata.iter().collect::<Vec<_>>(), vec![("x-trace", "abc")]);
    }
}
