//! Reference-counted runner connections keyed by endpoint.
//!
//! Each endpoint has at most one live connection. The first acquisition
//! starts the attempt; concurrent acquisitions await the same attempt. The
//! connection is closed when the last owning game releases it, and a later
//! acquisition dials again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use playfulbot_core::transport::{RunnerClient, Transport};
use playfulbot_core::{BotError, Endpoint, GameId};

type Connecting = Shared<BoxFuture<'static, Result<Arc<dyn RunnerClient>, BotError>>>;

struct PoolEntry {
    attempt: u64,
    connection: Connecting,
    owners: HashSet<GameId>,
}

pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    connect_timeout: Duration,
    entries: Mutex<HashMap<Endpoint, PoolEntry>>,
    attempts: AtomicU64,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn Transport>, connect_timeout: Duration) -> Self {
        Self {
            transport,
            connect_timeout,
            entries: Mutex::new(HashMap::new()),
            attempts: AtomicU64::new(0),
        }
    }

    /// Get the connection to `endpoint` on behalf of `game_id`, dialing if
    /// none exists. A failed attempt is forgotten so the next acquisition
    /// dials again.
    pub async fn acquire(
        &self,
        endpoint: &Endpoint,
        game_id: &GameId,
    ) -> Result<Arc<dyn RunnerClient>, BotError> {
        let (attempt, connection) = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(endpoint.clone())
                .or_insert_with(|| self.dial(endpoint));
            entry.owners.insert(game_id.clone());
            (entry.attempt, entry.connection.clone())
        };

        match connection.await {
            Ok(client) => Ok(client),
            Err(e) => {
                self.forget(endpoint, attempt);
                Err(e)
            }
        }
    }

    /// Drop `game_id`'s claim on `endpoint`, closing the connection when no
    /// other game holds it. Unknown pairs are ignored.
    pub async fn release(&self, endpoint: &Endpoint, game_id: &GameId) {
        let evicted = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(endpoint) else {
                return;
            };
            if !entry.owners.remove(game_id) {
                debug!(%endpoint, %game_id, "release by a game that holds no claim");
            }
            if !entry.owners.is_empty() {
                return;
            }
            entries.remove(endpoint)
        };

        let client = evicted.and_then(|entry| match entry.connection.peek() {
            Some(Ok(client)) => Some(Arc::clone(client)),
            _ => None,
        });
        if let Some(client) = client {
            client.close().await;
            info!(%endpoint, "closed runner connection");
        }
    }

    /// Number of endpoints with a live or pending connection.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.entries.lock().contains_key(endpoint)
    }

    /// Games currently holding `endpoint`, sorted.
    pub fn owners(&self, endpoint: &Endpoint) -> Vec<GameId> {
        let mut owners: Vec<GameId> = self
            .entries
            .lock()
            .get(endpoint)
            .map(|entry| entry.owners.iter().cloned().collect())
            .unwrap_or_default();
        owners.sort();
        owners
    }

    fn dial(&self, endpoint: &Endpoint) -> PoolEntry {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
        let transport = Arc::clone(&self.transport);
        let endpoint = endpoint.clone();
        let timeout = self.connect_timeout;

        let connection = async move {
            debug!(%endpoint, attempt, "connecting to runner");
            match tokio::time::timeout(timeout, transport.connect_runner(&endpoint)).await {
                Ok(Ok(client)) => {
                    info!(%endpoint, "connected to runner");
                    Ok(client)
                }
                Ok(Err(status)) => {
                    warn!(%endpoint, %status, "runner connection failed");
                    Err(BotError::Connection { endpoint, status })
                }
                Err(_) => {
                    warn!(%endpoint, ?timeout, "runner connection timed out");
                    Err(BotError::ConnectTimeout { endpoint, timeout })
                }
            }
        }
        .boxed()
        .shared();

        PoolEntry {
            attempt,
            connection,
            owners: HashSet::new(),
        }
    }

    fn forget(&self, endpoint: &Endpoint, attempt: u64) {
        let mut entries = self.entries.lock();
        if entries.get(endpoint).is_some_and(|e| e.attempt == attempt) {
            entries.remove(endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockRunner, MockTransport};
    use playfulbot_core::{Code, Status};

    const RUNNER: &str = "localhost:5001";

    fn pool_with(runner: MockRunner) -> (ConnectionPool, Arc<MockRunner>) {
        let transport = MockTransport::new(MockBackend::new()).with_runner(RUNNER, runner);
        let runner = transport.runner(RUNNER).unwrap();
        let pool = ConnectionPool::new(Arc::new(transport), Duration::from_millis(200));
        (pool, runner)
    }

    #[tokio::test]
    async fn shares_one_connection_per_endpoint() {
        let (pool, runner) = pool_with(MockRunner::new());
        let endpoint = Endpoint::from(RUNNER);

        let a = pool.acquire(&endpoint, &GameId::from("game1")).await.unwrap();
        let b = pool.acquire(&endpoint, &GameId::from("game2")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(runner.connects(), 1);
        assert_eq!(
            pool.owners(&endpoint),
            vec![GameId::from("game1"), GameId::from("game2")]
        );

        pool.release(&endpoint, &GameId::from("game1")).await;
        assert_eq!(runner.closes(), 0);
        assert!(pool.contains(&endpoint));

        pool.release(&endpoint, &GameId::from("game2")).await;
        assert_eq!(runner.closes(), 1);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn concurrent_acquisitions_converge() {
        let (pool, runner) =
            pool_with(MockRunner::new().with_connect_delay(Duration::from_millis(30)));
        let endpoint = Endpoint::from(RUNNER);
        let (g1, g2, g3) = (GameId::from("g1"), GameId::from("g2"), GameId::from("g3"));

        let (a, b, c) = tokio::join!(
            pool.acquire(&endpoint, &g1),
            pool.acquire(&endpoint, &g2),
            pool.acquire(&endpoint, &g3),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(runner.connects(), 1);
        assert_eq!(pool.owners(&endpoint).len(), 3);
    }

    #[tokio::test]
    async fn reconnects_after_full_release() {
        let (pool, runner) = pool_with(MockRunner::new());
        let endpoint = Endpoint::from(RUNNER);
        let game = GameId::from("game1");

        pool.acquire(&endpoint, &game).await.unwrap();
        pool.release(&endpoint, &game).await;
        pool.acquire(&endpoint, &game).await.unwrap();

        assert_eq!(runner.connects(), 2);
        assert_eq!(runner.closes(), 1);
    }

    #[tokio::test]
    async fn failed_attempt_is_not_retained() {
        let (pool, runner) =
            pool_with(MockRunner::new().with_connect_error(Status::unavailable("refused")));
        let endpoint = Endpoint::from(RUNNER);

        let err = pool
            .acquire(&endpoint, &GameId::from("game1"))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BotError::Connection { ref status, .. } if status.code() == Code::Unavailable
        ));
        assert!(pool.is_empty());
        assert_eq!(runner.connects(), 0);
    }

    #[tokio::test]
    async fn connect_timeout_is_reported() {
        let (pool, _runner) =
            pool_with(MockRunner::new().with_connect_delay(Duration::from_secs(5)));
        let endpoint = Endpoint::from(RUNNER);

        let err = pool
            .acquire(&endpoint, &GameId::from("game1"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BotError::ConnectTimeout { .. }));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn unknown_release_is_ignored() {
        let (pool, runner) = pool_with(MockRunner::new());
        pool.release(&Endpoint::from(RUNNER), &GameId::from("nobody"))
            .await;
        assert_eq!(runner.closes(), 0);
    }
}
