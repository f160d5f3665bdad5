//! Game orchestration: follows the games assigned to a player, keeps a local
//! copy of each game's state in step with its runner and plays the AI's
//! actions whenever it is the bot's turn.

pub mod ai;
pub mod bot;
pub mod mock;
pub mod orchestrator;
pub mod pool;
pub mod session;
pub mod tracker;

pub use ai::BotAi;
pub use bot::PlayfulBot;
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunSummary};
pub use pool::ConnectionPool;
pub use session::{GameSession, SessionConfig, SessionOutcome, SessionPhase, SessionSummary};
pub use tracker::{GameTracker, Step};
