//! Round-robin turn coordination between player processes.
//!
//! The game lives in a named shared memory region: turn state, player seats,
//! one readiness signal per seat and the score table, guarded by a turn lock
//! and a separate score lock. Each process attaches a [`TurnCoordinator`]
//! to the region and drives the game through it.

use error_stack::Report;

mod config;
mod coordinator;
mod error;
mod layout;
mod scores;
mod ticker;

/// Result type using error-stack for context-rich error reporting
pub type Result<T, C = CoordinatorError> = core::result::Result<T, Report<C>>;

pub use config::{CoordinatorConfig, MAX_PLAYERS, MIN_PLAYERS};
pub use coordinator::{
    GameSnapshot, PlayerMove, PlayerView, TurnCoordinator, TurnOutcome, TurnWait,
};
pub use error::CoordinatorError;
pub use layout::GameStatus;
pub use scores::{JsonScoreStore, PlayerScore, ScoreBoard, ScoreStore};
pub use ticker::{ProactiveTicker, IDLE_INTERVAL};
