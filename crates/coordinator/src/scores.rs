//! Score persistence.

use std::io::Write;
use std::path::{Path, PathBuf};

use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MAX_PLAYERS;
use crate::{CoordinatorError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerScore {
    pub name: String,
    pub wins: u32,
    pub games_played: u32,
}

impl PlayerScore {
    pub fn unnamed(seat: usize) -> Self {
        Self {
            name: format!("Player {seat}"),
            wins: 0,
            games_played: 0,
        }
    }
}

/// Per-seat win counts across games.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBoard {
    pub total_games: u32,
    pub players: Vec<PlayerScore>,
}

impl Default for ScoreBoard {
    fn default() -> Self {
        Self {
            total_games: 0,
            players: (0..MAX_PLAYERS).map(PlayerScore::unnamed).collect(),
        }
    }
}

impl ScoreBoard {
    pub fn games_played_total(&self) -> u64 {
        self.players.iter().map(|p| u64::from(p.games_played)).sum()
    }
}

/// Where completed games are recorded.
pub trait ScoreStore: Send + Sync {
    /// The saved board, or `None` if nothing was saved yet.
    fn load(&self) -> Result<Option<ScoreBoard>>;

    fn save(&self, board: &ScoreBoard) -> Result<()>;
}

/// Keeps the board in a JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonScoreStore {
    path: PathBuf,
}

impl JsonScoreStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScoreStore for JsonScoreStore {
    fn load(&self) -> Result<Option<ScoreBoard>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Report::new(e)
                    .change_context(CoordinatorError::Persistence)
                    .attach_printable(format!("path: {}", self.path.display())))
            }
        };
        let board = serde_json::from_str(&contents)
            .change_context(CoordinatorError::Persistence)
            .attach_printable_lazy(|| format!("path: {}", self.path.display()))?;
        Ok(Some(board))
    }

    fn save(&self, board: &ScoreBoard) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(dir)
            .change_context(CoordinatorError::Persistence)
            .attach_printable_lazy(|| format!("dir: {}", dir.display()))?;
        serde_json::to_writer_pretty(&mut file, board)
            .change_context(CoordinatorError::Persistence)?;
        file.write_all(b"\n")
            .change_context(CoordinatorError::Persistence)?;
        file.persist(&self.path)
            .change_context(CoordinatorError::Persistence)
            .attach_printable_lazy(|| format!("path: {}", self.path.display()))?;
        debug!(path = %self.path.display(), total_games = board.total_games, "Saved scores");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonScoreStore::new(dir.path().join("scores.json"));
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn saved_board_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonScoreStore::new(dir.path().join("scores.json"));
        let mut board = ScoreBoard::default();
        board.total_games = 2;
        board.players[1].name = "ada".to_string();
        board.players[1].wins = 2;

        store.save(&board).unwrap();
        store.save(&board).unwrap();
        assert_eq!(store.load().unwrap(), Some(board));
    }

    #[test]
    fn corrupt_file_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scores.json");
        std::fs::write(&path, "Total Games: 3").unwrap();

        let err = JsonScoreStore::new(&path).load().unwrap_err();
        assert!(matches!(
            err.current_context(),
            CoordinatorError::Persistence
        ));
    }

    #[test]
    fn default_board_names_every_seat() {
        let board = ScoreBoard::default();
        assert_eq!(board.players.len(), MAX_PLAYERS);
        assert_eq!(board.players[4].name, "Player 4");
        assert_eq!(board.games_played_total(), 0);
    }
}
