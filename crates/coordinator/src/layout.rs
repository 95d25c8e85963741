//! Byte layout of a game region. Every attaching process must agree on it,
//! so bump [`GameLayout::VERSION`] whenever a field changes.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;
use utils::shared_memory::{LayoutHeader, SharedLayout};
use utils::sync::{ShmCondvar, ShmMutex, ShmSemaphore};

use crate::config::{CoordinatorConfig, MAX_PLAYERS};
use crate::scores::{PlayerScore, ScoreBoard};

pub const MAX_NAME_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GameStatus {
    Waiting,
    Playing,
    GameOver,
}

impl GameStatus {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Playing,
            2 => Self::GameOver,
            _ => Self::Waiting,
        }
    }

    fn raw(self) -> u32 {
        match self {
            Self::Waiting => 0,
            Self::Playing => 1,
            Self::GameOver => 2,
        }
    }
}

#[repr(C)]
pub(crate) struct Settings {
    pub max_players: AtomicU32,
    pub min_players: AtomicU32,
    pub lap_cap: AtomicU32,
    pub starting_money: AtomicI64,
}

impl Settings {
    pub fn store(&self, config: &CoordinatorConfig) {
        self.max_players
            .store(config.max_players as u32, Ordering::Relaxed);
        self.min_players
            .store(config.min_players as u32, Ordering::Relaxed);
        self.lap_cap.store(config.lap_cap, Ordering::Relaxed);
        self.starting_money
            .store(config.starting_money, Ordering::Relaxed);
    }

    pub fn load(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_players: self.max_players.load(Ordering::Relaxed) as usize,
            min_players: self.min_players.load(Ordering::Relaxed) as usize,
            lap_cap: self.lap_cap.load(Ordering::Relaxed),
            starting_money: self.starting_money.load(Ordering::Relaxed),
            proactive_tick_ms: None,
        }
    }
}

/// Turn bookkeeping. Written only under the turn lock.
#[repr(C)]
pub(crate) struct TurnState {
    pub status: AtomicU32,
    pub current: AtomicU32,
    pub round: AtomicU32,
    pub num_players: AtomicU32,
    pub active_count: AtomicU32,
    /// Winning seat plus one; zero while there is no winner.
    pub winner: AtomicU32,
    pub total_moves: AtomicU64,
}

impl TurnState {
    pub fn status(&self) -> GameStatus {
        GameStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: GameStatus) {
        self.status.store(status.raw(), Ordering::Release);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire) as usize
    }

    pub fn num_players(&self) -> usize {
        self.num_players.load(Ordering::Acquire) as usize
    }

    pub fn winner(&self) -> Option<usize> {
        match self.winner.load(Ordering::Acquire) {
            0 => None,
            seat => Some(seat as usize - 1),
        }
    }

    pub fn set_winner(&self, seat: usize) {
        self.winner.store(seat as u32 + 1, Ordering::Release);
    }
}

/// One seat at the table. Written only under the turn lock.
#[repr(C)]
pub(crate) struct PlayerSlot {
    pub connected: AtomicBool,
    pub active: AtomicBool,
    pub bankrupt: AtomicBool,
    pub turn_count: AtomicU64,
    pub money: AtomicI64,
    pub position: AtomicU32,
}

impl PlayerSlot {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_bankrupt(&self) -> bool {
        self.bankrupt.load(Ordering::Acquire)
    }

    /// Can be elected for the next turn.
    pub fn is_eligible(&self) -> bool {
        self.is_connected() && self.is_active() && !self.is_bankrupt()
    }

    pub fn money(&self) -> i64 {
        self.money.load(Ordering::Acquire)
    }

    pub fn seat(&self, starting_money: i64) {
        self.connected.store(false, Ordering::Relaxed);
        self.active.store(true, Ordering::Relaxed);
        self.bankrupt.store(false, Ordering::Relaxed);
        self.turn_count.store(0, Ordering::Relaxed);
        self.position.store(0, Ordering::Relaxed);
        self.money.store(starting_money, Ordering::Release);
    }
}

#[repr(C)]
pub(crate) struct ScoreEntry {
    wins: AtomicU32,
    games_played: AtomicU32,
    name_len: AtomicU32,
    name: UnsafeCell<[u8; MAX_NAME_LEN]>,
}

// `name` is only touched while holding the score lock.
unsafe impl Sync for ScoreEntry {}

impl ScoreEntry {
    pub fn set_name(&self, name: &str) {
        let mut end = name.len().min(MAX_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let bytes = &name.as_bytes()[..end];
        unsafe {
            (&mut *self.name.get())[..bytes.len()].copy_from_slice(bytes);
        }
        self.name_len.store(bytes.len() as u32, Ordering::Relaxed);
    }

    fn name(&self) -> Option<String> {
        let len = (self.name_len.load(Ordering::Relaxed) as usize).min(MAX_NAME_LEN);
        if len == 0 {
            return None;
        }
        let bytes = unsafe { &(&*self.name.get())[..len] };
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn record_game(&self, won: bool) {
        self.games_played.fetch_add(1, Ordering::Relaxed);
        if won {
            self.wins.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Scores for every seat. Written only under the score lock.
#[repr(C)]
pub(crate) struct ScoreTable {
    pub total_games: AtomicU32,
    pub entries: [ScoreEntry; MAX_PLAYERS],
}

impl ScoreTable {
    pub fn to_board(&self) -> ScoreBoard {
        ScoreBoard {
            total_games: self.total_games.load(Ordering::Relaxed),
            players: self
                .entries
                .iter()
                .enumerate()
                .map(|(seat, entry)| PlayerScore {
                    name: entry
                        .name()
                        .unwrap_or_else(|| PlayerScore::unnamed(seat).name),
                    wins: entry.wins.load(Ordering::Relaxed),
                    games_played: entry.games_played.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }

    pub fn load_board(&self, board: &ScoreBoard) {
        self.total_games.store(board.total_games, Ordering::Relaxed);
        for (entry, score) in self.entries.iter().zip(&board.players) {
            entry.wins.store(score.wins, Ordering::Relaxed);
            entry
                .games_played
                .store(score.games_played, Ordering::Relaxed);
            entry.set_name(&score.name);
        }
    }
}

/// The whole game region.
#[repr(C)]
pub(crate) struct GameLayout {
    header: LayoutHeader,
    pub settings: Settings,
    pub turn_lock: ShmMutex,
    /// Broadcast whenever turn state changes; waited on with `turn_lock`.
    pub turn_changed: ShmCondvar,
    pub score_lock: ShmMutex,
    pub readiness: [ShmSemaphore; MAX_PLAYERS],
    pub turn: TurnState,
    pub players: [PlayerSlot; MAX_PLAYERS],
    pub scores: ScoreTable,
}

unsafe impl SharedLayout for GameLayout {
    const VERSION: u32 = 1;

    fn header(&self) -> &LayoutHeader {
        &self.header
    }
}

impl GameLayout {
    /// In-place initialisation of a freshly created, zeroed region.
    pub fn init(&self, config: &CoordinatorConfig) -> Result<(), utils::ShmError> {
        self.settings.store(config);
        self.turn_lock.init()?;
        self.turn_changed.init()?;
        self.score_lock.init()?;
        for signal in &self.readiness {
            signal.init(0)?;
        }
        Ok(())
    }

    /// Seated players, i.e. the slots that take part in this game.
    pub fn seated(&self) -> &[PlayerSlot] {
        let seats = self.turn.num_players().min(MAX_PLAYERS);
        &self.players[..seats]
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn zeroed_turn_state_is_waiting_without_winner() {
        let turn: TurnState = unsafe { std::mem::zeroed() };
        assert_eq!(turn.status(), GameStatus::Waiting);
        assert_eq!(turn.winner(), None);
        turn.set_winner(0);
        assert_eq!(turn.winner(), Some(0));
    }

    #[test]
    fn score_names_truncate_on_char_boundary() {
        let entry: ScoreEntry = unsafe { std::mem::zeroed() };
        assert_eq!(entry.name(), None);
        entry.set_name(&"ü".repeat(20));
        let name = entry.name().unwrap();
        assert_eq!(name.len(), 32);
        assert!(name.chars().all(|c| c == 'ü'));
    }

    #[test]
    fn board_round_trips_through_table() {
        let table: ScoreTable = unsafe { std::mem::zeroed() };
        let mut board = ScoreBoard::default();
        board.total_games = 4;
        board.players[2].wins = 3;
        board.players[2].games_played = 4;
        board.players[2].name = "grace".to_string();

        table.load_board(&board);
        assert_eq!(table.to_board(), board);
    }
}
