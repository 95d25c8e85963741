use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use error_stack::{Report, ResultExt};
use game_log::LogProducer;
use serde::Serialize;
use tracing::{debug, info, warn};
use utils::shared_memory::SharedMemoryHandle;
use utils::sync::{ShmMutexGuard, ShmSemaphore, TryWait};

use crate::config::{CoordinatorConfig, MAX_PLAYERS};
use crate::error::{region_report, sync_report};
use crate::layout::{GameLayout, GameStatus, PlayerSlot};
use crate::scores::{ScoreBoard, ScoreStore};
use crate::{CoordinatorError, Result};

/// The fields of a seat that a move may rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerMove {
    pub player_id: usize,
    pub money: i64,
    pub position: u32,
}

/// What happened after a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The turn passed to this player.
    Next(usize),
    /// The game ended with this winner.
    GameOver { winner: usize },
}

/// Why [`TurnCoordinator::wait_for_turn`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnWait {
    MyTurn,
    GameOver,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerView {
    pub id: usize,
    pub connected: bool,
    pub active: bool,
    pub bankrupt: bool,
    pub turn_count: u64,
    pub money: i64,
    pub position: u32,
}

/// A consistent view of the whole turn state, taken under the turn lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameSnapshot {
    pub status: GameStatus,
    pub current_player: usize,
    pub round: u32,
    pub total_moves: u64,
    pub num_players: usize,
    pub active_player_count: usize,
    pub winner: Option<usize>,
    pub players: Vec<PlayerView>,
}

/// Round-robin turn coordination over a named game region.
///
/// Every process attaches its own `TurnCoordinator` to the same region;
/// all mutation happens under the region's turn lock.
pub struct TurnCoordinator {
    handle: SharedMemoryHandle<GameLayout>,
    game_log: Option<LogProducer>,
    scores: Option<Arc<dyn ScoreStore>>,
}

impl TurnCoordinator {
    /// Creates the game region and initialises it for `config`.
    pub fn create(name: &str, config: &CoordinatorConfig) -> Result<Self> {
        Self::create_with_scores(name, config, None)
    }

    /// Like [`TurnCoordinator::create`], seeding the score table from a saved
    /// board. The board is written before any other process can attach, so
    /// it never overwrites a seat that has already joined. A region that was
    /// already initialised keeps its own scores.
    pub fn create_with_scores(
        name: &str,
        config: &CoordinatorConfig,
        saved: Option<&ScoreBoard>,
    ) -> Result<Self> {
        config.validate()?;
        let mut seeded = false;
        let handle = SharedMemoryHandle::<GameLayout>::create(name, |layout| {
            layout.init(config)?;
            if let Some(board) = saved {
                layout.scores.load_board(board);
                seeded = true;
            }
            Ok(())
        })
        .map_err(region_report)
        .attach_printable_lazy(|| format!("region: {name}"))?;
        let coordinator = Self::from_handle(handle);

        match saved {
            Some(board) if seeded => {
                info!(region = %name, total_games = board.total_games, "Loaded scores");
            }
            Some(_) => {
                warn!(region = %name, "Game region already existed, saved scores not applied");
            }
            None => {}
        }

        let shared = coordinator.config();
        if shared.max_players != config.max_players || shared.min_players != config.min_players {
            warn!(region = %name, "Reusing game region created with different rules");
        }
        info!(region = %name, max_players = shared.max_players, "Game region ready");
        Ok(coordinator)
    }

    /// Attaches to a game region created by another process.
    pub fn attach(name: &str) -> Result<Self> {
        let handle = SharedMemoryHandle::<GameLayout>::open(name)
            .map_err(region_report)
            .attach_printable_lazy(|| format!("region: {name}"))?;
        Ok(Self::from_handle(handle))
    }

    fn from_handle(handle: SharedMemoryHandle<GameLayout>) -> Self {
        Self {
            handle,
            game_log: None,
            scores: None,
        }
    }

    /// Mirrors game events into the shared game log.
    pub fn with_game_log(mut self, producer: LogProducer) -> Self {
        self.game_log = Some(producer);
        self
    }

    /// Saves the score board here whenever a game this process ends completes.
    pub fn with_score_store(mut self, store: Arc<dyn ScoreStore>) -> Self {
        self.scores = Some(store);
        self
    }

    pub fn name(&self) -> &str {
        self.handle.get_identifier()
    }

    /// The rules the region was created with.
    pub fn config(&self) -> CoordinatorConfig {
        self.layout().settings.load()
    }

    /// Unmaps the region and removes its name. Other attached processes
    /// keep their mapping.
    pub fn destroy(self) -> Result<()> {
        self.handle.destroy().map_err(region_report)
    }

    fn layout(&self) -> &GameLayout {
        self.handle.get_state()
    }

    fn lock(&self) -> Result<ShmMutexGuard<'_>> {
        self.layout().turn_lock.lock().map_err(sync_report)
    }

    fn game_log(&self, args: std::fmt::Arguments<'_>) {
        if let Some(producer) = &self.game_log {
            producer.log_fmt(args);
        }
    }

    fn seat<'a>(&self, layout: &'a GameLayout, id: usize) -> Result<&'a PlayerSlot> {
        let seated = layout.turn.num_players();
        if id >= seated {
            return Err(Report::new(CoordinatorError::invalid_argument(format!(
                "player {id} is not seated ({seated} seats taken)"
            ))));
        }
        Ok(&layout.players[id])
    }

    /// Takes the next free seat and connects it.
    pub fn join(&self, name: &str) -> Result<usize> {
        let layout = self.layout();
        let id = {
            let _guard = self.lock()?;
            match layout.turn.status() {
                GameStatus::GameOver => return Err(Report::new(CoordinatorError::GameOver)),
                GameStatus::Waiting | GameStatus::Playing => {}
            }
            let capacity =
                (layout.settings.max_players.load(Ordering::Relaxed) as usize).min(MAX_PLAYERS);
            let id = layout.turn.num_players();
            if id >= capacity {
                return Err(Report::new(CoordinatorError::GameFull { capacity }));
            }

            let starting_money = layout.settings.starting_money.load(Ordering::Relaxed);
            layout.players[id].seat(starting_money);
            layout
                .turn
                .num_players
                .store(id as u32 + 1, Ordering::Release);
            {
                let _scores = layout.score_lock.lock().map_err(sync_report)?;
                layout.scores.entries[id].set_name(name);
            }
            self.connect_locked(layout, id)?;
            id
        };
        info!(player_id = id, name, "Player joined");
        Ok(id)
    }

    /// Marks a seated player connected. Repeated calls are no-ops.
    pub fn connect(&self, id: usize) -> Result<()> {
        let _guard = self.lock()?;
        self.connect_locked(self.layout(), id)
    }

    fn connect_locked(&self, layout: &GameLayout, id: usize) -> Result<()> {
        let slot = self.seat(layout, id)?;
        if slot.is_connected() {
            return Ok(());
        }
        if layout.turn.status() == GameStatus::GameOver {
            return Err(Report::new(CoordinatorError::GameOver));
        }

        slot.connected.store(true, Ordering::Release);
        if slot.is_active() && !slot.is_bankrupt() {
            layout.turn.active_count.fetch_add(1, Ordering::AcqRel);
        }
        let active = layout.turn.active_count.load(Ordering::Acquire) as usize;
        info!(player_id = id, active, "Player connected");
        self.game_log(format_args!(
            "Player {id} connected ({active}/{} active)",
            layout.turn.num_players()
        ));

        let min_players = layout.settings.min_players.load(Ordering::Relaxed) as usize;
        if layout.turn.status() == GameStatus::Waiting && active >= min_players {
            self.start_locked(layout)?;
        }
        layout.turn_changed.notify_all().map_err(sync_report)
    }

    fn start_locked(&self, layout: &GameLayout) -> Result<()> {
        let Some(first) = layout.seated().iter().position(PlayerSlot::is_eligible) else {
            return Ok(());
        };
        layout.turn.round.store(0, Ordering::Release);
        layout.turn.current.store(first as u32, Ordering::Release);
        layout.turn.set_status(GameStatus::Playing);
        layout.players[first]
            .turn_count
            .fetch_add(1, Ordering::AcqRel);
        self.fan_out(layout, first)?;

        info!(
            current = first,
            players = layout.turn.num_players(),
            "Game started"
        );
        self.game_log(format_args!(
            "Game started with {} players, player {first} goes first",
            layout.turn.num_players()
        ));
        Ok(())
    }

    /// Marks a player gone. If it was their turn the turn moves on at once.
    /// Repeated calls are no-ops.
    pub fn disconnect(&self, id: usize) -> Result<()> {
        let (outcome, result) = {
            let _guard = self.lock()?;
            let layout = self.layout();
            let slot = self.seat(layout, id)?;
            if !slot.is_connected() {
                return Ok(());
            }

            slot.connected.store(false, Ordering::Release);
            if slot.is_active() && !slot.is_bankrupt() {
                layout.turn.active_count.fetch_sub(1, Ordering::AcqRel);
            }
            info!(player_id = id, "Player disconnected");
            self.game_log(format_args!("Player {id} disconnected"));

            let was_current = layout.turn.status() == GameStatus::Playing
                && layout.turn.current() == id;
            let result = if was_current {
                self.advance_locked(layout).map(Some)
            } else {
                Ok(None)
            };
            layout.turn_changed.notify_all().map_err(sync_report)?;
            (result.as_ref().ok().copied().flatten(), result)
        };

        if let Some(TurnOutcome::GameOver { .. }) = outcome {
            self.persist_scores();
        }
        match result {
            Ok(_) => Ok(()),
            Err(report)
                if matches!(report.current_context(), CoordinatorError::NoActivePlayers) =>
            {
                warn!(
                    player_id = id,
                    "No eligible player left after disconnect, game paused"
                );
                Ok(())
            }
            Err(report) => Err(report),
        }
    }

    /// Passes the turn to the next eligible player.
    ///
    /// Afterwards only the new current player's readiness signal is raised.
    /// The move that ends the game instead raises every seated player's
    /// signal, so all of them wake and see [`GameStatus::GameOver`].
    pub fn advance_turn(&self) -> Result<TurnOutcome> {
        let outcome = {
            let _guard = self.lock()?;
            let layout = self.layout();
            let outcome = self.advance_locked(layout)?;
            layout.turn_changed.notify_all().map_err(sync_report)?;
            outcome
        };
        if let TurnOutcome::GameOver { .. } = outcome {
            self.persist_scores();
        }
        Ok(outcome)
    }

    fn advance_locked(&self, layout: &GameLayout) -> Result<TurnOutcome> {
        match layout.turn.status() {
            GameStatus::Playing => {}
            GameStatus::GameOver => return Err(Report::new(CoordinatorError::GameOver)),
            GameStatus::Waiting => return Err(Report::new(CoordinatorError::NotPlaying)),
        }

        let seated = layout.seated();
        let previous = layout.turn.current();
        let next = (1..=seated.len())
            .map(|step| (previous + step) % seated.len())
            .find(|&idx| seated[idx].is_eligible())
            .ok_or_else(|| Report::new(CoordinatorError::NoActivePlayers))?;

        layout.turn.current.store(next as u32, Ordering::Release);
        if next <= previous || next == 0 {
            layout.turn.round.fetch_add(1, Ordering::AcqRel);
        }
        layout.turn.total_moves.fetch_add(1, Ordering::AcqRel);
        seated[next].turn_count.fetch_add(1, Ordering::AcqRel);

        let round = layout.turn.round.load(Ordering::Acquire);
        let solvent: Vec<usize> = (0..seated.len())
            .filter(|&idx| !seated[idx].is_bankrupt())
            .collect();
        let lap_cap = layout.settings.lap_cap.load(Ordering::Relaxed);

        if solvent.len() <= 1 || round >= lap_cap {
            let winner = match solvent.as_slice() {
                [sole] => *sole,
                _ => richest(seated),
            };
            self.finish_locked(layout, winner)?;
            return Ok(TurnOutcome::GameOver { winner });
        }

        self.fan_out(layout, next)?;
        debug!(current = next, round, "Turn advanced");
        Ok(TurnOutcome::Next(next))
    }

    fn finish_locked(&self, layout: &GameLayout, winner: usize) -> Result<()> {
        layout.turn.set_winner(winner);
        layout.turn.set_status(GameStatus::GameOver);
        {
            let _scores = layout.score_lock.lock().map_err(sync_report)?;
            for seat in 0..layout.turn.num_players() {
                layout.scores.entries[seat].record_game(seat == winner);
            }
            layout.scores.total_games.fetch_add(1, Ordering::AcqRel);
        }

        // Wake everyone blocked on their signal so they observe the end.
        for signal in &layout.readiness[..layout.turn.num_players()] {
            raise(signal)?;
        }

        let round = layout.turn.round.load(Ordering::Acquire);
        let money = layout.players[winner].money();
        info!(winner, round, money, "Game over");
        self.game_log(format_args!(
            "Game over! Player {winner} wins at round {round} with ${money}"
        ));
        Ok(())
    }

    /// Leaves exactly the current player's readiness signal raised.
    fn fan_out(&self, layout: &GameLayout, current: usize) -> Result<()> {
        for (id, signal) in layout.readiness[..layout.turn.num_players()]
            .iter()
            .enumerate()
        {
            if id == current {
                raise(signal)?;
            } else {
                drain(signal)?;
            }
        }
        Ok(())
    }

    /// Applies one move for `id` and ends their turn, atomically.
    ///
    /// A seat whose money drops below zero goes bankrupt. If no eligible
    /// player is left to take over, the move stands and
    /// [`CoordinatorError::NoActivePlayers`] is returned. Readiness signals
    /// follow [`TurnCoordinator::advance_turn`], including the wake of every
    /// seat when the game ends.
    pub fn act<F>(&self, id: usize, mutation: F) -> Result<TurnOutcome>
    where
        F: FnOnce(&mut PlayerMove),
    {
        let outcome = {
            let _guard = self.lock()?;
            let layout = self.layout();
            match layout.turn.status() {
                GameStatus::Playing => {}
                GameStatus::GameOver => return Err(Report::new(CoordinatorError::GameOver)),
                GameStatus::Waiting => return Err(Report::new(CoordinatorError::NotPlaying)),
            }
            let slot = self.seat(layout, id)?;
            let current = layout.turn.current();
            if current != id {
                return Err(Report::new(CoordinatorError::NotYourTurn {
                    player: id,
                    current,
                }));
            }

            let mut mv = PlayerMove {
                player_id: id,
                money: slot.money(),
                position: slot.position.load(Ordering::Acquire),
            };
            mutation(&mut mv);
            slot.money.store(mv.money, Ordering::Release);
            slot.position.store(mv.position, Ordering::Release);
            debug!(
                player_id = id,
                money = mv.money,
                position = mv.position,
                "Move applied"
            );

            if mv.money < 0 && !slot.is_bankrupt() {
                let counted = slot.is_connected() && slot.is_active();
                slot.bankrupt.store(true, Ordering::Release);
                slot.active.store(false, Ordering::Release);
                if counted {
                    layout.turn.active_count.fetch_sub(1, Ordering::AcqRel);
                }
                info!(player_id = id, money = mv.money, "Player bankrupt");
                self.game_log(format_args!("Player {id} is bankrupt with ${}", mv.money));
            }

            let outcome = self.advance_locked(layout);
            layout.turn_changed.notify_all().map_err(sync_report)?;
            outcome?
        };

        if let TurnOutcome::GameOver { .. } = outcome {
            self.persist_scores();
        }
        Ok(outcome)
    }

    /// Blocks until it is `id`'s turn or the game is over.
    pub fn wait_for_turn(&self, id: usize) -> Result<TurnWait> {
        let layout = self.layout();
        let mut guard = self.lock()?;
        self.seat(layout, id)?;
        loop {
            match layout.turn.status() {
                GameStatus::GameOver => return Ok(TurnWait::GameOver),
                GameStatus::Playing if layout.turn.current() == id => return Ok(TurnWait::MyTurn),
                _ => {}
            }
            layout.turn_changed.wait(&mut guard).map_err(sync_report)?;
        }
    }

    /// Blocks on `id`'s readiness signal, consuming it.
    pub fn wait_turn_signal(&self, id: usize) -> Result<()> {
        let layout = self.layout();
        self.seat(layout, id)?;
        layout.readiness[id].wait().map_err(sync_report)
    }

    /// Like [`wait_turn_signal`](Self::wait_turn_signal) with a deadline.
    /// Returns `false` on timeout.
    pub fn wait_turn_signal_timeout(&self, id: usize, timeout: Duration) -> Result<bool> {
        let layout = self.layout();
        self.seat(layout, id)?;
        layout.readiness[id]
            .wait_timeout(timeout)
            .map_err(sync_report)
    }

    /// Current value of every seated player's readiness signal.
    pub fn readiness(&self) -> Result<Vec<u32>> {
        let layout = self.layout();
        layout.readiness[..layout.turn.num_players()]
            .iter()
            .map(|signal| signal.value().map_err(sync_report))
            .collect()
    }

    /// Waits up to `timeout` for the game to end. Returns `true` once over.
    pub fn wait_for_game_over(&self, timeout: Duration) -> Result<bool> {
        let layout = self.layout();
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock()?;
        while layout.turn.status() != GameStatus::GameOver {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            layout
                .turn_changed
                .wait_timeout(&mut guard, remaining)
                .map_err(sync_report)?;
        }
        Ok(true)
    }

    pub fn status(&self) -> GameStatus {
        self.layout().turn.status()
    }

    pub fn current_player(&self) -> usize {
        self.layout().turn.current()
    }

    pub fn round(&self) -> u32 {
        self.layout().turn.round.load(Ordering::Acquire)
    }

    pub fn total_moves(&self) -> u64 {
        self.layout().turn.total_moves.load(Ordering::Acquire)
    }

    pub fn active_player_count(&self) -> usize {
        self.layout().turn.active_count.load(Ordering::Acquire) as usize
    }

    pub fn is_my_turn(&self, id: usize) -> bool {
        let turn = &self.layout().turn;
        turn.status() == GameStatus::Playing && turn.current() == id
    }

    /// The winner, once the game is over.
    pub fn winner(&self) -> Option<usize> {
        let turn = &self.layout().turn;
        match turn.status() {
            GameStatus::GameOver => turn.winner(),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> Result<GameSnapshot> {
        let _guard = self.lock()?;
        let layout = self.layout();
        let turn = &layout.turn;
        let players = layout
            .seated()
            .iter()
            .enumerate()
            .map(|(id, slot)| PlayerView {
                id,
                connected: slot.is_connected(),
                active: slot.is_active(),
                bankrupt: slot.is_bankrupt(),
                turn_count: slot.turn_count.load(Ordering::Acquire),
                money: slot.money(),
                position: slot.position.load(Ordering::Acquire),
            })
            .collect();
        Ok(GameSnapshot {
            status: turn.status(),
            current_player: turn.current(),
            round: turn.round.load(Ordering::Acquire),
            total_moves: turn.total_moves.load(Ordering::Acquire),
            num_players: turn.num_players(),
            active_player_count: turn.active_count.load(Ordering::Acquire) as usize,
            winner: turn.winner(),
            players,
        })
    }

    pub fn scores(&self) -> Result<ScoreBoard> {
        let layout = self.layout();
        let _scores = layout.score_lock.lock().map_err(sync_report)?;
        Ok(layout.scores.to_board())
    }

    /// Writes the current board to the configured store.
    pub fn save_scores(&self) -> Result<()> {
        let Some(store) = &self.scores else {
            return Ok(());
        };
        let board = self.scores()?;
        store.save(&board)
    }

    fn persist_scores(&self) {
        if let Err(report) = self.save_scores() {
            warn!(error = ?report, "Failed to persist scores");
        }
    }
}

impl std::fmt::Debug for TurnCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnCoordinator")
            .field("region", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

/// Seat with strictly the most money, lowest id on ties.
fn richest(seated: &[PlayerSlot]) -> usize {
    let mut best = 0;
    for (idx, slot) in seated.iter().enumerate().skip(1) {
        if slot.money() > seated[best].money() {
            best = idx;
        }
    }
    best
}

fn raise(signal: &ShmSemaphore) -> Result<()> {
    if signal.value().map_err(sync_report)? == 0 {
        signal.post().map_err(sync_report)?;
    }
    Ok(())
}

fn drain(signal: &ShmSemaphore) -> Result<()> {
    while signal.try_wait().map_err(sync_report)? == TryWait::Decremented {}
    Ok(())
}
