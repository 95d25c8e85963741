//! Optional background thread that moves the game along on its own.
//!
//! With the ticker running, turns advance every interval whether or not the
//! current player acted, which changes how a game plays. It only runs when
//! `proactive_tick_ms` is configured.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::layout::GameStatus;
use crate::{CoordinatorError, TurnCoordinator, TurnOutcome};

/// Poll interval while no game is in progress.
pub const IDLE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct ProactiveTicker {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<u64>>,
}

impl ProactiveTicker {
    pub fn spawn(coordinator: Arc<TurnCoordinator>, interval: Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("proactive-ticker".to_string())
            .spawn(move || run(&coordinator, interval, &stop_rx))?;
        info!(
            interval_ms = interval.as_millis() as u64,
            "Proactive ticker started"
        );
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stops the thread and returns how many turns it advanced.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        drop(self.stop.take());
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(ticks)) => ticks,
            Some(Err(_)) => {
                error!("proactive ticker thread panicked");
                0
            }
            None => 0,
        }
    }
}

impl Drop for ProactiveTicker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(coordinator: &TurnCoordinator, interval: Duration, stop: &mpsc::Receiver<()>) -> u64 {
    let mut ticks = 0;
    loop {
        let pause = match coordinator.status() {
            GameStatus::GameOver => break,
            GameStatus::Waiting => IDLE_INTERVAL,
            GameStatus::Playing => {
                match coordinator.advance_turn() {
                    Ok(TurnOutcome::Next(player)) => {
                        ticks += 1;
                        debug!(current = player, "Ticker advanced turn");
                    }
                    Ok(TurnOutcome::GameOver { winner }) => {
                        ticks += 1;
                        info!(winner, "Ticker ended the game");
                        break;
                    }
                    Err(report) => match report.current_context() {
                        CoordinatorError::NoActivePlayers | CoordinatorError::NotPlaying => {
                            warn!("Ticker found no player to advance to");
                        }
                        CoordinatorError::GameOver => break,
                        _ => {
                            error!(error = ?report, "Ticker stopping on coordinator failure");
                            break;
                        }
                    },
                }
                interval
            }
        };
        match stop.recv_timeout(pause) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    ticks
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::CoordinatorConfig;

    fn region(test_name: &str) -> String {
        format!("test_ticker_{}_{}", test_name, std::process::id())
    }

    #[test_log::test]
    fn ticker_plays_a_short_game_to_the_end() {
        let config = CoordinatorConfig {
            lap_cap: 2,
            ..CoordinatorConfig::default()
        };
        let coordinator = Arc::new(TurnCoordinator::create(&region("game"), &config).unwrap());
        for name in ["a", "b", "c"] {
            coordinator.join(name).unwrap();
        }

        let ticker =
            ProactiveTicker::spawn(Arc::clone(&coordinator), Duration::from_millis(5)).unwrap();
        let limit = Duration::from_secs(5);
        assert!(coordinator.wait_for_game_over(limit).unwrap());
        // Two laps of three seats.
        assert_eq!(ticker.stop(), 6);
        assert_eq!(coordinator.round(), 2);
        assert_eq!(coordinator.winner(), Some(0));

        let coordinator = Arc::into_inner(coordinator).unwrap();
        coordinator.destroy().unwrap();
    }

    #[test]
    fn ticker_idles_while_waiting_and_stops_promptly() {
        let coordinator = Arc::new(
            TurnCoordinator::create(&region("idle"), &CoordinatorConfig::default()).unwrap(),
        );
        let ticker =
            ProactiveTicker::spawn(Arc::clone(&coordinator), Duration::from_millis(5)).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let start = std::time::Instant::now();
        assert_eq!(ticker.stop(), 0);
        assert!(start.elapsed() < IDLE_INTERVAL);
        assert_eq!(coordinator.status(), GameStatus::Waiting);

        let coordinator = Arc::into_inner(coordinator).unwrap();
        coordinator.destroy().unwrap();
    }
}
