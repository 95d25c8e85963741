use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use anyhow::Result;
use game_log::{game_log, LogProducer};
use rand::Rng;
use tracing::{debug, info, warn};
use turn_coordinator::{CoordinatorError, PlayerMove, TurnCoordinator, TurnOutcome, TurnWait};

use crate::cli::PlayerArgs;
use crate::{log_queue_name, IntoAnyhow};

const BOARD_SIZE: u32 = 20;
const PASS_START_BONUS: i64 = 200;
const MAX_RENT: i64 = 150;

/// Rolls a die, moves, and collects or pays.
pub(crate) fn roll_and_move<R: Rng>(rng: &mut R, mv: &mut PlayerMove) -> u32 {
    let roll = rng.random_range(1..=6);
    let from = mv.position;
    mv.position = (from + roll) % BOARD_SIZE;
    if mv.position < from {
        mv.money += PASS_START_BONUS;
    } else {
        mv.money -= rng.random_range(0..=MAX_RENT);
    }
    roll
}

fn attach_with_retry(name: &str, timeout: Duration) -> Result<TurnCoordinator> {
    let deadline = Instant::now() + timeout;
    loop {
        match TurnCoordinator::attach(name) {
            Ok(coordinator) => return Ok(coordinator),
            Err(report)
                if report.current_context().is_recoverable() && Instant::now() < deadline =>
            {
                debug!(region = %name, "Game not ready yet, retrying");
                thread::sleep(Duration::from_millis(50));
            }
            Err(report) => {
                return Err(report)
                    .into_anyhow()
                    .with_context(|| format!("attach game region {name}"))
            }
        }
    }
}

pub fn run(args: PlayerArgs) -> Result<()> {
    let coordinator = attach_with_retry(&args.name, Duration::from_millis(args.attach_timeout_ms))?;
    let producer = match LogProducer::attach(&log_queue_name(&args.name)) {
        Ok(producer) => Some(producer),
        Err(e) => {
            warn!(error = %e, "Game log unavailable, playing without it");
            None
        }
    };
    let coordinator = match producer.clone() {
        Some(producer) => coordinator.with_game_log(producer),
        None => coordinator,
    };

    let player_name = args
        .player_name
        .clone()
        .unwrap_or_else(|| format!("pid-{}", std::process::id()));
    let id = match coordinator.join(&player_name) {
        Ok(id) => id,
        Err(report) if matches!(report.current_context(), CoordinatorError::GameOver) => {
            info!(name = %player_name, "Game already over, nothing to join");
            println!("player ({player_name}): game already over");
            return Ok(());
        }
        Err(report) => return Err(report).into_anyhow(),
    };
    info!(player_id = id, name = %player_name, "Seated");

    let mut rng = rand::rng();
    let mut turns = 0;
    loop {
        match coordinator.wait_for_turn(id).into_anyhow()? {
            TurnWait::GameOver => break,
            TurnWait::MyTurn => {}
        }
        if args.rounds.is_some_and(|limit| turns >= limit) {
            info!(player_id = id, turns, "Leaving the game");
            coordinator.disconnect(id).into_anyhow()?;
            return Ok(());
        }

        let mut roll = 0;
        let result = coordinator.act(id, |mv| roll = roll_and_move(&mut rng, mv));
        match result {
            Ok(outcome) => {
                turns += 1;
                if let Some(producer) = &producer {
                    game_log!(producer, "Player {} rolled {}", id, roll);
                }
                if let TurnOutcome::GameOver { winner } = outcome {
                    debug!(winner, "This move ended the game");
                }
            }
            Err(report) => match report.current_context() {
                // The ticker moved the turn on before we acted.
                CoordinatorError::NotYourTurn { .. } => continue,
                CoordinatorError::GameOver => break,
                CoordinatorError::NoActivePlayers => {
                    warn!(player_id = id, "Nobody left to take the turn, leaving");
                    coordinator.disconnect(id).into_anyhow()?;
                    return Ok(());
                }
                _ => return Err(report).into_anyhow(),
            },
        }
    }

    let winner = coordinator.winner();
    info!(player_id = id, turns, ?winner, "Game over");
    println!(
        "player {id} ({player_name}): {}",
        match winner {
            Some(winner) if winner == id => "won".to_string(),
            Some(winner) => format!("lost to player {winner}"),
            None => "no winner".to_string(),
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use similar_asserts::assert_eq;
    use turn_coordinator::{CoordinatorConfig, GameStatus};

    use super::*;

    #[test]
    fn moves_stay_on_the_board() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut mv = PlayerMove {
            player_id: 0,
            money: 500,
            position: 0,
        };
        for _ in 0..200 {
            let before = mv.clone();
            let roll = roll_and_move(&mut rng, &mut mv);
            assert!((1..=6).contains(&roll));
            assert!(mv.position < BOARD_SIZE);
            assert_eq!(mv.position, (before.position + roll) % BOARD_SIZE);
            if mv.position < before.position {
                assert_eq!(mv.money, before.money + PASS_START_BONUS);
            } else {
                assert!(before.money - mv.money <= MAX_RENT);
            }
        }
    }

    #[test]
    fn arriving_after_game_over_exits_cleanly() {
        let name = format!("turnstile_late_{}", std::process::id());
        let config = CoordinatorConfig {
            lap_cap: 1,
            ..CoordinatorConfig::default()
        };
        let coordinator = TurnCoordinator::create(&name, &config).unwrap();
        for seat in 0..3 {
            coordinator.join(&format!("p{seat}")).unwrap();
        }
        while coordinator.status() != GameStatus::GameOver {
            coordinator.advance_turn().unwrap();
        }

        let late = PlayerArgs {
            name: name.clone(),
            player_name: Some("late".to_string()),
            rounds: None,
            attach_timeout_ms: 100,
        };
        let result = run(late);
        coordinator.destroy().unwrap();
        assert!(result.is_ok(), "{result:?}");
    }
}
