use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use anyhow::Result;
use game_log::GameLogger;
use tracing::{info, warn};
use turn_coordinator::{
    CoordinatorConfig, JsonScoreStore, ProactiveTicker, ScoreStore, TurnCoordinator,
};
use utils::ShmError;

use crate::cli::{HostArgs, RuleArgs};
use crate::{log_queue_name, IntoAnyhow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostOutcome {
    Finished,
    TimedOut,
    Interrupted,
}

/// Config file first, then command line overrides.
pub(crate) fn resolve_config(rules: &RuleArgs) -> Result<CoordinatorConfig> {
    let mut config = match &rules.config {
        Some(path) => CoordinatorConfig::from_yaml_file(path).into_anyhow()?,
        None => CoordinatorConfig::default(),
    };
    if let Some(max_players) = rules.max_players {
        config.max_players = max_players;
    }
    if let Some(min_players) = rules.min_players {
        config.min_players = min_players;
    }
    if let Some(lap_cap) = rules.lap_cap {
        config.lap_cap = lap_cap;
    }
    if let Some(starting_money) = rules.starting_money {
        config.starting_money = starting_money;
    }
    if rules.proactive_tick_ms.is_some() {
        config.proactive_tick_ms = rules.proactive_tick_ms;
    }
    config.validate().into_anyhow()?;
    Ok(config)
}

fn remove_leftover(name: &str) -> Result<()> {
    match utils::shared_memory::remove_region(name) {
        Ok(()) => {
            info!(region = %name, "Removed leftover region");
            Ok(())
        }
        Err(ShmError::NotFound { .. }) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove leftover region {name}")),
    }
}

pub async fn run(args: HostArgs) -> Result<()> {
    let config = resolve_config(&args.rules)?;
    let queue_name = log_queue_name(&args.name);
    if args.reset {
        remove_leftover(&args.name)?;
        remove_leftover(&queue_name)?;
    }

    // The log queue exists before the game region, so players that can
    // attach the game can always attach the log.
    let logger = GameLogger::start(&queue_name, &args.log_file)
        .with_context(|| format!("start game log at {}", args.log_file.display()))?;
    let store = JsonScoreStore::new(&args.scores_file);
    let saved = store
        .load()
        .into_anyhow()
        .with_context(|| format!("load scores from {}", args.scores_file.display()))?;
    if saved.is_some() {
        info!(path = %args.scores_file.display(), "Continuing saved score board");
    }

    // Saved scores go in while the region is initialised, before any
    // player can attach and claim a seat.
    let coordinator = TurnCoordinator::create_with_scores(&args.name, &config, saved.as_ref())
        .into_anyhow()
        .context("create game region")?
        .with_game_log(logger.producer());
    let coordinator = Arc::new(coordinator);

    let ticker = match config.proactive_tick() {
        Some(interval) => Some(
            ProactiveTicker::spawn(Arc::clone(&coordinator), interval)
                .context("start proactive ticker")?,
        ),
        None => None,
    };
    info!(
        region = %args.name,
        max_players = config.max_players,
        min_players = config.min_players,
        "Hosting game, waiting for players"
    );

    let stop = Arc::new(AtomicBool::new(false));
    let waiter = {
        let coordinator = Arc::clone(&coordinator);
        let stop = Arc::clone(&stop);
        let timeout = args.timeout_secs.map(Duration::from_secs);
        tokio::task::spawn_blocking(move || wait_until_over(&coordinator, &stop, timeout))
    };

    let outcome = tokio::select! {
        joined = waiter => joined??,
        signal = tokio::signal::ctrl_c() => {
            signal.context("listen for ctrl-c")?;
            stop.store(true, Ordering::Release);
            warn!("Interrupted, tearing the game down");
            HostOutcome::Interrupted
        }
    };

    if let Some(ticker) = ticker {
        let ticks = ticker.stop();
        info!(ticks, "Proactive ticker stopped");
    }

    if outcome == HostOutcome::Finished {
        let board = coordinator.scores().into_anyhow()?;
        store
            .save(&board)
            .into_anyhow()
            .with_context(|| format!("save scores to {}", args.scores_file.display()))?;
        let snapshot = coordinator.snapshot().into_anyhow()?;
        println!(
            "{}",
            serde_json::json!({ "game": snapshot, "scores": board })
        );
    }

    logger.shutdown().context("stop game log")?;
    match Arc::try_unwrap(coordinator) {
        Ok(coordinator) => coordinator.destroy().into_anyhow()?,
        Err(shared) => {
            warn!("Game region still mapped, removing its name only");
            remove_leftover(shared.name())?;
        }
    }

    match outcome {
        HostOutcome::Finished | HostOutcome::Interrupted => Ok(()),
        HostOutcome::TimedOut => Err(anyhow::anyhow!("game did not finish in time")),
    }
}

fn wait_until_over(
    coordinator: &TurnCoordinator,
    stop: &AtomicBool,
    timeout: Option<Duration>,
) -> Result<HostOutcome> {
    const POLL: Duration = Duration::from_millis(200);
    let started = Instant::now();
    loop {
        if coordinator.wait_for_game_over(POLL).into_anyhow()? {
            let winner = coordinator.winner();
            info!(?winner, round = coordinator.round(), "Game finished");
            return Ok(HostOutcome::Finished);
        }
        if stop.load(Ordering::Acquire) {
            return Ok(HostOutcome::Interrupted);
        }
        if timeout.is_some_and(|limit| started.elapsed() >= limit) {
            warn!("Game did not finish before the host timeout");
            return Ok(HostOutcome::TimedOut);
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn command_line_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, "max_players: 4\nlap_cap: 20\n").unwrap();

        let rules = RuleArgs {
            config: Some(path),
            lap_cap: Some(3),
            ..RuleArgs::default()
        };
        let config = resolve_config(&rules).unwrap();
        assert_eq!(config.max_players, 4);
        assert_eq!(config.lap_cap, 3);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let rules = RuleArgs {
            max_players: Some(7),
            ..RuleArgs::default()
        };
        assert!(resolve_config(&rules).is_err());
    }
}
