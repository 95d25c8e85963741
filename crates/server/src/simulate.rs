use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};
use tracing::{error, info, warn};
use turn_coordinator::{MAX_PLAYERS, MIN_PLAYERS};

use crate::cli::SimulateArgs;

fn spawn(args: &[String]) -> Result<Child> {
    let exe = std::env::current_exe().context("locate own executable")?;
    let command = args.first().map(String::as_str).unwrap_or_default();
    Command::new(exe)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawn {command}"))
}

/// Flags for the child `host`. The game waits for every simulated player, so
/// none of them can arrive after a short game has already ended.
fn host_args(name: &str, args: &SimulateArgs) -> Vec<String> {
    let mut rules = args.rules.clone();
    if rules.min_players.is_some_and(|min| min != args.players) {
        warn!(
            players = args.players,
            "Ignoring --min-players, every simulated player must join"
        );
    }
    rules.min_players = Some(args.players);

    let mut host_args = vec![
        "host".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--log-file".to_string(),
        args.log_file.display().to_string(),
        "--scores-file".to_string(),
        args.scores_file.display().to_string(),
        "--reset".to_string(),
        "--timeout-secs".to_string(),
        args.timeout_secs.to_string(),
    ];
    host_args.extend(rules.to_args());
    host_args
}

pub async fn run(args: SimulateArgs) -> Result<()> {
    if !(MIN_PLAYERS..=MAX_PLAYERS).contains(&args.players) {
        bail!(
            "--players must be within {MIN_PLAYERS}..={MAX_PLAYERS}, got {}",
            args.players
        );
    }
    let name = args
        .name
        .clone()
        .unwrap_or_else(|| format!("turnstile_sim_{}", std::process::id()));

    let host_args = host_args(&name, &args);
    let mut host = spawn(&host_args)?;
    info!(region = %name, players = args.players, "Started host");

    let mut players = Vec::with_capacity(args.players);
    for seat in 0..args.players {
        players.push(spawn(&[
            "player".to_string(),
            "--name".to_string(),
            name.clone(),
            "--player-name".to_string(),
            format!("sim-{seat}"),
        ])?);
    }

    let limit = Duration::from_secs(args.timeout_secs);
    let waited = tokio::time::timeout(limit, async {
        let mut failures = 0;
        for (seat, player) in players.iter_mut().enumerate() {
            let status = player.wait().await.context("wait for player")?;
            if !status.success() {
                error!(seat, %status, "Player process failed");
                failures += 1;
            }
        }
        let host_status = host.wait().await.context("wait for host")?;
        anyhow::Ok((failures, host_status))
    })
    .await;

    let (failures, host_status) = match waited {
        Ok(result) => result?,
        Err(_) => bail!("simulation did not finish within {}s", args.timeout_secs),
    };
    if !host_status.success() {
        bail!("host exited with {host_status}");
    }
    if failures > 0 {
        bail!("{failures} player process(es) failed");
    }
    info!(region = %name, "Simulation finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::cli::RuleArgs;

    fn simulate_args(players: usize, rules: RuleArgs) -> SimulateArgs {
        SimulateArgs {
            name: None,
            players,
            log_file: "game.log".into(),
            scores_file: "scores.json".into(),
            rules,
            timeout_secs: 60,
        }
    }

    fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == name)
            .map(|i| args[i + 1].as_str())
    }

    #[test]
    fn host_waits_for_every_simulated_player() {
        let rules = RuleArgs {
            lap_cap: Some(2),
            ..RuleArgs::default()
        };
        let args = host_args("sim", &simulate_args(4, rules));
        assert_eq!(flag(&args, "--min-players"), Some("4"));
        assert_eq!(flag(&args, "--lap-cap"), Some("2"));
        assert_eq!(flag(&args, "--name"), Some("sim"));
    }

    #[test]
    fn explicit_min_players_is_replaced_by_player_count() {
        let rules = RuleArgs {
            min_players: Some(3),
            ..RuleArgs::default()
        };
        let args = host_args("sim", &simulate_args(5, rules));
        assert_eq!(flag(&args, "--min-players"), Some("5"));
        assert_eq!(args.iter().filter(|a| *a == "--min-players").count(), 1);
    }
}
