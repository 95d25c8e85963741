use std::path::PathBuf;

use clap::Args;
use clap::Parser;
use clap::Subcommand;

#[derive(Parser)]
#[command(about, long_about, version)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = utils::logging::LOG_DIR_ENV_VAR,
        value_hint = clap::ValueHint::DirPath,
        help = "Also write diagnostics to a daily rolling file in this directory"
    )]
    pub diagnostics_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a game and serve it until it ends
    Host(HostArgs),
    /// Join a hosted game and play it
    Player(PlayerArgs),
    /// Run a host and several players as separate processes
    Simulate(SimulateArgs),
    /// Remove shared memory regions left behind by crashed runs
    #[command(name = "clean-shm")]
    CleanShm(CleanShmArgs),
}

/// Rules that can be set on the command line, overriding the config file.
#[derive(Args, Clone, Debug, Default)]
pub struct RuleArgs {
    #[arg(
        long,
        env = "TURNSTILE_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML file with game rules"
    )]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Seats available, 3 to 5")]
    pub max_players: Option<usize>,

    #[arg(long, help = "Connected players needed to start")]
    pub min_players: Option<usize>,

    #[arg(long, help = "Round at which the richest player wins")]
    pub lap_cap: Option<u32>,

    #[arg(long, help = "Money every player starts with")]
    pub starting_money: Option<i64>,

    #[arg(
        long,
        env = "TURNSTILE_PROACTIVE_TICK_MS",
        help = "Advance turns automatically at this interval, in milliseconds"
    )]
    pub proactive_tick_ms: Option<u64>,
}

impl RuleArgs {
    /// Flags to hand the same rules to a child `host` process.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.display().to_string());
        }
        push_flag(&mut args, "--max-players", self.max_players);
        push_flag(&mut args, "--min-players", self.min_players);
        push_flag(&mut args, "--lap-cap", self.lap_cap);
        push_flag(&mut args, "--starting-money", self.starting_money);
        push_flag(&mut args, "--proactive-tick-ms", self.proactive_tick_ms);
        args
    }
}

fn push_flag<T: ToString>(args: &mut Vec<String>, flag: &str, value: Option<T>) {
    if let Some(value) = value {
        args.push(flag.to_string());
        args.push(value.to_string());
    }
}

#[derive(Args, Clone, Debug)]
pub struct HostArgs {
    #[arg(
        long,
        env = "TURNSTILE_NAME",
        default_value = "turnstile",
        help = "Name of the game's shared memory region"
    )]
    pub name: String,

    #[arg(
        long,
        env = "TURNSTILE_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "game.log",
        help = "Game event log"
    )]
    pub log_file: PathBuf,

    #[arg(
        long,
        env = "TURNSTILE_SCORES_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "scores.json",
        help = "Where wins and games played are kept between games"
    )]
    pub scores_file: PathBuf,

    #[command(flatten)]
    pub rules: RuleArgs,

    #[arg(long, help = "Remove leftover regions with this name before starting")]
    pub reset: bool,

    #[arg(
        long,
        help = "Give up if the game has not ended after this many seconds"
    )]
    pub timeout_secs: Option<u64>,
}

#[derive(Args, Clone, Debug)]
pub struct PlayerArgs {
    #[arg(
        long,
        env = "TURNSTILE_NAME",
        default_value = "turnstile",
        help = "Name of the game's shared memory region"
    )]
    pub name: String,

    #[arg(long, help = "Name recorded on the score board")]
    pub player_name: Option<String>,

    #[arg(long, help = "Leave the game after taking this many turns")]
    pub rounds: Option<u32>,

    #[arg(
        long,
        default_value = "5000",
        help = "How long to wait for the host to create the game, in milliseconds"
    )]
    pub attach_timeout_ms: u64,
}

#[derive(Args, Clone, Debug)]
pub struct SimulateArgs {
    #[arg(long, help = "Region name; a unique one is picked when omitted")]
    pub name: Option<String>,

    #[arg(long, default_value = "3", help = "Player processes to start, 3 to 5")]
    pub players: usize,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = "game.log"
    )]
    pub log_file: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = "scores.json"
    )]
    pub scores_file: PathBuf,

    #[command(flatten)]
    pub rules: RuleArgs,

    #[arg(
        long,
        default_value = "60",
        help = "Seconds before the simulation is abandoned"
    )]
    pub timeout_secs: u64,
}

#[derive(Args, Clone, Debug)]
pub struct CleanShmArgs {
    #[arg(
        long,
        default_value = "turnstile*",
        help = "Glob matched against region names"
    )]
    pub pattern: String,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn rule_flags_round_trip_to_child_args() {
        let cli = Cli::parse_from([
            "turnstile",
            "simulate",
            "--players",
            "4",
            "--lap-cap",
            "5",
            "--proactive-tick-ms",
            "20",
        ]);
        let Commands::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.players, 4);
        assert_eq!(
            args.rules.to_args(),
            vec!["--lap-cap", "5", "--proactive-tick-ms", "20"]
        );
    }

    #[test]
    fn diagnostics_dir_reads_the_shared_env_var() {
        let command = Cli::command();
        let arg = command
            .get_arguments()
            .find(|arg| arg.get_id() == "diagnostics_dir")
            .unwrap();
        let env = arg.get_env().and_then(|env| env.to_str());
        assert_eq!(env, Some(utils::logging::LOG_DIR_ENV_VAR));
    }
}
