mod cli;
mod host;
mod player;
mod simulate;

use anyhow::Result;
use clap::Parser;

use crate::cli::Cli;
use crate::cli::CleanShmArgs;
use crate::cli::Commands;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

/// Turns an error-stack report into an `anyhow` error, keeping its frames.
pub(crate) trait IntoAnyhow<T> {
    fn into_anyhow(self) -> Result<T>;
}

impl<T, C> IntoAnyhow<T> for core::result::Result<T, error_stack::Report<C>>
where
    C: error_stack::Context,
{
    fn into_anyhow(self) -> Result<T> {
        self.map_err(|report| anyhow::anyhow!("{report:?}"))
    }
}

/// Name of the log queue that belongs to a game region.
pub(crate) fn log_queue_name(game: &str) -> String {
    format!("{game}_log")
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = match &cli.diagnostics_dir {
        Some(dir) => utils::logging::init_with_dir(dir),
        None => {
            utils::logging::init();
            None
        }
    };

    match cli.command {
        Commands::Host(args) => host::run(args).await,
        Commands::Player(args) => {
            tokio::task::spawn_blocking(move || player::run(args)).await?
        }
        Commands::Simulate(args) => simulate::run(args).await,
        Commands::CleanShm(args) => run_clean_shm(args),
    }
}

fn run_clean_shm(args: CleanShmArgs) -> Result<()> {
    let removed = utils::shared_memory::cleanup_regions(&args.pattern)?;
    tracing::info!(pattern = %args.pattern, removed = removed.len(), "Cleaned shared memory");
    for name in removed {
        println!("{name}");
    }
    Ok(())
}
