//! flowkeep command-line entry point.
//!
//! Binary name: `flowkeep`
//!
//! Parses CLI arguments, sets up tracing, opens the SQLite store under the
//! data directory and dispatches to the command handlers.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use flowkeep_observe::{LogFormat, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,flowkeep_core=debug,flowkeep_infra=debug",
        _ => "trace",
    };
    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_tracing(filter, format, cli.otel).map_err(|e| anyhow::anyhow!(e))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "flowkeep", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;

    let result = match cli.command {
        Commands::Demo(args) => cli::demo::run_demo(&state, args, cli.json).await,
        Commands::Recover(args) => cli::recover::recover(&state, args, cli.json).await,
        Commands::Checkpoints { action } => cli::checkpoints::handle(&state, action, cli.json).await,
        Commands::Hospital { action } => cli::hospital::handle(&state, action, cli.json).await,
        Commands::Status => cli::status::status(&state, cli.json).await,
        Commands::Completions { .. } => unreachable!("handled above"),
    };

    state.db_pool.close().await;
    shutdown_tracing();
    result
}
