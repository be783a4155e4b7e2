//! Cadence CLI entry point.
//!
//! Binary name: `cadence`
//!
//! Parses CLI arguments, opens the engine over the SQLite store, then
//! dispatches to the command handler.

mod cli;
mod state;

use anyhow::anyhow;
use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,cadence=debug",
        _ => "trace",
    };
    cadence_observe::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "cadence", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init(cli.data_dir.clone(), &cli.simulate).await?;
    let result = run(cli.command, &state, cli.json).await;

    cadence_observe::shutdown_tracing();
    result
}

async fn run(command: Commands, state: &AppState, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::Validate { file } => cli::definition::handle_validate(&file, state, json),
        Commands::Definition { action } => {
            cli::definition::handle_definition_command(action, state, json).await
        }
        Commands::Instance { action } => {
            cli::instance::handle_instance_command(action, state, json).await
        }
        Commands::Event { action } => cli::event::handle_event_command(action, state, json).await,
        Commands::Tick { until_idle } => cli::worker::handle_tick(until_idle, state, json).await,
        Commands::Worker => cli::worker::handle_worker(state, json).await,
        Commands::Completions { .. } => unreachable!("handled above"),
    }
}
