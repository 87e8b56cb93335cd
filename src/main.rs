//! task-board: command-line front end for the task orchestration engine.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use task_board::board::TaskBoard;
use task_board::cli::{self, Cli, Command};
use task_board::config::Config;
use task_board::logging::{self, LogTarget};
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let target: LogTarget = cli.log.parse()?;
    logging::init(&target, cli.verbose)?;

    let (mut config, source) = Config::resolve(cli.config.as_deref())?;
    if let Some(db_path) = cli.database {
        config.server.db_path = db_path;
    }
    debug!(config = ?source, db_path = %config.server.db_path.display(), "starting");

    let board = Arc::new(TaskBoard::from_config(&config)?);
    let command = cli.command.unwrap_or(Command::Serve);

    if let Err(e) = cli::run(board, command, config.leases.sweep_interval(), cli.json).await {
        if cli.json {
            eprintln!("{}", serde_json::to_string_pretty(&e.report())?);
        } else {
            eprintln!("Error [{:?}]: {}", e.code(), e);
        }
        std::process::exit(1);
    }

    Ok(())
}
