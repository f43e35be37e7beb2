mod cli;
mod commands;
mod logging;

use clap::Parser;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let _log_guard = cli.logging.to_setup().install()?;

    match cli.command {
        Command::Spawn(args) => commands::spawn(args).await,
        Command::Wait(args) => commands::wait(args).await,
        Command::Connect(args) => commands::connect(args).await,
        Command::Run(args) => commands::run(args).await,
    }
}
