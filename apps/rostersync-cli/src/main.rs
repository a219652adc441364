//! rostersync - run roster imports against a JSON-file directory store
//!
//! - `import` converges the store to a CSV roster and prints the run report
//! - `check-config` runs the configuration checks only

use clap::{Parser, Subcommand};
use rostersync_cli::commands;
use rostersync_cli::error::CliResult;

/// rostersync - roster import and reconciliation
#[derive(Parser)]
#[command(name = "rostersync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a CSV roster into the store
    Import(commands::import::ImportArgs),

    /// Check an import configuration without running it
    CheckConfig(commands::check_config::CheckConfigArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            e.print();
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> CliResult<i32> {
    match cli.command {
        Commands::Import(args) => commands::import::execute(args).await,
        Commands::CheckConfig(args) => commands::check_config::execute(args).map(|()| 0),
    }
}
