//! Check-config command - Run the configuration checks only

use crate::error::CliResult;
use clap::Args;
use rostersync_import::ImportConfiguration;
use std::path::PathBuf;

/// Arguments for the check-config command
#[derive(Args, Debug)]
pub struct CheckConfigArgs {
    /// Import configuration (JSON)
    #[arg(long, short = 'c')]
    pub config: PathBuf,
}

/// Execute the check-config command
pub fn execute(args: CheckConfigArgs) -> CliResult<()> {
    let config = ImportConfiguration::load(&args.config)?;
    config.check()?;
    println!("{}: configuration OK", args.config.display());
    Ok(())
}
