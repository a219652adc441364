//! Import command - Converge a JSON-file store to a CSV roster

use crate::error::CliResult;
use crate::lock::StoreLock;
use crate::logging;
use clap::Args;
use rostersync_directory::InMemoryDirectory;
use rostersync_import::{ImportConfiguration, ImportEngine, RunResult};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Arguments for the import command
#[derive(Args, Debug, Clone)]
pub struct ImportArgs {
    /// Import configuration (JSON)
    #[arg(long, short = 'c')]
    pub config: PathBuf,

    /// Roster CSV file
    #[arg(long, short = 'i')]
    pub input: PathBuf,

    /// Directory store snapshot (JSON); created if missing
    #[arg(long, short = 's')]
    pub store: PathBuf,

    /// Plan and validate without writing to the store
    #[arg(long)]
    pub dry_run: bool,

    /// Debug logging
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Write the run report here instead of stdout
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

/// Execute the import command and return the process exit code.
pub async fn execute(args: ImportArgs) -> CliResult<i32> {
    logging::init(args.verbose);

    let result = run_import(&args).await?;
    let report = serde_json::to_string_pretty(&result)?;
    match &args.output {
        Some(path) => std::fs::write(path, report)?,
        None => println!("{report}"),
    }
    Ok(result.exit_code())
}

/// Lock the store, run the import and persist the snapshot.
pub async fn run_import(args: &ImportArgs) -> CliResult<RunResult> {
    let config = ImportConfiguration::load(&args.config)?;
    let _lock = StoreLock::acquire(&args.store)?;

    let store = Arc::new(InMemoryDirectory::load_json(&args.store).await?);
    let mut engine = ImportEngine::new(config, store.clone())?;
    if args.dry_run {
        engine = engine.with_dry_run(true);
    }

    let result = engine.run(File::open(&args.input)?).await?;

    if !result.dry_run {
        store.save_json(&args.store).await?;
    }
    info!(
        run_id = %result.run_id,
        exit_code = result.exit_code(),
        dry_run = result.dry_run,
        "Import finished"
    );
    Ok(result)
}
