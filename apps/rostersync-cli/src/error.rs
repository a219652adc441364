//! CLI error types and exit codes

use rostersync_directory::DirectoryError;
use rostersync_import::{ConfigurationError, ImportError, EXIT_CONFIGURATION, EXIT_ERRORS};
use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the CLI
/// - 0: Import finished without errors
/// - 1: Import finished with row or action errors, or the CLI itself failed
/// - 2: Import aborted
/// - 3: Configuration rejected
pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Store {path} is locked by another run (lock file {lock})")]
    Locked { path: PathBuf, lock: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] DirectoryError),

    #[error("Import failed: {0}")]
    Import(ImportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ImportError> for CliError {
    fn from(e: ImportError) -> Self {
        match e {
            ImportError::Configuration(inner) => CliError::Configuration(inner),
            other => CliError::Import(other),
        }
    }
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Configuration(_) => EXIT_CONFIGURATION,
            _ => EXIT_ERRORS,
        }
    }

    /// Print the error to stderr with appropriate formatting
    pub fn print(&self) {
        let use_color = std::env::var("NO_COLOR").is_err();

        if use_color {
            eprintln!("\x1b[31mError:\x1b[0m {}", self);
        } else {
            eprintln!("Error: {}", self);
        }

        if let Some(suggestion) = self.suggestion() {
            if use_color {
                eprintln!("\n\x1b[33mSuggestion:\x1b[0m {}", suggestion);
            } else {
                eprintln!("\nSuggestion: {}", suggestion);
            }
        }
    }

    fn suggestion(&self) -> Option<&'static str> {
        match self {
            CliError::Locked { .. } => {
                Some("Wait for the other run to finish, or remove a stale lock file.")
            }
            CliError::Configuration(_) => {
                Some("Run 'rostersync check-config --config <file>' to check the document.")
            }
            _ => None,
        }
    }
}
