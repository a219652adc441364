//! Error types for the import engine.
//!
//! [`ConfigurationError`] is the only error surfaced past the run boundary.
//! Everything row- or action-level ends up as a
//! [`RecordError`](crate::report::RecordError) in the run report.

use rostersync_directory::DirectoryError;
use thiserror::Error;

use crate::scheme::SchemeError;

/// Malformed or contradictory configuration. Fatal before any row is read.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("cannot read configuration {path}: {message}")]
    Unreadable { path: String, message: String },

    #[error("invalid configuration document: {message}")]
    Parse { message: String },

    #[error("missing required option '{option}'")]
    MissingOption { option: String },

    #[error("mandatory_attributes must include '{field}'")]
    MandatoryAttributeOmitted { field: String },

    #[error("mandatory attribute '{field}' is neither mapped from a column nor derived by a scheme")]
    UnproducibleField { field: String },

    #[error("username max_length for '{role}' is {value}, allowed range is {min}..={max}")]
    UsernameLength {
        role: String,
        value: usize,
        min: usize,
        max: usize,
    },

    #[error("'user_role' cannot be combined with a column mapped to '__role'")]
    ConflictingRoleSource,

    #[error("option '{option}' is no longer supported: {hint}")]
    Deprecated { option: String, hint: String },

    #[error("scheme for '{field}' is invalid: {source}")]
    Scheme {
        field: String,
        #[source]
        source: SchemeError,
    },

    #[error("scheme for '{field}' references unknown field '{reference}'")]
    UnknownReference { field: String, reference: String },

    #[error("schemes reference each other in a cycle: {}", .cycle.join(" -> "))]
    SchemeCycle { cycle: Vec<String> },

    #[error("invalid value for '{option}': {message}")]
    InvalidOption { option: String, message: String },

    #[error("hook '{hook}' is invalid: {message}")]
    InvalidHook { hook: String, message: String },
}

impl ConfigurationError {
    pub fn invalid(option: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigurationError::InvalidOption {
            option: option.into(),
            message: message.into(),
        }
    }
}

/// A single row failed to map into a record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("line {line}: {message} (field '{field}')")]
pub struct MappingError {
    pub line: usize,
    pub field: String,
    pub message: String,
}

impl MappingError {
    pub fn new(line: usize, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            line,
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing(line: usize, field: &str) -> Self {
        Self::new(line, field, "mandatory attribute is missing or empty")
    }
}

/// Run-level error type.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("identity collision for {identity}: {message}")]
    IdentityCollision { identity: String, message: String },

    #[error("run aborted by hook '{hook}': {reason}")]
    HookAbort { hook: String, reason: String },

    #[error(transparent)]
    Store(#[from] DirectoryError),

    #[error("error budget exceeded: {failures} failures with {tolerated} tolerated")]
    ErrorBudgetExceeded { failures: usize, tolerated: usize },

    #[error("cannot read input: {message}")]
    Input { message: String },
}

impl From<csv::Error> for ImportError {
    fn from(err: csv::Error) -> Self {
        ImportError::Input {
            message: err.to_string(),
        }
    }
}

/// Result type for import operations.
pub type ImportResult<T> = Result<T, ImportError>;
