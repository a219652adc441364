//! # Roster Import
//!
//! Import and reconciliation engine that converges a directory store to an
//! authoritative roster feed.
//!
//! ## Overview
//!
//! - **Configuration**: [`ImportConfiguration`] JSON document, checked into a
//!   [`ValidatedConfig`] before any row is read
//! - **Mapping**: CSV rows become canonical [`Record`]s through column
//!   mapping, [`normalize()`] and scheme expressions
//! - **Identity**: records match store entities only by
//!   `(source_uid, record_uid)`
//! - **Planning**: [`Planner`] emits create, modify, move, delete and
//!   deferred-delete [`Action`]s
//! - **Execution**: [`ReconciliationExecutor`] applies actions with retries,
//!   timeouts, hooks and an error budget, or validates them in dry-run mode
//! - **Hooks**: [`ImportHook`]s at every stage, ordered in a [`HookRegistry`]
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  CSV reader  │──▶│ RecordMapper │──▶│   Planner    │──▶│   Executor   │
//! └──────────────┘   └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!                           │                  │                  │
//!                    ┌──────▼───────┐   ┌──────▼───────┐   ┌──────▼───────┐
//!                    │ SchemeSet +  │   │ IdentityIndex│   │    Hooks     │
//!                    │  usernames   │   │              │   │              │
//!                    └──────────────┘   └──────────────┘   └──────┬───────┘
//!                                                                 │
//!                                                       ┌─────────▼────────┐
//!                                                       │ dyn DirectoryStore│
//!                                                       └──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use rostersync_import::prelude::*;
//! use rostersync_directory::InMemoryDirectory;
//! use std::sync::Arc;
//!
//! let config = ImportConfiguration::load("import.json")?;
//! let store = Arc::new(InMemoryDirectory::new());
//! let engine = ImportEngine::new(config, store)?;
//! let result = engine.run(std::fs::File::open("roster.csv")?).await?;
//! std::process::exit(result.exit_code());
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod identity;
pub mod mapper;
pub mod normalize;
pub mod plan;
pub mod reader;
pub mod record;
pub mod report;
pub mod scheme;
pub mod username;

pub use config::{ImportConfiguration, RetrySettings, RoleScoped, UsernameSettings, ValidatedConfig};
pub use engine::{load_schools, ImportEngine};
pub use error::{ConfigurationError, ImportError, ImportResult, MappingError};
pub use executor::ReconciliationExecutor;
pub use hooks::{
    Dispatch, HeaderSwapHook, HookContext, HookCriticality, HookDefinition, HookDispatcher,
    HookError, HookOutcome, HookPayload, HookRegistration, HookRegistry, HookRegistryBuilder,
    HookResult, HookStage, ImportHook, RuleHook,
};
pub use identity::{IdentityIndex, IdentityResolver, MatchKind, Resolved};
pub use mapper::{MappedRecord, RecordMapper};
pub use normalize::{normalize, transliterate};
pub use plan::{Action, ActionKind, DeleteReason, Plan, Planner};
pub use reader::{read_csv, CsvInput, RawRow};
pub use record::{IdentityKey, Record, RecordAction, Role};
pub use report::{
    AbortReason, ActionOutcome, ActionReport, ErrorKind, RecordError, RunResult, RunStatistics,
    EXIT_ABORTED, EXIT_CONFIGURATION, EXIT_ERRORS, EXIT_OK,
};
pub use scheme::{SchemeExpression, SchemeSet};
pub use username::{UsernameAllocator, UsernameFormatter};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{ImportConfiguration, ValidatedConfig};
    pub use crate::engine::ImportEngine;
    pub use crate::error::{ConfigurationError, ImportError, ImportResult};
    pub use crate::hooks::{
        HookContext, HookCriticality, HookOutcome, HookPayload, HookRegistration, HookStage,
        ImportHook,
    };
    pub use crate::plan::{Action, ActionKind};
    pub use crate::record::{IdentityKey, Record, Role};
    pub use crate::report::{ActionOutcome, RunResult};
}
