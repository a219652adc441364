//! Run result report.
//!
//! Everything a run did, or would have done in dry-run mode, ends up in a
//! [`RunResult`]. Dry-run and execute failures share the same shape.

use chrono::{DateTime, Utc};
use rostersync_directory::EntryKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::plan::ActionKind;
use crate::record::IdentityKey;

/// Exit code of a run without recorded errors.
pub const EXIT_OK: i32 = 0;
/// Exit code of a run that finished with recorded errors.
pub const EXIT_ERRORS: i32 = 1;
/// Exit code of an aborted run.
pub const EXIT_ABORTED: i32 = 2;
/// Exit code for a rejected configuration.
pub const EXIT_CONFIGURATION: i32 = 3;

/// What happened to one planned action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied,
    WouldApply,
    WouldFail,
    Failed,
    /// Skipped by a hook.
    Skipped,
}

impl ActionOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOutcome::Applied => "applied",
            ActionOutcome::WouldApply => "would_apply",
            ActionOutcome::WouldFail => "would_fail",
            ActionOutcome::Failed => "failed",
            ActionOutcome::Skipped => "skipped",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ActionOutcome::Failed | ActionOutcome::WouldFail)
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-action report line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReport {
    pub kind: ActionKind,
    /// Entity the action targeted; for a create, the key it received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<EntryKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityKey>,
    pub outcome: ActionOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Error category of a [`RecordError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Mapping,
    IdentityCollision,
    Hook,
    Store,
    Timeout,
    Validation,
}

/// One row- or action-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    /// Pipeline stage, e.g. `map` or `pre-create`.
    pub stage: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl RecordError {
    pub fn new(stage: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            identity: None,
            line: None,
            stage: stage.into(),
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_identity(mut self, identity: Option<IdentityKey>) -> Self {
        self.identity = identity;
        self
    }

    #[must_use]
    pub fn with_line(mut self, line: usize) -> Self {
        self.line = (line > 0).then_some(line);
        self
    }
}

/// Why a run stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    HookAbort { hook: String, reason: String },
    ErrorBudgetExceeded { failures: usize, tolerated: usize },
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::HookAbort { hook, reason } => {
                write!(f, "aborted by hook '{hook}': {reason}")
            }
            AbortReason::ErrorBudgetExceeded {
                failures,
                tolerated,
            } => write!(
                f,
                "error budget exceeded: {failures} failures with {tolerated} tolerated"
            ),
            AbortReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatistics {
    #[serde(default)]
    pub created: u32,
    #[serde(default)]
    pub modified: u32,
    #[serde(default)]
    pub moved: u32,
    #[serde(default)]
    pub deleted: u32,
    #[serde(default)]
    pub deferred: u32,
    #[serde(default)]
    pub skipped: u32,
    /// Row and action failures, one per entry in `RunResult::errors`.
    #[serde(default)]
    pub failed: u32,
    /// Records that matched their entity without any difference.
    #[serde(default)]
    pub unchanged: u32,
}

impl RunStatistics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an action outcome. Dry-run `would_apply` counts like `applied`.
    pub fn record_action(&mut self, kind: ActionKind, outcome: ActionOutcome) {
        match outcome {
            ActionOutcome::Applied | ActionOutcome::WouldApply => match kind {
                ActionKind::Create => self.created += 1,
                ActionKind::Modify => self.modified += 1,
                ActionKind::Move => self.moved += 1,
                ActionKind::Delete => self.deleted += 1,
                ActionKind::DeferredDelete => self.deferred += 1,
            },
            // failures are counted with their error, see `RunResult::push_error`
            ActionOutcome::Failed | ActionOutcome::WouldFail => {}
            ActionOutcome::Skipped => self.skipped += 1,
        }
    }

    /// Count of entities changed (or that would change).
    #[must_use]
    pub fn changed(&self) -> u32 {
        self.created + self.modified + self.moved + self.deleted + self.deferred
    }
}

/// Result of one import run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub source_uid: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub statistics: RunStatistics,
    pub actions: Vec<ActionReport>,
    pub errors: Vec<RecordError>,
    /// Entities absent from the input but kept because of `no_delete`.
    pub not_present: Vec<EntryKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort: Option<AbortReason>,
}

impl RunResult {
    pub fn new(run_id: Uuid, source_uid: impl Into<String>, dry_run: bool) -> Self {
        Self {
            run_id,
            source_uid: source_uid.into(),
            started_at: Utc::now(),
            finished_at: None,
            dry_run,
            statistics: RunStatistics::new(),
            actions: Vec::new(),
            errors: Vec::new(),
            not_present: Vec::new(),
            abort: None,
        }
    }

    /// Number of failures counted against `tolerate_errors`.
    pub fn failure_count(&self) -> usize {
        self.errors.len()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.abort.is_none() && self.errors.is_empty()
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.abort.is_some() {
            EXIT_ABORTED
        } else if !self.errors.is_empty() {
            EXIT_ERRORS
        } else {
            EXIT_OK
        }
    }

    pub fn push_action(&mut self, report: ActionReport) {
        self.statistics.record_action(report.kind, report.outcome);
        self.actions.push(report);
    }

    /// Record an error; every error counts as one failure.
    pub fn push_error(&mut self, error: RecordError) {
        self.statistics.failed += 1;
        self.errors.push(error);
    }

    /// Record a failure and check the error budget.
    ///
    /// Returns `true` and sets the abort reason once more than `tolerated`
    /// failures have been recorded.
    pub fn record_failure(&mut self, error: RecordError, tolerated: usize) -> bool {
        self.push_error(error);
        let failures = self.failure_count();
        if failures > tolerated {
            self.abort = Some(AbortReason::ErrorBudgetExceeded {
                failures,
                tolerated,
            });
            true
        } else {
            false
        }
    }

    /// Reports for actions of one kind.
    pub fn actions_of(&self, kind: ActionKind) -> impl Iterator<Item = &ActionReport> {
        self.actions.iter().filter(move |a| a.kind == kind)
    }

    pub(crate) fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}
