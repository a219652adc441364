//! Import hooks
//!
//! Ordered extension callbacks at fixed pipeline stages. A hook may rewrite
//! the payload for the hooks after it, skip the current record, or abort the
//! whole run. Hook failures are handled according to the hook's
//! [`HookCriticality`].
//!
//! The [`HookRegistry`] is assembled with a [`HookRegistryBuilder`] before a
//! run starts and cannot change afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rostersync_directory::EntryKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::ConfigurationError;
use crate::plan::Action;
use crate::reader::RawRow;

/// Hook execution errors.
#[derive(Debug, Error)]
pub enum HookError {
    /// The hook itself reported a failure.
    #[error("hook execution failed: {message}")]
    ExecutionFailed { message: String },

    /// The hook did not return within its registration timeout.
    #[error("hook timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The hook returned a payload that does not belong to the stage,
    /// e.g. a row from `pre-create`.
    #[error("hook returned a {returned} payload at stage {stage}")]
    PayloadMismatch { stage: HookStage, returned: String },
}

/// Result type for hook operations.
pub type HookResult<T> = Result<T, HookError>;

/// Pipeline stage a hook is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookStage {
    /// Raw row available, before mapping.
    PreRead,
    /// Before a new entity is created. The payload is the `Create` action.
    PreCreate,
    /// Before attributes of a matched entity are replaced.
    PreModify,
    /// Before an entity changes school.
    PreMove,
    /// Before a Delete or DeferredDelete.
    PreDelete,
    /// After an action has been committed to the store.
    PostCommit,
}

impl HookStage {
    #[must_use]
    pub fn all() -> &'static [HookStage] {
        &[
            HookStage::PreRead,
            HookStage::PreCreate,
            HookStage::PreModify,
            HookStage::PreMove,
            HookStage::PreDelete,
            HookStage::PostCommit,
        ]
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            HookStage::PreRead => "pre-read",
            HookStage::PreCreate => "pre-create",
            HookStage::PreModify => "pre-modify",
            HookStage::PreMove => "pre-move",
            HookStage::PreDelete => "pre-delete",
            HookStage::PostCommit => "post-commit",
        }
    }
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookStage::all()
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown hook stage '{s}'"))
    }
}

/// How to handle hook errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookCriticality {
    /// Hook failure aborts the run.
    Fatal,
    /// Hook failure fails the current record.
    #[default]
    Partial,
    /// Hook failure is logged; the payload continues unmodified.
    Ignore,
}

/// An action that has been committed, as seen by post-commit hooks.
#[derive(Debug, Clone, Serialize)]
pub struct CommitEvent {
    /// The action as executed, including hook rewrites.
    pub action: Action,
    /// Key of the entity after the action (absent after a delete).
    pub key: Option<EntryKey>,
}

/// What a hook sees and may rewrite.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum HookPayload {
    /// `pre-read` only.
    Row(RawRow),
    /// `pre-create`, `pre-modify`, `pre-move` and `pre-delete`. A rewrite
    /// must keep the action kind and target entity.
    Action(Action),
    /// `post-commit` only.
    Committed(CommitEvent),
}

impl HookPayload {
    fn kind(&self) -> &'static str {
        match self {
            HookPayload::Row(_) => "row",
            HookPayload::Action(_) => "action",
            HookPayload::Committed(_) => "committed",
        }
    }

    fn fits(&self, stage: HookStage) -> bool {
        matches!(
            (self, stage),
            (HookPayload::Row(_), HookStage::PreRead)
                | (HookPayload::Committed(_), HookStage::PostCommit)
                | (
                    HookPayload::Action(_),
                    HookStage::PreCreate
                        | HookStage::PreModify
                        | HookStage::PreMove
                        | HookStage::PreDelete
                )
        )
    }
}

/// Context passed to hooks during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookContext {
    /// Identifier shared by every hook call of one run.
    pub run_id: Uuid,
    /// Source system being imported.
    pub source_uid: String,
    /// Set when nothing is written; `post-commit` never fires then.
    pub dry_run: bool,
}

/// Value returned by a hook.
#[derive(Debug, Clone)]
pub enum HookOutcome {
    /// Hand the (possibly rewritten) payload to the next hook.
    Continue(HookPayload),
    /// Exclude the current record; counted as a non-fatal skip.
    SkipRecord { reason: String },
    /// Stop the whole run. Committed actions stay committed.
    Abort { reason: String },
}

/// An extension callback.
#[async_trait]
pub trait ImportHook: Send + Sync {
    fn name(&self) -> &str;

    async fn call(
        &self,
        stage: HookStage,
        payload: HookPayload,
        context: &HookContext,
    ) -> HookResult<HookOutcome>;
}

/// A hook bound to a stage.
#[derive(Clone)]
pub struct HookRegistration {
    pub hook: Arc<dyn ImportHook>,
    /// The one stage this registration fires at.
    pub stage: HookStage,
    /// Lower runs first; ties keep registration order.
    pub order: i32,
    /// What a failure or timeout of this hook does to the run.
    pub criticality: HookCriticality,
    /// Upper bound for a single call; exceeding it is a [`HookError::Timeout`].
    pub timeout: Duration,
}

impl fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistration")
            .field("hook", &self.hook.name())
            .field("stage", &self.stage)
            .field("order", &self.order)
            .field("criticality", &self.criticality)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HookRegistration {
    pub fn new(stage: HookStage, order: i32, hook: Arc<dyn ImportHook>) -> Self {
        Self {
            hook,
            stage,
            order,
            criticality: HookCriticality::default(),
            timeout: Duration::from_millis(default_timeout()),
        }
    }

    #[must_use]
    pub fn with_criticality(mut self, criticality: HookCriticality) -> Self {
        self.criticality = criticality;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Collects registrations before a run.
#[derive(Debug, Default)]
pub struct HookRegistryBuilder {
    registrations: Vec<HookRegistration>,
}

impl HookRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(self, stage: HookStage, order: i32, hook: Arc<dyn ImportHook>) -> Self {
        self.add(HookRegistration::new(stage, order, hook))
    }

    #[must_use]
    pub fn add(mut self, registration: HookRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    /// Freeze the registry.
    pub fn build(self) -> HookRegistry {
        let mut by_stage: BTreeMap<HookStage, Vec<HookRegistration>> = BTreeMap::new();
        for registration in self.registrations {
            by_stage
                .entry(registration.stage)
                .or_default()
                .push(registration);
        }
        for hooks in by_stage.values_mut() {
            // stable: equal ranks keep registration order
            hooks.sort_by_key(|h| h.order);
        }
        HookRegistry { by_stage }
    }
}

/// Stage → ordered hooks. Immutable once built.
#[derive(Debug, Default)]
pub struct HookRegistry {
    by_stage: BTreeMap<HookStage, Vec<HookRegistration>>,
}

impl HookRegistry {
    pub fn builder() -> HookRegistryBuilder {
        HookRegistryBuilder::new()
    }

    pub fn hooks_for(&self, stage: HookStage) -> &[HookRegistration] {
        self.by_stage.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_stage.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of dispatching a stage.
#[derive(Debug)]
pub enum Dispatch {
    /// Every hook passed; carries the final payload.
    Continue(HookPayload),
    /// `hook` excluded the record.
    SkipRecord { hook: String, reason: String },
    /// `hook` asked to stop, or a `fatal` hook failed.
    Abort { hook: String, reason: String },
    /// A `partial` hook failed; the record fails.
    Failed { hook: String, error: HookError },
}

/// Invokes registered hooks for a run.
#[derive(Debug, Clone)]
pub struct HookDispatcher {
    registry: Arc<HookRegistry>,
    context: HookContext,
}

impl HookDispatcher {
    pub fn new(registry: Arc<HookRegistry>, context: HookContext) -> Self {
        Self { registry, context }
    }

    pub fn context(&self) -> &HookContext {
        &self.context
    }

    pub fn has_hooks(&self, stage: HookStage) -> bool {
        !self.registry.hooks_for(stage).is_empty()
    }

    /// Run every hook registered for `stage` in order.
    #[instrument(skip_all, fields(stage = %stage))]
    pub async fn dispatch(&self, stage: HookStage, mut payload: HookPayload) -> Dispatch {
        let hooks = self.registry.hooks_for(stage);
        if hooks.is_empty() {
            return Dispatch::Continue(payload);
        }
        debug!(hook_count = hooks.len(), "Dispatching hooks");

        for registration in hooks {
            let name = registration.hook.name().to_string();
            let call = registration
                .hook
                .call(stage, payload.clone(), &self.context);
            let result = match tokio::time::timeout(registration.timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(HookError::Timeout {
                    timeout_ms: registration.timeout.as_millis() as u64,
                }),
            };
            let result = result.and_then(|outcome| match outcome {
                HookOutcome::Continue(p) if !p.fits(stage) => Err(HookError::PayloadMismatch {
                    stage,
                    returned: p.kind().to_string(),
                }),
                other => Ok(other),
            });

            match result {
                Ok(HookOutcome::Continue(next)) => payload = next,
                Ok(HookOutcome::SkipRecord { reason }) => {
                    info!(hook = %name, reason = %reason, "Hook skipped record");
                    return Dispatch::SkipRecord { hook: name, reason };
                }
                Ok(HookOutcome::Abort { reason }) => {
                    error!(hook = %name, reason = %reason, "Hook aborted run");
                    return Dispatch::Abort { hook: name, reason };
                }
                Err(e) => {
                    warn!(hook = %name, error = %e, "Hook execution failed");
                    match registration.criticality {
                        HookCriticality::Fatal => {
                            return Dispatch::Abort {
                                hook: name,
                                reason: e.to_string(),
                            }
                        }
                        HookCriticality::Partial => return Dispatch::Failed { hook: name, error: e },
                        HookCriticality::Ignore => debug!(hook = %name, "Ignoring hook failure"),
                    }
                }
            }
        }

        Dispatch::Continue(payload)
    }
}

// ----------------------------------------------------------------------------
// Built-in hooks
// ----------------------------------------------------------------------------

/// Renames delivered column headers before mapping.
#[derive(Debug, Clone)]
pub struct HeaderSwapHook {
    swaps: BTreeMap<String, String>,
}

impl HeaderSwapHook {
    pub fn new(swaps: BTreeMap<String, String>) -> Self {
        Self { swaps }
    }
}

#[async_trait]
impl ImportHook for HeaderSwapHook {
    fn name(&self) -> &str {
        "header-swap"
    }

    async fn call(
        &self,
        _stage: HookStage,
        payload: HookPayload,
        _context: &HookContext,
    ) -> HookResult<HookOutcome> {
        let HookPayload::Row(mut row) = payload else {
            return Ok(HookOutcome::Continue(payload));
        };
        for (from, to) in &self.swaps {
            if let Some(value) = row.cells.remove(from) {
                row.cells.insert(to.clone(), value);
            }
        }
        Ok(HookOutcome::Continue(HookPayload::Row(row)))
    }
}

/// A declarative hook from the configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookDefinition {
    /// Shown in logs and error reports.
    pub name: String,
    pub stage: HookStage,
    /// Position among the stage's hooks, lower first. Defaults to 0.
    #[serde(default)]
    pub order: i32,
    /// Defaults to `partial`.
    #[serde(default)]
    pub criticality: HookCriticality,
    /// Per-call timeout in milliseconds. Defaults to 30 seconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// A disabled definition is parsed but never checked or registered.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Rules applied in order, see [`Rule`].
    pub rules: Vec<String>,
}

fn default_timeout() -> u64 {
    30_000
}

fn default_enabled() -> bool {
    true
}

impl HookDefinition {
    pub fn check(&self) -> Result<(), ConfigurationError> {
        let invalid = |message: String| ConfigurationError::InvalidHook {
            hook: self.name.clone(),
            message,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if self.rules.is_empty() {
            return Err(invalid("at least one rule is required".to_string()));
        }
        self.parse_rules().map(|_| ()).map_err(invalid)
    }

    pub fn parse_rules(&self) -> Result<Vec<Rule>, String> {
        self.rules.iter().map(|r| r.parse()).collect()
    }

    /// Turn the definition into a registration. `None` when disabled.
    pub fn into_registration(self) -> Result<Option<HookRegistration>, ConfigurationError> {
        if !self.enabled {
            return Ok(None);
        }
        self.check()?;
        let rules = self.parse_rules().unwrap_or_default();
        let hook = RuleHook {
            name: self.name,
            rules,
        };
        Ok(Some(
            HookRegistration::new(self.stage, self.order, Arc::new(hook))
                .with_criticality(self.criticality)
                .with_timeout(Duration::from_millis(self.timeout_ms)),
        ))
    }
}

/// A single declarative rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    /// `set:<field>=<value>`
    Set { field: String, value: String },
    /// `remove:<field>`
    Remove { field: String },
    /// `skip_if:<field>=<value>`
    SkipIf { field: String, value: String },
    /// `skip_if_prefix:<field>=<prefix>`
    SkipIfPrefix { field: String, prefix: String },
    /// `abort_if:<field>=<value>`
    AbortIf { field: String, value: String },
}

impl FromStr for Rule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (verb, rest) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("rule '{s}' has no verb"))?;
        let pair = || {
            rest.split_once('=')
                .map(|(f, v)| (f.trim().to_string(), v.trim().to_string()))
                .filter(|(f, _)| !f.is_empty())
                .ok_or_else(|| format!("rule '{s}' expects <field>=<value>"))
        };
        match verb {
            "set" => pair().map(|(field, value)| Rule::Set { field, value }),
            "remove" if !rest.trim().is_empty() => Ok(Rule::Remove {
                field: rest.trim().to_string(),
            }),
            "skip_if" => pair().map(|(field, value)| Rule::SkipIf { field, value }),
            "skip_if_prefix" => pair().map(|(field, prefix)| Rule::SkipIfPrefix { field, prefix }),
            "abort_if" => pair().map(|(field, value)| Rule::AbortIf { field, value }),
            _ => Err(format!("unknown rule '{s}'")),
        }
    }
}

/// Applies [`Rule`]s to rows and actions.
#[derive(Debug, Clone)]
pub struct RuleHook {
    name: String,
    rules: Vec<Rule>,
}

impl RuleHook {
    pub fn new(name: impl Into<String>, rules: Vec<Rule>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }
}

fn read_field(payload: &HookPayload, field: &str) -> Option<String> {
    match payload {
        HookPayload::Row(row) => row.get(field).map(str::to_string),
        HookPayload::Action(action) => action.field(field),
        HookPayload::Committed(event) => event.action.field(field),
    }
}

fn write_field(payload: &mut HookPayload, field: &str, value: Option<String>) {
    match payload {
        HookPayload::Row(row) => match value {
            Some(v) => {
                row.cells.insert(field.to_string(), v);
            }
            None => {
                row.cells.remove(field);
            }
        },
        HookPayload::Action(action) => {
            if let Some(record) = action.record_mut() {
                match value {
                    Some(v) => record.set(field, v),
                    None => {
                        record.fields.remove(field);
                        record.extra_properties.remove(field);
                        record.multi_fields.remove(field);
                    }
                }
            }
        }
        HookPayload::Committed(_) => {}
    }
}

#[async_trait]
impl ImportHook for RuleHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        _stage: HookStage,
        mut payload: HookPayload,
        _context: &HookContext,
    ) -> HookResult<HookOutcome> {
        for rule in &self.rules {
            match rule {
                Rule::Set { field, value } => write_field(&mut payload, field, Some(value.clone())),
                Rule::Remove { field } => write_field(&mut payload, field, None),
                Rule::SkipIf { field, value } => {
                    if read_field(&payload, field).as_deref() == Some(value.as_str()) {
                        return Ok(HookOutcome::SkipRecord {
                            reason: format!("{field} is '{value}'"),
                        });
                    }
                }
                Rule::SkipIfPrefix { field, prefix } => {
                    if read_field(&payload, field).is_some_and(|v| v.starts_with(prefix.as_str())) {
                        return Ok(HookOutcome::SkipRecord {
                            reason: format!("{field} starts with '{prefix}'"),
                        });
                    }
                }
                Rule::AbortIf { field, value } => {
                    if read_field(&payload, field).as_deref() == Some(value.as_str()) {
                        return Ok(HookOutcome::Abort {
                            reason: format!("{field} is '{value}'"),
                        });
                    }
                }
            }
        }
        Ok(HookOutcome::Continue(payload))
    }
}
