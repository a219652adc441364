//! Import engine.
//!
//! The run surface: takes a configuration and an input feed, drives the
//! pipeline stages in order and returns the [`RunResult`].
//!
//! ```text
//!  CSV ─▶ read ─▶ pre-read hooks ─▶ map ─▶ usernames ─▶ plan ─▶ execute
//!                      │             │         │                  │
//!                      └─ skip ──────┴─ error ─┴──▶ protected     └─▶ RunResult
//! ```
//!
//! Only [`ConfigurationError`]s, unreadable input and a store that cannot
//! be read at the start of a run surface as `Err`. Everything after that
//! lands in the report.

use chrono::{DateTime, Utc};
use rostersync_directory::{
    DirectoryResult, DirectoryStore, EntryKey, Filter, OBJECT_CLASS_ATTRIBUTE,
    SCHOOL_OBJECT_CLASS,
};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ImportConfiguration, ValidatedConfig};
use crate::error::{ConfigurationError, ImportError, ImportResult, MappingError};
use crate::executor::ReconciliationExecutor;
use crate::hooks::{
    Dispatch, HeaderSwapHook, HookContext, HookDispatcher, HookPayload, HookRegistration,
    HookRegistry, HookStage,
};
use crate::identity::{IdentityIndex, MatchKind};
use crate::mapper::{MappedRecord, RecordMapper};
use crate::plan::{Plan, Planner};
use crate::reader::read_csv;
use crate::record::{fields, IdentityKey};
use crate::report::{AbortReason, ErrorKind, RecordError, RunResult};
use crate::scheme::Rendered;
use crate::username::{with_implicit_counter, UsernameAllocator, UsernameFormatter};

const STAGE_READ: &str = "read";
const STAGE_MAP: &str = "map";
const STAGE_USERNAME: &str = "username";

fn error_kind(error: &ImportError) -> ErrorKind {
    match error {
        ImportError::IdentityCollision { .. } => ErrorKind::IdentityCollision,
        ImportError::Store(_) => ErrorKind::Store,
        ImportError::HookAbort { .. } => ErrorKind::Hook,
        _ => ErrorKind::Mapping,
    }
}

/// Names of the schools (OUs) known to the store.
pub async fn load_schools(store: &dyn DirectoryStore) -> DirectoryResult<BTreeSet<String>> {
    let schools = store
        .search(&Filter::eq(OBJECT_CLASS_ATTRIBUTE, SCHOOL_OBJECT_CLASS))
        .await?;
    Ok(schools.into_iter().map(|s| s.container).collect())
}

/// Runs imports of one configuration against one store.
pub struct ImportEngine {
    config: ValidatedConfig,
    store: Arc<dyn DirectoryStore>,
    registrations: Vec<HookRegistration>,
    cancel: CancellationToken,
}

impl ImportEngine {
    /// Check `config` and build an engine. Fails before any row is read.
    pub fn new(
        config: ImportConfiguration,
        store: Arc<dyn DirectoryStore>,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self::from_validated(config.validate()?, store))
    }

    pub fn from_validated(config: ValidatedConfig, store: Arc<dyn DirectoryStore>) -> Self {
        Self {
            config,
            store,
            registrations: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Register a programmatic hook in addition to the configured ones.
    #[must_use]
    pub fn with_hook(mut self, registration: HookRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the document's `dry_run` flag.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.config.set_dry_run(dry_run);
        self
    }

    /// Token that cancels the current run when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    fn registry(&self) -> Result<HookRegistry, ConfigurationError> {
        let raw = self.config.raw();
        let mut builder = HookRegistry::builder();
        if !raw.header_swap.is_empty() {
            builder = builder.register(
                HookStage::PreRead,
                i32::MIN,
                Arc::new(HeaderSwapHook::new(raw.header_swap.clone())),
            );
        }
        for definition in &raw.hooks {
            if let Some(registration) = definition.clone().into_registration()? {
                builder = builder.add(registration);
            }
        }
        for registration in &self.registrations {
            builder = builder.add(registration.clone());
        }
        Ok(builder.build())
    }

    /// Run one import now.
    pub async fn run(&self, input: impl Read) -> ImportResult<RunResult> {
        self.run_at(input, Utc::now()).await
    }

    /// Run one import as if the clock read `now`.
    #[instrument(skip(self, input), fields(source_uid = %self.config.source_uid(), dry_run = self.config.is_dry_run()))]
    pub async fn run_at(&self, input: impl Read, now: DateTime<Utc>) -> ImportResult<RunResult> {
        let raw = self.config.raw();
        let run_id = Uuid::new_v4();
        let mut result = RunResult::new(run_id, self.config.source_uid(), self.config.is_dry_run());
        let dispatcher = HookDispatcher::new(
            Arc::new(self.registry()?),
            HookContext {
                run_id,
                source_uid: self.config.source_uid().to_string(),
                dry_run: self.config.is_dry_run(),
            },
        );
        info!(run_id = %run_id, "Import run started");

        let input = read_csv(input, raw.csv_delimiter as u8)?;
        debug!(rows = input.rows.len(), headers = ?input.headers, "Read input");
        for error in input.errors {
            let error = RecordError::new(STAGE_READ, ErrorKind::Mapping, error.message)
                .with_line(error.line);
            if result.record_failure(error, raw.tolerate_errors) {
                return Ok(finish(result));
            }
        }

        let store = self.store.as_ref();
        let schools = load_schools(store).await?;
        let index =
            IdentityIndex::load(store, self.config.source_uid(), raw.legacy_username_matching)
                .await?;
        let mapper = RecordMapper::new(&self.config).with_schools(&schools);
        let mut protected: BTreeSet<IdentityKey> = BTreeSet::new();
        let mut seen: BTreeMap<IdentityKey, usize> = BTreeMap::new();
        let mut pending: Vec<MappedRecord> = Vec::new();

        for row in input.rows {
            if self.cancel.is_cancelled() {
                warn!(line = row.line, "Run cancelled while reading rows");
                result.abort = Some(AbortReason::Cancelled);
                return Ok(finish(result));
            }
            let line = row.line;
            let hint = mapper.peek_identity(&row);

            let row = match dispatcher.dispatch(HookStage::PreRead, HookPayload::Row(row)).await {
                Dispatch::Continue(HookPayload::Row(row)) => row,
                Dispatch::Continue(_) => {
                    warn!(line, "Pre-read hooks returned no row");
                    continue;
                }
                Dispatch::SkipRecord { hook, reason } => {
                    debug!(line, hook = %hook, reason = %reason, "Row skipped");
                    result.statistics.skipped += 1;
                    protected.extend(hint);
                    continue;
                }
                Dispatch::Abort { hook, reason } => {
                    result.abort = Some(AbortReason::HookAbort { hook, reason });
                    return Ok(finish(result));
                }
                Dispatch::Failed { hook, error } => {
                    protected.extend(hint.clone());
                    let error = RecordError::new(
                        HookStage::PreRead.as_str(),
                        ErrorKind::Hook,
                        format!("hook '{hook}': {error}"),
                    )
                    .with_identity(hint)
                    .with_line(line);
                    if result.record_failure(error, raw.tolerate_errors) {
                        return Ok(finish(result));
                    }
                    continue;
                }
            };

            let mapped = match mapper.map(&row) {
                Ok(mapped) => mapped,
                Err(e) => {
                    let identity = mapper.peek_identity(&row).or(hint);
                    protected.extend(identity.clone());
                    let error = RecordError::new(STAGE_MAP, ErrorKind::Mapping, e.message)
                        .with_identity(identity)
                        .with_line(e.line);
                    if result.record_failure(error, raw.tolerate_errors) {
                        return Ok(finish(result));
                    }
                    continue;
                }
            };

            let identity = mapped.identity();
            if let Some(&first_line) = seen.get(&identity) {
                let error = RecordError::new(
                    STAGE_MAP,
                    ErrorKind::IdentityCollision,
                    format!("record_uid already used on line {first_line}"),
                )
                .with_identity(Some(identity))
                .with_line(line);
                if result.record_failure(error, raw.tolerate_errors) {
                    return Ok(finish(result));
                }
                continue;
            }
            seen.insert(identity, line);
            pending.push(mapped);
        }

        // Usernames are settled once the input is complete, so that names
        // freed by deletions running first can be handed out again.
        let planner = Planner::new(&self.config, now);
        let released = planner.vacated_usernames(&pending, &index, &protected);
        if !released.is_empty() {
            debug!(count = released.len(), "Usernames released by planned deletions");
        }
        let mut allocator = UsernameAllocator::new(raw.username.max_counter_attempts)
            .with_released(released.clone());
        let mut adopted: BTreeMap<EntryKey, IdentityKey> = BTreeMap::new();
        let mut records: Vec<MappedRecord> = Vec::with_capacity(pending.len());

        for mut mapped in pending {
            if !mapped.record.is_delete_request() {
                if let Err(e) = self
                    .assign_username(&mut mapped, &index, &mut allocator, &mut adopted, &mapper)
                    .await
                {
                    let identity = mapped.identity();
                    protected.insert(identity.clone());
                    let error = RecordError::new(STAGE_USERNAME, error_kind(&e), e.to_string())
                        .with_identity(Some(identity))
                        .with_line(mapped.line());
                    if result.record_failure(error, raw.tolerate_errors) {
                        return Ok(finish(result));
                    }
                    continue;
                }
            }
            records.push(mapped);
        }

        let Plan {
            actions,
            not_present,
            unchanged,
            errors,
        } = planner.plan(records, &index, &protected);
        for error in errors {
            if result.record_failure(error, raw.tolerate_errors) {
                return Ok(finish(result));
            }
        }
        result.not_present = not_present;
        result.statistics.unchanged = unchanged.len() as u32;

        let executor = ReconciliationExecutor::new(store, &self.config, &dispatcher, &schools)
            .with_cancellation(self.cancel.clone())
            .with_released_usernames(released);
        let result = executor.execute(actions, result).await;
        Ok(finish(result))
    }

    /// Settle the record's username.
    ///
    /// A matched entity keeps its stored username; otherwise a unique one is
    /// allocated from the scheme rendering or the delivered column. A legacy
    /// entity is adopted by the first record claiming it; later claims fail.
    async fn assign_username(
        &self,
        mapped: &mut MappedRecord,
        index: &IdentityIndex,
        allocator: &mut UsernameAllocator,
        adopted: &mut BTreeMap<EntryKey, IdentityKey>,
        mapper: &RecordMapper<'_>,
    ) -> ImportResult<()> {
        let identity = mapped.identity();
        let line = mapped.line();
        let resolved = index.resolve(&mapped.record, mapped.delivered_username.as_deref())?;
        if let Some(r) = resolved.as_ref().filter(|r| r.via == MatchKind::LegacyUsername) {
            if let Some(owner) = adopted.get(&r.entity.key) {
                return Err(ImportError::IdentityCollision {
                    identity: identity.to_string(),
                    message: format!("legacy entity {} already adopted by {owner}", r.entity.key),
                });
            }
            adopted.insert(r.entity.key.clone(), identity.clone());
        }
        let stored = resolved
            .as_ref()
            .and_then(|r| r.entity.attribute(fields::USERNAME))
            .map(str::to_string);

        let username = match stored {
            Some(stored) => {
                allocator.reserve(stored.clone(), identity);
                stored
            }
            None => {
                let formatter = UsernameFormatter::for_role(&self.config, mapped.record.role);
                let template = match (&mapped.username_template, &mapped.delivered_username) {
                    (Some(rendered), _) => {
                        formatter.format_template(&with_implicit_counter(rendered.clone()))
                    }
                    (None, Some(delivered)) => Rendered {
                        prefix: formatter.format(delivered, false),
                        counter: None,
                        suffix: String::new(),
                    },
                    (None, None) => return Err(MappingError::missing(line, fields::USERNAME).into()),
                };
                allocator
                    .allocate(&template, &identity, line, self.store.as_ref())
                    .await?
            }
        };

        mapped.record.set(fields::USERNAME, username);
        mapper.rerender_dependents(&mut mapped.record, fields::USERNAME)?;
        Ok(())
    }
}

fn finish(mut result: RunResult) -> RunResult {
    result.finish();
    let stats = &result.statistics;
    info!(
        run_id = %result.run_id,
        created = stats.created,
        modified = stats.modified,
        moved = stats.moved,
        deleted = stats.deleted,
        deferred = stats.deferred,
        skipped = stats.skipped,
        unchanged = stats.unchanged,
        failed = result.failure_count(),
        aborted = ?result.abort,
        "Import run finished"
    );
    result
}
