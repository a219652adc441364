//! Reconciliation executor.
//!
//! Applies planned actions one at a time. Every action is wrapped in its
//! pre-stage hooks and, once committed, the `post-commit` hooks. Store
//! calls are retried on transient errors and the whole action is bounded
//! by `action_timeout_ms`. Nothing is ever rolled back.
//!
//! In dry-run mode each action is validated against the store instead of
//! applied, and reported as `would_apply` or `would_fail`.

use rostersync_directory::{
    DirectoryError, DirectoryResult, DirectoryStore, EntryKey, Filter, NewEntity, RetryExecutor,
    StoreEntity,
};
use std::collections::BTreeSet;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ValidatedConfig;
use crate::hooks::{CommitEvent, Dispatch, HookDispatcher, HookPayload, HookStage};
use crate::identity::IdentityResolver;
use crate::plan::{deferral_delta, diff, Action};
use crate::record::{fields, Record};
use crate::report::{AbortReason, ActionOutcome, ActionReport, ErrorKind, RecordError, RunResult};

/// Why applying one action failed.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Store(#[from] DirectoryError),

    #[error("action timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl ActionError {
    fn kind(&self) -> ErrorKind {
        match self {
            ActionError::Store(_) => ErrorKind::Store,
            ActionError::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

/// Control flow after one action.
enum Step {
    Next,
    Stop,
}

/// Applies a plan against the store.
pub struct ReconciliationExecutor<'a> {
    store: &'a dyn DirectoryStore,
    config: &'a ValidatedConfig,
    dispatcher: &'a HookDispatcher,
    schools: &'a BTreeSet<String>,
    retry: RetryExecutor,
    resolver: IdentityResolver,
    cancel: CancellationToken,
    /// Usernames freed by deletions that run before the creates.
    released: BTreeSet<String>,
}

impl<'a> ReconciliationExecutor<'a> {
    pub fn new(
        store: &'a dyn DirectoryStore,
        config: &'a ValidatedConfig,
        dispatcher: &'a HookDispatcher,
        schools: &'a BTreeSet<String>,
    ) -> Self {
        Self {
            store,
            config,
            dispatcher,
            schools,
            retry: RetryExecutor::new(config.retry_config()),
            resolver: IdentityResolver::new(config.raw().legacy_username_matching),
            cancel: CancellationToken::new(),
            released: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_released_usernames(mut self, usernames: BTreeSet<String>) -> Self {
        self.released = usernames;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    fn tolerated(&self) -> usize {
        self.config.raw().tolerate_errors
    }

    fn failed_outcome(&self) -> ActionOutcome {
        if self.config.is_dry_run() {
            ActionOutcome::WouldFail
        } else {
            ActionOutcome::Failed
        }
    }

    /// Execute `actions` in order, adding to `result`.
    pub async fn execute(&self, actions: Vec<Action>, mut result: RunResult) -> RunResult {
        let total = actions.len();
        for (position, action) in actions.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(
                    executed = position,
                    remaining = total - position,
                    "Run cancelled"
                );
                result.abort = Some(AbortReason::Cancelled);
                break;
            }
            if let Step::Stop = self.execute_one(action, &mut result).await {
                break;
            }
        }
        result
    }

    fn fail(
        &self,
        result: &mut RunResult,
        action: &Action,
        stage: &str,
        kind: ErrorKind,
        message: String,
        outcome: ActionOutcome,
    ) -> Step {
        warn!(
            kind = %action.kind(),
            key = ?action.entity_key().map(EntryKey::as_str),
            stage,
            error = %message,
            "Action failed"
        );
        result.push_action(ActionReport {
            kind: action.kind(),
            key: action.entity_key().cloned(),
            identity: action.identity(),
            outcome,
            message: Some(message.clone()),
        });
        let error = RecordError::new(stage, kind, message)
            .with_identity(action.identity())
            .with_line(action.record().map(|r| r.line).unwrap_or_default());
        if result.record_failure(error, self.tolerated()) {
            Step::Stop
        } else {
            Step::Next
        }
    }

    #[instrument(skip_all, fields(kind = %action.kind(), identity = ?action.identity()))]
    async fn execute_one(&self, mut action: Action, result: &mut RunResult) -> Step {
        let stage = action.hook_stage();
        match self
            .dispatcher
            .dispatch(stage, HookPayload::Action(action.clone()))
            .await
        {
            Dispatch::Continue(HookPayload::Action(mut rewritten)) => {
                if rewritten != action {
                    if let Err(message) = rewritten.check_rewrite(&action) {
                        return self.fail(
                            result,
                            &action,
                            stage.as_str(),
                            ErrorKind::Hook,
                            message,
                            self.failed_outcome(),
                        );
                    }
                    rewritten.refresh_delta();
                    action = rewritten;
                }
            }
            Dispatch::Continue(_) => {}
            Dispatch::SkipRecord { hook, reason } => {
                info!(hook = %hook, reason = %reason, "Action skipped by hook");
                result.push_action(ActionReport {
                    kind: action.kind(),
                    key: action.entity_key().cloned(),
                    identity: action.identity(),
                    outcome: ActionOutcome::Skipped,
                    message: Some(reason),
                });
                return Step::Next;
            }
            Dispatch::Abort { hook, reason } => {
                result.abort = Some(AbortReason::HookAbort { hook, reason });
                return Step::Stop;
            }
            Dispatch::Failed { hook, error } => {
                return self.fail(
                    result,
                    &action,
                    stage.as_str(),
                    ErrorKind::Hook,
                    format!("hook '{hook}': {error}"),
                    self.failed_outcome(),
                );
            }
        }

        if self.config.is_dry_run() {
            return match self.validate(&action).await {
                Ok(()) => {
                    result.push_action(ActionReport {
                        kind: action.kind(),
                        key: action.entity_key().cloned(),
                        identity: action.identity(),
                        outcome: ActionOutcome::WouldApply,
                        message: None,
                    });
                    Step::Next
                }
                Err(message) => self.fail(
                    result,
                    &action,
                    "validate",
                    ErrorKind::Validation,
                    message,
                    ActionOutcome::WouldFail,
                ),
            };
        }

        let timeout = self.config.action_timeout();
        let applied = match tokio::time::timeout(timeout, self.apply(&action)).await {
            Ok(Ok(key)) => key,
            Ok(Err(e)) => {
                let e = ActionError::from(e);
                return self.fail(
                    result,
                    &action,
                    "execute",
                    e.kind(),
                    e.to_string(),
                    ActionOutcome::Failed,
                );
            }
            Err(_) => {
                let e = ActionError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                };
                return self.fail(
                    result,
                    &action,
                    "execute",
                    e.kind(),
                    e.to_string(),
                    ActionOutcome::Failed,
                );
            }
        };

        debug!(key = ?applied.as_ref().map(EntryKey::as_str), "Action applied");
        result.push_action(ActionReport {
            kind: action.kind(),
            key: applied.clone().or_else(|| action.entity_key().cloned()),
            identity: action.identity(),
            outcome: ActionOutcome::Applied,
            message: None,
        });

        let committed = HookPayload::Committed(CommitEvent {
            action: action.clone(),
            key: applied,
        });
        match self.dispatcher.dispatch(HookStage::PostCommit, committed).await {
            Dispatch::Continue(_) => Step::Next,
            Dispatch::SkipRecord { hook, .. } => {
                debug!(hook = %hook, "Skip after commit has no effect");
                Step::Next
            }
            Dispatch::Abort { hook, reason } => {
                result.abort = Some(AbortReason::HookAbort { hook, reason });
                Step::Stop
            }
            Dispatch::Failed { hook, error } => {
                let error = RecordError::new(
                    HookStage::PostCommit.as_str(),
                    ErrorKind::Hook,
                    format!("hook '{hook}': {error}"),
                )
                .with_identity(action.identity());
                if result.record_failure(error, self.tolerated()) {
                    Step::Stop
                } else {
                    Step::Next
                }
            }
        }
    }

    /// Apply one action. Returns the entity key after the action, if any.
    async fn apply(&self, action: &Action) -> DirectoryResult<Option<EntryKey>> {
        let store = self.store;
        match action {
            Action::Create { record } => self.create(record).await.map(Some),
            Action::Modify { entity, delta, .. } => {
                if !delta.is_empty() {
                    self.retry
                        .execute(|_| async move { store.modify(&entity.key, delta).await })
                        .await?;
                }
                Ok(Some(entity.key.clone()))
            }
            Action::Move {
                entity,
                new_school,
                delta,
                ..
            } => {
                let new_key = self.move_entry(&entity.key, new_school).await?;
                if !delta.is_empty() {
                    let key = &new_key;
                    self.retry
                        .execute(|_| async move { store.modify(key, delta).await })
                        .await?;
                }
                Ok(Some(new_key))
            }
            Action::Delete { entity, .. } => {
                self.retry
                    .execute(|_| async move {
                        match store.delete(&entity.key).await {
                            Err(DirectoryError::NotFound { .. }) => {
                                debug!(key = %entity.key, "Entity already gone");
                                Ok(())
                            }
                            other => other,
                        }
                    })
                    .await?;
                Ok(None)
            }
            Action::DeferredDelete {
                entity,
                grace_deadline,
            } => {
                let delta = &deferral_delta(*grace_deadline);
                self.retry
                    .execute(|_| async move { store.modify(&entity.key, delta).await })
                    .await?;
                Ok(Some(entity.key.clone()))
            }
        }
    }

    /// The single entity carrying the record's identity, if any.
    async fn existing(&self, record: &Record) -> DirectoryResult<Option<StoreEntity>> {
        let mut found = self.resolver.lookup(&record.identity(), self.store).await?;
        match found.len() {
            0 | 1 => Ok(found.pop()),
            n => Err(DirectoryError::constraint_violation(
                fields::RECORD_UID,
                format!("{n} entities carry identity {}", record.identity()),
            )),
        }
    }

    async fn converge(&self, existing: &StoreEntity, record: &Record) -> DirectoryResult<EntryKey> {
        let delta = diff(existing, record);
        if !delta.is_empty() {
            self.store.modify(&existing.key, &delta).await?;
        }
        Ok(existing.key.clone())
    }

    fn new_entity(&self, record: &Record) -> DirectoryResult<NewEntity> {
        let username = record
            .username()
            .ok_or_else(|| DirectoryError::InvalidRequest {
                message: format!("record {} has no username", record.identity()),
            })?;
        let mut attributes = record.desired_attributes();
        let disabled = !self.config.activate_new_user(record.role);
        attributes.set(fields::DISABLED, disabled.to_string());
        Ok(NewEntity::new(username, record.school.as_str(), attributes))
    }

    /// Create that degrades to modify when an earlier attempt already
    /// created the entity.
    async fn create(&self, record: &Record) -> DirectoryResult<EntryKey> {
        let entity = self.new_entity(record)?;
        let entity = &entity;
        self.retry
            .execute(|attempt| async move {
                if let Some(existing) = self.existing(record).await? {
                    debug!(attempt, key = %existing.key, "Entity already exists, converging");
                    return self.converge(&existing, record).await;
                }
                match self.store.create(entity.clone()).await {
                    Err(e @ DirectoryError::AlreadyExists { .. }) => {
                        match self.existing(record).await? {
                            Some(existing) => self.converge(&existing, record).await,
                            None => Err(e),
                        }
                    }
                    other => other,
                }
            })
            .await
    }

    /// Move that accepts an earlier attempt having already moved the entry.
    async fn move_entry(&self, key: &EntryKey, new_school: &str) -> DirectoryResult<EntryKey> {
        let store = self.store;
        self.retry
            .execute(|_| async move {
                match store.move_entry(key, new_school).await {
                    Err(e @ DirectoryError::NotFound { .. }) => {
                        let Some(rdn) = key.rdn() else {
                            return Err(e);
                        };
                        let target = EntryKey::new(rdn, new_school);
                        match store.get(&target).await? {
                            Some(_) => Ok(target),
                            None => Err(e),
                        }
                    }
                    other => other,
                }
            })
            .await
    }

    /// Dry-run check of one action.
    async fn validate(&self, action: &Action) -> Result<(), String> {
        match action {
            Action::Create { record } => {
                for field in &self.config.raw().mandatory_attributes {
                    if !record.is_present(field) {
                        return Err(format!("mandatory attribute '{field}' is missing"));
                    }
                }
                if !self.schools.contains(&record.school) {
                    return Err(format!("school '{}' does not exist", record.school));
                }
                match self.existing(record).await {
                    Ok(Some(existing)) => {
                        return Err(format!(
                            "identity {} already exists as {}",
                            record.identity(),
                            existing.key
                        ))
                    }
                    Ok(None) => {}
                    Err(e) => return Err(e.to_string()),
                }
                if let Some(username) = record.username().filter(|u| !self.released.contains(*u)) {
                    let owners = self
                        .store
                        .search(&Filter::eq(fields::USERNAME, username))
                        .await
                        .map_err(|e| e.to_string())?;
                    if !owners.is_empty() {
                        return Err(format!("username '{username}' is already in use"));
                    }
                }
                Ok(())
            }
            Action::Move { new_school, .. } if !self.schools.contains(new_school) => {
                Err(format!("school '{new_school}' does not exist"))
            }
            other => {
                let Some(key) = other.entity_key() else {
                    return Ok(());
                };
                match self.store.get(key).await {
                    Ok(Some(_)) => Ok(()),
                    Ok(None) => Err(format!("entity {key} no longer exists")),
                    Err(e) => Err(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImportConfiguration;
    use crate::hooks::{HookContext, HookOutcome, HookRegistry, HookResult, ImportHook, RuleHook};
    use crate::plan::DeleteReason;
    use crate::record::Role;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use rostersync_directory::{AttributeSet, InMemoryDirectory};
    use std::sync::Arc;
    use uuid::Uuid;

    fn config(extra: serde_json::Value) -> ValidatedConfig {
        let mut doc = serde_json::json!({
            "source_uid": "sis",
            "csv_mapping": {
                "Vorname": "firstname",
                "Nachname": "lastname",
                "Schule": "school",
                "ID": "record_uid",
                "Benutzer": "username"
            },
            "user_role": "student",
            "tolerate_errors": 5,
            "retry": {"max_retries": 0}
        });
        if let (Some(doc), Some(extra)) = (doc.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                doc.insert(k.clone(), v.clone());
            }
        }
        ImportConfiguration::from_json_str(&doc.to_string())
            .unwrap()
            .validate()
            .unwrap()
    }

    fn dispatcher(registry: HookRegistry) -> HookDispatcher {
        HookDispatcher::new(
            Arc::new(registry),
            HookContext {
                run_id: Uuid::new_v4(),
                source_uid: "sis".to_string(),
                dry_run: false,
            },
        )
    }

    fn record(uid: &str, school: &str) -> Record {
        Record::new("sis", Role::Student)
            .with("record_uid", uid)
            .with("school", school)
            .with("firstname", "Anna")
            .with("lastname", "Mueller")
            .with("username", format!("user{uid}"))
    }

    async fn store() -> InMemoryDirectory {
        let store = InMemoryDirectory::new();
        store.add_school("SchoolA").await;
        store.add_school("SchoolB").await;
        store.add_school("SchoolC").await;
        store
    }

    fn schools() -> BTreeSet<String> {
        ["SchoolA", "SchoolB", "SchoolC"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    async fn seed(store: &InMemoryDirectory, record: &Record) -> StoreEntity {
        let key = store
            .create(NewEntity::new(
                record.username().unwrap(),
                record.school.as_str(),
                record.desired_attributes(),
            ))
            .await
            .unwrap();
        store.get(&key).await.unwrap().unwrap()
    }

    fn result(dry_run: bool) -> RunResult {
        RunResult::new(Uuid::new_v4(), "sis", dry_run)
    }

    #[tokio::test]
    async fn test_create_applies_and_disables_per_role() {
        let store = store().await;
        let config = config(serde_json::json!({"activate_new_users": {"student": false}}));
        let dispatcher = dispatcher(HookRegistry::default());
        let schools = schools();
        let executor = ReconciliationExecutor::new(&store, &config, &dispatcher, &schools);

        let out = executor
            .execute(vec![Action::Create { record: record("1", "SchoolA") }], result(false))
            .await;

        assert_eq!(out.statistics.created, 1);
        let entity = store
            .get(&EntryKey::new("user1", "SchoolA"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.attribute(fields::DISABLED), Some("true"));
        assert_eq!(entity.attribute(fields::RECORD_UID), Some("1"));
    }

    #[tokio::test]
    async fn test_create_converges_on_existing_identity() {
        let store = store().await;
        let mut stored = record("1", "SchoolA");
        stored.set(fields::LASTNAME, "Old".to_string());
        seed(&store, &stored).await;

        let config = config(serde_json::json!({}));
        let dispatcher = dispatcher(HookRegistry::default());
        let schools = schools();
        let executor = ReconciliationExecutor::new(&store, &config, &dispatcher, &schools);
        let out = executor
            .execute(vec![Action::Create { record: record("1", "SchoolA") }], result(false))
            .await;

        assert!(out.errors.is_empty());
        assert_eq!(store.user_count().await, 1);
        let entity = store
            .get(&EntryKey::new("user1", "SchoolA"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.attribute(fields::LASTNAME), Some("Mueller"));
    }

    #[tokio::test]
    async fn test_delete_of_missing_entity_succeeds() {
        let store = store().await;
        let config = config(serde_json::json!({}));
        let dispatcher = dispatcher(HookRegistry::default());
        let schools = schools();
        let executor = ReconciliationExecutor::new(&store, &config, &dispatcher, &schools);

        let entity = StoreEntity {
            key: EntryKey::new("gone", "SchoolA"),
            container: "SchoolA".to_string(),
            attributes: AttributeSet::new(),
        };
        let out = executor
            .execute(
                vec![Action::Delete {
                    entity,
                    reason: DeleteReason::Absent,
                }],
                result(false),
            )
            .await;
        assert_eq!(out.statistics.deleted, 1);
        assert!(out.errors.is_empty());
    }

    #[tokio::test]
    async fn test_deferred_delete_writes_marker() {
        let store = store().await;
        let entity = seed(&store, &record("1", "SchoolA")).await;
        let config = config(serde_json::json!({}));
        let dispatcher = dispatcher(HookRegistry::default());
        let schools = schools();
        let executor = ReconciliationExecutor::new(&store, &config, &dispatcher, &schools);
        let deadline = Utc.with_ymd_and_hms(2026, 10, 21, 8, 0, 0).unwrap();

        let out = executor
            .execute(
                vec![Action::DeferredDelete {
                    entity: entity.clone(),
                    grace_deadline: deadline,
                }],
                result(false),
            )
            .await;
        assert_eq!(out.statistics.deferred, 1);
        let stored = store.get(&entity.key).await.unwrap().unwrap();
        assert_eq!(stored.attribute(fields::DISABLED), Some("true"));
        assert_eq!(
            stored.attribute(fields::DELETION_DEADLINE),
            Some(deadline.to_rfc3339().as_str())
        );
    }

    #[tokio::test]
    async fn test_move_changes_container_and_attributes() {
        let store = store().await;
        let entity = seed(&store, &record("1", "SchoolA")).await;
        let mut moved = record("1", "SchoolB");
        moved.set(fields::LASTNAME, "Schmidt".to_string());
        let delta = diff(&entity, &moved);

        let config = config(serde_json::json!({}));
        let dispatcher = dispatcher(HookRegistry::default());
        let schools = schools();
        let executor = ReconciliationExecutor::new(&store, &config, &dispatcher, &schools);
        let out = executor
            .execute(
                vec![Action::Move {
                    entity,
                    record: moved,
                    old_school: "SchoolA".to_string(),
                    new_school: "SchoolB".to_string(),
                    delta,
                }],
                result(false),
            )
            .await;

        assert_eq!(out.statistics.moved, 1);
        assert_eq!(out.actions[0].key, Some(EntryKey::new("user1", "SchoolB")));
        let stored = store
            .get(&EntryKey::new("user1", "SchoolB"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.attribute(fields::LASTNAME), Some("Schmidt"));
    }

    #[tokio::test]
    async fn test_dry_run_validates_without_writing() {
        let store = store().await;
        let config = config(serde_json::json!({"dry_run": true}));
        let dispatcher = dispatcher(HookRegistry::default());
        let schools = schools();
        let executor = ReconciliationExecutor::new(&store, &config, &dispatcher, &schools);

        let out = executor
            .execute(
                vec![
                    Action::Create { record: record("1", "SchoolA") },
                    Action::Create { record: record("2", "Nowhere") },
                ],
                result(true),
            )
            .await;

        assert_eq!(out.actions[0].outcome, ActionOutcome::WouldApply);
        assert_eq!(out.actions[1].outcome, ActionOutcome::WouldFail);
        assert_eq!(out.errors[0].kind, ErrorKind::Validation);
        assert_eq!(store.user_count().await, 0);
    }

    struct SkipAll;

    #[async_trait]
    impl ImportHook for SkipAll {
        fn name(&self) -> &str {
            "skip-all"
        }

        async fn call(
            &self,
            _stage: HookStage,
            _payload: HookPayload,
            _context: &HookContext,
        ) -> HookResult<HookOutcome> {
            Ok(HookOutcome::SkipRecord {
                reason: "frozen".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_pre_hook_skip_leaves_store_alone() {
        let store = store().await;
        let config = config(serde_json::json!({}));
        let registry = HookRegistry::builder()
            .register(HookStage::PreCreate, 0, Arc::new(SkipAll))
            .build();
        let dispatcher = dispatcher(registry);
        let schools = schools();
        let executor = ReconciliationExecutor::new(&store, &config, &dispatcher, &schools);

        let out = executor
            .execute(vec![Action::Create { record: record("1", "SchoolA") }], result(false))
            .await;
        assert_eq!(out.statistics.skipped, 1);
        assert_eq!(out.actions[0].outcome, ActionOutcome::Skipped);
        assert_eq!(store.user_count().await, 0);
    }

    fn rewriting(stage: HookStage, rule: &str) -> HookDispatcher {
        let hook = RuleHook::new("rewrite", vec![rule.parse().unwrap()]);
        dispatcher(HookRegistry::builder().register(stage, 0, Arc::new(hook)).build())
    }

    #[tokio::test]
    async fn test_rewritten_move_follows_new_school() {
        let store = store().await;
        let entity = seed(&store, &record("1", "SchoolA")).await;
        let target = record("1", "SchoolB");
        let delta = diff(&entity, &target);

        let config = config(serde_json::json!({}));
        let dispatcher = rewriting(HookStage::PreMove, "set:school=SchoolC");
        let schools = schools();
        let executor = ReconciliationExecutor::new(&store, &config, &dispatcher, &schools);
        let out = executor
            .execute(
                vec![Action::Move {
                    entity,
                    record: target,
                    old_school: "SchoolA".to_string(),
                    new_school: "SchoolB".to_string(),
                    delta,
                }],
                result(false),
            )
            .await;

        assert!(out.errors.is_empty(), "{:?}", out.errors);
        assert_eq!(out.actions[0].key, Some(EntryKey::new("user1", "SchoolC")));
        assert!(store
            .get(&EntryKey::new("user1", "SchoolB"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_hook_cannot_turn_modify_into_move() {
        let store = store().await;
        let entity = seed(&store, &record("1", "SchoolA")).await;
        let mut renamed = record("1", "SchoolA");
        renamed.set(fields::LASTNAME, "Schmidt".to_string());
        let delta = diff(&entity, &renamed);

        let config = config(serde_json::json!({}));
        let dispatcher = rewriting(HookStage::PreModify, "set:school=SchoolB");
        let schools = schools();
        let executor = ReconciliationExecutor::new(&store, &config, &dispatcher, &schools);
        let out = executor
            .execute(
                vec![Action::Modify {
                    entity: entity.clone(),
                    record: renamed,
                    delta,
                }],
                result(false),
            )
            .await;

        assert_eq!(out.actions[0].outcome, ActionOutcome::Failed);
        assert_eq!(out.errors[0].kind, ErrorKind::Hook);
        assert_eq!(out.errors[0].stage, "pre-modify");
        let stored = store.get(&entity.key).await.unwrap().unwrap();
        assert_eq!(stored.attribute(fields::LASTNAME), Some("Mueller"));
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_before_first_action() {
        let store = store().await;
        let config = config(serde_json::json!({}));
        let dispatcher = dispatcher(HookRegistry::default());
        let schools = schools();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let executor = ReconciliationExecutor::new(&store, &config, &dispatcher, &schools)
            .with_cancellation(cancel);

        let out = executor
            .execute(vec![Action::Create { record: record("1", "SchoolA") }], result(false))
            .await;
        assert_eq!(out.abort, Some(AbortReason::Cancelled));
        assert!(out.actions.is_empty());
    }
}
