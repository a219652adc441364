//! Retries, timeouts, error budget, hooks and cancellation.

mod common;

use async_trait::async_trait;
use common::{config, csv, day, find, store, FlakyStore, LostReplyStore, SlowStore};
use rostersync_directory::{AttributeSet, EntryKey, StoreEntity};
use rostersync_import::{
    AbortReason, ActionOutcome, ErrorKind, HookContext, HookCriticality, HookError, HookOutcome,
    HookPayload, HookRegistration, HookResult, HookStage, ImportEngine, ImportHook, EXIT_ABORTED,
    EXIT_ERRORS,
};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Store failures
// ============================================================================

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let inner = store().await;
    let flaky = Arc::new(FlakyStore::new(inner.clone(), 2));
    let engine = ImportEngine::new(config(serde_json::json!({})), flaky.clone()).unwrap();

    let result = engine
        .run_at(csv(&["1,Anna,Berg,SchoolA"]).as_bytes(), day(1))
        .await
        .unwrap();

    assert!(result.is_success(), "{:?}", result.errors);
    assert_eq!(result.statistics.created, 1);
    assert_eq!(flaky.writes.load(Ordering::SeqCst), 3);
    assert!(find(inner.as_ref(), "1").await.is_some());
}

#[tokio::test]
async fn test_retry_budget_exhaustion_fails_the_action() {
    let inner = store().await;
    let flaky = Arc::new(FlakyStore::new(inner.clone(), 10));
    let engine = ImportEngine::new(
        config(serde_json::json!({"retry": {"max_retries": 1, "initial_backoff_ms": 1, "max_backoff_ms": 1}})),
        flaky,
    )
    .unwrap();

    let result = engine
        .run_at(csv(&["1,Anna,Berg,SchoolA"]).as_bytes(), day(1))
        .await
        .unwrap();

    assert_eq!(result.errors[0].kind, ErrorKind::Store);
    assert_eq!(result.actions[0].outcome, ActionOutcome::Failed);
    assert_eq!(inner.user_count().await, 0);
}

#[tokio::test]
async fn test_create_retried_after_lost_reply_is_not_duplicated() {
    let inner = store().await;
    let lossy = Arc::new(LostReplyStore::new(inner.clone()));
    let engine = ImportEngine::new(config(serde_json::json!({})), lossy).unwrap();

    let result = engine
        .run_at(csv(&["1,Anna,Berg,SchoolA"]).as_bytes(), day(1))
        .await
        .unwrap();

    assert!(result.is_success(), "{:?}", result.errors);
    assert_eq!(result.statistics.created, 1);
    assert_eq!(inner.user_count().await, 1);
}

#[tokio::test]
async fn test_slow_action_times_out_and_run_continues() {
    let inner = store().await;
    let slow = Arc::new(SlowStore::new(inner.clone(), Duration::from_millis(500)));
    let engine = ImportEngine::new(
        config(serde_json::json!({"action_timeout_ms": 20, "tolerate_errors": 5})),
        slow,
    )
    .unwrap();

    let result = engine
        .run_at(
            csv(&["1,Anna,Berg,SchoolA", "2,Eva,Kurz,SchoolA"]).as_bytes(),
            day(1),
        )
        .await
        .unwrap();

    assert_eq!(result.errors.len(), 2);
    assert!(result.errors.iter().all(|e| e.kind == ErrorKind::Timeout));
    assert!(result.abort.is_none());
    assert_eq!(result.exit_code(), EXIT_ERRORS);
}

// ============================================================================
// Error budget
// ============================================================================

#[tokio::test]
async fn test_error_budget_aborts_the_run() {
    let store = store().await;
    let engine = ImportEngine::new(
        config(serde_json::json!({"tolerate_errors": 1})),
        store.clone(),
    )
    .unwrap();

    let result = engine
        .run_at(
            csv(&[
                "1,Anna,Berg,Nowhere",
                "2,Eva,Kurz,Nowhere",
                "3,Tom,Lang,SchoolA",
            ])
            .as_bytes(),
            day(1),
        )
        .await
        .unwrap();

    assert_eq!(
        result.abort,
        Some(AbortReason::ErrorBudgetExceeded {
            failures: 2,
            tolerated: 1
        })
    );
    assert_eq!(result.exit_code(), EXIT_ABORTED);
    assert_eq!(store.user_count().await, 0);
}

#[tokio::test]
async fn test_budget_abort_keeps_committed_actions() {
    let store = store().await;
    store
        .insert_raw(StoreEntity {
            key: EntryKey::new("kurz.eva", "SchoolB"),
            container: "SchoolB".to_string(),
            attributes: AttributeSet::new()
                .with("source_uid", "hr")
                .with("record_uid", "55")
                .with("username", "kurz.eva")
                .with("email", "e.kurz@schule.example"),
        })
        .await;
    let engine = ImportEngine::new(config(serde_json::json!({})), store.clone()).unwrap();

    let result = engine
        .run_at(
            csv(&["1,Anna,Berg,SchoolA", "2,Eva,Kurz,SchoolA", "3,Tom,Lang,SchoolA"]).as_bytes(),
            day(1),
        )
        .await
        .unwrap();

    assert_eq!(
        result.abort,
        Some(AbortReason::ErrorBudgetExceeded {
            failures: 1,
            tolerated: 0
        })
    );
    assert_eq!(result.errors[0].kind, ErrorKind::Store);
    assert!(find(store.as_ref(), "1").await.is_some());
    assert!(find(store.as_ref(), "3").await.is_none());
}

// ============================================================================
// Hooks
// ============================================================================

#[tokio::test]
async fn test_rule_hook_abort_stops_run_without_rollback() {
    let store = store().await;
    let engine = ImportEngine::new(
        config(serde_json::json!({
            "hooks": [{
                "name": "stopper",
                "stage": "pre-create",
                "rules": ["abort_if:lastname=Stop"]
            }]
        })),
        store.clone(),
    )
    .unwrap();

    let result = engine
        .run_at(
            csv(&["1,Anna,Berg,SchoolA", "2,Eva,Stop,SchoolA", "3,Tom,Lang,SchoolA"]).as_bytes(),
            day(1),
        )
        .await
        .unwrap();

    match &result.abort {
        Some(AbortReason::HookAbort { hook, .. }) => assert_eq!(hook, "stopper"),
        other => panic!("expected hook abort, got {other:?}"),
    }
    assert_eq!(result.exit_code(), EXIT_ABORTED);
    assert_eq!(store.user_count().await, 1);
    assert!(find(store.as_ref(), "1").await.is_some());
}

#[tokio::test]
async fn test_pre_read_skip_protects_entity() {
    let store = store().await;
    let engine = ImportEngine::new(
        config(serde_json::json!({
            "hooks": [{
                "name": "freeze",
                "stage": "pre-read",
                "rules": ["skip_if_prefix:Nachname=~"]
            }]
        })),
        store.clone(),
    )
    .unwrap();

    engine
        .run_at(
            csv(&["1,Anna,Berg,SchoolA", "2,Eva,Kurz,SchoolA"]).as_bytes(),
            day(1),
        )
        .await
        .unwrap();
    let result = engine
        .run_at(
            csv(&["1,Anna,Berg,SchoolA", "2,Eva,~Kurz,SchoolA"]).as_bytes(),
            day(2),
        )
        .await
        .unwrap();

    assert_eq!(result.statistics.skipped, 1);
    assert!(result.is_success());
    assert!(find(store.as_ref(), "2").await.is_some());
}

#[tokio::test]
async fn test_rule_hook_rewrites_action_before_commit() {
    let store = store().await;
    let engine = ImportEngine::new(
        config(serde_json::json!({
            "hooks": [{
                "name": "tag",
                "stage": "pre-create",
                "rules": ["set:department=imported"]
            }]
        })),
        store.clone(),
    )
    .unwrap();

    engine
        .run_at(csv(&["1,Anna,Berg,SchoolA"]).as_bytes(), day(1))
        .await
        .unwrap();

    let entity = find(store.as_ref(), "1").await.unwrap();
    assert_eq!(entity.attribute("department"), Some("imported"));
}

/// Records committed keys and cancels the run after the first commit.
struct CommitSpy {
    seen: Mutex<Vec<String>>,
    cancel: Option<CancellationToken>,
}

#[async_trait]
impl ImportHook for CommitSpy {
    fn name(&self) -> &str {
        "commit-spy"
    }

    async fn call(
        &self,
        _stage: HookStage,
        payload: HookPayload,
        _context: &HookContext,
    ) -> HookResult<HookOutcome> {
        if let HookPayload::Committed(event) = &payload {
            if let Some(key) = &event.key {
                self.seen.lock().unwrap().push(key.to_string());
            }
        }
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        Ok(HookOutcome::Continue(payload))
    }
}

#[tokio::test]
async fn test_post_commit_sees_every_committed_action() {
    let store = store().await;
    let spy = Arc::new(CommitSpy {
        seen: Mutex::new(Vec::new()),
        cancel: None,
    });
    let engine = ImportEngine::new(config(serde_json::json!({})), store.clone())
        .unwrap()
        .with_hook(HookRegistration::new(HookStage::PostCommit, 0, spy.clone()));

    engine
        .run_at(
            csv(&["1,Anna,Berg,SchoolA", "2,Eva,Kurz,SchoolB"]).as_bytes(),
            day(1),
        )
        .await
        .unwrap();

    let seen = spy.seen.lock().unwrap().clone();
    assert_eq!(seen, vec!["uid=a.berg,ou=SchoolA", "uid=e.kurz,ou=SchoolB"]);
}

#[tokio::test]
async fn test_cancellation_stops_before_next_action() {
    let store = store().await;
    let engine = ImportEngine::new(config(serde_json::json!({})), store.clone()).unwrap();
    let spy = Arc::new(CommitSpy {
        seen: Mutex::new(Vec::new()),
        cancel: Some(engine.cancellation_token()),
    });
    let engine = engine.with_hook(HookRegistration::new(HookStage::PostCommit, 0, spy));

    let result = engine
        .run_at(
            csv(&["1,Anna,Berg,SchoolA", "2,Eva,Kurz,SchoolA"]).as_bytes(),
            day(1),
        )
        .await
        .unwrap();

    assert_eq!(result.abort, Some(AbortReason::Cancelled));
    assert_eq!(result.statistics.created, 1);
    assert_eq!(store.user_count().await, 1);
}

/// Always fails.
struct Broken;

#[async_trait]
impl ImportHook for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn call(
        &self,
        _stage: HookStage,
        _payload: HookPayload,
        _context: &HookContext,
    ) -> HookResult<HookOutcome> {
        Err(HookError::ExecutionFailed {
            message: "backend down".to_string(),
        })
    }
}

#[tokio::test]
async fn test_hook_criticality() {
    for (criticality, created, aborted) in [
        (HookCriticality::Ignore, 1, false),
        (HookCriticality::Partial, 0, false),
        (HookCriticality::Fatal, 0, true),
    ] {
        let store = store().await;
        let engine = ImportEngine::new(
            config(serde_json::json!({"tolerate_errors": 5})),
            store.clone(),
        )
        .unwrap()
        .with_hook(
            HookRegistration::new(HookStage::PreCreate, 0, Arc::new(Broken))
                .with_criticality(criticality),
        );

        let result = engine
            .run_at(csv(&["1,Anna,Berg,SchoolA"]).as_bytes(), day(1))
            .await
            .unwrap();

        assert_eq!(result.statistics.created, created, "{criticality:?}");
        assert_eq!(result.is_aborted(), aborted, "{criticality:?}");
    }
}
