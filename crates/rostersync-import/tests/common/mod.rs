//! Shared fixtures for import integration tests.
//!
//! The wrapper stores delegate to [`InMemoryDirectory`] and inject transient
//! failures or delays into write operations.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rostersync_directory::{
    AttributeDelta, DirectoryError, DirectoryResult, DirectoryStore, EntryKey, Filter,
    InMemoryDirectory, NewEntity, StoreEntity,
};
use rostersync_import::ImportConfiguration;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const HEADER: &str = "ID,Vorname,Nachname,Schule";

/// Configuration used by most scenarios; `extra` overrides top-level keys.
pub fn config(extra: serde_json::Value) -> ImportConfiguration {
    let mut doc = serde_json::json!({
        "source_uid": "sis",
        "csv_mapping": {
            "ID": "record_uid",
            "Vorname": "firstname",
            "Nachname": "lastname",
            "Schule": "school"
        },
        "normalize": {"firstname": true, "lastname": true},
        "scheme": {
            "username": "<firstname>[0].<lastname>",
            "email": "<username>@<maildomain>"
        },
        "scheme_variables": {"maildomain": "schule.example"},
        "user_role": "student",
        "retry": {"max_retries": 3, "initial_backoff_ms": 1, "max_backoff_ms": 5}
    });
    if let (Some(doc), Some(extra)) = (doc.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            doc.insert(k.clone(), v.clone());
        }
    }
    ImportConfiguration::from_json_str(&doc.to_string()).unwrap()
}

/// CSV text with the standard header.
pub fn csv(rows: &[&str]) -> String {
    let mut out = String::from(HEADER);
    out.push('\n');
    for row in rows {
        out.push_str(row);
        out.push('\n');
    }
    out
}

/// In-memory store with `SchoolA` and `SchoolB`.
pub async fn store() -> Arc<InMemoryDirectory> {
    let store = InMemoryDirectory::new();
    store.add_school("SchoolA").await;
    store.add_school("SchoolB").await;
    Arc::new(store)
}

pub fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, d, 7, 0, 0).unwrap()
}

pub async fn find(store: &dyn DirectoryStore, record_uid: &str) -> Option<StoreEntity> {
    store
        .search(&Filter::and(vec![
            Filter::eq("source_uid", "sis"),
            Filter::eq("record_uid", record_uid),
        ]))
        .await
        .unwrap()
        .pop()
}

/// Fails the first `failures` writes with a transient error.
pub struct FlakyStore {
    inner: Arc<InMemoryDirectory>,
    remaining: AtomicU32,
    pub writes: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryDirectory>, failures: u32) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(failures),
            writes: AtomicU32::new(0),
        }
    }

    fn trip(&self) -> DirectoryResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let tripped = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(DirectoryError::connection_failed("connection reset by peer"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DirectoryStore for FlakyStore {
    fn display_name(&self) -> &str {
        "flaky"
    }

    async fn get(&self, key: &EntryKey) -> DirectoryResult<Option<StoreEntity>> {
        self.inner.get(key).await
    }

    async fn search(&self, filter: &Filter) -> DirectoryResult<Vec<StoreEntity>> {
        self.inner.search(filter).await
    }

    async fn create(&self, entity: NewEntity) -> DirectoryResult<EntryKey> {
        self.trip()?;
        self.inner.create(entity).await
    }

    async fn modify(&self, key: &EntryKey, delta: &AttributeDelta) -> DirectoryResult<()> {
        self.trip()?;
        self.inner.modify(key, delta).await
    }

    async fn delete(&self, key: &EntryKey) -> DirectoryResult<()> {
        self.trip()?;
        self.inner.delete(key).await
    }

    async fn move_entry(&self, key: &EntryKey, new_container: &str) -> DirectoryResult<EntryKey> {
        self.trip()?;
        self.inner.move_entry(key, new_container).await
    }
}

/// Commits the first create but reports it as timed out, as a replica
/// that lost the answer would.
pub struct LostReplyStore {
    inner: Arc<InMemoryDirectory>,
    lost: AtomicU32,
}

impl LostReplyStore {
    pub fn new(inner: Arc<InMemoryDirectory>) -> Self {
        Self {
            inner,
            lost: AtomicU32::new(1),
        }
    }
}

#[async_trait]
impl DirectoryStore for LostReplyStore {
    fn display_name(&self) -> &str {
        "lost-reply"
    }

    async fn get(&self, key: &EntryKey) -> DirectoryResult<Option<StoreEntity>> {
        self.inner.get(key).await
    }

    async fn search(&self, filter: &Filter) -> DirectoryResult<Vec<StoreEntity>> {
        self.inner.search(filter).await
    }

    async fn create(&self, entity: NewEntity) -> DirectoryResult<EntryKey> {
        let key = self.inner.create(entity).await?;
        if self
            .lost
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DirectoryError::Timeout { timeout_ms: 100 });
        }
        Ok(key)
    }

    async fn modify(&self, key: &EntryKey, delta: &AttributeDelta) -> DirectoryResult<()> {
        self.inner.modify(key, delta).await
    }

    async fn delete(&self, key: &EntryKey) -> DirectoryResult<()> {
        self.inner.delete(key).await
    }

    async fn move_entry(&self, key: &EntryKey, new_container: &str) -> DirectoryResult<EntryKey> {
        self.inner.move_entry(key, new_container).await
    }
}

/// Delays every write by `delay`.
pub struct SlowStore {
    inner: Arc<InMemoryDirectory>,
    delay: Duration,
}

impl SlowStore {
    pub fn new(inner: Arc<InMemoryDirectory>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl DirectoryStore for SlowStore {
    fn display_name(&self) -> &str {
        "slow"
    }

    async fn get(&self, key: &EntryKey) -> DirectoryResult<Option<StoreEntity>> {
        self.inner.get(key).await
    }

    async fn search(&self, filter: &Filter) -> DirectoryResult<Vec<StoreEntity>> {
        self.inner.search(filter).await
    }

    async fn create(&self, entity: NewEntity) -> DirectoryResult<EntryKey> {
        tokio::time::sleep(self.delay).await;
        self.inner.create(entity).await
    }

    async fn modify(&self, key: &EntryKey, delta: &AttributeDelta) -> DirectoryResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.modify(key, delta).await
    }

    async fn delete(&self, key: &EntryKey) -> DirectoryResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete(key).await
    }

    async fn move_entry(&self, key: &EntryKey, new_container: &str) -> DirectoryResult<EntryKey> {
        tokio::time::sleep(self.delay).await;
        self.inner.move_entry(key, new_container).await
    }
}
