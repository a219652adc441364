//! Directory store trait
//!
//! The narrow interface the import engine uses to read and write entries.

use async_trait::async_trait;
use std::sync::Arc;

use crate::entry::{AttributeDelta, EntryKey, Filter, NewEntity, StoreEntity};
use crate::error::DirectoryResult;

/// A directory-backed identity store.
///
/// Every call may fail with a transient or permanent [`DirectoryError`].
/// Callers decide whether to retry by inspecting
/// [`DirectoryError::is_transient`].
///
/// [`DirectoryError`]: crate::error::DirectoryError
/// [`DirectoryError::is_transient`]: crate::error::DirectoryError::is_transient
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Display name used in logs.
    fn display_name(&self) -> &str;

    /// Read a single entry. Returns `Ok(None)` when the key is unknown.
    async fn get(&self, key: &EntryKey) -> DirectoryResult<Option<StoreEntity>>;

    /// Return every entry matching `filter`, ordered by key.
    async fn search(&self, filter: &Filter) -> DirectoryResult<Vec<StoreEntity>>;

    /// Create an entry and return its key.
    async fn create(&self, entity: NewEntity) -> DirectoryResult<EntryKey>;

    /// Apply an attribute delta to an existing entry.
    async fn modify(&self, key: &EntryKey, delta: &AttributeDelta) -> DirectoryResult<()>;

    /// Remove an entry.
    async fn delete(&self, key: &EntryKey) -> DirectoryResult<()>;

    /// Move an entry to another container and return its new key.
    async fn move_entry(&self, key: &EntryKey, new_container: &str) -> DirectoryResult<EntryKey>;

    /// Check if an entry exists under the given key.
    async fn exists(&self, key: &EntryKey) -> DirectoryResult<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

#[async_trait]
impl<T: DirectoryStore + ?Sized> DirectoryStore for Arc<T> {
    fn display_name(&self) -> &str {
        (**self).display_name()
    }

    async fn get(&self, key: &EntryKey) -> DirectoryResult<Option<StoreEntity>> {
        (**self).get(key).await
    }

    async fn search(&self, filter: &Filter) -> DirectoryResult<Vec<StoreEntity>> {
        (**self).search(filter).await
    }

    async fn create(&self, entity: NewEntity) -> DirectoryResult<EntryKey> {
        (**self).create(entity).await
    }

    async fn modify(&self, key: &EntryKey, delta: &AttributeDelta) -> DirectoryResult<()> {
        (**self).modify(key, delta).await
    }

    async fn delete(&self, key: &EntryKey) -> DirectoryResult<()> {
        (**self).delete(key).await
    }

    async fn move_entry(&self, key: &EntryKey, new_container: &str) -> DirectoryResult<EntryKey> {
        (**self).move_entry(key, new_container).await
    }
}
