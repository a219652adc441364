//! In-memory directory store
//!
//! A [`DirectoryStore`] backed by an ordered map, with optional JSON
//! snapshots on disk. Schools are entries with `object_class = school`;
//! user entries may only be created in or moved to an existing school.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::entry::{
    AttributeDelta, AttributeSet, AttributeValue, EntryKey, Filter, NewEntity, StoreEntity,
    CONTAINER_ATTRIBUTE,
};
use crate::error::{DirectoryError, DirectoryResult};
use crate::traits::DirectoryStore;

/// Attribute holding an entry's object class.
pub const OBJECT_CLASS_ATTRIBUTE: &str = "object_class";

/// Object class of school (container) entries.
pub const SCHOOL_OBJECT_CLASS: &str = "school";

/// Attributes that must be unique across all entries by default.
pub const DEFAULT_UNIQUE_ATTRIBUTES: &[&str] = &["username", "email"];

/// On-disk representation of the store.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub entries: Vec<StoreEntity>,
}

/// In-memory directory store.
#[derive(Debug)]
pub struct InMemoryDirectory {
    name: String,
    unique_attributes: Vec<String>,
    entries: RwLock<BTreeMap<EntryKey, StoreEntity>>,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            name: "memory".to_string(),
            unique_attributes: DEFAULT_UNIQUE_ATTRIBUTES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Replace the list of attributes with a uniqueness constraint.
    #[must_use]
    pub fn with_unique_attributes(mut self, attributes: &[&str]) -> Self {
        self.unique_attributes = attributes.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Build a store from a snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::new();
        let entries = snapshot
            .entries
            .into_iter()
            .map(|e| (e.key.clone(), e))
            .collect();
        Self {
            entries: RwLock::new(entries),
            ..store
        }
    }

    /// Load a store from a JSON snapshot. A missing file yields an empty store.
    pub async fn load_json(path: impl AsRef<Path>) -> DirectoryResult<Self> {
        let path = path.as_ref();
        let snapshot = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => {
                return Err(DirectoryError::storage(
                    format!("cannot read {}", path.display()),
                    e,
                ))
            }
        };
        info!(
            path = %path.display(),
            entries = snapshot.entries.len(),
            "Loaded directory snapshot"
        );
        let mut store = Self::from_snapshot(snapshot);
        store.name = path.display().to_string();
        Ok(store)
    }

    /// Write the current state as a JSON snapshot, replacing the file atomically.
    pub async fn save_json(&self, path: impl AsRef<Path>) -> DirectoryResult<()> {
        let path = path.as_ref();
        let snapshot = self.snapshot().await;
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| DirectoryError::storage(format!("cannot write {}", tmp.display()), e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| DirectoryError::storage(format!("cannot replace {}", path.display()), e))?;
        info!(
            path = %path.display(),
            entries = snapshot.entries.len(),
            "Saved directory snapshot"
        );
        Ok(())
    }

    /// Copy of all entries, ordered by key.
    pub async fn snapshot(&self) -> Snapshot {
        Snapshot {
            entries: self.entries.read().await.values().cloned().collect(),
        }
    }

    /// Add a school container.
    pub async fn add_school(&self, name: &str) {
        let key = school_key(name);
        let entity = StoreEntity {
            key: key.clone(),
            container: name.to_string(),
            attributes: AttributeSet::new()
                .with(OBJECT_CLASS_ATTRIBUTE, SCHOOL_OBJECT_CLASS)
                .with(CONTAINER_ATTRIBUTE, name),
        };
        self.entries.write().await.insert(key, entity);
    }

    /// Insert an entry as-is, bypassing constraint checks. Used to seed state.
    pub async fn insert_raw(&self, entity: StoreEntity) {
        self.entries.write().await.insert(entity.key.clone(), entity);
    }

    /// Number of non-school entries.
    pub async fn user_count(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| !is_school(e))
            .count()
    }

    fn check_unique(
        &self,
        entries: &BTreeMap<EntryKey, StoreEntity>,
        attributes: &AttributeSet,
        own_key: Option<&EntryKey>,
    ) -> DirectoryResult<()> {
        for name in &self.unique_attributes {
            let Some(AttributeValue::String(value)) = attributes.get(name) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            let clash = entries.values().any(|e| {
                Some(&e.key) != own_key && e.attributes.get_string(name) == Some(value.as_str())
            });
            if clash {
                return Err(DirectoryError::constraint_violation(
                    name.clone(),
                    format!("value '{value}' already in use"),
                ));
            }
        }
        Ok(())
    }
}

fn school_key(name: &str) -> EntryKey {
    EntryKey::from_raw(format!("{CONTAINER_ATTRIBUTE}={name}"))
}

fn is_school(entity: &StoreEntity) -> bool {
    entity.attribute(OBJECT_CLASS_ATTRIBUTE) == Some(SCHOOL_OBJECT_CLASS)
}

fn ensure_container(
    entries: &BTreeMap<EntryKey, StoreEntity>,
    container: &str,
) -> DirectoryResult<()> {
    if entries.contains_key(&school_key(container)) {
        Ok(())
    } else {
        Err(DirectoryError::InvalidContainer {
            container: container.to_string(),
        })
    }
}

#[async_trait]
impl DirectoryStore for InMemoryDirectory {
    fn display_name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &EntryKey) -> DirectoryResult<Option<StoreEntity>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn search(&self, filter: &Filter) -> DirectoryResult<Vec<StoreEntity>> {
        let entries = self.entries.read().await;
        let found: Vec<StoreEntity> = entries
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        debug!(filter = %filter, matches = found.len(), "Searched directory");
        Ok(found)
    }

    async fn create(&self, entity: NewEntity) -> DirectoryResult<EntryKey> {
        if entity.rdn.is_empty() {
            return Err(DirectoryError::InvalidRequest {
                message: "empty relative name".to_string(),
            });
        }
        let mut entries = self.entries.write().await;
        ensure_container(&entries, &entity.container)?;
        let key = entity.key();
        if entries.contains_key(&key) {
            return Err(DirectoryError::already_exists(key.as_str()));
        }
        self.check_unique(&entries, &entity.attributes, None)?;
        entries.insert(
            key.clone(),
            StoreEntity {
                key: key.clone(),
                container: entity.container,
                attributes: entity.attributes,
            },
        );
        debug!(key = %key, "Created entry");
        Ok(key)
    }

    async fn modify(&self, key: &EntryKey, delta: &AttributeDelta) -> DirectoryResult<()> {
        let mut entries = self.entries.write().await;
        let mut updated = entries
            .get(key)
            .cloned()
            .ok_or_else(|| DirectoryError::not_found(key.as_str()))?;
        delta.apply_to(&mut updated.attributes);
        self.check_unique(&entries, &updated.attributes, Some(key))?;
        entries.insert(key.clone(), updated);
        debug!(key = %key, attributes = ?delta.affected_attributes(), "Modified entry");
        Ok(())
    }

    async fn delete(&self, key: &EntryKey) -> DirectoryResult<()> {
        let mut entries = self.entries.write().await;
        if entries.remove(key).is_none() {
            return Err(DirectoryError::not_found(key.as_str()));
        }
        debug!(key = %key, "Deleted entry");
        Ok(())
    }

    async fn move_entry(&self, key: &EntryKey, new_container: &str) -> DirectoryResult<EntryKey> {
        let mut entries = self.entries.write().await;
        ensure_container(&entries, new_container)?;
        let rdn = key
            .rdn()
            .ok_or_else(|| DirectoryError::InvalidRequest {
                message: format!("malformed key {key}"),
            })?
            .to_string();
        let new_key = EntryKey::new(&rdn, new_container);
        if new_key != *key && entries.contains_key(&new_key) {
            return Err(DirectoryError::already_exists(new_key.as_str()));
        }
        let mut entity = entries
            .remove(key)
            .ok_or_else(|| DirectoryError::not_found(key.as_str()))?;
        entity.key = new_key.clone();
        entity.container = new_container.to_string();
        entries.insert(new_key.clone(), entity);
        debug!(from = %key, to = %new_key, "Moved entry");
        Ok(new_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> InMemoryDirectory {
        let store = InMemoryDirectory::new();
        store.add_school("SchoolA").await;
        store.add_school("SchoolB").await;
        store
    }

    fn user(rdn: &str, school: &str) -> NewEntity {
        NewEntity::new(
            rdn,
            school,
            AttributeSet::new()
                .with("username", rdn)
                .with("source_uid", "sis"),
        )
    }

    #[tokio::test]
    async fn test_create_requires_existing_container() {
        let store = store().await;
        let err = store.create(user("a.b", "Nowhere")).await.unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidContainer { .. }));

        let key = store.create(user("a.b", "SchoolA")).await.unwrap();
        assert_eq!(key.as_str(), "uid=a.b,ou=SchoolA");
        assert_eq!(store.user_count().await, 1);
    }

    #[tokio::test]
    async fn test_unique_attributes_are_enforced() {
        let store = store().await;
        store.create(user("a.b", "SchoolA")).await.unwrap();
        let err = store.create(user("a.b", "SchoolB")).await.unwrap_err();
        assert!(matches!(err, DirectoryError::ConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn test_modify_and_delete_missing_entry() {
        let store = store().await;
        let key = EntryKey::new("ghost", "SchoolA");
        let mut delta = AttributeDelta::new();
        delta.replace("firstname", "Casper");
        assert!(matches!(
            store.modify(&key, &delta).await,
            Err(DirectoryError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete(&key).await,
            Err(DirectoryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_move_changes_key_and_container() {
        let store = store().await;
        let key = store.create(user("a.b", "SchoolA")).await.unwrap();
        let new_key = store.move_entry(&key, "SchoolB").await.unwrap();

        assert_eq!(new_key.as_str(), "uid=a.b,ou=SchoolB");
        assert!(store.get(&key).await.unwrap().is_none());
        let moved = store.get(&new_key).await.unwrap().unwrap();
        assert_eq!(moved.container, "SchoolB");
    }

    #[tokio::test]
    async fn test_search_excludes_non_matching() {
        let store = store().await;
        store.create(user("a.b", "SchoolA")).await.unwrap();
        let schools = store
            .search(&Filter::eq(OBJECT_CLASS_ATTRIBUTE, SCHOOL_OBJECT_CLASS))
            .await
            .unwrap();
        assert_eq!(schools.len(), 2);

        let users = store.search(&Filter::eq("source_uid", "sis")).await.unwrap();
        assert_eq!(users.len(), 1);
    }

    #[tokio::test]
    async fn test_json_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = store().await;
        store.create(user("a.b", "SchoolA")).await.unwrap();
        store.save_json(&path).await.unwrap();

        let loaded = InMemoryDirectory::load_json(&path).await.unwrap();
        assert_eq!(loaded.user_count().await, 1);
        assert!(loaded
            .exists(&EntryKey::new("a.b", "SchoolA"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = InMemoryDirectory::load_json(dir.path().join("absent.json"))
            .await
            .unwrap();
        assert_eq!(loaded.user_count().await, 0);
    }
}
