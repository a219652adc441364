//! Identity resolution.
//!
//! A record is matched to its store entity exclusively by
//! `(source_uid, record_uid)`. Names, schools and roles may change between
//! runs without producing a second entity.
//!
//! Legacy entities, created before identity attributes were written, carry
//! no `source_uid`. They are only considered when
//! `legacy_username_matching` is enabled, and then only by username within
//! the same school.

use rostersync_directory::{
    DirectoryResult, DirectoryStore, Filter, StoreEntity, OBJECT_CLASS_ATTRIBUTE,
    SCHOOL_OBJECT_CLASS,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::ImportError;
use crate::record::{fields, IdentityKey, Record};

/// How a record was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Identity,
    /// Adopted through `legacy_username_matching`.
    LegacyUsername,
}

/// A resolved store entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub entity: StoreEntity,
    pub via: MatchKind,
}

fn identity_filter(identity: &IdentityKey) -> Filter {
    Filter::and(vec![
        Filter::eq(fields::SOURCE_UID, identity.source_uid.as_str()),
        Filter::eq(fields::RECORD_UID, identity.record_uid.as_str()),
    ])
}

fn collision(identity: &IdentityKey, count: usize) -> ImportError {
    ImportError::IdentityCollision {
        identity: identity.to_string(),
        message: format!("{count} store entities carry this identity"),
    }
}

fn legacy_candidate<'a>(
    record: &Record,
    username: &str,
    entities: impl IntoIterator<Item = &'a StoreEntity>,
) -> Option<&'a StoreEntity> {
    entities.into_iter().find(|e| {
        e.attribute(fields::SOURCE_UID).is_none()
            && e.attribute(fields::USERNAME) == Some(username)
            && e.container == record.school
    })
}

/// Resolves records against the live store.
///
/// Used by the executor to re-check identities right before a create.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver {
    legacy_username_matching: bool,
}

impl IdentityResolver {
    pub fn new(legacy_username_matching: bool) -> Self {
        Self {
            legacy_username_matching,
        }
    }

    /// Every entity carrying `identity`. More than one is a collision.
    pub async fn lookup(
        &self,
        identity: &IdentityKey,
        store: &dyn DirectoryStore,
    ) -> DirectoryResult<Vec<StoreEntity>> {
        store.search(&identity_filter(identity)).await
    }

    /// Find the entity for `record`.
    ///
    /// `delivered_username` is the username from the input feed, used only
    /// for legacy matching.
    pub async fn resolve(
        &self,
        record: &Record,
        delivered_username: Option<&str>,
        store: &dyn DirectoryStore,
    ) -> Result<Option<Resolved>, ImportError> {
        let identity = record.identity();
        let mut found = self.lookup(&identity, store).await?;
        match found.len() {
            0 => {}
            1 => {
                return Ok(found.pop().map(|entity| Resolved {
                    entity,
                    via: MatchKind::Identity,
                }))
            }
            n => return Err(collision(&identity, n)),
        }

        let Some(username) = delivered_username.filter(|_| self.legacy_username_matching) else {
            return Ok(None);
        };
        let candidates = store.search(&Filter::eq(fields::USERNAME, username)).await?;
        Ok(legacy_candidate(record, username, &candidates).map(|entity| {
            warn!(
                identity = %identity,
                key = %entity.key,
                "Matched legacy entity by username"
            );
            Resolved {
                entity: entity.clone(),
                via: MatchKind::LegacyUsername,
            }
        }))
    }
}

/// Snapshot of every entity a run may touch, indexed by identity.
///
/// Built once before planning so that resolution and deletion planning see
/// the same view of the store.
#[derive(Debug, Clone, Default)]
pub struct IdentityIndex {
    source_uid: String,
    by_identity: BTreeMap<IdentityKey, Vec<StoreEntity>>,
    legacy: Vec<StoreEntity>,
    legacy_username_matching: bool,
}

impl IdentityIndex {
    /// Build an index from already-fetched entities.
    ///
    /// Entities of other sources and entities without a `record_uid` are
    /// never indexed, so they can never be planned for deletion.
    pub fn new(
        source_uid: &str,
        entities: Vec<StoreEntity>,
        legacy_username_matching: bool,
    ) -> Self {
        let mut index = Self {
            source_uid: source_uid.to_string(),
            legacy_username_matching,
            ..Self::default()
        };
        for entity in entities {
            if entity.attribute(OBJECT_CLASS_ATTRIBUTE) == Some(SCHOOL_OBJECT_CLASS) {
                continue;
            }
            match (
                entity.attribute(fields::SOURCE_UID),
                entity.attribute(fields::RECORD_UID),
            ) {
                (Some(source), Some(record_uid)) if source == source_uid => {
                    let identity = IdentityKey::new(source, record_uid);
                    index.by_identity.entry(identity).or_default().push(entity);
                }
                (Some(source), None) if source == source_uid => {
                    warn!(key = %entity.key, "Entity carries source_uid but no record_uid");
                }
                (None, _) if legacy_username_matching => index.legacy.push(entity),
                _ => {}
            }
        }
        debug!(
            source_uid = %index.source_uid,
            identities = index.by_identity.len(),
            legacy = index.legacy.len(),
            "Built identity index"
        );
        index
    }

    /// Fetch every relevant entity from the store and index it.
    pub async fn load(
        store: &dyn DirectoryStore,
        source_uid: &str,
        legacy_username_matching: bool,
    ) -> DirectoryResult<Self> {
        let mut entities = store
            .search(&Filter::eq(fields::SOURCE_UID, source_uid))
            .await?;
        if legacy_username_matching {
            let legacy = store
                .search(&Filter::and(vec![
                    Filter::negate(Filter::present(fields::SOURCE_UID)),
                    Filter::present(fields::USERNAME),
                ]))
                .await?;
            entities.extend(legacy);
        }
        Ok(Self::new(source_uid, entities, legacy_username_matching))
    }

    pub fn source_uid(&self) -> &str {
        &self.source_uid
    }

    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }

    /// Resolve a record against the snapshot.
    pub fn resolve(
        &self,
        record: &Record,
        delivered_username: Option<&str>,
    ) -> Result<Option<Resolved>, ImportError> {
        let identity = record.identity();
        if let Some(entities) = self.by_identity.get(&identity) {
            return match entities.as_slice() {
                [entity] => Ok(Some(Resolved {
                    entity: entity.clone(),
                    via: MatchKind::Identity,
                })),
                many => Err(collision(&identity, many.len())),
            };
        }
        let Some(username) = delivered_username.filter(|_| self.legacy_username_matching) else {
            return Ok(None);
        };
        Ok(
            legacy_candidate(record, username, &self.legacy).map(|entity| Resolved {
                entity: entity.clone(),
                via: MatchKind::LegacyUsername,
            }),
        )
    }

    /// All uniquely indexed entities, in identity order.
    pub fn entities(&self) -> impl Iterator<Item = (&IdentityKey, &StoreEntity)> {
        self.by_identity
            .iter()
            .filter_map(|(identity, entities)| match entities.as_slice() {
                [entity] => Some((identity, entity)),
                _ => None,
            })
    }
}
