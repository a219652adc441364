//! Diff/action planner.
//!
//! Compares the incoming records with the store entities of one source and
//! produces the ordered list of actions that converges the store.
//!
//! ```text
//!  records ──┐
//!            ├─▶ resolve ─┬─ no match ──────────────▶ Create
//!  index ────┘            ├─ school differs ────────▶ Move (+ delta)
//!                         ├─ attributes differ ─────▶ Modify
//!                         └─ identical ─────────────▶ (unchanged)
//!
//!  unmatched entities ─┬─ no_delete ────────────────▶ not_present
//!                      ├─ grace = 0 ────────────────▶ Delete
//!                      ├─ marker elapsed ───────────▶ Delete
//!                      ├─ marker pending ───────────▶ (unchanged)
//!                      └─ no marker ────────────────▶ DeferredDelete
//! ```

use chrono::{DateTime, Duration, Utc};
use rostersync_directory::{AttributeDelta, EntryKey, StoreEntity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::ValidatedConfig;
use crate::hooks::HookStage;
use crate::identity::{IdentityIndex, MatchKind};
use crate::mapper::MappedRecord;
use crate::record::{fields, parse_deadline, IdentityKey, Record};
use crate::report::{ErrorKind, RecordError};

/// Kind of a planned action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Modify,
    Move,
    Delete,
    DeferredDelete,
}

impl ActionKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Modify => "modify",
            ActionKind::Move => "move",
            ActionKind::Delete => "delete",
            ActionKind::DeferredDelete => "deferred_delete",
        }
    }

    /// Execution rank; lower runs first.
    fn rank(&self, delete_before_create: bool) -> u8 {
        match (delete_before_create, self) {
            (false, ActionKind::Move) => 0,
            (false, ActionKind::Modify) => 1,
            (false, ActionKind::Create) => 2,
            (false, ActionKind::DeferredDelete) => 3,
            (false, ActionKind::Delete) => 4,
            (true, ActionKind::Delete) => 0,
            (true, ActionKind::DeferredDelete) => 1,
            (true, ActionKind::Move) => 2,
            (true, ActionKind::Modify) => 3,
            (true, ActionKind::Create) => 4,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an entity is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteReason {
    /// Absent from the input and no grace period configured.
    Absent,
    /// Its deferred deletion deadline has passed.
    GraceElapsed,
    /// The input asked for it with the action column.
    Requested,
}

/// One planned change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Create {
        record: Record,
    },
    Modify {
        entity: StoreEntity,
        record: Record,
        delta: AttributeDelta,
    },
    /// A school change; other changed attributes travel in `delta`.
    Move {
        entity: StoreEntity,
        record: Record,
        old_school: String,
        new_school: String,
        delta: AttributeDelta,
    },
    Delete {
        entity: StoreEntity,
        reason: DeleteReason,
    },
    DeferredDelete {
        entity: StoreEntity,
        grace_deadline: DateTime<Utc>,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Create { .. } => ActionKind::Create,
            Action::Modify { .. } => ActionKind::Modify,
            Action::Move { .. } => ActionKind::Move,
            Action::Delete { .. } => ActionKind::Delete,
            Action::DeferredDelete { .. } => ActionKind::DeferredDelete,
        }
    }

    /// Hook stage that runs before this action.
    pub fn hook_stage(&self) -> HookStage {
        match self {
            Action::Create { .. } => HookStage::PreCreate,
            Action::Modify { .. } => HookStage::PreModify,
            Action::Move { .. } => HookStage::PreMove,
            Action::Delete { .. } | Action::DeferredDelete { .. } => HookStage::PreDelete,
        }
    }

    pub fn entity(&self) -> Option<&StoreEntity> {
        match self {
            Action::Create { .. } => None,
            Action::Modify { entity, .. }
            | Action::Move { entity, .. }
            | Action::Delete { entity, .. }
            | Action::DeferredDelete { entity, .. } => Some(entity),
        }
    }

    pub fn entity_key(&self) -> Option<&EntryKey> {
        self.entity().map(|e| &e.key)
    }

    pub fn record(&self) -> Option<&Record> {
        match self {
            Action::Create { record }
            | Action::Modify { record, .. }
            | Action::Move { record, .. } => Some(record),
            Action::Delete { .. } | Action::DeferredDelete { .. } => None,
        }
    }

    pub fn record_mut(&mut self) -> Option<&mut Record> {
        match self {
            Action::Create { record }
            | Action::Modify { record, .. }
            | Action::Move { record, .. } => Some(record),
            Action::Delete { .. } | Action::DeferredDelete { .. } => None,
        }
    }

    /// Identity key of the record or entity.
    pub fn identity(&self) -> Option<IdentityKey> {
        if let Some(record) = self.record() {
            return Some(record.identity());
        }
        let entity = self.entity()?;
        Some(IdentityKey::new(
            entity.attribute(fields::SOURCE_UID)?,
            entity.attribute(fields::RECORD_UID)?,
        ))
    }

    /// Single-valued field of the record, or attribute of the entity.
    pub fn field(&self, name: &str) -> Option<String> {
        match self.record() {
            Some(record) => record.get(name).map(str::to_string),
            None => self
                .entity()
                .and_then(|e| e.attribute(name))
                .map(str::to_string),
        }
    }

    /// Check a hook's rewrite of `original`.
    ///
    /// Kind and target entity are fixed. A move must still leave the
    /// entity's school and a modify must stay in it.
    pub fn check_rewrite(&self, original: &Action) -> Result<(), String> {
        if self.kind() != original.kind() {
            return Err(format!(
                "hook turned a {} into a {}",
                original.kind(),
                self.kind()
            ));
        }
        if self.entity() != original.entity() {
            return Err("hook replaced the target entity".to_string());
        }
        match self {
            Action::Modify { entity, record, .. } if record.school != entity.container => Err(
                format!("hook moved a modify to school '{}'", record.school),
            ),
            Action::Move { entity, record, .. } if record.school == entity.container => Err(
                format!("hook moved the entity back to school '{}'", record.school),
            ),
            _ => Ok(()),
        }
    }

    /// Recompute the attribute delta and move target after the record was
    /// rewritten.
    pub fn refresh_delta(&mut self) {
        if let Action::Move {
            record, new_school, ..
        } = self
        {
            *new_school = record.school.clone();
        }
        if let Action::Modify {
            entity,
            record,
            delta,
        }
        | Action::Move {
            entity,
            record,
            delta,
            ..
        } = self
        {
            *delta = diff(entity, record);
        }
    }
}

/// Attribute changes needed to bring `entity` in line with `record`.
///
/// A stored username is never replaced. A pending deletion marker is
/// cleared and the account re-enabled.
pub fn diff(entity: &StoreEntity, record: &Record) -> AttributeDelta {
    let mut delta = AttributeDelta::new();
    for (name, value) in record.desired_attributes().iter() {
        if name == fields::USERNAME && entity.attributes.has(fields::USERNAME) {
            continue;
        }
        if entity.attributes.get(name) != Some(value) {
            delta.replace(name.clone(), value.clone());
        }
    }
    if entity.attributes.has(fields::DELETION_DEADLINE) {
        delta.clear_attribute(fields::DELETION_DEADLINE);
        if entity.attribute(fields::DISABLED) != Some("false") {
            delta.replace(fields::DISABLED, "false");
        }
    }
    delta
}

/// Attributes written by a deferred delete.
pub fn deferral_delta(deadline: DateTime<Utc>) -> AttributeDelta {
    let mut delta = AttributeDelta::new();
    delta
        .replace(fields::DELETION_DEADLINE, deadline.to_rfc3339())
        .replace(fields::DISABLED, "true");
    delta
}

/// The planner's output.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Actions in execution order.
    pub actions: Vec<Action>,
    /// Entities absent from the input but kept by `no_delete`.
    pub not_present: Vec<EntryKey>,
    /// Records whose entity needs no change.
    pub unchanged: Vec<IdentityKey>,
    pub errors: Vec<RecordError>,
}

impl Plan {
    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind() == kind).count()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Plans the actions of one run.
#[derive(Debug, Clone)]
pub struct Planner<'a> {
    config: &'a ValidatedConfig,
    now: DateTime<Utc>,
}

impl<'a> Planner<'a> {
    pub fn new(config: &'a ValidatedConfig, now: DateTime<Utc>) -> Self {
        Self { config, now }
    }

    fn deletion(&self, entity: &StoreEntity, requested: bool) -> Option<Action> {
        let grace_days = self.config.raw().deletion_grace_period;
        let reason = if requested {
            DeleteReason::Requested
        } else {
            DeleteReason::Absent
        };
        if grace_days == 0 {
            return Some(Action::Delete {
                entity: entity.clone(),
                reason,
            });
        }
        match entity
            .attribute(fields::DELETION_DEADLINE)
            .and_then(parse_deadline)
        {
            Some(deadline) if deadline <= self.now => Some(Action::Delete {
                entity: entity.clone(),
                reason: DeleteReason::GraceElapsed,
            }),
            Some(deadline) => {
                debug!(key = %entity.key, deadline = %deadline, "Deletion still pending");
                None
            }
            None => Some(Action::DeferredDelete {
                entity: entity.clone(),
                grace_deadline: self.now + Duration::days(i64::from(grace_days)),
            }),
        }
    }

    /// Usernames held by entities this run deletes before any create.
    ///
    /// Empty unless `delete_before_create` is set. Deferred deletes keep
    /// the entity, and with it the username.
    pub fn vacated_usernames(
        &self,
        records: &[MappedRecord],
        index: &IdentityIndex,
        protected: &BTreeSet<IdentityKey>,
    ) -> BTreeSet<String> {
        let raw = self.config.raw();
        if !raw.delete_before_create {
            return BTreeSet::new();
        }

        let mut doomed: Vec<Action> = Vec::new();
        let mut matched: BTreeSet<IdentityKey> = BTreeSet::new();
        for mapped in records {
            matched.insert(mapped.identity());
            if !mapped.record.is_delete_request() {
                continue;
            }
            if let Ok(Some(r)) =
                index.resolve(&mapped.record, mapped.delivered_username.as_deref())
            {
                if r.via == MatchKind::Identity {
                    doomed.extend(self.deletion(&r.entity, true));
                }
            }
        }
        if !raw.no_delete {
            for (identity, entity) in index.entities() {
                if !matched.contains(identity) && !protected.contains(identity) {
                    doomed.extend(self.deletion(entity, false));
                }
            }
        }

        doomed
            .iter()
            .filter_map(|action| match action {
                Action::Delete { entity, .. } => entity.attribute(fields::USERNAME),
                _ => None,
            })
            .map(str::to_string)
            .collect()
    }

    /// Plan the run.
    ///
    /// `protected` lists identities whose row failed or was skipped; their
    /// entities are never deleted.
    pub fn plan(
        &self,
        records: Vec<MappedRecord>,
        index: &IdentityIndex,
        protected: &BTreeSet<IdentityKey>,
    ) -> Plan {
        let mut plan = Plan::default();
        let mut matched: BTreeSet<IdentityKey> = BTreeSet::new();

        for mapped in records {
            let identity = mapped.identity();
            let resolved = match index.resolve(&mapped.record, mapped.delivered_username.as_deref()) {
                Ok(resolved) => resolved,
                Err(e) => {
                    plan.errors.push(
                        RecordError::new("plan", ErrorKind::IdentityCollision, e.to_string())
                            .with_identity(Some(identity.clone()))
                            .with_line(mapped.line()),
                    );
                    matched.insert(identity);
                    continue;
                }
            };
            matched.insert(identity.clone());
            let record = mapped.record;

            if record.is_delete_request() {
                match resolved {
                    Some(r) if r.via == MatchKind::Identity => {
                        plan.actions.extend(self.deletion(&r.entity, true));
                    }
                    _ => debug!(identity = %identity, "Delete requested for unknown identity"),
                }
                continue;
            }

            let Some(resolved) = resolved else {
                plan.actions.push(Action::Create { record });
                continue;
            };
            let entity = resolved.entity;
            let delta = diff(&entity, &record);

            if entity.container != record.school {
                plan.actions.push(Action::Move {
                    old_school: entity.container.clone(),
                    new_school: record.school.clone(),
                    entity,
                    record,
                    delta,
                });
            } else if !delta.is_empty() {
                plan.actions.push(Action::Modify {
                    entity,
                    record,
                    delta,
                });
            } else {
                plan.unchanged.push(identity);
            }
        }

        let no_delete = self.config.raw().no_delete;
        for (identity, entity) in index.entities() {
            if matched.contains(identity) {
                continue;
            }
            if protected.contains(identity) {
                warn!(identity = %identity, key = %entity.key, "Keeping entity of failed row");
                continue;
            }
            if no_delete {
                plan.not_present.push(entity.key.clone());
                continue;
            }
            plan.actions.extend(self.deletion(entity, false));
        }

        let delete_first = self.config.raw().delete_before_create;
        plan.actions.sort_by_key(|a| a.kind().rank(delete_first));

        info!(
            creates = plan.count(ActionKind::Create),
            modifies = plan.count(ActionKind::Modify),
            moves = plan.count(ActionKind::Move),
            deletes = plan.count(ActionKind::Delete),
            deferred = plan.count(ActionKind::DeferredDelete),
            unchanged = plan.unchanged.len(),
            not_present = plan.not_present.len(),
            "Planned actions"
        );
        plan
    }
}
