//! Canonical record model.

use chrono::{DateTime, Utc};
use rostersync_directory::{AttributeSet, AttributeValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Well-known field and attribute names.
pub mod fields {
    pub const SOURCE_UID: &str = "source_uid";
    pub const RECORD_UID: &str = "record_uid";
    pub const ROLE: &str = "role";
    pub const SCHOOL: &str = "school";
    pub const SCHOOLS: &str = "schools";
    pub const SCHOOL_CLASSES: &str = "school_classes";
    pub const GROUPS: &str = "groups";
    pub const FIRSTNAME: &str = "firstname";
    pub const LASTNAME: &str = "lastname";
    pub const USERNAME: &str = "username";
    pub const EMAIL: &str = "email";
    pub const BIRTHDAY: &str = "birthday";

    /// Mapping target for the explicit action column (`A`, `M`, `D`).
    pub const ACTION_COLUMN: &str = "__action";
    /// Mapping target for a per-row role column.
    pub const ROLE_COLUMN: &str = "__role";
    /// Mapping target for columns that are read but dropped.
    pub const IGNORE_COLUMN: &str = "__ignore";

    /// Store attribute carrying the deferred deletion deadline.
    pub const DELETION_DEADLINE: &str = "deletion_deadline";
    /// Store attribute marking an account as deactivated.
    pub const DISABLED: &str = "disabled";

    /// Fields every configuration must list as mandatory.
    pub const REQUIRED_MANDATORY: &[&str] =
        &[FIRSTNAME, LASTNAME, USERNAME, RECORD_UID, SCHOOL, SOURCE_UID];

    /// Scalar fields with a fixed meaning.
    pub const KNOWN_SCALAR: &[&str] = &[FIRSTNAME, LASTNAME, USERNAME, EMAIL, BIRTHDAY];

    /// Fields that are always multi-valued.
    pub const KNOWN_MULTI: &[&str] = &[SCHOOLS, SCHOOL_CLASSES, GROUPS];
}

/// Role of an imported user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Teacher,
    Staff,
    TeacherAndStaff,
    Admin,
}

impl Role {
    #[must_use]
    pub fn all() -> &'static [Role] {
        &[
            Role::Student,
            Role::Teacher,
            Role::Staff,
            Role::TeacherAndStaff,
            Role::Admin,
        ]
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Staff => "staff",
            Role::TeacherAndStaff => "teacher_and_staff",
            Role::Admin => "admin",
        }
    }

    /// Check whether this role includes `other`.
    ///
    /// `teacher_and_staff` includes both `teacher` and `staff`.
    #[must_use]
    pub fn includes(&self, other: Role) -> bool {
        *self == other
            || (*self == Role::TeacherAndStaff && matches!(other, Role::Teacher | Role::Staff))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "student" | "pupil" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            "staff" => Ok(Role::Staff),
            "teacher_and_staff" => Ok(Role::TeacherAndStaff),
            "admin" | "school_admin" => Ok(Role::Admin),
            _ => Err(ParseRoleError(s.to_string())),
        }
    }
}

/// Error parsing a role from a string.
#[derive(Debug, Clone)]
pub struct ParseRoleError(String);

impl fmt::Display for ParseRoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid role '{}', expected one of: student, teacher, staff, teacher_and_staff, admin",
            self.0
        )
    }
}

impl std::error::Error for ParseRoleError {}

/// What the source wants done with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordAction {
    /// Create or update (no action column, or `A` / `M`).
    #[default]
    Upsert,
    /// Explicit deletion request (`D`).
    Delete,
}

impl FromStr for RecordAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "A" | "a" | "M" | "m" => Ok(RecordAction::Upsert),
            "D" | "d" => Ok(RecordAction::Delete),
            other => Err(format!("unknown action '{other}', expected A, M or D")),
        }
    }
}

/// Stable identity of a record: `(source_uid, record_uid)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub source_uid: String,
    pub record_uid: String,
}

impl IdentityKey {
    pub fn new(source_uid: impl Into<String>, record_uid: impl Into<String>) -> Self {
        Self {
            source_uid: source_uid.into(),
            record_uid: record_uid.into(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_uid, self.record_uid)
    }
}

/// Canonical representation of one source entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub source_uid: String,
    pub record_uid: String,
    pub role: Role,
    /// Current organizational unit.
    pub school: String,
    /// Previous organizational unit, set only during a move.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_school: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub multi_fields: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub extra_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub action: RecordAction,
    /// 1-based input line (the header is line 1).
    #[serde(default)]
    pub line: usize,
}

impl Record {
    pub fn new(source_uid: impl Into<String>, role: Role) -> Self {
        Self {
            source_uid: source_uid.into(),
            record_uid: String::new(),
            role,
            school: String::new(),
            old_school: None,
            fields: BTreeMap::new(),
            multi_fields: BTreeMap::new(),
            extra_properties: BTreeMap::new(),
            action: RecordAction::Upsert,
            line: 0,
        }
    }

    /// Set a field using builder pattern.
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set(name, value.into());
        self
    }

    pub fn identity(&self) -> IdentityKey {
        IdentityKey::new(&self.source_uid, &self.record_uid)
    }

    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.role.includes(role)
    }

    pub fn is_delete_request(&self) -> bool {
        self.action == RecordAction::Delete
    }

    pub fn username(&self) -> Option<&str> {
        self.get(fields::USERNAME)
    }

    /// Look up any single-valued field by name, including the identity
    /// fields, `school` and `role`. Empty values count as absent.
    pub fn get(&self, name: &str) -> Option<&str> {
        let value = match name {
            fields::SOURCE_UID => self.source_uid.as_str(),
            fields::RECORD_UID => self.record_uid.as_str(),
            fields::SCHOOL => self.school.as_str(),
            fields::ROLE => self.role.as_str(),
            _ => self
                .fields
                .get(name)
                .or_else(|| self.extra_properties.get(name))
                .map(String::as_str)?,
        };
        (!value.is_empty()).then_some(value)
    }

    /// Set a single-valued field, routing well-known names to their slots.
    /// Unknown names land in `extra_properties`.
    pub fn set(&mut self, name: &str, value: String) {
        match name {
            fields::SOURCE_UID => self.source_uid = value,
            fields::RECORD_UID => self.record_uid = value,
            fields::SCHOOL => self.school = value,
            _ if fields::KNOWN_SCALAR.contains(&name) || self.fields.contains_key(name) => {
                self.fields.insert(name.to_string(), value);
            }
            _ => {
                self.extra_properties.insert(name.to_string(), value);
            }
        }
    }

    /// Check presence of a field, scalar or multi-valued.
    pub fn is_present(&self, name: &str) -> bool {
        self.get(name).is_some() || self.multi_fields.get(name).is_some_and(|v| !v.is_empty())
    }

    /// Attributes the store entity should carry for this record.
    ///
    /// Absent fields are omitted rather than cleared, so an empty column
    /// leaves the stored value alone.
    pub fn desired_attributes(&self) -> AttributeSet {
        let mut attrs = AttributeSet::new()
            .with(fields::SOURCE_UID, self.source_uid.as_str())
            .with(fields::RECORD_UID, self.record_uid.as_str())
            .with(fields::ROLE, self.role.as_str());
        for (name, value) in self.fields.iter().chain(self.extra_properties.iter()) {
            if !value.is_empty() {
                attrs.set(name.clone(), value.as_str());
            }
        }
        for (name, values) in &self.multi_fields {
            if !values.is_empty() {
                attrs.set(name.clone(), AttributeValue::Array(values.clone()));
            }
        }
        attrs
    }
}

/// Parse a stored deletion deadline.
pub fn parse_deadline(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
