//! Record mapper.
//!
//! Turns a [`RawRow`] into a canonical [`Record`]:
//!
//! 1. `csv_mapping` resolves columns to fields (`__action`, `__role` and
//!    `__ignore` are handled specially)
//! 2. multi-value cells are split on their `incell_delimiter`
//! 3. `normalize` transliterates configured fields
//! 4. schemes are rendered in dependency order; a non-empty scheme result
//!    wins over a mapped column
//! 5. mandatory attributes and the school are checked
//!
//! Username disambiguation happens later, once the identity is resolved.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::ValidatedConfig;
use crate::error::MappingError;
use crate::normalize::normalize;
use crate::reader::RawRow;
use crate::record::{fields, IdentityKey, Record, RecordAction, Role};
use crate::scheme::{FieldSource, Rendered};

/// Output of [`RecordMapper::map`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRecord {
    pub record: Record,
    /// Username delivered in the input, before any scheme ran.
    pub delivered_username: Option<String>,
    /// Username scheme rendering, if a scheme produced one.
    pub username_template: Option<Rendered>,
}

impl MappedRecord {
    pub fn identity(&self) -> IdentityKey {
        self.record.identity()
    }

    pub fn line(&self) -> usize {
        self.record.line
    }
}

/// Field lookup for scheme rendering: record fields, then scheme
/// variables, then empty for fields that are known but unset.
struct SchemeSource<'a> {
    record: &'a Record,
    config: &'a ValidatedConfig,
}

impl FieldSource for SchemeSource<'_> {
    fn lookup(&self, name: &str) -> Option<&str> {
        self.record
            .lookup(name)
            .or_else(|| self.config.raw().scheme_variables.get(name).map(String::as_str))
            .or_else(|| {
                (self.config.known_fields().contains(name) || self.config.schemes().contains(name))
                    .then_some("")
            })
    }
}

/// Maps raw rows to records for one run.
#[derive(Debug, Clone)]
pub struct RecordMapper<'a> {
    config: &'a ValidatedConfig,
    schools: Option<&'a BTreeSet<String>>,
}

impl<'a> RecordMapper<'a> {
    pub fn new(config: &'a ValidatedConfig) -> Self {
        Self {
            config,
            schools: None,
        }
    }

    /// Reject records whose school is not in `schools`.
    #[must_use]
    pub fn with_schools(mut self, schools: &'a BTreeSet<String>) -> Self {
        self.schools = Some(schools);
        self
    }

    /// Identity of a row without mapping it fully. Used to protect entities
    /// whose row failed or was skipped.
    /// Headers still awaiting a `header_swap` rename are considered too.
    pub fn peek_identity(&self, row: &RawRow) -> Option<IdentityKey> {
        let raw = self.config.raw();
        let (column, _) = raw
            .csv_mapping
            .iter()
            .find(|(_, field)| field.as_str() == fields::RECORD_UID)?;
        row.get(column)
            .or_else(|| {
                raw.header_swap
                    .iter()
                    .find(|(_, to)| *to == column)
                    .and_then(|(from, _)| row.get(from))
            })
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| IdentityKey::new(self.config.source_uid(), v))
    }

    fn split(&self, line: usize, field: &str, raw: &str) -> Result<Vec<String>, MappingError> {
        let items: Vec<String> = raw
            .split(self.config.delimiter_for(field))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| normalize(s, self.config.should_normalize(field)))
            .collect();
        if items.is_empty() {
            return Err(MappingError::new(line, field, "unparsable multi-value cell"));
        }
        Ok(items)
    }

    /// Map one row.
    pub fn map(&self, row: &RawRow) -> Result<MappedRecord, MappingError> {
        let line = row.line;
        let raw_config = self.config.raw();
        let mut role: Option<Role> = raw_config.user_role;
        let mut record = Record::new(self.config.source_uid(), Role::Student);
        record.line = line;

        for (column, field) in &raw_config.csv_mapping {
            let Some(cell) = row.get(column) else {
                continue;
            };
            let cell = cell.trim();
            match field.as_str() {
                fields::IGNORE_COLUMN => {}
                fields::ACTION_COLUMN => {
                    record.action = cell
                        .parse::<RecordAction>()
                        .map_err(|message| MappingError::new(line, fields::ACTION_COLUMN, message))?;
                }
                fields::ROLE_COLUMN if !cell.is_empty() => {
                    role = Some(
                        cell.parse::<Role>()
                            .map_err(|e| MappingError::new(line, fields::ROLE, e.to_string()))?,
                    );
                }
                _ if cell.is_empty() => {}
                f if self.config.is_multi_value(f) => {
                    let items = self.split(line, f, cell)?;
                    record.multi_fields.insert(f.to_string(), items);
                }
                f => {
                    let value = normalize(cell, self.config.should_normalize(f));
                    record.set(f, value);
                }
            }
        }

        record.role = role.ok_or_else(|| MappingError::new(line, fields::ROLE, "no role given"))?;

        if record.school.is_empty() {
            if let Some(first) = record
                .multi_fields
                .get(fields::SCHOOLS)
                .and_then(|schools| schools.iter().min())
            {
                record.school = first.clone();
            }
        }

        let delivered_username = record.username().map(str::to_string);
        let mut username_template = None;

        for (field, expr) in self.config.schemes().for_role(record.role) {
            let rendered = expr
                .render(
                    &SchemeSource {
                        record: &record,
                        config: self.config,
                    },
                    &[],
                )
                .map_err(|e| MappingError::new(line, field, e.to_string()))?;
            if rendered.is_empty() {
                continue;
            }
            if field == fields::USERNAME {
                record.set(field, rendered.first());
                username_template = Some(rendered);
            } else {
                let value = normalize(&rendered.first(), self.config.should_normalize(field));
                record.set(field, value);
            }
        }

        let mapped = MappedRecord {
            record,
            delivered_username,
            username_template,
        };
        self.check(&mapped)?;
        Ok(mapped)
    }

    fn check(&self, mapped: &MappedRecord) -> Result<(), MappingError> {
        let record = &mapped.record;
        let line = record.line;

        for field in &self.config.raw().mandatory_attributes {
            if record.is_delete_request()
                && field != fields::RECORD_UID
                && field != fields::SOURCE_UID
            {
                continue;
            }
            let present = if field == fields::USERNAME {
                mapped.username_template.is_some() || mapped.delivered_username.is_some()
            } else {
                record.is_present(field)
            };
            if !present {
                return Err(MappingError::missing(line, field));
            }
        }

        if let Some(schools) = self.schools.filter(|_| !record.is_delete_request()) {
            if !schools.contains(&record.school) {
                return Err(MappingError::new(
                    line,
                    fields::SCHOOL,
                    format!("school '{}' does not exist", record.school),
                ));
            }
        }
        Ok(())
    }

    /// Re-render every scheme depending on `changed`, e.g. after the
    /// username was made unique.
    pub fn rerender_dependents(&self, record: &mut Record, changed: &str) -> Result<(), MappingError> {
        let dependents = self.config.schemes().dependents_of(changed);
        if dependents.is_empty() {
            return Ok(());
        }
        let mut updates: BTreeMap<String, String> = BTreeMap::new();
        for (field, expr) in self.config.schemes().for_role(record.role) {
            if !dependents.contains(field) {
                continue;
            }
            let mut view = record.clone();
            for (name, value) in &updates {
                view.set(name, value.clone());
            }
            let rendered = expr
                .render(
                    &SchemeSource {
                        record: &view,
                        config: self.config,
                    },
                    &[],
                )
                .map_err(|e| MappingError::new(record.line, field, e.to_string()))?;
            if !rendered.is_empty() {
                let value = normalize(&rendered.first(), self.config.should_normalize(field));
                updates.insert(field.to_string(), value);
            }
        }
        for (name, value) in updates {
            record.set(&name, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImportConfiguration;

    fn config(extra: serde_json::Value) -> ValidatedConfig {
        let mut doc = serde_json::json!({
            "source_uid": "sis",
            "csv_mapping": {
                "Vorname": "firstname",
                "Nachname": "lastname",
                "Schule": "school",
                "ID": "record_uid",
                "Klassen": "school_classes",
                "Aktion": "__action",
                "Notiz": "__ignore",
                "Telefon": "phone"
            },
            "normalize": {"lastname": true},
            "scheme": {
                "username": "<firstname>[0].<lastname>",
                "email": "<username>@<maildomain>"
            },
            "scheme_variables": {"maildomain": "school.example"},
            "user_role": "student"
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

    fn row() -> RawRow {
        RawRow::new(2)
            .with("Vorname", "Anna")
            .with("Nachname", "Müller")
            .with("Schule", "SchoolA")
            .with("ID", "7")
            .with("Klassen", "1a, 2b,,")
            .with("Notiz", "ignored")
    }

    #[test]
    fn test_map_row() {
        let config = config(serde_json::json!({}));
        let mapped = RecordMapper::new(&config).map(&row()).unwrap();
        let record = &mapped.record;

        assert_eq!(record.identity(), IdentityKey::new("sis", "7"));
        assert_eq!(record.role, Role::Student);
        assert_eq!(record.school, "SchoolA");
        assert_eq!(record.get("lastname"), Some("Mueller"));
        assert_eq!(record.get("firstname"), Some("Anna"));
        assert_eq!(
            record.multi_fields.get("school_classes"),
            Some(&vec!["1a".to_string(), "2b".to_string()])
        );
        assert_eq!(record.get("Notiz"), None);
        assert_eq!(record.username(), Some("A.Mueller"));
        assert_eq!(record.get("email"), Some("A.Mueller@school.example"));
        assert!(mapped.username_template.is_some());
        assert_eq!(mapped.delivered_username, None);
        assert_eq!(record.line, 2);
    }

    #[test]
    fn test_missing_mandatory_field() {
        let config = config(serde_json::json!({}));
        let mut row = row();
        row.cells.remove("Nachname");
        let err = RecordMapper::new(&config).map(&row).unwrap_err();
        assert_eq!(err.field, "lastname");
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_unparsable_multi_value_cell() {
        let config = config(serde_json::json!({}));
        let row = row().with("Klassen", " , ,");
        let err = RecordMapper::new(&config).map(&row).unwrap_err();
        assert_eq!(err.field, "school_classes");
    }

    #[test]
    fn test_action_column() {
        let config = config(serde_json::json!({}));
        let mapper = RecordMapper::new(&config);

        let delete = RawRow::new(3).with("ID", "7").with("Aktion", "D").with("Schule", "Gone");
        let mapped = mapper.map(&delete).unwrap();
        assert!(mapped.record.is_delete_request());

        let bogus = row().with("Aktion", "X");
        assert_eq!(mapper.map(&bogus).unwrap_err().field, "__action");
    }

    #[test]
    fn test_role_column() {
        let mut doc = config(serde_json::json!({})).raw().clone();
        doc.user_role = None;
        doc.csv_mapping.insert("Rolle".into(), "__role".into());
        let config = doc.validate().unwrap();
        let mapper = RecordMapper::new(&config);

        let teacher = mapper.map(&row().with("Rolle", "teacher")).unwrap();
        assert_eq!(teacher.record.role, Role::Teacher);
        assert!(mapper.map(&row()).is_err());
        assert!(mapper.map(&row().with("Rolle", "janitor")).is_err());
    }

    #[test]
    fn test_scheme_takes_precedence_unless_empty() {
        let config = config(serde_json::json!({
            "scheme": {"username": "<firstname>[0].<lastname>", "phone": "<phone:strip>"}
        }));
        let mapped = RecordMapper::new(&config)
            .map(&row().with("Telefon", " 0800 "))
            .unwrap();
        assert_eq!(mapped.record.get("phone"), Some("0800"));

        // mapped value survives an empty rendering
        let config = config_with_nickname();
        let mapped = RecordMapper::new(&config)
            .map(&row().with("Telefon", "0800"))
            .unwrap();
        assert_eq!(mapped.record.get("phone"), Some("0800"));
    }

    fn config_with_nickname() -> ValidatedConfig {
        config(serde_json::json!({
            "csv_mapping": {
                "Vorname": "firstname",
                "Nachname": "lastname",
                "Schule": "school",
                "ID": "record_uid",
                "Telefon": "phone",
                "Spitzname": "nickname"
            },
            "scheme": {"username": "<firstname>[0].<lastname>", "phone": "<nickname>"}
        }))
    }

    #[test]
    fn test_unknown_school_is_rejected() {
        let config = config(serde_json::json!({}));
        let schools = BTreeSet::from(["SchoolB".to_string()]);
        let err = RecordMapper::new(&config)
            .with_schools(&schools)
            .map(&row())
            .unwrap_err();
        assert_eq!(err.field, "school");

        // exact, case-sensitive
        let schools = BTreeSet::from(["schoola".to_string()]);
        assert!(RecordMapper::new(&config)
            .with_schools(&schools)
            .map(&row())
            .is_err());
    }

    #[test]
    fn test_school_from_schools() {
        let config = config(serde_json::json!({
            "csv_mapping": {
                "Vorname": "firstname",
                "Nachname": "lastname",
                "Schulen": "schools",
                "ID": "record_uid"
            },
            "scheme": {"username": "<firstname>[0].<lastname>"}
        }));
        let row = RawRow::new(2)
            .with("Vorname", "Anna")
            .with("Nachname", "Meier")
            .with("ID", "1")
            .with("Schulen", "SchoolB,SchoolA");
        let mapped = RecordMapper::new(&config).map(&row).unwrap();
        assert_eq!(mapped.record.school, "SchoolA");
    }

    #[test]
    fn test_rerender_dependents() {
        let config = config(serde_json::json!({}));
        let mapper = RecordMapper::new(&config);
        let mut record = mapper.map(&row()).unwrap().record;
        record.set("username", "a.mueller2".to_string());
        mapper.rerender_dependents(&mut record, "username").unwrap();
        assert_eq!(record.get("email"), Some("a.mueller2@school.example"));
    }

    #[test]
    fn test_peek_identity() {
        let config = config(serde_json::json!({}));
        let mapper = RecordMapper::new(&config);
        assert_eq!(
            mapper.peek_identity(&RawRow::new(2).with("ID", " 9 ")),
            Some(IdentityKey::new("sis", "9"))
        );
        assert_eq!(mapper.peek_identity(&RawRow::new(2)), None);
    }
}
