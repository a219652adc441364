//! Directory entry types
//!
//! Types for store operations: entry keys, attribute sets, deltas and filters.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Attribute naming the relative part of an entry key.
pub const RDN_ATTRIBUTE: &str = "uid";

/// Attribute naming the container part of an entry key.
pub const CONTAINER_ATTRIBUTE: &str = "ou";

/// Distinguished key of an entry, `uid=<rdn>,ou=<container>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryKey(String);

impl EntryKey {
    /// Build the key for an entry named `rdn` inside `container`.
    pub fn new(rdn: &str, container: &str) -> Self {
        Self(format!(
            "{RDN_ATTRIBUTE}={rdn},{CONTAINER_ATTRIBUTE}={container}"
        ))
    }

    /// Wrap an already rendered key.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The relative name, if the key is well formed.
    pub fn rdn(&self) -> Option<&str> {
        let (first, _) = self.0.split_once(',')?;
        first.strip_prefix(&format!("{RDN_ATTRIBUTE}="))
    }

    /// The container name, if the key is well formed.
    pub fn container(&self) -> Option<&str> {
        let (_, rest) = self.0.split_once(',')?;
        rest.strip_prefix(&format!("{CONTAINER_ATTRIBUTE}="))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value for an attribute, which may be single or multi-valued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// No value (null).
    Null,
    /// A single string value.
    String(String),
    /// An ordered list of values.
    Array(Vec<String>),
}

impl AttributeValue {
    /// Check if this is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// Get as a string if this is a single string value.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as strings (works for both single and multi-valued).
    pub fn as_strings(&self) -> Vec<&str> {
        match self {
            AttributeValue::Null => vec![],
            AttributeValue::String(s) => vec![s.as_str()],
            AttributeValue::Array(arr) => arr.iter().map(String::as_str).collect(),
        }
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::String(b.to_string())
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(values: Vec<String>) -> Self {
        AttributeValue::Array(values)
    }
}

impl From<Vec<&str>> for AttributeValue {
    fn from(values: Vec<&str>) -> Self {
        AttributeValue::Array(values.into_iter().map(str::to_string).collect())
    }
}

/// A set of attributes, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSet {
    #[serde(flatten)]
    attributes: BTreeMap<String, AttributeValue>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an attribute value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Set an attribute using builder pattern.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Get a single-valued string attribute.
    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AttributeValue::as_string)
    }

    /// Get a multi-valued string attribute.
    pub fn get_strings(&self, name: &str) -> Option<Vec<&str>> {
        self.get(name).map(AttributeValue::as_strings)
    }

    /// Check if an attribute exists and carries a value.
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some_and(|v| !v.is_null())
    }

    pub fn remove(&mut self, name: &str) -> Option<AttributeValue> {
        self.attributes.remove(name)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.attributes.iter()
    }
}

impl FromIterator<(String, AttributeValue)> for AttributeSet {
    fn from_iter<T: IntoIterator<Item = (String, AttributeValue)>>(iter: T) -> Self {
        Self {
            attributes: iter.into_iter().collect(),
        }
    }
}

/// Changes to apply to an entry during modify operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDelta {
    /// Attributes to replace entirely.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replace: BTreeMap<String, AttributeValue>,

    /// Attributes to clear (remove all values).
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub clear: BTreeSet<String>,
}

impl AttributeDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace an attribute value entirely.
    pub fn replace(
        &mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> &mut Self {
        let name = name.into();
        self.clear.remove(&name);
        self.replace.insert(name, value.into());
        self
    }

    /// Clear all values from an attribute.
    pub fn clear_attribute(&mut self, name: impl Into<String>) -> &mut Self {
        let name = name.into();
        self.replace.remove(&name);
        self.clear.insert(name);
        self
    }

    /// Check if this delta has any changes.
    pub fn is_empty(&self) -> bool {
        self.replace.is_empty() && self.clear.is_empty()
    }

    /// Get all affected attribute names, sorted.
    pub fn affected_attributes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .replace
            .keys()
            .chain(self.clear.iter())
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Apply the delta to an attribute set.
    pub fn apply_to(&self, attributes: &mut AttributeSet) {
        for name in &self.clear {
            attributes.remove(name);
        }
        for (name, value) in &self.replace {
            attributes.set(name.clone(), value.clone());
        }
    }
}

/// Filter for search operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    /// Match entries where the attribute equals (or, if multi-valued, contains) the value.
    Equals { attribute: String, value: String },

    /// Match entries where the attribute exists.
    Present { attribute: String },

    /// Match entries located in the given container.
    InContainer { container: String },

    /// Logical AND of multiple filters.
    And { filters: Vec<Filter> },

    /// Logical NOT of a filter.
    Not { filter: Box<Filter> },
}

impl Filter {
    /// Create an equals filter.
    pub fn eq(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equals {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a present (attribute exists) filter.
    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present {
            attribute: attribute.into(),
        }
    }

    /// Create a container filter.
    pub fn in_container(container: impl Into<String>) -> Self {
        Filter::InContainer {
            container: container.into(),
        }
    }

    /// Create an AND filter.
    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And { filters }
    }

    /// Create a NOT filter (negation).
    pub fn negate(filter: Filter) -> Self {
        Filter::Not {
            filter: Box::new(filter),
        }
    }

    /// Combine this filter with another using AND.
    pub fn and_with(self, other: Filter) -> Self {
        match self {
            Filter::And { mut filters } => {
                filters.push(other);
                Filter::And { filters }
            }
            _ => Filter::And {
                filters: vec![self, other],
            },
        }
    }

    /// Evaluate the filter against an entry.
    pub fn matches(&self, entity: &StoreEntity) -> bool {
        match self {
            Filter::Equals { attribute, value } => entity
                .attributes
                .get(attribute)
                .is_some_and(|v| v.as_strings().iter().any(|s| s == value)),
            Filter::Present { attribute } => entity.attributes.has(attribute),
            Filter::InContainer { container } => &entity.container == container,
            Filter::And { filters } => filters.iter().all(|f| f.matches(entity)),
            Filter::Not { filter } => !filter.matches(entity),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Equals { attribute, value } => write!(f, "({attribute}={value})"),
            Filter::Present { attribute } => write!(f, "({attribute}=*)"),
            Filter::InContainer { container } => write!(f, "({CONTAINER_ATTRIBUTE}:={container})"),
            Filter::And { filters } => {
                f.write_str("(&")?;
                for filter in filters {
                    write!(f, "{filter}")?;
                }
                f.write_str(")")
            }
            Filter::Not { filter } => write!(f, "(!{filter})"),
        }
    }
}

/// An entry as stored in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEntity {
    pub key: EntryKey,
    /// Organizational unit the entry lives in.
    pub container: String,
    pub attributes: AttributeSet,
}

impl StoreEntity {
    /// Shorthand for a single-valued attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get_string(name)
    }
}

/// An entry to be created. The store assigns the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntity {
    pub rdn: String,
    pub container: String,
    pub attributes: AttributeSet,
}

impl NewEntity {
    pub fn new(rdn: impl Into<String>, container: impl Into<String>, attributes: AttributeSet) -> Self {
        Self {
            rdn: rdn.into(),
            container: container.into(),
            attributes,
        }
    }

    /// The key this entity will receive once created.
    pub fn key(&self) -> EntryKey {
        EntryKey::new(&self.rdn, &self.container)
    }
}
