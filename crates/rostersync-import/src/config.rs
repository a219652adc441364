//! Import configuration
//!
//! The [`ImportConfiguration`] document is loaded once per run, checked, and
//! then compiled into a [`ValidatedConfig`] that every component receives
//! explicitly. Unknown keys are rejected at load time.

use rostersync_directory::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigurationError;
use crate::hooks::HookDefinition;
use crate::record::{fields, Role};
use crate::scheme::SchemeSet;

/// Key selecting the fallback entry of a [`RoleScoped`] map.
pub const DEFAULT_KEY: &str = "default";

/// Hard limits for `username.max_length`.
pub const USERNAME_MIN_LENGTH: usize = 4;
pub const USERNAME_MAX_LENGTH: usize = 20;

/// A setting that is either uniform or varies by role.
///
/// ```json
/// "max_length": 20
/// "max_length": {"default": 20, "student": 15}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoleScoped<T> {
    Uniform(T),
    PerRole(BTreeMap<String, T>),
}

impl<T> RoleScoped<T> {
    /// Value for `role`, falling back to the `default` entry.
    pub fn for_role(&self, role: Role) -> Option<&T> {
        match self {
            RoleScoped::Uniform(value) => Some(value),
            RoleScoped::PerRole(map) => map.get(role.as_str()).or_else(|| map.get(DEFAULT_KEY)),
        }
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        let (one, many) = match self {
            RoleScoped::Uniform(value) => (Some(value), None),
            RoleScoped::PerRole(map) => (None, Some(map.values())),
        };
        one.into_iter().chain(many.into_iter().flatten())
    }

    /// Keys that are neither `default` nor a role name.
    pub fn unknown_keys(&self) -> Vec<&str> {
        match self {
            RoleScoped::Uniform(_) => Vec::new(),
            RoleScoped::PerRole(map) => map
                .keys()
                .map(String::as_str)
                .filter(|k| *k != DEFAULT_KEY && k.parse::<Role>().is_err())
                .collect(),
        }
    }

    pub fn try_map<U, E>(&self, f: impl Fn(&T) -> Result<U, E>) -> Result<RoleScoped<U>, E> {
        Ok(match self {
            RoleScoped::Uniform(value) => RoleScoped::Uniform(f(value)?),
            RoleScoped::PerRole(map) => RoleScoped::PerRole(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), f(v)?)))
                    .collect::<Result<_, E>>()?,
            ),
        })
    }
}

/// Username formatting and disambiguation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsernameSettings {
    #[serde(default = "default_username_max_length")]
    pub max_length: RoleScoped<usize>,

    /// Characters allowed in usernames besides ASCII letters, digits and `.`.
    #[serde(default)]
    pub allowed_special_chars: String,

    #[serde(default = "default_true")]
    pub lowercase: bool,

    /// Counter values tried before giving up on a colliding username.
    #[serde(default = "default_max_counter_attempts")]
    pub max_counter_attempts: u32,
}

impl Default for UsernameSettings {
    fn default() -> Self {
        Self {
            max_length: default_username_max_length(),
            allowed_special_chars: String::new(),
            lowercase: true,
            max_counter_attempts: default_max_counter_attempts(),
        }
    }
}

/// Retry policy for transient store errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// The configuration document for one import run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportConfiguration {
    /// Identifier of the feeding system. Required.
    #[serde(default)]
    pub source_uid: Option<String>,

    #[serde(default = "default_mandatory_attributes")]
    pub mandatory_attributes: BTreeSet<String>,

    /// Days an absent entity stays deactivated before it is deleted.
    #[serde(default)]
    pub deletion_grace_period: u32,

    #[serde(default)]
    pub no_delete: bool,

    #[serde(default)]
    pub dry_run: bool,

    /// Field → expression (or role → expression).
    #[serde(default)]
    pub scheme: BTreeMap<String, RoleScoped<String>>,

    #[serde(default)]
    pub normalize: BTreeMap<String, bool>,

    /// Column header → field.
    #[serde(default)]
    pub csv_mapping: BTreeMap<String, String>,

    /// Field (or `default`) → multi-value delimiter.
    #[serde(default = "default_incell_delimiter")]
    pub incell_delimiter: BTreeMap<String, String>,

    #[serde(default)]
    pub user_role: Option<Role>,

    /// Per-record failures tolerated before the run aborts.
    #[serde(default)]
    pub tolerate_errors: usize,

    #[serde(default = "default_csv_delimiter")]
    pub csv_delimiter: char,

    /// Delivered header → expected header, applied before mapping.
    #[serde(default)]
    pub header_swap: BTreeMap<String, String>,

    #[serde(default)]
    pub username: UsernameSettings,

    #[serde(default = "default_activate_new_users")]
    pub activate_new_users: RoleScoped<bool>,

    #[serde(default)]
    pub legacy_username_matching: bool,

    #[serde(default)]
    pub delete_before_create: bool,

    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,

    #[serde(default)]
    pub retry: RetrySettings,

    /// Extra values schemes may reference, e.g. `maildomain`.
    #[serde(default)]
    pub scheme_variables: BTreeMap<String, String>,

    #[serde(default)]
    pub hooks: Vec<HookDefinition>,

    /// Replaced by `deletion_grace_period`; rejected when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_deletion: Option<serde_json::Value>,
}

impl Default for ImportConfiguration {
    fn default() -> Self {
        Self {
            source_uid: None,
            mandatory_attributes: default_mandatory_attributes(),
            deletion_grace_period: 0,
            no_delete: false,
            dry_run: false,
            scheme: BTreeMap::new(),
            normalize: BTreeMap::new(),
            csv_mapping: BTreeMap::new(),
            incell_delimiter: default_incell_delimiter(),
            user_role: None,
            tolerate_errors: 0,
            csv_delimiter: default_csv_delimiter(),
            header_swap: BTreeMap::new(),
            username: UsernameSettings::default(),
            activate_new_users: default_activate_new_users(),
            legacy_username_matching: false,
            delete_before_create: false,
            action_timeout_ms: default_action_timeout_ms(),
            retry: RetrySettings::default(),
            scheme_variables: BTreeMap::new(),
            hooks: Vec::new(),
            user_deletion: None,
        }
    }
}

impl ImportConfiguration {
    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(json).map_err(|e| ConfigurationError::Parse {
            message: e.to_string(),
        })
    }

    /// Read and parse a JSON document from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigurationError::Unreadable {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&json)
    }

    /// Run every configuration check without keeping the compiled result.
    pub fn check(&self) -> Result<(), ConfigurationError> {
        self.clone().validate().map(|_| ())
    }

    /// Check the configuration and compile it for a run.
    pub fn validate(self) -> Result<ValidatedConfig, ConfigurationError> {
        let source_uid = self
            .source_uid
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigurationError::MissingOption {
                option: fields::SOURCE_UID.to_string(),
            })?
            .to_string();

        if self.user_deletion.is_some() {
            return Err(ConfigurationError::Deprecated {
                option: "user_deletion".to_string(),
                hint: "use 'deletion_grace_period' and 'no_delete'".to_string(),
            });
        }

        for field in fields::REQUIRED_MANDATORY {
            if !self.mandatory_attributes.contains(*field) {
                return Err(ConfigurationError::MandatoryAttributeOmitted {
                    field: field.to_string(),
                });
            }
        }

        let mapped = self.mapped_fields();
        if self.user_role.is_some() && mapped.contains(fields::ROLE_COLUMN) {
            return Err(ConfigurationError::ConflictingRoleSource);
        }

        self.check_role_keys()?;
        for (role, value) in self.username_lengths() {
            if !(USERNAME_MIN_LENGTH..=USERNAME_MAX_LENGTH).contains(&value) {
                return Err(ConfigurationError::UsernameLength {
                    role,
                    value,
                    min: USERNAME_MIN_LENGTH,
                    max: USERNAME_MAX_LENGTH,
                });
            }
        }

        if !self.csv_delimiter.is_ascii() {
            return Err(ConfigurationError::invalid(
                "csv_delimiter",
                "must be a single ASCII character",
            ));
        }
        if let Some((field, _)) = self.incell_delimiter.iter().find(|(_, d)| d.is_empty()) {
            return Err(ConfigurationError::invalid(
                format!("incell_delimiter.{field}"),
                "delimiter must not be empty",
            ));
        }
        if self.action_timeout_ms == 0 {
            return Err(ConfigurationError::invalid(
                "action_timeout_ms",
                "must be greater than zero",
            ));
        }

        let mut known: BTreeSet<String> = mapped
            .iter()
            .filter(|f| !f.starts_with("__"))
            .cloned()
            .collect();
        known.insert(fields::SOURCE_UID.to_string());
        known.insert(fields::ROLE.to_string());
        if mapped.contains(fields::SCHOOLS) {
            known.insert(fields::SCHOOL.to_string());
        }
        known.extend(self.scheme_variables.keys().cloned());

        let schemes = SchemeSet::compile(&self.scheme, &known)?;

        for field in &self.mandatory_attributes {
            if !known.contains(field) && !schemes.contains(field) {
                return Err(ConfigurationError::UnproducibleField {
                    field: field.clone(),
                });
            }
        }

        for hook in &self.hooks {
            hook.check()?;
        }

        Ok(ValidatedConfig {
            source_uid,
            schemes,
            known_fields: known,
            config: self,
        })
    }

    /// Fields targeted by `csv_mapping`.
    pub fn mapped_fields(&self) -> BTreeSet<String> {
        self.csv_mapping.values().cloned().collect()
    }

    fn check_role_keys(&self) -> Result<(), ConfigurationError> {
        let scoped = self
            .scheme
            .iter()
            .map(|(f, s)| (format!("scheme.{f}"), s.unknown_keys()))
            .chain(std::iter::once((
                "username.max_length".to_string(),
                self.username.max_length.unknown_keys(),
            )))
            .chain(std::iter::once((
                "activate_new_users".to_string(),
                self.activate_new_users.unknown_keys(),
            )));
        for (option, unknown) in scoped {
            if let Some(key) = unknown.first() {
                return Err(ConfigurationError::invalid(
                    option,
                    format!("'{key}' is neither 'default' nor a role"),
                ));
            }
        }
        Ok(())
    }

    fn username_lengths(&self) -> Vec<(String, usize)> {
        match &self.username.max_length {
            RoleScoped::Uniform(v) => vec![(DEFAULT_KEY.to_string(), *v)],
            RoleScoped::PerRole(map) => map.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }
}

/// A checked configuration with compiled schemes.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    source_uid: String,
    schemes: SchemeSet,
    known_fields: BTreeSet<String>,
    config: ImportConfiguration,
}

impl ValidatedConfig {
    pub fn source_uid(&self) -> &str {
        &self.source_uid
    }

    pub fn schemes(&self) -> &SchemeSet {
        &self.schemes
    }

    /// Fields a scheme may reference.
    pub fn known_fields(&self) -> &BTreeSet<String> {
        &self.known_fields
    }

    pub fn raw(&self) -> &ImportConfiguration {
        &self.config
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// Force dry-run mode regardless of the document.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.config.dry_run = dry_run;
    }

    pub fn should_normalize(&self, field: &str) -> bool {
        self.config.normalize.get(field).copied().unwrap_or(false)
    }

    pub fn is_multi_value(&self, field: &str) -> bool {
        fields::KNOWN_MULTI.contains(&field)
            || (field != DEFAULT_KEY && self.config.incell_delimiter.contains_key(field))
    }

    pub fn delimiter_for(&self, field: &str) -> &str {
        self.config
            .incell_delimiter
            .get(field)
            .or_else(|| self.config.incell_delimiter.get(DEFAULT_KEY))
            .map(String::as_str)
            .unwrap_or(",")
    }

    pub fn username_max_length(&self, role: Role) -> usize {
        self.config
            .username
            .max_length
            .for_role(role)
            .copied()
            .unwrap_or(USERNAME_MAX_LENGTH)
    }

    pub fn activate_new_user(&self, role: Role) -> bool {
        self.config
            .activate_new_users
            .for_role(role)
            .copied()
            .unwrap_or(true)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.config.retry.max_retries,
            initial_delay: Duration::from_millis(self.config.retry.initial_backoff_ms),
            max_delay: Duration::from_millis(self.config.retry.max_backoff_ms),
            ..RetryConfig::default()
        }
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.config.action_timeout_ms)
    }
}

fn default_mandatory_attributes() -> BTreeSet<String> {
    fields::REQUIRED_MANDATORY
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_incell_delimiter() -> BTreeMap<String, String> {
    BTreeMap::from([(DEFAULT_KEY.to_string(), ",".to_string())])
}

fn default_csv_delimiter() -> char {
    ','
}

fn default_username_max_length() -> RoleScoped<usize> {
    RoleScoped::PerRole(BTreeMap::from([
        (DEFAULT_KEY.to_string(), 20),
        (Role::Student.as_str().to_string(), 15),
    ]))
}

fn default_activate_new_users() -> RoleScoped<bool> {
    RoleScoped::PerRole(BTreeMap::from([(DEFAULT_KEY.to_string(), true)]))
}

fn default_max_counter_attempts() -> u32 {
    100
}

fn default_action_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}
