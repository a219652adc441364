//! Username formatting and disambiguation.
//!
//! A username candidate is rendered by the scheme engine, cleaned up by
//! [`UsernameFormatter`] and then made unique by [`UsernameAllocator`],
//! which advances the counter placeholder until neither this run nor the
//! store already uses the candidate.

use rostersync_directory::{DirectoryStore, Filter};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::ValidatedConfig;
use crate::error::{ImportError, MappingError};
use crate::normalize::transliterate;
use crate::record::{fields, IdentityKey, Role};
use crate::scheme::{CounterStyle, Rendered};

/// Room reserved for the counter when a template carries one.
const COUNTER_WIDTH: usize = 3;

/// Cleans rendered usernames for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsernameFormatter {
    max_length: usize,
    allowed_special_chars: String,
    lowercase: bool,
}

impl UsernameFormatter {
    pub fn new(max_length: usize, allowed_special_chars: impl Into<String>, lowercase: bool) -> Self {
        Self {
            max_length,
            allowed_special_chars: allowed_special_chars.into(),
            lowercase,
        }
    }

    pub fn for_role(config: &ValidatedConfig, role: Role) -> Self {
        let settings = &config.raw().username;
        Self::new(
            config.username_max_length(role),
            settings.allowed_special_chars.clone(),
            settings.lowercase,
        )
    }

    fn filter(&self, text: &str) -> String {
        let filtered: String = transliterate(text)
            .chars()
            .filter(|c| {
                c.is_ascii_alphanumeric() || *c == '.' || self.allowed_special_chars.contains(*c)
            })
            .collect();
        if self.lowercase {
            filtered.to_lowercase()
        } else {
            filtered
        }
    }

    /// Format a complete username.
    pub fn format(&self, raw: &str, has_counter: bool) -> String {
        let limit = if has_counter {
            self.max_length.saturating_sub(COUNTER_WIDTH)
        } else {
            self.max_length
        };
        let cleaned = self.filter(raw);
        let truncated: String = cleaned.trim_matches('.').chars().take(limit).collect();
        truncated.trim_matches('.').to_string()
    }

    /// Format a rendered template, keeping its counter position.
    ///
    /// The suffix after the counter is kept whole; the prefix is shortened
    /// so that prefix, counter and suffix fit the length limit.
    pub fn format_template(&self, rendered: &Rendered) -> Rendered {
        if rendered.counter.is_none() {
            return Rendered {
                prefix: self.format(&format!("{}{}", rendered.prefix, rendered.suffix), false),
                counter: None,
                suffix: String::new(),
            };
        }
        let suffix = self.filter(&rendered.suffix).trim_end_matches('.').to_string();
        let limit = self
            .max_length
            .saturating_sub(COUNTER_WIDTH)
            .saturating_sub(suffix.chars().count());
        let cleaned = self.filter(&rendered.prefix);
        let prefix: String = cleaned.trim_start_matches('.').chars().take(limit).collect();
        let prefix = prefix.trim_start_matches('.').to_string();
        let prefix = if suffix.is_empty() {
            prefix.trim_end_matches('.').to_string()
        } else {
            prefix
        };
        Rendered {
            prefix,
            counter: rendered.counter,
            suffix,
        }
    }
}

/// Give a scheme rendering without a counter the implicit `[COUNTER2]`.
pub fn with_implicit_counter(rendered: Rendered) -> Rendered {
    if rendered.counter.is_some() {
        return rendered;
    }
    Rendered {
        prefix: format!("{}{}", rendered.prefix, rendered.suffix),
        counter: Some(CounterStyle::FromTwo),
        suffix: String::new(),
    }
}

/// Assigns unique usernames within one run.
#[derive(Debug, Clone)]
pub struct UsernameAllocator {
    assigned: BTreeMap<String, IdentityKey>,
    /// Store usernames whose owner is deleted before any create runs.
    released: BTreeSet<String>,
    max_attempts: u32,
}

impl UsernameAllocator {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            assigned: BTreeMap::new(),
            released: BTreeSet::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Treat `usernames` as free even though the store still holds them.
    #[must_use]
    pub fn with_released(mut self, usernames: BTreeSet<String>) -> Self {
        self.released = usernames;
        self
    }

    /// Mark a username as used by `identity`, e.g. one kept from the store.
    pub fn reserve(&mut self, username: impl Into<String>, identity: IdentityKey) {
        self.assigned.insert(username.into(), identity);
    }

    pub fn is_assigned(&self, username: &str) -> bool {
        self.assigned.contains_key(username)
    }

    async fn is_taken(
        &self,
        candidate: &str,
        identity: &IdentityKey,
        store: &dyn DirectoryStore,
    ) -> Result<bool, ImportError> {
        if let Some(owner) = self.assigned.get(candidate) {
            return Ok(owner != identity);
        }
        if self.released.contains(candidate) {
            return Ok(false);
        }
        let owners = store.search(&Filter::eq(fields::USERNAME, candidate)).await?;
        Ok(owners.iter().any(|e| {
            e.attribute(fields::SOURCE_UID) != Some(identity.source_uid.as_str())
                || e.attribute(fields::RECORD_UID) != Some(identity.record_uid.as_str())
        }))
    }

    /// Find the first free candidate for `template` and reserve it.
    pub async fn allocate(
        &mut self,
        template: &Rendered,
        identity: &IdentityKey,
        line: usize,
        store: &dyn DirectoryStore,
    ) -> Result<String, ImportError> {
        if template.is_empty() {
            return Err(MappingError::new(line, fields::USERNAME, "username is empty after formatting").into());
        }
        let attempts = if template.counter.is_some() {
            self.max_attempts
        } else {
            1
        };
        for attempt in 0..attempts {
            let candidate = template.with_counter(attempt);
            if !self.is_taken(&candidate, identity, store).await? {
                debug!(identity = %identity, username = %candidate, attempt, "Assigned username");
                self.reserve(candidate.clone(), identity.clone());
                return Ok(candidate);
            }
        }
        Err(ImportError::IdentityCollision {
            identity: identity.to_string(),
            message: format!(
                "username '{}' still taken after {attempts} attempts",
                template.first()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rostersync_directory::{AttributeSet, InMemoryDirectory, NewEntity};

    fn formatter(max_length: usize) -> UsernameFormatter {
        UsernameFormatter::new(max_length, "", true)
    }

    fn template(prefix: &str) -> Rendered {
        with_implicit_counter(Rendered {
            prefix: prefix.to_string(),
            counter: None,
            suffix: String::new(),
        })
    }

    #[test]
    fn test_format_filters_and_truncates() {
        let f = formatter(20);
        assert_eq!(f.format("Max.Mustermann", false), "max.mustermann");
        assert_eq!(f.format(".Jörg-Peter O'Neil.", false), "joergpeteroneil");
        assert_eq!(f.format("Ǹanâ.Müstèrmánn", false), "nana.muestermann");
        assert_eq!(
            formatter(8).format("Max.Mustermann", false),
            "max.must"
        );
        // dots left dangling by the cut are removed
        assert_eq!(formatter(4).format("Max.Mustermann", false), "max");
    }

    #[test]
    fn test_counter_reserves_room() {
        let f = formatter(12);
        assert_eq!(f.format("Maximilian.Mustermann", true), "maximilia");
        let t = f.format_template(&template("Maximilian.Mustermann"));
        assert_eq!(t.first(), "maximilia");
        assert_eq!(t.with_counter(1), "maximilia2");
    }

    #[test]
    fn test_allowed_special_chars() {
        let f = UsernameFormatter::new(20, "-_", false);
        assert_eq!(f.format("Jean-Luc_Picard!", false), "Jean-Luc_Picard");
    }

    #[test]
    fn test_template_keeps_suffix() {
        let f = formatter(15);
        let rendered = Rendered {
            prefix: "Anna.".to_string(),
            counter: Some(CounterStyle::Always),
            suffix: ".Ext".to_string(),
        };
        let t = f.format_template(&rendered);
        assert_eq!(t.with_counter(0), "anna.1.ext");
    }

    #[tokio::test]
    async fn test_allocation_advances_counter_within_run() {
        let store = InMemoryDirectory::new();
        let mut allocator = UsernameAllocator::new(100);
        let t = formatter(15).format_template(&template("A.Mueller"));

        let first = allocator
            .allocate(&t, &IdentityKey::new("sis", "1"), 2, &store)
            .await
            .unwrap();
        let second = allocator
            .allocate(&t, &IdentityKey::new("sis", "2"), 3, &store)
            .await
            .unwrap();
        assert_eq!(first, "a.mueller");
        assert_eq!(second, "a.mueller2");
    }

    #[tokio::test]
    async fn test_allocation_skips_store_owned_names() {
        let store = InMemoryDirectory::new();
        store.add_school("SchoolA").await;
        store
            .create(NewEntity::new(
                "a.mueller",
                "SchoolA",
                AttributeSet::new()
                    .with("username", "a.mueller")
                    .with("source_uid", "hr")
                    .with("record_uid", "1"),
            ))
            .await
            .unwrap();

        let mut allocator = UsernameAllocator::new(100);
        let t = formatter(15).format_template(&template("a.mueller"));
        let name = allocator
            .allocate(&t, &IdentityKey::new("sis", "1"), 2, &store)
            .await
            .unwrap();
        assert_eq!(name, "a.mueller2");
    }

    #[tokio::test]
    async fn test_released_names_are_free_again() {
        let store = InMemoryDirectory::new();
        store.add_school("SchoolA").await;
        store
            .create(NewEntity::new(
                "a.mueller",
                "SchoolA",
                AttributeSet::new()
                    .with("username", "a.mueller")
                    .with("source_uid", "sis")
                    .with("record_uid", "1"),
            ))
            .await
            .unwrap();

        let mut allocator =
            UsernameAllocator::new(100).with_released(BTreeSet::from(["a.mueller".to_string()]));
        let t = formatter(15).format_template(&template("a.mueller"));
        let first = allocator
            .allocate(&t, &IdentityKey::new("sis", "2"), 2, &store)
            .await
            .unwrap();
        let second = allocator
            .allocate(&t, &IdentityKey::new("sis", "3"), 3, &store)
            .await
            .unwrap();
        assert_eq!(first, "a.mueller");
        assert_eq!(second, "a.mueller2");
    }

    #[tokio::test]
    async fn test_allocation_gives_up_after_budget() {
        let store = InMemoryDirectory::new();
        let mut allocator = UsernameAllocator::new(2);
        let t = formatter(15).format_template(&template("x.y"));
        for uid in ["1", "2"] {
            allocator
                .allocate(&t, &IdentityKey::new("sis", uid), 2, &store)
                .await
                .unwrap();
        }
        assert!(matches!(
            allocator
                .allocate(&t, &IdentityKey::new("sis", "3"), 4, &store)
                .await,
            Err(ImportError::IdentityCollision { .. })
        ));
    }

    #[tokio::test]
    async fn test_fixed_username_collides_immediately() {
        let store = InMemoryDirectory::new();
        let mut allocator = UsernameAllocator::new(100);
        allocator.reserve("max", IdentityKey::new("sis", "1"));
        let fixed = formatter(20).format_template(&Rendered {
            prefix: "max".to_string(),
            counter: None,
            suffix: String::new(),
        });
        assert!(allocator
            .allocate(&fixed, &IdentityKey::new("sis", "2"), 3, &store)
            .await
            .is_err());
        // the owner itself may keep it
        assert_eq!(
            allocator
                .allocate(&fixed, &IdentityKey::new("sis", "1"), 2, &store)
                .await
                .unwrap(),
            "max"
        );
    }
}
