//! Entry types and operations

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::times::Times;

/// A string that is zeroed on drop, used for in-memory passwords.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SecureString(String);

impl SecureString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for SecureString {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SecureString {}

impl std::fmt::Debug for SecureString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureString(***)")
    }
}

impl Serialize for SecureString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SecureString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(SecureString(String::deserialize(deserializer)?))
    }
}

impl From<&str> for SecureString {
    fn from(s: &str) -> Self {
        SecureString::new(s)
    }
}

/// A non-standard entry field with its own protection flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomField {
    pub value: String,
    pub protected: bool,
}

impl CustomField {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            protected: false,
        }
    }

    pub fn protected(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            protected: true,
        }
    }
}

/// A password entry.
///
/// One unified type covers both formats: history, custom fields and tags
/// stay empty for KDB v3 files, the binary description is unused for
/// KDBX files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Immutable 16-byte identity
    pub uuid: Uuid,
    pub title: String,
    pub username: String,
    pub password: SecureString,
    pub url: String,
    pub notes: String,
    pub icon_id: u32,
    pub custom_icon: Option<Uuid>,
    /// Extra fields keyed by name; BTreeMap keeps serialization order
    /// stable, which the inner stream cipher depends on
    #[serde(default)]
    pub custom_fields: BTreeMap<String, CustomField>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub override_url: String,
    pub foreground_color: String,
    pub background_color: String,
    pub auto_type_enabled: bool,
    /// UUID of the owning group (back-reference, never an ownership edge)
    pub parent: Option<Uuid>,
    pub times: Times,
    /// Prior snapshots of this logical entry, oldest first (KDBX only)
    #[serde(default)]
    pub history: Vec<Entry>,
    /// Attachment name → index into the database binary pool
    #[serde(default)]
    pub binaries: BTreeMap<String, usize>,
    /// KDB v3 single-attachment description
    #[serde(default)]
    pub binary_description: String,
}

impl Entry {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            title: title.into(),
            username: String::new(),
            password: SecureString::default(),
            url: String::new(),
            notes: String::new(),
            icon_id: 0,
            custom_icon: None,
            custom_fields: BTreeMap::new(),
            tags: Vec::new(),
            override_url: String::new(),
            foreground_color: String::new(),
            background_color: String::new(),
            auto_type_enabled: true,
            parent: None,
            times: Times::now(),
            history: Vec::new(),
            binaries: BTreeMap::new(),
            binary_description: String::new(),
        }
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = SecureString::new(password);
        self.times.touch_modified();
    }

    pub fn password(&self) -> &str {
        self.password.as_str()
    }

    pub fn is_expired(&self) -> bool {
        self.times.is_expired()
    }

    /// UUID as lowercase hex without hyphens, the form the search engine
    /// matches against.
    pub fn uuid_hex(&self) -> String {
        self.uuid.simple().to_string()
    }

    /// Push the current state onto the history list, then prune to the
    /// given caps (oldest first). A negative cap disables that limit.
    pub fn snapshot_into_history(&mut self, max_items: i32, max_size_bytes: i64) {
        let mut snapshot = self.clone();
        snapshot.history.clear();
        self.history.push(snapshot);
        self.prune_history(max_items, max_size_bytes);
    }

    pub fn prune_history(&mut self, max_items: i32, max_size_bytes: i64) {
        if max_items >= 0 {
            while self.history.len() > max_items as usize {
                self.history.remove(0);
            }
        }
        if max_size_bytes >= 0 {
            while self.history_size() > max_size_bytes as u64 && !self.history.is_empty() {
                self.history.remove(0);
            }
        }
    }

    /// Approximate serialized size of the history list, the measure the
    /// size cap is applied to.
    fn history_size(&self) -> u64 {
        self.history.iter().map(Entry::approximate_size).sum()
    }

    fn approximate_size(&self) -> u64 {
        let strings = self.title.len()
            + self.username.len()
            + self.password.as_str().len()
            + self.url.len()
            + self.notes.len()
            + self.override_url.len()
            + self
                .custom_fields
                .iter()
                .map(|(k, v)| k.len() + v.value.len())
                .sum::<usize>();
        128 + strings as u64
    }
}

/// Builder for creating entries
pub struct EntryBuilder {
    entry: Entry,
}

impl EntryBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            entry: Entry::new(title),
        }
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.entry.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.entry.password = SecureString::new(password);
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.entry.url = url.into();
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.entry.notes = notes.into();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.entry.tags.push(tag.into());
        self
    }

    pub fn custom_field(mut self, key: impl Into<String>, value: CustomField) -> Self {
        self.entry.custom_fields.insert(key.into(), value);
        self
    }

    pub fn parent(mut self, group_uuid: Uuid) -> Self {
        self.entry.parent = Some(group_uuid);
        self
    }

    pub fn build(self) -> Entry {
        self.entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let entry = EntryBuilder::new("GitHub")
            .username("octocat")
            .password("s3cret")
            .url("https://github.com")
            .tag("dev")
            .custom_field("2FA", CustomField::protected("otpauth://..."))
            .build();
        assert_eq!(entry.title, "GitHub");
        assert_eq!(entry.password(), "s3cret");
        assert!(entry.custom_fields["2FA"].protected);
    }

    #[test]
    fn history_count_cap_prunes_oldest() {
        let mut entry = Entry::new("A");
        for i in 0..5 {
            entry.title = format!("rev{i}");
            entry.snapshot_into_history(3, -1);
        }
        assert_eq!(entry.history.len(), 3);
        assert_eq!(entry.history[0].title, "rev2");
        assert_eq!(entry.history[2].title, "rev4");
    }

    #[test]
    fn history_size_cap_prunes_oldest() {
        let mut entry = Entry::new("A");
        entry.notes = "x".repeat(4096);
        entry.snapshot_into_history(-1, -1);
        entry.snapshot_into_history(-1, -1);
        entry.prune_history(-1, 5000);
        assert_eq!(entry.history.len(), 1);
    }

    #[test]
    fn secure_string_compares_by_value() {
        assert_eq!(SecureString::new("a"), SecureString::new("a"));
        assert_ne!(SecureString::new("a"), SecureString::new("b"));
    }

    #[test]
    fn uuid_hex_is_32_chars() {
        assert_eq!(Entry::new("x").uuid_hex().len(), 32);
    }
}
