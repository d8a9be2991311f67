use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One attribute of a topic. Values are never edited in place: every write
/// produces a new `AttributeValue` that replaces the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeValue {
    key: String,
    value: String,
    is_dirty: bool,
    last_modified: DateTime<Utc>,
}

impl AttributeValue {
    pub fn new(key: &str, value: &str, is_dirty: bool) -> Self {
        Self::with_last_modified(key, value, is_dirty, Utc::now())
    }

    pub fn with_last_modified(
        key: &str,
        value: &str,
        is_dirty: bool,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            is_dirty,
            last_modified,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Empty values act as tombstones and never satisfy a lookup
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    fn cleaned(&self, version: Option<DateTime<Utc>>) -> Self {
        Self::with_last_modified(
            &self.key,
            &self.value,
            false,
            version.unwrap_or(self.last_modified),
        )
    }
}

/// Result of a write into an [`AttributeValueCollection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Inserted,
    Replaced,
    Unchanged,
    /// An empty value for a key that was never set
    Ignored,
}

/// The attribute values owned by a single topic. Lookups are
/// case-insensitive; inheritance is resolved by the graph, which knows the
/// topic's parent and derived topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeValueCollection {
    values: BTreeMap<String, AttributeValue>,
    had_deletion: bool,
}

impl AttributeValueCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(&key.to_ascii_lowercase())
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.values.get(&key.to_ascii_lowercase())
    }

    /// Local, non-empty value for `key`
    pub fn local_value(&self, key: &str) -> Option<&str> {
        self.get(key)
            .filter(|attribute| !attribute.is_empty())
            .map(AttributeValue::value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttributeValue> {
        self.values.values()
    }

    pub fn dirty_values(&self) -> impl Iterator<Item = &AttributeValue> {
        self.values.values().filter(|attribute| attribute.is_dirty)
    }

    /// True if any value is dirty or a value was removed since the last clean
    pub fn is_dirty(&self) -> bool {
        self.had_deletion || self.values.values().any(|attribute| attribute.is_dirty)
    }

    pub fn is_attribute_dirty(&self, key: &str) -> bool {
        self.get(key).map(|attribute| attribute.is_dirty).unwrap_or(false)
    }

    pub fn had_deletion(&self) -> bool {
        self.had_deletion
    }

    /// Upsert a value. `is_dirty` overrides the computed dirty state, which
    /// otherwise is "changed from the previous value".
    pub(crate) fn set_value(
        &mut self,
        key: &str,
        value: Option<&str>,
        is_dirty: Option<bool>,
        last_modified: Option<DateTime<Utc>>,
    ) -> SetOutcome {
        let normalized = key.to_ascii_lowercase();
        let value = value.unwrap_or("");
        let stamp = last_modified.unwrap_or_else(Utc::now);

        let existing = match self.values.get(&normalized) {
            Some(existing) => existing,
            None if value.is_empty() => return SetOutcome::Ignored,
            None => {
                self.values.insert(
                    normalized,
                    AttributeValue::with_last_modified(key, value, is_dirty.unwrap_or(true), stamp),
                );
                return SetOutcome::Inserted;
            }
        };

        if existing.value == value && is_dirty.is_none() {
            return SetOutcome::Unchanged;
        }

        let dirty = is_dirty.unwrap_or(true);
        if value.is_empty() && !existing.is_empty() && dirty {
            self.had_deletion = true;
        }

        let replacement = AttributeValue::with_last_modified(&existing.key, value, dirty, stamp);
        self.values.insert(normalized, replacement);
        SetOutcome::Replaced
    }

    /// Drop the entry for `key` entirely
    pub(crate) fn remove(&mut self, key: &str) -> Option<AttributeValue> {
        let removed = self.values.remove(&key.to_ascii_lowercase());
        if removed.is_some() {
            self.had_deletion = true;
        }
        removed
    }

    /// Drop the entry for `key` without recording a deletion
    pub(crate) fn discard(&mut self, key: &str) -> Option<AttributeValue> {
        self.values.remove(&key.to_ascii_lowercase())
    }

    /// Clear every dirty flag and the deletion marker; `version` becomes the
    /// last-modified stamp of the values that were dirty.
    pub fn mark_clean(&mut self, version: Option<DateTime<Utc>>) {
        for attribute in self.values.values_mut() {
            if attribute.is_dirty {
                *attribute = attribute.cleaned(version);
            }
        }
        self.had_deletion = false;
    }

    pub fn mark_attribute_clean(&mut self, key: &str, version: Option<DateTime<Utc>>) {
        if let Some(attribute) = self.values.get_mut(&key.to_ascii_lowercase()) {
            *attribute = attribute.cleaned(version);
        }
    }
}
