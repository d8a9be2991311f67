use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::attributes::AttributeValueCollection;
use crate::collections::KeyedTopicCollection;
use crate::error::{Result, TopicError};
use crate::relationships::RelatedTopicCollection;

/// Id of a topic that has not been persisted yet
pub const UNSAVED_ID: i64 = -1;

/// Attribute keys the graph keeps in sync with topic state
pub mod attribute_keys {
    pub const KEY: &str = "Key";
    pub const CONTENT_TYPE: &str = "ContentType";
    pub const PARENT_ID: &str = "ParentID";
    /// Id of the derived topic; never inherited through derivation itself
    pub const DERIVED_TOPIC: &str = "TopicID";

    /// Attributes persisted as columns of the topic row rather than as
    /// attribute rows
    pub fn is_primary(key: &str) -> bool {
        [KEY, CONTENT_TYPE, PARENT_ID]
            .iter()
            .any(|primary| primary.eq_ignore_ascii_case(key))
    }
}

/// Position of a topic inside its [`crate::TopicGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicHandle(usize);

impl TopicHandle {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for TopicHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

fn key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("valid key pattern"))
}

/// Reject empty keys and keys with characters outside `[A-Za-z0-9_.-]`
pub fn validate_key(key: &str) -> Result<()> {
    if key_pattern().is_match(key) {
        Ok(())
    } else {
        Err(TopicError::InvalidKey(key.to_string()))
    }
}

/// A node of the topic tree. Fields are changed through the owning graph so
/// that parent/child and relationship mirrors stay consistent.
#[derive(Debug, Clone)]
pub struct Topic {
    pub(crate) handle: TopicHandle,
    pub(crate) id: i64,
    pub(crate) key: String,
    pub(crate) original_key: Option<String>,
    pub(crate) content_type: String,
    pub(crate) attributes: AttributeValueCollection,
    pub(crate) parent: Option<TopicHandle>,
    pub(crate) children: KeyedTopicCollection,
    pub(crate) relationships: RelatedTopicCollection,
    pub(crate) incoming_relationships: RelatedTopicCollection,
    pub(crate) derived_topic: Option<TopicHandle>,
    pub(crate) version_history: Vec<DateTime<Utc>>,
    pub(crate) removed: bool,
}

impl Topic {
    pub(crate) fn new(handle: TopicHandle, key: &str, content_type: &str, id: i64) -> Self {
        Self {
            handle,
            id,
            key: key.to_string(),
            original_key: None,
            content_type: content_type.to_string(),
            attributes: AttributeValueCollection::new(),
            parent: None,
            children: KeyedTopicCollection::new(),
            relationships: RelatedTopicCollection::outgoing(),
            incoming_relationships: RelatedTopicCollection::incoming(),
            derived_topic: None,
            version_history: Vec::new(),
            removed: false,
        }
    }

    pub fn handle(&self) -> TopicHandle {
        self.handle
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn is_new(&self) -> bool {
        self.id < 0
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Key before a pending rename, until the rename is saved
    pub fn original_key(&self) -> Option<&str> {
        self.original_key.as_deref()
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn attributes(&self) -> &AttributeValueCollection {
        &self.attributes
    }

    pub fn parent(&self) -> Option<TopicHandle> {
        self.parent
    }

    pub fn children(&self) -> &KeyedTopicCollection {
        &self.children
    }

    pub fn relationships(&self) -> &RelatedTopicCollection {
        &self.relationships
    }

    pub fn incoming_relationships(&self) -> &RelatedTopicCollection {
        &self.incoming_relationships
    }

    pub fn derived_topic(&self) -> Option<TopicHandle> {
        self.derived_topic
    }

    /// Saved versions, most recent first
    pub fn version_history(&self) -> &[DateTime<Utc>] {
        &self.version_history
    }

    /// Deleted from the graph; the handle stays valid but the topic is no
    /// longer reachable by id or unique key
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Unsaved, or carrying attribute or outgoing relationship changes
    pub fn is_dirty(&self) -> bool {
        self.is_new() || self.attributes.is_dirty() || self.relationships.is_dirty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("Home").is_ok());
        assert!(validate_key("web_2.0-beta").is_ok());
        assert_eq!(validate_key(""), Err(TopicError::InvalidKey(String::new())));
        assert!(validate_key("Root:Home").is_err());
        assert!(validate_key("has space").is_err());
    }

    #[test]
    fn test_primary_attribute_keys() {
        assert!(attribute_keys::is_primary("key"));
        assert!(attribute_keys::is_primary("ParentId"));
        assert!(!attribute_keys::is_primary("TopicID"));
        assert!(!attribute_keys::is_primary("Title"));
    }

    #[test]
    fn test_new_topic_is_dirty() {
        let topic = Topic::new(TopicHandle::from_index(0), "Home", "Page", UNSAVED_ID);
        assert!(topic.is_new());
        assert!(topic.is_dirty());

        let loaded = Topic::new(TopicHandle::from_index(1), "Home", "Page", 12);
        assert!(!loaded.is_dirty());
        assert!(loaded.incoming_relationships().is_incoming());
    }
}
