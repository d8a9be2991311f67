use std::collections::BTreeMap;

use crate::collections::KeyedTopicCollection;
use crate::topic::TopicHandle;

/// Which side of a relationship a collection records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipSide {
    Outgoing,
    Incoming,
}

/// Why a relationship collection rejected a change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelationshipConflict {
    /// Incoming collections only change while mirroring an outgoing edge
    IncomingGuard,
    /// Another topic with the same key is already in the named set
    DuplicateKey(TopicHandle),
}

/// The topics related to one topic under a single relationship key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedTopicCollection {
    name: String,
    topics: KeyedTopicCollection,
    is_dirty: bool,
}

impl NamedTopicCollection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            topics: KeyedTopicCollection::new(),
            is_dirty: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topics(&self) -> &KeyedTopicCollection {
        &self.topics
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn contains(&self, handle: TopicHandle) -> bool {
        self.topics.contains(handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = TopicHandle> + '_ {
        self.topics.iter()
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    fn insert(&mut self, topic_key: &str, handle: TopicHandle) -> Result<bool, TopicHandle> {
        if self.topics.contains(handle) {
            return Ok(false);
        }
        self.topics.insert(None, topic_key, handle)?;
        self.is_dirty = true;
        Ok(true)
    }

    fn remove(&mut self, handle: TopicHandle) -> bool {
        let removed = self.topics.remove(handle);
        if removed {
            self.is_dirty = true;
        }
        removed
    }

    fn clear(&mut self) -> Vec<TopicHandle> {
        self.is_dirty = true;
        self.topics.clear()
    }

    fn mark_clean(&mut self) {
        self.is_dirty = false;
    }
}

/// Relationship key → related topics. One instance holds a topic's outgoing
/// edges, another its incoming edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedTopicCollection {
    side: RelationshipSide,
    collections: BTreeMap<String, NamedTopicCollection>,
}

impl RelatedTopicCollection {
    pub fn new(side: RelationshipSide) -> Self {
        Self {
            side,
            collections: BTreeMap::new(),
        }
    }

    pub fn outgoing() -> Self {
        Self::new(RelationshipSide::Outgoing)
    }

    pub fn incoming() -> Self {
        Self::new(RelationshipSide::Incoming)
    }

    pub fn side(&self) -> RelationshipSide {
        self.side
    }

    pub fn is_incoming(&self) -> bool {
        self.side == RelationshipSide::Incoming
    }

    /// Relationship keys with their original casing
    pub fn keys(&self) -> Vec<&str> {
        self.collections.values().map(|c| c.name.as_str()).collect()
    }

    pub fn get(&self, relationship_key: &str) -> Option<&NamedTopicCollection> {
        self.collections.get(&relationship_key.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedTopicCollection> {
        self.collections.values()
    }

    pub fn contains(&self, relationship_key: &str, handle: TopicHandle) -> bool {
        self.get(relationship_key)
            .map(|collection| collection.contains(handle))
            .unwrap_or(false)
    }

    /// Every (relationship key, topic) pair, in key order
    pub fn edges(&self) -> Vec<(String, TopicHandle)> {
        self.collections
            .values()
            .flat_map(|collection| collection.iter().map(|h| (collection.name.clone(), h)))
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.collections.values().any(NamedTopicCollection::is_dirty)
    }

    fn guard(&self, is_incoming_edge: bool) -> Result<(), RelationshipConflict> {
        if self.is_incoming() && !is_incoming_edge {
            return Err(RelationshipConflict::IncomingGuard);
        }
        Ok(())
    }

    pub(crate) fn set_topic(
        &mut self,
        relationship_key: &str,
        topic_key: &str,
        handle: TopicHandle,
        is_incoming_edge: bool,
    ) -> Result<bool, RelationshipConflict> {
        self.guard(is_incoming_edge)?;
        self.collections
            .entry(relationship_key.to_ascii_lowercase())
            .or_insert_with(|| NamedTopicCollection::new(relationship_key))
            .insert(topic_key, handle)
            .map_err(RelationshipConflict::DuplicateKey)
    }

    /// Whether `set_topic` would collide with a different topic of the same key
    pub(crate) fn conflict_for(&self, relationship_key: &str, topic_key: &str, handle: TopicHandle) -> Option<TopicHandle> {
        self.get(relationship_key)
            .and_then(|collection| collection.topics.get(topic_key))
            .filter(|existing| *existing != handle)
    }

    pub(crate) fn remove_topic(
        &mut self,
        relationship_key: &str,
        handle: TopicHandle,
        is_incoming_edge: bool,
    ) -> Result<bool, RelationshipConflict> {
        self.guard(is_incoming_edge)?;
        Ok(self
            .collections
            .get_mut(&relationship_key.to_ascii_lowercase())
            .map(|collection| collection.remove(handle))
            .unwrap_or(false))
    }

    pub(crate) fn clear_key(
        &mut self,
        relationship_key: &str,
        is_incoming_edge: bool,
    ) -> Result<Vec<TopicHandle>, RelationshipConflict> {
        self.guard(is_incoming_edge)?;
        Ok(self
            .collections
            .get_mut(&relationship_key.to_ascii_lowercase())
            .map(NamedTopicCollection::clear)
            .unwrap_or_default())
    }

    pub(crate) fn change_key(&mut self, handle: TopicHandle, new_key: &str) -> Result<(), TopicHandle> {
        for collection in self.collections.values_mut() {
            if collection.contains(handle) {
                collection.topics.change_key(handle, new_key)?;
            }
        }
        Ok(())
    }

    pub fn mark_clean(&mut self) {
        self.collections
            .values_mut()
            .for_each(NamedTopicCollection::mark_clean);
    }

    pub(crate) fn mark_key_clean(&mut self, relationship_key: &str) {
        if let Some(collection) = self.collections.get_mut(&relationship_key.to_ascii_lowercase()) {
            collection.mark_clean();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(index: usize) -> TopicHandle {
        TopicHandle::from_index(index)
    }

    #[test]
    fn test_set_topic_creates_named_collection() {
        let mut related = RelatedTopicCollection::outgoing();
        assert_eq!(related.set_topic("Related", "A", handle(1), false), Ok(true));
        assert_eq!(related.set_topic("related", "A", handle(1), false), Ok(false));

        let named = related.get("RELATED").unwrap();
        assert_eq!(named.name(), "Related");
        assert_eq!(named.len(), 1);
        assert!(named.is_dirty());
        assert!(related.contains("Related", handle(1)));
    }

    #[test]
    fn test_incoming_collection_requires_incoming_flag() {
        let mut incoming = RelatedTopicCollection::incoming();
        assert_eq!(
            incoming.set_topic("Related", "A", handle(1), false),
            Err(RelationshipConflict::IncomingGuard)
        );
        assert_eq!(
            incoming.remove_topic("Related", handle(1), false),
            Err(RelationshipConflict::IncomingGuard)
        );
        assert_eq!(incoming.set_topic("Related", "A", handle(1), true), Ok(true));
        assert_eq!(incoming.remove_topic("Related", handle(1), true), Ok(true));
    }

    #[test]
    fn test_duplicate_key_in_target_set() {
        let mut related = RelatedTopicCollection::outgoing();
        related.set_topic("Related", "Home", handle(1), false).unwrap();
        assert_eq!(
            related.set_topic("Related", "home", handle(2), false),
            Err(RelationshipConflict::DuplicateKey(handle(1)))
        );
        assert_eq!(related.get("Related").unwrap().len(), 1);
        assert_eq!(related.conflict_for("Related", "HOME", handle(2)), Some(handle(1)));
        assert_eq!(related.conflict_for("Related", "HOME", handle(1)), None);
    }

    #[test]
    fn test_dirty_tracking_per_named_collection() {
        let mut related = RelatedTopicCollection::outgoing();
        related.set_topic("Related", "A", handle(1), false).unwrap();
        related.set_topic("Tags", "B", handle(2), false).unwrap();
        related.mark_clean();
        assert!(!related.is_dirty());

        related.remove_topic("Tags", handle(2), false).unwrap();
        assert!(related.get("Tags").unwrap().is_dirty());
        assert!(!related.get("Related").unwrap().is_dirty());
        assert!(related.is_dirty());

        related.mark_key_clean("tags");
        assert!(!related.is_dirty());

        assert_eq!(related.clear_key("Related", false).unwrap(), vec![handle(1)]);
        assert!(related.is_dirty());
    }

    #[test]
    fn test_change_key_across_named_collections() {
        let mut related = RelatedTopicCollection::outgoing();
        related.set_topic("Related", "A", handle(1), false).unwrap();
        related.set_topic("Tags", "A", handle(1), false).unwrap();
        related.change_key(handle(1), "Renamed").unwrap();

        assert_eq!(related.get("Tags").unwrap().topics().get("renamed"), Some(handle(1)));
        assert_eq!(
            related.edges(),
            vec![("Related".to_string(), handle(1)), ("Tags".to_string(), handle(1))]
        );
    }
}
