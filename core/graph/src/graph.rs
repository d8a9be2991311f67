use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::attributes::SetOutcome;
use crate::config::GraphConfig;
use crate::error::{Result, TopicError};
use crate::relationships::{RelatedTopicCollection, RelationshipConflict, RelationshipSide};
use crate::setters::{AttributeSetter, AttributeSetterTable};
use crate::topic::{attribute_keys, validate_key, Topic, TopicHandle, UNSAVED_ID};

/// Arena owning every topic of a tree (or forest). Parent, incoming
/// relationship and derived-topic links are handles into the arena; children
/// and outgoing relationships are the owning collections.
///
/// Handles stay valid for the lifetime of the graph: deleting a topic detaches
/// it, it is never freed.
#[derive(Debug)]
pub struct TopicGraph {
    topics: Vec<Topic>,
    ids: HashMap<i64, TopicHandle>,
    config: GraphConfig,
    setters: AttributeSetterTable,
    redirect_depth: usize,
}

impl Default for TopicGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicGraph {
    pub fn new() -> Self {
        Self::with_config(GraphConfig::default())
    }

    pub fn with_config(config: GraphConfig) -> Self {
        Self {
            topics: Vec::new(),
            ids: HashMap::new(),
            config,
            setters: AttributeSetterTable::with_defaults(),
            redirect_depth: 0,
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Add business logic for an attribute, for one content type or all
    pub fn register_setter(&mut self, content_type: Option<&str>, key: &str, setter: AttributeSetter) {
        self.setters.register(content_type, key, setter);
    }

    // ========== TOPIC LIFECYCLE ==========

    /// Create an unsaved topic, optionally attached under `parent`
    pub fn create_topic(
        &mut self,
        key: &str,
        content_type: &str,
        parent: Option<TopicHandle>,
    ) -> Result<TopicHandle> {
        self.create(key, content_type, parent, UNSAVED_ID)
    }

    /// Create a topic that already exists in the store. Its primary
    /// attributes start clean.
    pub fn create_topic_with_id(
        &mut self,
        key: &str,
        content_type: &str,
        parent: Option<TopicHandle>,
        id: i64,
    ) -> Result<TopicHandle> {
        if id < 0 {
            return Err(TopicError::InvalidArgument(format!(
                "persisted topic '{key}' needs a non-negative id, got {id}"
            )));
        }
        if let Some(existing) = self.ids.get(&id) {
            return Err(TopicError::ReferentialIntegrity(format!(
                "id {id} is already used by '{}'",
                self.unique_key(*existing)
            )));
        }
        self.create(key, content_type, parent, id)
    }

    fn create(
        &mut self,
        key: &str,
        content_type: &str,
        parent: Option<TopicHandle>,
        id: i64,
    ) -> Result<TopicHandle> {
        validate_key(key)?;
        if content_type.trim().is_empty() {
            return Err(TopicError::InvalidArgument(format!(
                "topic '{key}' needs a content type"
            )));
        }
        if let Some(parent) = parent {
            self.require(parent)?;
            if let Some(existing) = self.topic(parent).children.get(key) {
                let incoming = format!("{}:{}", self.unique_key(parent), key);
                return Err(self.duplicate_key(existing, incoming));
            }
        }

        let handle = TopicHandle::from_index(self.topics.len());
        let persisted = id >= 0;
        let mut topic = Topic::new(handle, key, content_type, id);
        topic
            .attributes
            .set_value(attribute_keys::KEY, Some(key), Some(!persisted), None);
        topic
            .attributes
            .set_value(attribute_keys::CONTENT_TYPE, Some(content_type), Some(!persisted), None);
        self.topics.push(topic);
        if persisted {
            self.ids.insert(id, handle);
        }

        if let Some(parent) = parent {
            self.attach(handle, parent, None)?;
            if persisted {
                self.topic_mut(handle)
                    .attributes
                    .mark_attribute_clean(attribute_keys::PARENT_ID, None);
            }
        }

        debug!("Created topic {} '{}' ({})", handle, key, content_type);
        Ok(handle)
    }

    // ========== LOOKUP ==========

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn contains(&self, handle: TopicHandle) -> bool {
        handle.index() < self.topics.len()
    }

    pub fn get(&self, handle: TopicHandle) -> Option<&Topic> {
        self.topics.get(handle.index())
    }

    /// # Panics
    /// If `handle` was not issued by this graph; use [`TopicGraph::get`] for
    /// untrusted handles.
    pub fn topic(&self, handle: TopicHandle) -> &Topic {
        &self.topics[handle.index()]
    }

    fn topic_mut(&mut self, handle: TopicHandle) -> &mut Topic {
        &mut self.topics[handle.index()]
    }

    /// The topic, or an argument error for a handle from another graph
    pub fn require(&self, handle: TopicHandle) -> Result<&Topic> {
        self.get(handle).ok_or_else(|| {
            TopicError::InvalidArgument(format!("topic {handle} does not belong to this graph"))
        })
    }

    pub fn handles(&self) -> impl Iterator<Item = TopicHandle> + '_ {
        self.topics.iter().map(Topic::handle)
    }

    pub fn roots(&self) -> Vec<TopicHandle> {
        self.topics
            .iter()
            .filter(|topic| topic.parent.is_none() && !topic.removed)
            .map(Topic::handle)
            .collect()
    }

    pub fn find_by_id(&self, id: i64) -> Option<TopicHandle> {
        self.ids.get(&id).copied()
    }

    /// Colon-delimited path of keys from the root, e.g. `Root:Web:Home`
    pub fn unique_key(&self, handle: TopicHandle) -> String {
        let mut keys = Vec::new();
        let mut current = self.get(handle);
        while let Some(topic) = current {
            keys.push(topic.key.as_str());
            current = topic.parent.and_then(|parent| self.get(parent));
        }
        keys.reverse();
        keys.join(":")
    }

    pub fn find_by_unique_key(&self, unique_key: &str) -> Option<TopicHandle> {
        let mut segments = unique_key.split(':');
        let first = segments.next()?;
        let mut current = self
            .topics
            .iter()
            .find(|topic| topic.parent.is_none() && !topic.removed && topic.key.eq_ignore_ascii_case(first))?
            .handle;
        for segment in segments {
            current = self.topic(current).children.get(segment)?;
        }
        Some(current)
    }

    pub fn children(&self, handle: TopicHandle) -> Vec<TopicHandle> {
        self.get(handle)
            .map(|topic| topic.children.to_vec())
            .unwrap_or_default()
    }

    /// `handle` and everything beneath it, parents before children
    pub fn descendants(&self, handle: TopicHandle) -> Vec<TopicHandle> {
        let mut ordered = Vec::new();
        let mut stack = vec![handle];
        while let Some(current) = stack.pop() {
            let Some(topic) = self.get(current) else {
                continue;
            };
            ordered.push(current);
            stack.extend(topic.children.iter().collect::<Vec<_>>().into_iter().rev());
        }
        ordered
    }

    /// Whether `ancestor` appears strictly above `handle`
    pub fn is_descendant_of(&self, handle: TopicHandle, ancestor: TopicHandle) -> bool {
        let mut current = self.get(handle).and_then(|topic| topic.parent);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.get(parent).and_then(|topic| topic.parent);
        }
        false
    }

    fn duplicate_key(&self, existing: TopicHandle, incoming: String) -> TopicError {
        TopicError::DuplicateKey {
            existing: self.unique_key(existing),
            incoming,
        }
    }

    // ========== IDENTITY ==========

    /// Record the id assigned by the store. Ids never change once set.
    pub fn assign_id(&mut self, handle: TopicHandle, id: i64) -> Result<()> {
        let current = self.require(handle)?.id;
        if id < 0 {
            return Err(TopicError::InvalidArgument(format!(
                "cannot assign negative id {id} to '{}'",
                self.unique_key(handle)
            )));
        }
        if current == id {
            return Ok(());
        }
        if current >= 0 {
            return Err(TopicError::InvalidOperation(format!(
                "'{}' already has id {current}",
                self.unique_key(handle)
            )));
        }
        if let Some(other) = self.ids.get(&id) {
            return Err(TopicError::ReferentialIntegrity(format!(
                "id {id} is already used by '{}'",
                self.unique_key(*other)
            )));
        }

        self.topic_mut(handle).id = id;
        self.ids.insert(id, handle);

        let parent_id = id.to_string();
        for child in self.children(handle) {
            self.topic_mut(child)
                .attributes
                .set_value(attribute_keys::PARENT_ID, Some(&parent_id), None, None);
        }
        Ok(())
    }

    /// Rename a topic. The owning children collection and every relationship
    /// set holding the topic are re-keyed in place.
    pub fn set_key(&mut self, handle: TopicHandle, key: &str) -> Result<()> {
        validate_key(key)?;
        let old_key = self.require(handle)?.key.clone();
        if old_key == key {
            return Ok(());
        }

        let parent = self.topic(handle).parent;
        if let Some(parent) = parent {
            if let Some(existing) = self.topic(parent).children.get(key) {
                if existing != handle {
                    let incoming = format!("{}:{}", self.unique_key(parent), key);
                    return Err(self.duplicate_key(existing, incoming));
                }
            }
        }

        let mut sources: Vec<TopicHandle> = self
            .topic(handle)
            .incoming_relationships
            .edges()
            .into_iter()
            .map(|(_, source)| source)
            .collect();
        sources.sort();
        sources.dedup();
        let mut targets: Vec<TopicHandle> = self
            .topic(handle)
            .relationships
            .edges()
            .into_iter()
            .map(|(_, target)| target)
            .collect();
        targets.sort();
        targets.dedup();

        for (relationship, source) in self.topic(handle).incoming_relationships.edges() {
            if let Some(existing) = self
                .topic(source)
                .relationships
                .conflict_for(&relationship, key, handle)
            {
                return Err(self.duplicate_key(existing, key.to_string()));
            }
        }
        for (relationship, target) in self.topic(handle).relationships.edges() {
            if let Some(existing) = self
                .topic(target)
                .incoming_relationships
                .conflict_for(&relationship, key, handle)
            {
                return Err(self.duplicate_key(existing, key.to_string()));
            }
        }

        if let Some(parent) = parent {
            if let Err(existing) = self.topic_mut(parent).children.change_key(handle, key) {
                return Err(self.duplicate_key(existing, key.to_string()));
            }
        }
        for source in sources {
            if let Err(existing) = self.topic_mut(source).relationships.change_key(handle, key) {
                return Err(self.duplicate_key(existing, key.to_string()));
            }
        }
        for target in targets {
            if let Err(existing) = self
                .topic_mut(target)
                .incoming_relationships
                .change_key(handle, key)
            {
                return Err(self.duplicate_key(existing, key.to_string()));
            }
        }

        let topic = self.topic_mut(handle);
        if topic.id >= 0 {
            match topic.original_key.as_deref() {
                None => topic.original_key = Some(old_key.clone()),
                Some(original) if original == key => topic.original_key = None,
                Some(_) => {}
            }
        }
        topic.key = key.to_string();
        topic
            .attributes
            .set_value(attribute_keys::KEY, Some(key), None, None);

        debug!("Renamed topic {} from '{}' to '{}'", handle, old_key, key);
        Ok(())
    }

    pub(crate) fn clear_original_key(&mut self, handle: TopicHandle) -> Option<String> {
        self.topic_mut(handle).original_key.take()
    }

    pub fn set_content_type(&mut self, handle: TopicHandle, content_type: &str) -> Result<()> {
        self.require(handle)?;
        if content_type.trim().is_empty() {
            return Err(TopicError::InvalidArgument(format!(
                "'{}' needs a content type",
                self.unique_key(handle)
            )));
        }
        let topic = self.topic_mut(handle);
        topic.content_type = content_type.to_string();
        topic
            .attributes
            .set_value(attribute_keys::CONTENT_TYPE, Some(content_type), None, None);
        Ok(())
    }

    // ========== HIERARCHY ==========

    /// Check that `handle` may be placed under `parent`, after `sibling`
    pub fn validate_parent(
        &self,
        handle: TopicHandle,
        parent: TopicHandle,
        sibling: Option<TopicHandle>,
    ) -> Result<()> {
        let topic = self.require(handle)?;
        self.require(parent)?;
        if handle == parent {
            return Err(TopicError::InvalidArgument(format!(
                "'{}' cannot be its own parent",
                self.unique_key(handle)
            )));
        }
        if self.is_descendant_of(parent, handle) {
            return Err(TopicError::InvalidArgument(format!(
                "'{}' cannot be placed beneath its own descendant '{}'",
                self.unique_key(handle),
                self.unique_key(parent)
            )));
        }
        if let Some(sibling) = sibling {
            self.require(sibling)?;
            if sibling == handle {
                return Err(TopicError::InvalidArgument(format!(
                    "'{}' cannot be positioned relative to itself",
                    self.unique_key(handle)
                )));
            }
            if self.topic(sibling).parent != Some(parent) {
                return Err(TopicError::InvalidArgument(format!(
                    "'{}' is not a child of '{}'",
                    self.unique_key(sibling),
                    self.unique_key(parent)
                )));
            }
        }
        if let Some(existing) = self.topic(parent).children.get(&topic.key) {
            if existing != handle {
                return Err(self.duplicate_key(existing, self.unique_key(handle)));
            }
        }
        Ok(())
    }

    /// Move `handle` under `parent`, directly after `sibling` when given and
    /// last otherwise
    pub fn set_parent(
        &mut self,
        handle: TopicHandle,
        parent: TopicHandle,
        sibling: Option<TopicHandle>,
    ) -> Result<()> {
        self.validate_parent(handle, parent, sibling)?;
        self.detach_from_parent(handle);
        self.attach(handle, parent, sibling)
    }

    /// Remove `handle` from its parent's children. This is the only way a
    /// topic leaves the tree; relationships are left untouched.
    pub fn detach(&mut self, handle: TopicHandle) -> Result<Option<TopicHandle>> {
        self.require(handle)?;
        Ok(self.detach_from_parent(handle))
    }

    /// Take `handle` and its subtree out of the graph after a delete. The
    /// subtree is detached, dropped from the id index and loses its stored
    /// parent id, so later loads cannot re-attach it.
    pub fn forget(&mut self, handle: TopicHandle) -> Result<Vec<TopicHandle>> {
        self.require(handle)?;
        self.detach_from_parent(handle);
        self.topic_mut(handle).attributes.discard(attribute_keys::PARENT_ID);

        let subtree = self.descendants(handle);
        for current in &subtree {
            let id = self.topic(*current).id;
            if self.ids.get(&id) == Some(current) {
                self.ids.remove(&id);
            }
            self.topic_mut(*current).removed = true;
        }
        debug!("Removed {} topics from the graph", subtree.len());
        Ok(subtree)
    }

    fn detach_from_parent(&mut self, handle: TopicHandle) -> Option<TopicHandle> {
        let parent = self.topic_mut(handle).parent.take()?;
        self.topic_mut(parent).children.remove(handle);
        Some(parent)
    }

    fn attach(
        &mut self,
        handle: TopicHandle,
        parent: TopicHandle,
        sibling: Option<TopicHandle>,
    ) -> Result<()> {
        let position = sibling
            .and_then(|sibling| self.topic(parent).children.position(sibling))
            .map(|position| position + 1);
        let key = self.topic(handle).key.clone();
        if let Err(existing) = self.topic_mut(parent).children.insert(position, &key, handle) {
            return Err(self.duplicate_key(existing, self.unique_key(handle)));
        }

        self.topic_mut(handle).parent = Some(parent);
        let parent_id = self.topic(parent).id;
        if parent_id >= 0 {
            self.topic_mut(handle).attributes.set_value(
                attribute_keys::PARENT_ID,
                Some(&parent_id.to_string()),
                None,
                None,
            );
        }
        Ok(())
    }

    // ========== DERIVED TOPICS ==========

    pub fn set_derived_topic(&mut self, handle: TopicHandle, derived: Option<TopicHandle>) -> Result<()> {
        self.require(handle)?;
        match derived {
            Some(derived) => {
                self.require(derived)?;
                if derived == handle {
                    return Err(TopicError::InvalidArgument(format!(
                        "'{}' cannot derive from itself",
                        self.unique_key(handle)
                    )));
                }
                let derived_id = self.topic(derived).id;
                let topic = self.topic_mut(handle);
                topic.derived_topic = Some(derived);
                if derived_id >= 0 {
                    topic.attributes.set_value(
                        attribute_keys::DERIVED_TOPIC,
                        Some(&derived_id.to_string()),
                        None,
                        None,
                    );
                }
            }
            None => {
                let topic = self.topic_mut(handle);
                topic.derived_topic = None;
                topic
                    .attributes
                    .set_value(attribute_keys::DERIVED_TOPIC, None, None, None);
            }
        }
        Ok(())
    }

    // ========== ATTRIBUTES ==========

    /// Local, non-empty value
    pub fn attribute(&self, handle: TopicHandle, key: &str) -> Option<&str> {
        self.get(handle)
            .and_then(|topic| topic.attributes.local_value(key))
    }

    /// Resolve `key` locally, then through the derived topic (up to the
    /// configured hop budget), then through the parent chain.
    pub fn get_value(
        &self,
        handle: TopicHandle,
        key: &str,
        default: &str,
        inherit_from_parent: bool,
        inherit_from_derived: bool,
    ) -> String {
        self.get_value_with_hops(
            handle,
            key,
            default,
            inherit_from_parent,
            inherit_from_derived,
            self.config.max_derived_hops,
        )
    }

    pub fn get_value_with_hops(
        &self,
        handle: TopicHandle,
        key: &str,
        default: &str,
        inherit_from_parent: bool,
        inherit_from_derived: bool,
        max_hops: usize,
    ) -> String {
        self.resolve(handle, key, inherit_from_parent, inherit_from_derived, max_hops)
            .unwrap_or(default)
            .to_string()
    }

    fn resolve(
        &self,
        handle: TopicHandle,
        key: &str,
        inherit_from_parent: bool,
        inherit_from_derived: bool,
        hops: usize,
    ) -> Option<&str> {
        let topic = self.get(handle)?;
        if let Some(value) = topic.attributes.local_value(key) {
            return Some(value);
        }

        if inherit_from_derived && hops > 0 && !key.eq_ignore_ascii_case(attribute_keys::DERIVED_TOPIC) {
            if let Some(derived) = topic.derived_topic {
                let inherited =
                    self.resolve(derived, key, inherit_from_parent, inherit_from_derived, hops - 1);
                if inherited.is_some() {
                    return inherited;
                }
            }
        }

        if inherit_from_parent {
            if let Some(parent) = topic.parent {
                return self.resolve(parent, key, inherit_from_parent, inherit_from_derived, hops);
            }
        }
        None
    }

    /// Write an attribute through any business logic registered for it
    pub fn set_attribute(&mut self, handle: TopicHandle, key: &str, value: Option<&str>) -> Result<()> {
        let content_type = self.require(handle)?.content_type.clone();
        if key.trim().is_empty() {
            return Err(TopicError::InvalidArgument(
                "attribute key cannot be empty".to_string(),
            ));
        }

        let Some(setter) = self.setters.lookup(&content_type, key) else {
            return self.write_attribute(handle, key, value, None).map(|_| ());
        };

        if self.redirect_depth >= self.config.max_setter_depth {
            warn!(
                "Setter redirection for '{}' on {} exceeded {} levels",
                key, handle, self.config.max_setter_depth
            );
            return Err(TopicError::SetterRecursion {
                key: key.to_string(),
                limit: self.config.max_setter_depth,
            });
        }

        self.redirect_depth += 1;
        let result = setter(self, handle, value);
        self.redirect_depth -= 1;
        result
    }

    /// Write an attribute value directly, bypassing business logic. Used by
    /// setters and by loaders reflecting persisted state.
    pub fn write_attribute(
        &mut self,
        handle: TopicHandle,
        key: &str,
        value: Option<&str>,
        is_dirty: Option<bool>,
    ) -> Result<SetOutcome> {
        self.require(handle)?;
        if key.trim().is_empty() {
            return Err(TopicError::InvalidArgument(
                "attribute key cannot be empty".to_string(),
            ));
        }
        Ok(self
            .topic_mut(handle)
            .attributes
            .set_value(key, value, is_dirty, None))
    }

    /// Same as [`TopicGraph::write_attribute`] with an explicit last-modified
    /// stamp
    pub fn write_attribute_at(
        &mut self,
        handle: TopicHandle,
        key: &str,
        value: Option<&str>,
        is_dirty: Option<bool>,
        last_modified: DateTime<Utc>,
    ) -> Result<SetOutcome> {
        self.require(handle)?;
        Ok(self
            .topic_mut(handle)
            .attributes
            .set_value(key, value, is_dirty, Some(last_modified)))
    }

    /// Drop an attribute entry; primary attributes cannot be removed
    pub fn remove_attribute(&mut self, handle: TopicHandle, key: &str) -> Result<bool> {
        self.require(handle)?;
        if attribute_keys::is_primary(key) {
            return Err(TopicError::InvalidOperation(format!(
                "primary attribute '{key}' cannot be removed"
            )));
        }
        Ok(self.topic_mut(handle).attributes.remove(key).is_some())
    }

    // ========== RELATIONSHIPS ==========

    /// Add `target` to `source`'s outgoing `relationship`, mirroring the
    /// incoming edge on `target`. Returns false if it was already present.
    pub fn set_relationship(
        &mut self,
        source: TopicHandle,
        relationship: &str,
        target: TopicHandle,
    ) -> Result<bool> {
        self.set_related(source, RelationshipSide::Outgoing, relationship, target)
    }

    pub fn remove_relationship(
        &mut self,
        source: TopicHandle,
        relationship: &str,
        target: TopicHandle,
    ) -> Result<bool> {
        self.remove_related(source, RelationshipSide::Outgoing, relationship, target)
    }

    /// Add an edge on either side. Incoming collections reject direct edits;
    /// they only change as the mirror of an outgoing edge.
    pub fn set_related(
        &mut self,
        owner: TopicHandle,
        side: RelationshipSide,
        relationship: &str,
        target: TopicHandle,
    ) -> Result<bool> {
        self.set_related_edge(owner, side, relationship, target, false)
    }

    pub fn remove_related(
        &mut self,
        owner: TopicHandle,
        side: RelationshipSide,
        relationship: &str,
        target: TopicHandle,
    ) -> Result<bool> {
        self.remove_related_edge(owner, side, relationship, target, false)
    }

    /// Remove every target of `relationship`, mirrors included
    pub fn clear_relationship(&mut self, source: TopicHandle, relationship: &str) -> Result<usize> {
        self.require(source)?;
        let removed = match self
            .topic_mut(source)
            .relationships
            .clear_key(relationship, false)
        {
            Ok(removed) => removed,
            Err(conflict) => {
                return Err(self.relationship_error(conflict, source, relationship, source))
            }
        };
        for target in &removed {
            self.remove_related_edge(*target, RelationshipSide::Incoming, relationship, source, true)?;
        }
        Ok(removed.len())
    }

    fn collection_mut(&mut self, handle: TopicHandle, side: RelationshipSide) -> &mut RelatedTopicCollection {
        let topic = self.topic_mut(handle);
        match side {
            RelationshipSide::Outgoing => &mut topic.relationships,
            RelationshipSide::Incoming => &mut topic.incoming_relationships,
        }
    }

    fn collection(&self, handle: TopicHandle, side: RelationshipSide) -> &RelatedTopicCollection {
        let topic = self.topic(handle);
        match side {
            RelationshipSide::Outgoing => &topic.relationships,
            RelationshipSide::Incoming => &topic.incoming_relationships,
        }
    }

    fn set_related_edge(
        &mut self,
        owner: TopicHandle,
        side: RelationshipSide,
        relationship: &str,
        target: TopicHandle,
        is_incoming_edge: bool,
    ) -> Result<bool> {
        self.require(owner)?;
        self.require(target)?;
        validate_key(relationship)?;

        if self.collection(owner, side).is_incoming() && !is_incoming_edge {
            return Err(self.relationship_error(
                RelationshipConflict::IncomingGuard,
                owner,
                relationship,
                target,
            ));
        }

        // Reject a mirror conflict up front so neither side changes
        if !is_incoming_edge {
            let owner_key = self.topic(owner).key.clone();
            let mirror = self.collection(target, RelationshipSide::Incoming);
            if let Some(existing) = mirror.conflict_for(relationship, &owner_key, owner) {
                return Err(self.duplicate_key(existing, self.unique_key(owner)));
            }
        }

        let target_key = self.topic(target).key.clone();
        let inserted = match self.collection_mut(owner, side).set_topic(
            relationship,
            &target_key,
            target,
            is_incoming_edge,
        ) {
            Ok(inserted) => inserted,
            Err(conflict) => return Err(self.relationship_error(conflict, owner, relationship, target)),
        };

        if inserted && !is_incoming_edge {
            self.set_related_edge(target, RelationshipSide::Incoming, relationship, owner, true)?;
        }
        Ok(inserted)
    }

    fn remove_related_edge(
        &mut self,
        owner: TopicHandle,
        side: RelationshipSide,
        relationship: &str,
        target: TopicHandle,
        is_incoming_edge: bool,
    ) -> Result<bool> {
        self.require(owner)?;
        self.require(target)?;

        let removed = match self
            .collection_mut(owner, side)
            .remove_topic(relationship, target, is_incoming_edge)
        {
            Ok(removed) => removed,
            Err(conflict) => return Err(self.relationship_error(conflict, owner, relationship, target)),
        };

        if removed && !is_incoming_edge {
            self.remove_related_edge(target, RelationshipSide::Incoming, relationship, owner, true)?;
        }
        Ok(removed)
    }

    fn relationship_error(
        &self,
        conflict: RelationshipConflict,
        owner: TopicHandle,
        relationship: &str,
        target: TopicHandle,
    ) -> TopicError {
        match conflict {
            RelationshipConflict::IncomingGuard => TopicError::InvalidOperation(format!(
                "incoming relationship '{}' of '{}' can only change by editing the outgoing side",
                relationship,
                self.unique_key(owner)
            )),
            RelationshipConflict::DuplicateKey(existing) => {
                self.duplicate_key(existing, self.unique_key(target))
            }
        }
    }

    // ========== PERSISTENCE STATE ==========

    pub fn is_dirty(&self, handle: TopicHandle) -> bool {
        self.get(handle).map(Topic::is_dirty).unwrap_or(false)
    }

    /// Clear attribute and relationship dirty flags after a successful save
    /// or load
    pub fn mark_clean(&mut self, handle: TopicHandle, version: Option<DateTime<Utc>>) -> Result<()> {
        self.require(handle)?;
        let topic = self.topic_mut(handle);
        topic.attributes.mark_clean(version);
        topic.relationships.mark_clean();
        topic.incoming_relationships.mark_clean();
        Ok(())
    }

    /// Clear attribute flags only, leaving relationship state alone
    pub fn mark_attributes_clean(&mut self, handle: TopicHandle, version: Option<DateTime<Utc>>) -> Result<()> {
        self.require(handle)?;
        self.topic_mut(handle).attributes.mark_clean(version);
        Ok(())
    }

    pub fn mark_attribute_clean(&mut self, handle: TopicHandle, key: &str) -> Result<()> {
        self.require(handle)?;
        self.topic_mut(handle)
            .attributes
            .mark_attribute_clean(key, None);
        Ok(())
    }

    pub fn mark_relationship_clean(&mut self, handle: TopicHandle, relationship: &str) -> Result<()> {
        self.require(handle)?;
        self.topic_mut(handle)
            .relationships
            .mark_key_clean(relationship);
        Ok(())
    }

    /// Prepend a saved version
    pub fn push_version(&mut self, handle: TopicHandle, version: DateTime<Utc>) -> Result<()> {
        self.require(handle)?;
        let history = &mut self.topic_mut(handle).version_history;
        if history.first() != Some(&version) {
            history.insert(0, version);
        }
        Ok(())
    }

    pub fn set_version_history(&mut self, handle: TopicHandle, mut versions: Vec<DateTime<Utc>>) -> Result<()> {
        self.require(handle)?;
        versions.sort_unstable_by(|a, b| b.cmp(a));
        versions.dedup();
        self.topic_mut(handle).version_history = versions;
        Ok(())
    }
}
