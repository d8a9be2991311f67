use chrono::{DateTime, Utc};
use ontopic_graph::{
    attribute_keys, ObserverId, RepositoryBase, RepositoryObserver, Result, TopicError, TopicGraph,
    TopicHandle, TopicRepository,
};
use ontopic_schemas::{ContentTypeProvider, ContentTypeRegistry};
use rusqlite::Connection;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RepositoryConfig;
use crate::loader::{apply_result_sets, refresh_result_sets};
use crate::procedures::{self, TopicWrite, VersionRow};
use crate::schema::init_schema;
use crate::xml::encode_attributes;

/// [`TopicRepository`] backed by SQLite. Every call opens its own
/// connection and drops it before returning.
pub struct SqlTopicRepository {
    config: RepositoryConfig,
    base: RepositoryBase,
    content_types: Box<dyn ContentTypeProvider>,
}

impl fmt::Debug for SqlTopicRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlTopicRepository")
            .field("config", &self.config)
            .field("base", &self.base)
            .finish()
    }
}

/// Outcome of writing one topic
struct WriteOutcome {
    written: bool,
    /// Relationship targets or the derived topic were not saved yet
    pending: bool,
}

impl SqlTopicRepository {
    /// Repository without touching the database
    pub fn new<P>(config: RepositoryConfig, content_types: P) -> Self
    where
        P: ContentTypeProvider + 'static,
    {
        Self {
            config,
            base: RepositoryBase::new(),
            content_types: Box::new(content_types),
        }
    }

    /// Repository over a database whose schema has been created
    pub fn open<P>(config: RepositoryConfig, content_types: P) -> Result<Self>
    where
        P: ContentTypeProvider + 'static,
    {
        let repository = Self::new(config, content_types);
        let conn = repository.connect()?;
        init_schema(&conn).map_err(|e| repository.storage_error("init schema", "", e))?;
        info!("Topic repository ready at {}", repository.config.database_path.display());
        Ok(repository)
    }

    /// Open with no content type metadata
    pub fn open_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        Self::open(RepositoryConfig::new(path), ContentTypeRegistry::new())
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// New graph configured like this repository
    pub fn new_graph(&self) -> TopicGraph {
        TopicGraph::with_config(self.config.graph)
    }

    fn storage_error<E: fmt::Display>(&self, operation: &str, topic: &str, err: E) -> TopicError {
        TopicError::storage(operation, topic, err)
    }

    fn connect(&self) -> Result<Connection> {
        let path = self.config.database_path.display().to_string();
        let conn = Connection::open(&self.config.database_path)
            .map_err(|e| self.storage_error("connect", &path, e))?;
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(|e| self.storage_error("connect", &path, e))?;
        conn.busy_timeout(Duration::from_millis(self.config.busy_timeout_ms))
            .map_err(|e| self.storage_error("connect", &path, e))?;
        Ok(conn)
    }

    /// Stored versions of a topic with their draft flags, most recent first
    pub fn version_rows(&self, id: i64) -> Result<Vec<VersionRow>> {
        let conn = self.connect()?;
        procedures::topic_versions(&conn, id).map_err(|e| self.storage_error("version history", &id.to_string(), e))
    }

    // ========== LOADING ==========

    fn load_tree(
        &self,
        conn: &Connection,
        graph: &mut TopicGraph,
        root_id: Option<i64>,
        recursive: bool,
        version: Option<DateTime<Utc>>,
    ) -> Result<Vec<TopicHandle>> {
        let label = root_id.map(|id| id.to_string()).unwrap_or_else(|| "roots".to_string());
        let sets = procedures::get_topics(conn, root_id, recursive, version)
            .map_err(|e| self.storage_error("load", &label, e))?;
        if sets.is_empty() {
            return Err(TopicError::NotFound(label));
        }
        match version {
            Some(_) => refresh_result_sets(graph, sets),
            None => apply_result_sets(graph, sets),
        }
    }

    /// Load the ancestors of `id` missing from `graph` so it attaches in place
    fn load_ancestors(&self, conn: &Connection, graph: &mut TopicGraph, id: i64) -> Result<()> {
        let ancestors = procedures::ancestor_ids(conn, id)
            .map_err(|e| self.storage_error("load ancestors", &id.to_string(), e))?;
        for ancestor in ancestors {
            if graph.find_by_id(ancestor).is_none() {
                self.load_tree(conn, graph, Some(ancestor), false, None)?;
            }
        }
        Ok(())
    }

    fn load_with_ancestors(&self, graph: &mut TopicGraph, id: i64, recursive: bool) -> Result<TopicHandle> {
        let conn = self.connect()?;
        self.load_ancestors(&conn, graph, id)?;
        self.load_tree(&conn, graph, Some(id), recursive, None)?;
        graph
            .find_by_id(id)
            .ok_or_else(|| TopicError::NotFound(id.to_string()))
    }

    // ========== SAVING ==========

    /// Id of a persisted topic, or a validation error before any I/O
    fn persisted_id(graph: &TopicGraph, handle: TopicHandle, operation: &str) -> Result<i64> {
        let topic = graph.require(handle)?;
        if topic.is_new() {
            return Err(TopicError::InvalidArgument(format!(
                "cannot {operation} '{}' before it has been saved",
                graph.unique_key(handle)
            )));
        }
        Ok(topic.id())
    }

    fn build_write(&self, graph: &TopicGraph, handle: TopicHandle, is_draft: bool) -> Result<(TopicWrite, Vec<(String, Vec<i64>)>, bool)> {
        let topic = graph.topic(handle);
        let parent_id = match topic.parent() {
            Some(parent) => Some(Self::persisted_id(graph, parent, "save a child of")?),
            None => None,
        };

        let descriptors = self.content_types.attribute_descriptors(topic.content_type());
        let extended: HashSet<String> = descriptors
            .iter()
            .filter(|descriptor| descriptor.is_extended)
            .map(|descriptor| descriptor.key.to_ascii_lowercase())
            .collect();
        let is_extended = |key: &str| extended.contains(&key.to_ascii_lowercase());

        let attributes: Vec<(String, Option<String>)> = topic
            .attributes()
            .dirty_values()
            .filter(|value| !attribute_keys::is_primary(value.key()) && !is_extended(value.key()))
            .map(|value| {
                let stored = (!value.is_empty()).then(|| value.value().to_string());
                (value.key().to_string(), stored)
            })
            .collect();

        let extended_xml = if topic
            .attributes()
            .dirty_values()
            .any(|value| is_extended(value.key()))
        {
            let values = topic
                .attributes()
                .iter()
                .filter(|value| is_extended(value.key()) && !value.is_empty())
                .map(|value| (value.key(), value.value()));
            Some(encode_attributes(values)?)
        } else {
            None
        };

        let null_attributes = if topic.is_new() {
            Vec::new()
        } else {
            descriptors
                .iter()
                .filter(|descriptor| descriptor.kind.is_stored_as_attribute() && !descriptor.is_extended)
                .filter(|descriptor| !attribute_keys::is_primary(&descriptor.key))
                .filter(|descriptor| topic.attributes().local_value(&descriptor.key).is_none())
                .map(|descriptor| descriptor.key.clone())
                .collect()
        };

        let mut pending = topic
            .derived_topic()
            .map(|derived| graph.topic(derived).is_new())
            .unwrap_or(false);

        let mut relationships = Vec::new();
        for collection in topic.relationships().iter().filter(|collection| collection.is_dirty()) {
            let ids: Vec<i64> = collection.iter().map(|target| graph.topic(target).id()).collect();
            if ids.iter().any(|id| *id < 0) {
                pending = true;
                continue;
            }
            relationships.push((collection.name().to_string(), ids));
        }

        let write = TopicWrite {
            key: topic.key().to_string(),
            content_type: topic.content_type().to_string(),
            parent_id,
            attributes,
            extended_xml,
            null_attributes,
            is_draft,
        };
        Ok((write, relationships, pending))
    }

    /// Whether the derived topic or a dirty relationship target has no id yet
    fn has_unsaved_references(graph: &TopicGraph, handle: TopicHandle) -> bool {
        let topic = graph.topic(handle);
        let derived_unsaved = topic
            .derived_topic()
            .map(|derived| graph.topic(derived).is_new())
            .unwrap_or(false);
        derived_unsaved
            || topic
                .relationships()
                .iter()
                .filter(|collection| collection.is_dirty())
                .any(|collection| collection.iter().any(|target| graph.topic(target).is_new()))
    }

    fn write_topic(
        &self,
        conn: &mut Connection,
        graph: &mut TopicGraph,
        handle: TopicHandle,
        is_draft: bool,
    ) -> Result<WriteOutcome> {
        if !graph.is_dirty(handle) {
            return Ok(WriteOutcome {
                written: false,
                pending: false,
            });
        }

        let label = graph.unique_key(handle);
        let (write, relationships, pending) = self.build_write(graph, handle, is_draft)?;
        let existing_id = graph.topic(handle).id();

        let tx = conn
            .transaction()
            .map_err(|e| self.storage_error("save", &label, e))?;
        let (id, version) = if existing_id < 0 {
            procedures::create_topic(&tx, &write)
        } else {
            procedures::update_topic(&tx, existing_id, &write).map(|version| (existing_id, version))
        }
        .map_err(|e| self.storage_error("save", &label, e))?;
        for (key, target_ids) in &relationships {
            procedures::update_relationships(&tx, id, key, target_ids)
                .map_err(|e| self.storage_error("save relationships", &label, e))?;
        }
        tx.commit().map_err(|e| self.storage_error("save", &label, e))?;

        if existing_id < 0 {
            graph.assign_id(handle, id)?;
        }
        graph.mark_attributes_clean(handle, Some(version))?;
        for (key, _) in &relationships {
            graph.mark_relationship_clean(handle, key)?;
        }
        graph.push_version(handle, version)?;

        debug!("Saved '{}' as {} ({} values)", label, id, write.attributes.len());
        Ok(WriteOutcome { written: true, pending })
    }
}

impl TopicRepository for SqlTopicRepository {
    fn load(&self, graph: &mut TopicGraph, unique_key: Option<&str>, recursive: bool) -> Result<TopicHandle> {
        let Some(unique_key) = unique_key else {
            let conn = self.connect()?;
            let loaded = self.load_tree(&conn, graph, None, recursive, None)?;
            return loaded
                .into_iter()
                .filter(|handle| graph.topic(*handle).parent().is_none())
                .min_by_key(|handle| graph.topic(*handle).id())
                .ok_or_else(|| TopicError::NotFound("roots".to_string()));
        };

        let id = {
            let conn = self.connect()?;
            procedures::find_topic_id(&conn, unique_key)
                .map_err(|e| self.storage_error("load", unique_key, e))?
        };
        let id = id.ok_or_else(|| TopicError::NotFound(unique_key.to_string()))?;
        self.load_with_ancestors(graph, id, recursive)
    }

    fn load_by_id(&self, graph: &mut TopicGraph, id: i64, recursive: bool) -> Result<TopicHandle> {
        self.load_with_ancestors(graph, id, recursive)
    }

    fn load_version(&self, graph: &mut TopicGraph, id: i64, version: DateTime<Utc>) -> Result<TopicHandle> {
        let conn = self.connect()?;
        self.load_ancestors(&conn, graph, id)?;
        self.load_tree(&conn, graph, Some(id), false, Some(version))?;
        graph
            .find_by_id(id)
            .ok_or_else(|| TopicError::NotFound(id.to_string()))
    }

    fn save(&mut self, graph: &mut TopicGraph, topic: TopicHandle, recursive: bool, is_draft: bool) -> Result<i64> {
        graph.require(topic)?;
        if let Some(parent) = graph.topic(topic).parent() {
            Self::persisted_id(graph, parent, "save a child of")?;
        }

        self.base.save(graph, topic, recursive)?;

        let scope = if recursive {
            graph.descendants(topic)
        } else {
            vec![topic]
        };

        let mut conn = self.connect()?;
        let mut written = 0;
        let mut pending = Vec::new();
        for handle in &scope {
            let outcome = self.write_topic(&mut conn, graph, *handle, is_draft)?;
            if outcome.written {
                written += 1;
            }
            if outcome.pending {
                pending.push(*handle);
            }
        }

        // References to topics that were unsaved during the first pass
        for handle in pending {
            if Self::has_unsaved_references(graph, handle) {
                warn!(
                    "'{}' still references unsaved topics; those references were not persisted",
                    graph.unique_key(handle)
                );
                continue;
            }
            if let Some(derived) = graph.topic(handle).derived_topic() {
                graph.set_derived_topic(handle, Some(derived))?;
            }
            self.write_topic(&mut conn, graph, handle, is_draft)?;
        }

        let id = graph.topic(topic).id();
        info!("Saved {} of {} topics under '{}' ({})", written, scope.len(), graph.unique_key(topic), id);
        Ok(id)
    }

    fn move_topic(
        &mut self,
        graph: &mut TopicGraph,
        topic: TopicHandle,
        target: TopicHandle,
        sibling: Option<TopicHandle>,
    ) -> Result<()> {
        graph.validate_parent(topic, target, sibling)?;
        let topic_id = Self::persisted_id(graph, topic, "move")?;
        let target_id = Self::persisted_id(graph, target, "move under")?;
        let sibling_id = match sibling {
            Some(sibling) => Some(Self::persisted_id(graph, sibling, "position after")?),
            None => None,
        };

        self.base.move_topic(graph, topic, target, sibling)?;

        let label = graph.unique_key(topic);
        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .map_err(|e| self.storage_error("move", &label, e))?;
        procedures::move_topic(&tx, topic_id, target_id, sibling_id)
            .map_err(|e| self.storage_error("move", &label, e))?;
        tx.commit().map_err(|e| self.storage_error("move", &label, e))?;

        graph.mark_attribute_clean(topic, attribute_keys::PARENT_ID)?;
        info!("Moved '{}' under {}", label, target_id);
        Ok(())
    }

    fn delete(&mut self, graph: &mut TopicGraph, topic: TopicHandle, recursive: bool) -> Result<()> {
        self.base.validate_delete(graph, topic, recursive)?;
        let topic_id = graph.topic(topic).id();
        let label = graph.unique_key(topic);

        // Children that were never loaded still count
        if !recursive && topic_id >= 0 {
            let conn = self.connect()?;
            let stored = procedures::child_count(&conn, topic_id)
                .map_err(|e| self.storage_error("delete", &label, e))?;
            if stored > 0 {
                return Err(TopicError::ReferentialIntegrity(format!(
                    "'{}' has {} stored children; delete it recursively",
                    label, stored
                )));
            }
        }

        self.base.delete(graph, topic, recursive)?;
        if topic_id < 0 {
            debug!("Deleted unsaved topic '{}' from memory only", label);
            return Ok(());
        }

        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .map_err(|e| self.storage_error("delete", &label, e))?;
        let deleted = procedures::delete_topic(&tx, topic_id)
            .map_err(|e| self.storage_error("delete", &label, e))?;
        tx.commit().map_err(|e| self.storage_error("delete", &label, e))?;

        if deleted == 0 {
            warn!("Topic '{}' ({}) had no stored row", label, topic_id);
        } else {
            info!("Deleted '{}' ({})", label, topic_id);
        }
        Ok(())
    }

    fn subscribe(&mut self, observer: Box<dyn RepositoryObserver>) -> ObserverId {
        self.base.subscribe(observer)
    }

    fn unsubscribe(&mut self, id: ObserverId) -> bool {
        self.base.unsubscribe(id)
    }
}
