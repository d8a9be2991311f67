use chrono::{DateTime, Utc};
use std::fmt;
use tracing::debug;

use crate::error::{Result, TopicError};
use crate::graph::TopicGraph;
use crate::topic::{TopicHandle, UNSAVED_ID};

// ============================================================================
// Events
// ============================================================================

/// A persisted topic was saved under a new key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameEvent {
    pub topic: TopicHandle,
    pub topic_id: i64,
    pub old_key: String,
    pub new_key: String,
}

/// A topic is about to be placed under `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveEvent {
    pub topic: TopicHandle,
    pub topic_id: i64,
    pub source: Option<TopicHandle>,
    pub target: TopicHandle,
    pub sibling: Option<TopicHandle>,
}

/// A topic is about to be detached from the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteEvent {
    pub topic: TopicHandle,
    pub topic_id: i64,
    pub unique_key: String,
    pub recursive: bool,
}

/// Collaborator notified of repository changes, e.g. a cache or a mapping
/// layer. Every method defaults to a no-op.
pub trait RepositoryObserver {
    fn topic_renamed(&mut self, _graph: &TopicGraph, _event: &RenameEvent) {}

    fn topic_moved(&mut self, _graph: &TopicGraph, _event: &MoveEvent) {}

    fn topic_deleted(&mut self, _graph: &TopicGraph, _event: &DeleteEvent) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(usize);

// ============================================================================
// Contract
// ============================================================================

/// Storage contract for topic graphs
pub trait TopicRepository {
    /// Load the topic at `unique_key` (all roots when `None`) into `graph`
    fn load(&self, graph: &mut TopicGraph, unique_key: Option<&str>, recursive: bool) -> Result<TopicHandle>;

    fn load_by_id(&self, graph: &mut TopicGraph, id: i64, recursive: bool) -> Result<TopicHandle>;

    /// Load a single topic with attribute values as they were at `version`
    fn load_version(&self, graph: &mut TopicGraph, id: i64, version: DateTime<Utc>) -> Result<TopicHandle>;

    /// Persist `topic` (and its subtree when `recursive`); returns its id
    fn save(&mut self, graph: &mut TopicGraph, topic: TopicHandle, recursive: bool, is_draft: bool) -> Result<i64>;

    fn move_topic(
        &mut self,
        graph: &mut TopicGraph,
        topic: TopicHandle,
        target: TopicHandle,
        sibling: Option<TopicHandle>,
    ) -> Result<()>;

    fn delete(&mut self, graph: &mut TopicGraph, topic: TopicHandle, recursive: bool) -> Result<()>;

    fn subscribe(&mut self, observer: Box<dyn RepositoryObserver>) -> ObserverId;

    fn unsubscribe(&mut self, id: ObserverId) -> bool;
}

// ============================================================================
// Shared behavior
// ============================================================================

/// Validation, event dispatch and the in-memory half of save, move and
/// delete. Storage adapters call into it before touching their backend.
#[derive(Default)]
pub struct RepositoryBase {
    observers: Vec<(ObserverId, Box<dyn RepositoryObserver>)>,
    next_observer: usize,
}

impl fmt::Debug for RepositoryBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryBase")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl RepositoryBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Box<dyn RepositoryObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, observer));
        id
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Announce pending renames and settle the original keys. Returns the
    /// unsaved sentinel; adapters return the real id.
    pub fn save(&mut self, graph: &mut TopicGraph, topic: TopicHandle, recursive: bool) -> Result<i64> {
        graph.require(topic)?;
        let scope = if recursive {
            graph.descendants(topic)
        } else {
            vec![topic]
        };

        for handle in scope {
            let current = graph.topic(handle);
            if let Some(original) = current.original_key() {
                if original != current.key() {
                    let event = RenameEvent {
                        topic: handle,
                        topic_id: current.id(),
                        old_key: original.to_string(),
                        new_key: current.key().to_string(),
                    };
                    debug!("Topic {} renamed '{}' -> '{}'", event.topic_id, event.old_key, event.new_key);
                    for (_, observer) in self.observers.iter_mut() {
                        observer.topic_renamed(graph, &event);
                    }
                }
            }
            graph.clear_original_key(handle);
        }
        Ok(UNSAVED_ID)
    }

    pub fn move_topic(
        &mut self,
        graph: &mut TopicGraph,
        topic: TopicHandle,
        target: TopicHandle,
        sibling: Option<TopicHandle>,
    ) -> Result<()> {
        graph.validate_parent(topic, target, sibling)?;

        let event = MoveEvent {
            topic,
            topic_id: graph.topic(topic).id(),
            source: graph.topic(topic).parent(),
            target,
            sibling,
        };
        for (_, observer) in self.observers.iter_mut() {
            observer.topic_moved(graph, &event);
        }

        graph.set_parent(topic, target, sibling)
    }

    pub fn validate_delete(&self, graph: &TopicGraph, topic: TopicHandle, recursive: bool) -> Result<()> {
        let current = graph.require(topic)?;
        if !recursive && !current.children().is_empty() {
            return Err(TopicError::ReferentialIntegrity(format!(
                "'{}' has {} children; delete it recursively",
                graph.unique_key(topic),
                current.children().len()
            )));
        }
        Ok(())
    }

    pub fn delete(&mut self, graph: &mut TopicGraph, topic: TopicHandle, recursive: bool) -> Result<()> {
        self.validate_delete(graph, topic, recursive)?;

        let event = DeleteEvent {
            topic,
            topic_id: graph.topic(topic).id(),
            unique_key: graph.unique_key(topic),
            recursive,
        };
        for (_, observer) in self.observers.iter_mut() {
            observer.topic_deleted(graph, &event);
        }

        graph.forget(topic)?;
        Ok(())
    }
}
