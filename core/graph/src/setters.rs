use std::collections::HashMap;

use crate::error::{Result, TopicError};
use crate::graph::TopicGraph;
use crate::topic::{attribute_keys, TopicHandle};

/// Business logic run when an attribute is written through
/// [`TopicGraph::set_attribute`]. Setters persist the final value through
/// [`TopicGraph::write_attribute`] (or a graph operation that does).
pub type AttributeSetter = fn(&mut TopicGraph, TopicHandle, Option<&str>) -> Result<()>;

/// Attribute key → setter, either for every topic or for one content type.
/// Content-type entries take precedence over the global ones.
#[derive(Clone, Default)]
pub struct AttributeSetterTable {
    global: HashMap<String, AttributeSetter>,
    by_content_type: HashMap<String, HashMap<String, AttributeSetter>>,
}

impl AttributeSetterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the setters that keep primary attributes and topic state
    /// in sync
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.register(None, attribute_keys::KEY, set_key);
        table.register(None, attribute_keys::CONTENT_TYPE, set_content_type);
        table.register(None, attribute_keys::PARENT_ID, set_parent_id);
        table.register(None, attribute_keys::DERIVED_TOPIC, set_derived_topic);
        table
    }

    pub fn register(&mut self, content_type: Option<&str>, key: &str, setter: AttributeSetter) {
        let key = key.to_ascii_lowercase();
        match content_type {
            Some(content_type) => {
                self.by_content_type
                    .entry(content_type.to_ascii_lowercase())
                    .or_default()
                    .insert(key, setter);
            }
            None => {
                self.global.insert(key, setter);
            }
        }
    }

    pub fn lookup(&self, content_type: &str, key: &str) -> Option<AttributeSetter> {
        let key = key.to_ascii_lowercase();
        self.by_content_type
            .get(&content_type.to_ascii_lowercase())
            .and_then(|setters| setters.get(&key))
            .or_else(|| self.global.get(&key))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.global.len() + self.by_content_type.values().map(HashMap::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for AttributeSetterTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut global: Vec<&String> = self.global.keys().collect();
        global.sort();
        f.debug_struct("AttributeSetterTable")
            .field("global", &global)
            .field("content_types", &self.by_content_type.len())
            .finish()
    }
}

fn required<'a>(key: &str, value: Option<&'a str>) -> Result<&'a str> {
    value
        .filter(|value| !value.is_empty())
        .ok_or_else(|| TopicError::InvalidArgument(format!("{key} cannot be empty")))
}

fn parse_id(key: &str, value: &str) -> Result<i64> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| TopicError::InvalidArgument(format!("{key} must be a topic id, got '{value}'")))
}

fn set_key(graph: &mut TopicGraph, topic: TopicHandle, value: Option<&str>) -> Result<()> {
    graph.set_key(topic, required(attribute_keys::KEY, value)?)
}

fn set_content_type(graph: &mut TopicGraph, topic: TopicHandle, value: Option<&str>) -> Result<()> {
    graph.set_content_type(topic, required(attribute_keys::CONTENT_TYPE, value)?)
}

fn set_parent_id(graph: &mut TopicGraph, topic: TopicHandle, value: Option<&str>) -> Result<()> {
    let id = parse_id(attribute_keys::PARENT_ID, required(attribute_keys::PARENT_ID, value)?)?;
    let parent = graph
        .find_by_id(id)
        .ok_or_else(|| TopicError::InvalidArgument(format!("no topic with id {id} is loaded")))?;
    graph.set_parent(topic, parent, None)
}

/// Unknown ids are kept as a raw attribute so a later load can resolve them
fn set_derived_topic(graph: &mut TopicGraph, topic: TopicHandle, value: Option<&str>) -> Result<()> {
    match value.filter(|value| !value.is_empty()) {
        None => graph.set_derived_topic(topic, None),
        Some(raw) => {
            let id = parse_id(attribute_keys::DERIVED_TOPIC, raw)?;
            match graph.find_by_id(id) {
                Some(derived) => graph.set_derived_topic(topic, Some(derived)),
                None => {
                    graph.set_derived_topic(topic, None)?;
                    graph
                        .write_attribute(topic, attribute_keys::DERIVED_TOPIC, Some(raw), None)
                        .map(|_| ())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut TopicGraph, _: TopicHandle, _: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn failing(_: &mut TopicGraph, _: TopicHandle, _: Option<&str>) -> Result<()> {
        Err(TopicError::InvalidArgument("rejected".into()))
    }

    #[test]
    fn test_defaults_cover_primary_attributes() {
        let table = AttributeSetterTable::with_defaults();
        assert_eq!(table.len(), 4);
        assert!(table.lookup("Page", "key").is_some());
        assert!(table.lookup("Page", "PARENTID").is_some());
        assert!(table.lookup("Page", "topicid").is_some());
        assert!(table.lookup("Page", "Title").is_none());
    }

    #[test]
    fn test_content_type_setter_takes_precedence() {
        let mut table = AttributeSetterTable::new();
        table.register(None, "Title", noop);
        table.register(Some("Page"), "Title", failing);

        let mut graph = TopicGraph::new();
        let topic = graph.create_topic("Home", "Page", None).unwrap();

        let page_setter = table.lookup("page", "title").unwrap();
        assert!(page_setter(&mut graph, topic, Some("x")).is_err());

        let other_setter = table.lookup("Folder", "Title").unwrap();
        assert!(other_setter(&mut graph, topic, Some("x")).is_ok());
    }
}
