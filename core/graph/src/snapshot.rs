use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::graph::TopicGraph;
use crate::topic::TopicHandle;

/// Plain, serializable view of a topic and (optionally) its subtree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicSnapshot {
    pub id: i64,
    pub key: String,
    pub unique_key: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_topic: Option<String>,
    pub attributes: BTreeMap<String, String>,
    /// Relationship key → unique keys of the targets
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub version_history: Vec<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TopicSnapshot>,
}

impl TopicGraph {
    pub fn snapshot(&self, handle: TopicHandle, recursive: bool) -> Result<TopicSnapshot> {
        let topic = self.require(handle)?;

        let attributes = topic
            .attributes()
            .iter()
            .filter(|attribute| !attribute.is_empty())
            .map(|attribute| (attribute.key().to_string(), attribute.value().to_string()))
            .collect();

        let relationships = topic
            .relationships()
            .iter()
            .filter(|collection| !collection.is_empty())
            .map(|collection| {
                let targets = collection.iter().map(|target| self.unique_key(target)).collect();
                (collection.name().to_string(), targets)
            })
            .collect();

        let children = if recursive {
            topic
                .children()
                .iter()
                .map(|child| self.snapshot(child, true))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        Ok(TopicSnapshot {
            id: topic.id(),
            key: topic.key().to_string(),
            unique_key: self.unique_key(handle),
            content_type: topic.content_type().to_string(),
            derived_topic: topic.derived_topic().map(|derived| self.unique_key(derived)),
            attributes,
            relationships,
            version_history: topic.version_history().to_vec(),
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes_tree() {
        let mut graph = TopicGraph::new();
        let root = graph.create_topic("Root", "Container", None).unwrap();
        let home = graph.create_topic("Home", "Page", Some(root)).unwrap();
        let about = graph.create_topic("About", "Page", Some(root)).unwrap();
        graph.set_attribute(home, "Title", Some("Welcome")).unwrap();
        graph.set_relationship(home, "Related", about).unwrap();
        graph.set_derived_topic(about, Some(home)).unwrap();

        let flat = graph.snapshot(root, false).unwrap();
        assert!(flat.children.is_empty());

        let tree = graph.snapshot(root, true).unwrap();
        assert_eq!(tree.children.len(), 2);
        let home_snapshot = &tree.children[0];
        assert_eq!(home_snapshot.unique_key, "Root:Home");
        assert_eq!(home_snapshot.attributes.get("Title").map(String::as_str), Some("Welcome"));
        assert_eq!(home_snapshot.relationships["Related"], vec!["Root:About".to_string()]);
        assert_eq!(tree.children[1].derived_topic.as_deref(), Some("Root:Home"));

        let json = serde_json::to_string(&tree).unwrap();
        let parsed: TopicSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, tree);
    }
}
