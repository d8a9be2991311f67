use chrono::{DateTime, Utc};
use ontopic_graph::{attribute_keys, Result, TopicError, TopicGraph, TopicHandle};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::procedures::TopicResultSets;
use crate::xml::decode_attributes;

/// Build (or refresh) topics in `graph` from the result sets of
/// `get_topics`, consumed in order. Returns the handles of the topic rows,
/// parents first. Topics already in the graph with unsaved changes keep
/// their in-memory state; everything else loaded ends clean.
pub fn apply_result_sets(graph: &mut TopicGraph, sets: TopicResultSets) -> Result<Vec<TopicHandle>> {
    apply(graph, sets, false)
}

/// Like [`apply_result_sets`], but stored values replace unsaved edits
pub fn refresh_result_sets(graph: &mut TopicGraph, sets: TopicResultSets) -> Result<Vec<TopicHandle>> {
    apply(graph, sets, true)
}

fn apply(graph: &mut TopicGraph, sets: TopicResultSets, overwrite_edits: bool) -> Result<Vec<TopicHandle>> {
    if sets.is_empty() {
        return Err(TopicError::NotFound("no topic rows".to_string()));
    }

    // Topics
    let mut loaded = Vec::with_capacity(sets.topics.len());
    let mut kept: HashSet<TopicHandle> = HashSet::new();
    for row in &sets.topics {
        if let Some(existing) = graph.find_by_id(row.id) {
            if !overwrite_edits && graph.is_dirty(existing) {
                kept.insert(existing);
            }
            loaded.push(existing);
            continue;
        }

        let parent = row.parent_id.and_then(|parent_id| graph.find_by_id(parent_id));
        let handle = graph.create_topic_with_id(&row.key, &row.content_type, parent, row.id)?;
        if let (Some(parent_id), None) = (row.parent_id, parent) {
            // Parent not loaded yet; remembered for a later attach
            graph.write_attribute(handle, attribute_keys::PARENT_ID, Some(&parent_id.to_string()), Some(false))?;
        }
        loaded.push(handle);
    }

    // Attributes
    for row in &sets.attributes {
        let Some(handle) = graph.find_by_id(row.topic_id) else {
            continue;
        };
        if kept.contains(&handle) {
            continue;
        }
        graph.write_attribute_at(handle, &row.key, row.value.as_deref(), Some(false), row.version)?;
    }

    // Extended attributes
    for row in &sets.extended_attributes {
        let Some(handle) = graph.find_by_id(row.topic_id) else {
            continue;
        };
        if kept.contains(&handle) {
            continue;
        }
        for (key, value) in decode_attributes(&row.xml)? {
            graph.write_attribute_at(handle, &key, Some(&value), Some(false), row.version)?;
        }
    }

    // Relationships
    let mut skipped = 0;
    for row in &sets.relationships {
        match (graph.find_by_id(row.source_id), graph.find_by_id(row.target_id)) {
            (Some(source), _) if kept.contains(&source) => {}
            (Some(source), Some(target)) => {
                graph.set_relationship(source, &row.relationship_key, target)?;
            }
            _ => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!("Skipped {} relationships with targets outside the graph", skipped);
    }

    // Version history
    let mut histories: HashMap<i64, Vec<DateTime<Utc>>> = HashMap::new();
    for row in &sets.versions {
        histories.entry(row.topic_id).or_default().push(row.version);
    }
    for (topic_id, versions) in histories {
        if let Some(handle) = graph.find_by_id(topic_id) {
            graph.set_version_history(handle, versions)?;
        }
    }

    attach_deferred_parents(graph)?;
    resolve_derived_topics(graph)?;

    for handle in loaded.iter().filter(|handle| !kept.contains(*handle)) {
        graph.mark_clean(*handle, None)?;
    }
    if !kept.is_empty() {
        debug!("Kept unsaved changes of {} topics", kept.len());
    }

    debug!("Loaded {} topics into graph of {}", loaded.len(), graph.len());
    Ok(loaded)
}

fn id_attribute(graph: &TopicGraph, handle: TopicHandle, key: &str) -> Option<i64> {
    graph
        .attribute(handle, key)
        .and_then(|raw| raw.trim().parse().ok())
}

/// Attach loaded roots whose stored parent is now in the graph
fn attach_deferred_parents(graph: &mut TopicGraph) -> Result<()> {
    for handle in graph.roots() {
        let Some(parent_id) = id_attribute(graph, handle, attribute_keys::PARENT_ID) else {
            continue;
        };
        let Some(parent) = graph.find_by_id(parent_id) else {
            continue;
        };
        if parent == handle {
            continue;
        }
        graph.set_parent(handle, parent, None)?;
        graph.mark_attribute_clean(handle, attribute_keys::PARENT_ID)?;
    }
    Ok(())
}

/// Turn stored `TopicID` values into derived-topic links where the target
/// is loaded
fn resolve_derived_topics(graph: &mut TopicGraph) -> Result<()> {
    let pending: Vec<(TopicHandle, TopicHandle)> = graph
        .handles()
        .filter(|handle| graph.topic(*handle).derived_topic().is_none())
        .filter_map(|handle| {
            let derived_id = id_attribute(graph, handle, attribute_keys::DERIVED_TOPIC)?;
            let derived = graph.find_by_id(derived_id)?;
            (derived != handle).then_some((handle, derived))
        })
        .collect();

    for (handle, derived) in pending {
        graph.set_derived_topic(handle, Some(derived))?;
    }
    Ok(())
}
