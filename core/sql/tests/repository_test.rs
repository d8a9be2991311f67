use anyhow::Result;
use ontopic_graph::{
    ErrorKind, RenameEvent, RepositoryObserver, TopicError, TopicGraph, TopicHandle, TopicRepository,
};
use ontopic_schemas::{AttributeDescriptor, ContentTypeDescriptor, ContentTypeRegistry};
use ontopic_sql::{RepositoryConfig, SqlTopicRepository};
use rusqlite::Connection;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use tempfile::TempDir;

fn registry() -> ContentTypeRegistry {
    ContentTypeRegistry::new()
        .with(ContentTypeDescriptor::new("Container"))
        .with(
            ContentTypeDescriptor::new("Page")
                .with_attribute(AttributeDescriptor::new("Title"))
                .with_attribute(AttributeDescriptor::new("Subtitle"))
                .with_attribute(AttributeDescriptor::new("Body").extended()),
        )
}

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("topics.db")
}

fn open(dir: &TempDir) -> SqlTopicRepository {
    SqlTopicRepository::open(RepositoryConfig::new(db_path(dir)), registry()).unwrap()
}

/// Saved `Root` container in a fresh graph
fn seed(repository: &mut SqlTopicRepository) -> (TopicGraph, TopicHandle) {
    let mut graph = repository.new_graph();
    let root = graph.create_topic("Root", "Container", None).unwrap();
    repository.save(&mut graph, root, false, false).unwrap();
    (graph, root)
}

#[test]
fn test_save_new_topic_assigns_id_and_version() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);

    let home = graph.create_topic("Home", "Page", Some(root))?;
    graph.set_attribute(home, "Title", Some("Welcome"))?;
    let id = repository.save(&mut graph, home, false, false)?;

    assert!(id >= 0);
    assert_eq!(graph.topic(home).id(), id);
    assert!(!graph.is_dirty(home));
    let stored = repository.version_rows(id)?;
    assert_eq!(stored.len(), 1);
    assert_eq!(graph.topic(home).version_history()[0], stored[0].version);

    let mut fresh = repository.new_graph();
    let loaded = repository.load(&mut fresh, Some("Root:Home"), false)?;
    assert_eq!(fresh.attribute(loaded, "Title"), Some("Welcome"));
    assert_eq!(fresh.topic(loaded).version_history(), graph.topic(home).version_history());
    Ok(())
}

#[test]
fn test_unchanged_topics_are_skipped() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);
    let home = graph.create_topic("Home", "Page", Some(root))?;
    let id = repository.save(&mut graph, home, false, false)?;

    repository.save(&mut graph, root, true, false)?;
    assert_eq!(repository.version_rows(id)?.len(), 1);
    assert_eq!(graph.topic(home).version_history().len(), 1);
    Ok(())
}

#[test]
fn test_draft_flag_is_recorded() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);
    let home = graph.create_topic("Home", "Page", Some(root))?;
    let id = repository.save(&mut graph, home, false, true)?;

    graph.set_attribute(home, "Title", Some("Published"))?;
    repository.save(&mut graph, home, false, false)?;

    let versions = repository.version_rows(id)?;
    assert!(!versions[0].is_draft);
    assert!(versions[1].is_draft);
    Ok(())
}

#[test]
fn test_extended_markup_round_trips_decoded_once() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);

    let home = graph.create_topic("Home", "Page", Some(root))?;
    graph.set_attribute(home, "Body", Some("<b>hi</b>"))?;
    graph.set_attribute(home, "Title", Some("Plain"))?;
    let id = repository.save(&mut graph, home, false, false)?;

    let conn = Connection::open(db_path(&dir))?;
    let xml: String = conn.query_row(
        "SELECT attributes_xml FROM extended_attributes WHERE topic_id = ?1",
        [id],
        |row| row.get(0),
    )?;
    assert!(xml.contains("&lt;b&gt;hi&lt;/b&gt;"));
    let indexed: i64 = conn.query_row(
        "SELECT COUNT(*) FROM attributes WHERE topic_id = ?1 AND attribute_key = 'Body'",
        [id],
        |row| row.get(0),
    )?;
    assert_eq!(indexed, 0);

    let mut fresh = repository.new_graph();
    let loaded = repository.load_by_id(&mut fresh, id, false)?;
    assert_eq!(fresh.attribute(loaded, "Body"), Some("<b>hi</b>"));
    assert_eq!(fresh.attribute(loaded, "Title"), Some("Plain"));
    Ok(())
}

#[test]
fn test_derived_inheritance_survives_reload() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);

    // A is saved before B, so its derived reference is written in a second pass
    let a = graph.create_topic("A", "Page", Some(root))?;
    let b = graph.create_topic("B", "Page", Some(root))?;
    graph.set_attribute(b, "Subtitle", Some("X"))?;
    graph.set_derived_topic(a, Some(b))?;
    repository.save(&mut graph, root, true, false)?;
    assert!(!graph.is_dirty(a));

    let mut fresh = repository.new_graph();
    let loaded_root = repository.load(&mut fresh, Some("Root"), true)?;
    let loaded_a = fresh.topic(loaded_root).children().get("A").unwrap();
    let loaded_b = fresh.topic(loaded_root).children().get("B").unwrap();

    assert_eq!(fresh.topic(loaded_a).derived_topic(), Some(loaded_b));
    assert_eq!(fresh.get_value(loaded_a, "Subtitle", "", false, true), "X");
    assert_eq!(
        fresh.get_value_with_hops(loaded_a, "Subtitle", "default", false, true, 0),
        "default"
    );
    Ok(())
}

#[test]
fn test_relationships_persist_with_mirrors() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);

    // Target is unsaved when the source is written
    let a = graph.create_topic("A", "Page", Some(root))?;
    let b = graph.create_topic("B", "Page", Some(root))?;
    graph.set_relationship(a, "Related", b)?;
    repository.save(&mut graph, root, true, false)?;
    assert!(!graph.is_dirty(a));

    let mut fresh = repository.new_graph();
    let loaded_root = repository.load(&mut fresh, Some("Root"), true)?;
    let loaded_a = fresh.topic(loaded_root).children().get("A").unwrap();
    let loaded_b = fresh.topic(loaded_root).children().get("B").unwrap();
    assert!(fresh.topic(loaded_a).relationships().contains("Related", loaded_b));
    assert!(fresh.topic(loaded_b).incoming_relationships().contains("Related", loaded_a));

    fresh.remove_relationship(loaded_a, "Related", loaded_b)?;
    repository.save(&mut fresh, loaded_a, false, false)?;

    let mut again = repository.new_graph();
    let reloaded = repository.load(&mut again, Some("Root:A"), false)?;
    assert!(again.topic(reloaded).relationships().get("Related").is_none());
    Ok(())
}

#[test]
fn test_relationship_targets_outside_the_load_are_skipped() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);
    let other = graph.create_topic("Other", "Container", None)?;
    repository.save(&mut graph, other, false, false)?;
    let home = graph.create_topic("Home", "Page", Some(root))?;
    graph.set_relationship(home, "Related", other)?;
    repository.save(&mut graph, home, false, false)?;

    let mut fresh = repository.new_graph();
    let loaded = repository.load(&mut fresh, Some("Root:Home"), false)?;
    assert!(fresh.topic(loaded).relationships().get("Related").is_none());
    assert!(!fresh.is_dirty(loaded));
    Ok(())
}

#[test]
fn test_removed_attributes_are_nulled() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);
    let home = graph.create_topic("Home", "Page", Some(root))?;
    graph.set_attribute(home, "Title", Some("Hello"))?;
    graph.set_attribute(home, "Subtitle", Some("World"))?;
    let id = repository.save(&mut graph, home, false, false)?;

    graph.remove_attribute(home, "Subtitle")?;
    graph.set_attribute(home, "Title", Some(""))?;
    repository.save(&mut graph, home, false, false)?;

    let conn = Connection::open(db_path(&dir))?;
    let nulls: i64 = conn.query_row(
        "SELECT COUNT(*) FROM attributes WHERE topic_id = ?1 AND attribute_value IS NULL",
        [id],
        |row| row.get(0),
    )?;
    assert_eq!(nulls, 2);

    let mut fresh = repository.new_graph();
    let loaded = repository.load_by_id(&mut fresh, id, false)?;
    assert_eq!(fresh.attribute(loaded, "Title"), None);
    assert_eq!(fresh.attribute(loaded, "Subtitle"), None);
    Ok(())
}

#[test]
fn test_load_version_returns_values_as_of_stamp() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);
    let home = graph.create_topic("Home", "Page", Some(root))?;
    graph.set_attribute(home, "Title", Some("One"))?;
    let id = repository.save(&mut graph, home, false, false)?;
    let first = graph.topic(home).version_history()[0];

    graph.set_attribute(home, "Title", Some("Two"))?;
    repository.save(&mut graph, home, false, false)?;
    assert_eq!(graph.topic(home).version_history().len(), 2);

    let mut fresh = repository.new_graph();
    let old = repository.load_version(&mut fresh, id, first)?;
    assert_eq!(fresh.attribute(old, "Title"), Some("One"));
    assert_eq!(fresh.topic(old).version_history(), &[first]);
    Ok(())
}

#[test]
fn test_move_persists_position() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);
    let a = graph.create_topic("A", "Page", Some(root))?;
    let b = graph.create_topic("B", "Page", Some(root))?;
    let c = graph.create_topic("C", "Page", Some(root))?;
    repository.save(&mut graph, root, true, false)?;

    repository.move_topic(&mut graph, c, root, Some(a))?;
    assert_eq!(graph.children(root), vec![a, c, b]);
    assert!(!graph.is_dirty(c));

    let mut fresh = repository.new_graph();
    let loaded_root = repository.load(&mut fresh, Some("Root"), true)?;
    let keys: Vec<String> = fresh
        .children(loaded_root)
        .into_iter()
        .map(|child| fresh.topic(child).key().to_string())
        .collect();
    assert_eq!(keys, vec!["A", "C", "B"]);
    Ok(())
}

#[test]
fn test_move_under_itself_fails_before_any_io() {
    // Any database access would fail on this path
    let config = RepositoryConfig::new("/nonexistent/directory/topics.db");
    let mut repository = SqlTopicRepository::new(config, registry());
    let mut graph = TopicGraph::new();
    let topic = graph.create_topic_with_id("Home", "Page", None, 1).unwrap();

    let err = repository.move_topic(&mut graph, topic, topic, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_move_of_unsaved_topic_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);
    let loose = graph.create_topic("Loose", "Page", None)?;

    let err = repository.move_topic(&mut graph, loose, root, None).unwrap_err();
    assert!(matches!(err, TopicError::InvalidArgument(_)));
    assert!(graph.topic(loose).parent().is_none());
    Ok(())
}

#[test]
fn test_save_with_unsaved_parent_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let mut graph = repository.new_graph();
    let root = graph.create_topic("Root", "Container", None)?;
    let child = graph.create_topic("Child", "Page", Some(root))?;

    let err = repository.save(&mut graph, child, false, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(graph.topic(child).is_new());

    // Saving from the root covers both
    repository.save(&mut graph, root, true, false)?;
    assert!(!graph.topic(child).is_new());
    Ok(())
}

#[test]
fn test_delete_requires_recursive_for_children() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);
    let web = graph.create_topic("Web", "Container", Some(root))?;
    let home = graph.create_topic("Home", "Page", Some(web))?;
    repository.save(&mut graph, root, true, false)?;
    let home_id = graph.topic(home).id();

    let err = repository.delete(&mut graph, web, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert_eq!(graph.children(root), vec![web]);

    repository.delete(&mut graph, web, true)?;
    assert!(graph.children(root).is_empty());

    let mut fresh = repository.new_graph();
    let missing = repository.load(&mut fresh, Some("Root:Web"), false).unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);
    let cascaded = repository.load_by_id(&mut fresh, home_id, false).unwrap_err();
    assert_eq!(cascaded.kind(), ErrorKind::NotFound);
    Ok(())
}

#[test]
fn test_non_recursive_delete_counts_stored_children() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);
    let web = graph.create_topic("Web", "Container", Some(root))?;
    graph.create_topic("Home", "Page", Some(web))?;
    repository.save(&mut graph, root, true, false)?;

    // Web's children are not loaded
    let mut fresh = repository.new_graph();
    let loaded = repository.load(&mut fresh, Some("Root:Web"), false)?;
    assert!(fresh.children(loaded).is_empty());

    let err = repository.delete(&mut fresh, loaded, false).unwrap_err();
    assert!(matches!(err, TopicError::ReferentialIntegrity(_)));
    assert_eq!(fresh.find_by_unique_key("Root:Web"), Some(loaded));

    let mut again = repository.new_graph();
    assert!(repository.load(&mut again, Some("Root:Web:Home"), false).is_ok());
    Ok(())
}

#[test]
fn test_deleted_topic_is_not_reattached_by_later_loads() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);
    let home = graph.create_topic("Home", "Page", Some(root))?;
    let home_id = repository.save(&mut graph, home, false, false)?;

    repository.delete(&mut graph, home, false)?;
    assert!(graph.children(root).is_empty());
    assert_eq!(graph.find_by_id(home_id), None);

    let other = graph.create_topic("Other", "Container", None)?;
    repository.save(&mut graph, other, false, false)?;
    let reloaded = repository.load(&mut graph, Some("Root"), false)?;

    assert_eq!(reloaded, root);
    assert!(graph.children(root).is_empty());
    assert!(graph.topic(home).parent().is_none());
    assert_eq!(graph.find_by_unique_key("Root:Home"), None);
    Ok(())
}

#[test]
fn test_reload_keeps_unsaved_edits() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);
    let home = graph.create_topic("Home", "Page", Some(root))?;
    graph.set_attribute(home, "Title", Some("Saved"))?;
    let id = repository.save(&mut graph, home, false, false)?;

    graph.set_attribute(home, "Title", Some("Unsaved edit"))?;
    repository.load(&mut graph, Some("Root"), true)?;
    assert_eq!(graph.attribute(home, "Title"), Some("Unsaved edit"));
    assert!(graph.is_dirty(home));

    repository.save(&mut graph, home, false, false)?;
    assert_eq!(repository.version_rows(id)?.len(), 2);

    let mut fresh = repository.new_graph();
    let loaded = repository.load_by_id(&mut fresh, id, false)?;
    assert_eq!(fresh.attribute(loaded, "Title"), Some("Unsaved edit"));
    Ok(())
}

#[test]
fn test_unsaved_relationship_target_writes_source_once() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);
    let a = graph.create_topic("A", "Page", Some(root))?;
    let b = graph.create_topic("B", "Page", Some(root))?;
    graph.set_relationship(a, "Related", b)?;

    let a_id = repository.save(&mut graph, a, false, false)?;
    assert_eq!(repository.version_rows(a_id)?.len(), 1);
    assert!(graph.is_dirty(a));

    repository.save(&mut graph, b, false, false)?;
    repository.save(&mut graph, a, false, false)?;
    assert_eq!(repository.version_rows(a_id)?.len(), 2);
    assert!(!graph.is_dirty(a));

    let mut fresh = repository.new_graph();
    let loaded_root = repository.load(&mut fresh, Some("Root"), true)?;
    let loaded_a = fresh.topic(loaded_root).children().get("A").unwrap();
    let loaded_b = fresh.topic(loaded_root).children().get("B").unwrap();
    assert!(fresh.topic(loaded_a).relationships().contains("Related", loaded_b));
    Ok(())
}

struct RenameLog(Rc<RefCell<Vec<String>>>);

impl RepositoryObserver for RenameLog {
    fn topic_renamed(&mut self, _graph: &TopicGraph, event: &RenameEvent) {
        self.0
            .borrow_mut()
            .push(format!("{}->{}", event.old_key, event.new_key));
    }
}

#[test]
fn test_rename_is_announced_and_persisted() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);
    let home = graph.create_topic("Home", "Page", Some(root))?;
    repository.save(&mut graph, home, false, false)?;

    let log = Rc::new(RefCell::new(Vec::new()));
    let observer = repository.subscribe(Box::new(RenameLog(Rc::clone(&log))));

    let mut fresh = repository.new_graph();
    let loaded = repository.load(&mut fresh, Some("Root:Home"), false)?;
    fresh.set_key(loaded, "Start")?;
    repository.save(&mut fresh, loaded, false, false)?;
    assert_eq!(*log.borrow(), vec!["Home->Start"]);
    assert_eq!(fresh.topic(loaded).original_key(), None);

    let mut again = repository.new_graph();
    assert!(repository.load(&mut again, Some("Root:Start"), false).is_ok());
    assert_eq!(
        repository.load(&mut again, Some("Root:Home"), false).unwrap_err().kind(),
        ErrorKind::NotFound
    );

    assert!(repository.unsubscribe(observer));
    Ok(())
}

#[test]
fn test_load_without_key_returns_first_root() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, _) = seed(&mut repository);
    let other = graph.create_topic("Other", "Container", None)?;
    repository.save(&mut graph, other, false, false)?;

    let mut fresh = repository.new_graph();
    let first = repository.load(&mut fresh, None, false)?;
    assert_eq!(fresh.topic(first).key(), "Root");
    assert_eq!(fresh.roots().len(), 2);
    Ok(())
}

#[test]
fn test_load_of_nested_key_attaches_ancestors() -> Result<()> {
    let dir = TempDir::new()?;
    let mut repository = open(&dir);
    let (mut graph, root) = seed(&mut repository);
    let web = graph.create_topic("Web", "Container", Some(root))?;
    graph.create_topic("Home", "Page", Some(web))?;
    graph.create_topic("About", "Page", Some(web))?;
    repository.save(&mut graph, root, true, false)?;

    let mut fresh = repository.new_graph();
    let home = repository.load(&mut fresh, Some("Root:Web:Home"), false)?;
    assert_eq!(fresh.unique_key(home), "Root:Web:Home");
    assert_eq!(fresh.len(), 3);
    assert!(fresh.handles().all(|handle| !fresh.is_dirty(handle)));
    Ok(())
}

#[test]
fn test_missing_topic_is_not_found() -> Result<()> {
    let dir = TempDir::new()?;
    let repository = open(&dir);
    let mut graph = repository.new_graph();
    assert_eq!(
        repository.load(&mut graph, None, true).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        repository.load_by_id(&mut graph, 42, false).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    Ok(())
}
