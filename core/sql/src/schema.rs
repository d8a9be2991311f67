use rusqlite::Connection;
use tracing::debug;

/// Create all tables and indexes. Safe to run against an existing database.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    // Topics (one row per node; key unique among siblings)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS topics (
            topic_id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic_key TEXT NOT NULL COLLATE NOCASE,
            content_type TEXT NOT NULL,
            parent_id INTEGER REFERENCES topics(topic_id) ON DELETE CASCADE,
            sort_order INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_topics_sibling_key
         ON topics(IFNULL(parent_id, -1), topic_key)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_topics_parent ON topics(parent_id, sort_order)",
        [],
    )?;

    // Indexed attribute values, one row per key per version. NULL marks a
    // value removed as of that version.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attributes (
            topic_id INTEGER NOT NULL REFERENCES topics(topic_id) ON DELETE CASCADE,
            attribute_key TEXT NOT NULL COLLATE NOCASE,
            attribute_value TEXT,
            version TEXT NOT NULL,
            PRIMARY KEY (topic_id, attribute_key, version)
        )",
        [],
    )?;

    // Extended attributes, one XML document per topic per version
    conn.execute(
        "CREATE TABLE IF NOT EXISTS extended_attributes (
            topic_id INTEGER NOT NULL REFERENCES topics(topic_id) ON DELETE CASCADE,
            attributes_xml TEXT NOT NULL,
            version TEXT NOT NULL,
            PRIMARY KEY (topic_id, version)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS relationships (
            source_id INTEGER NOT NULL REFERENCES topics(topic_id) ON DELETE CASCADE,
            relationship_key TEXT NOT NULL COLLATE NOCASE,
            target_id INTEGER NOT NULL REFERENCES topics(topic_id) ON DELETE CASCADE,
            PRIMARY KEY (source_id, relationship_key, target_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS topic_versions (
            topic_id INTEGER NOT NULL REFERENCES topics(topic_id) ON DELETE CASCADE,
            version TEXT NOT NULL,
            is_draft INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (topic_id, version)
        )",
        [],
    )?;

    debug!("Topic schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(
            tables,
            vec!["attributes", "extended_attributes", "relationships", "topic_versions", "topics"]
        );
    }

    #[test]
    fn test_sibling_keys_are_unique_ignoring_case() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO topics (topic_key, content_type) VALUES ('Root', 'Container')",
            [],
        )
        .unwrap();
        let duplicate = conn.execute(
            "INSERT INTO topics (topic_key, content_type) VALUES ('ROOT', 'Container')",
            [],
        );
        assert!(duplicate.is_err());
    }
}
