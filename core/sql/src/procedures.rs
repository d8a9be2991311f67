//! Fixed SQL protocols for reading and writing topics. Each function is the
//! equivalent of one stored procedure; callers own the connection and, for
//! writes, the transaction.

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{named_params, params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

// ============================================================================
// Result sets
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRow {
    pub id: i64,
    pub key: String,
    pub content_type: String,
    pub parent_id: Option<i64>,
    pub sort_order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRow {
    pub topic_id: i64,
    pub key: String,
    pub value: Option<String>,
    pub version: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedAttributeRow {
    pub topic_id: i64,
    pub xml: String,
    pub version: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipRow {
    pub source_id: i64,
    pub relationship_key: String,
    pub target_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionRow {
    pub topic_id: i64,
    pub version: DateTime<Utc>,
    pub is_draft: bool,
}

/// Everything `get_topics` returns, in the order it is produced and must be
/// consumed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicResultSets {
    /// Parents before children
    pub topics: Vec<TopicRow>,
    pub attributes: Vec<AttributeRow>,
    pub extended_attributes: Vec<ExtendedAttributeRow>,
    pub relationships: Vec<RelationshipRow>,
    /// Most recent first per topic
    pub versions: Vec<VersionRow>,
}

impl TopicResultSets {
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// Values written by `create_topic` / `update_topic`
#[derive(Debug, Clone, Default)]
pub struct TopicWrite {
    pub key: String,
    pub content_type: String,
    pub parent_id: Option<i64>,
    /// Indexed attribute values; `None` is stored as NULL
    pub attributes: Vec<(String, Option<String>)>,
    /// Full extended attribute document, when any extended value changed
    pub extended_xml: Option<String>,
    /// Keys to null out if their latest stored value is not already NULL
    pub null_attributes: Vec<String>,
    pub is_draft: bool,
}

// ============================================================================
// Version stamps
// ============================================================================

/// Stamps are stored as fixed-width RFC 3339 text so they sort as text
pub fn format_version(version: &DateTime<Utc>) -> String {
    version.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_version(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|version| version.with_timezone(&Utc))
}

fn version_column(row: &Row, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    parse_version(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}

/// Current time at storage precision, strictly after the topic's latest
/// version
fn next_version(conn: &Connection, topic_id: i64) -> rusqlite::Result<DateTime<Utc>> {
    let now = Utc::now().trunc_subsecs(6);
    let latest: Option<String> = conn.query_row(
        "SELECT MAX(version) FROM topic_versions WHERE topic_id = ?1",
        params![topic_id],
        |row| row.get(0),
    )?;

    let Some(latest) = latest else {
        return Ok(now);
    };
    let latest = parse_version(&latest)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    if latest >= now {
        Ok(latest + Duration::microseconds(1))
    } else {
        Ok(now)
    }
}

// ============================================================================
// Reads
// ============================================================================

/// Topic ids in scope: the root (every root topic when `:root` is NULL) and,
/// when `:recursive`, all descendants
const TREE_CTE: &str = "WITH RECURSIVE tree(topic_id, depth) AS (
        SELECT topic_id, 0 FROM topics
        WHERE (:root IS NULL AND parent_id IS NULL) OR topic_id = :root
        UNION ALL
        SELECT t.topic_id, tree.depth + 1
        FROM topics t JOIN tree ON t.parent_id = tree.topic_id
        WHERE :recursive
    )";

/// Load a topic (or every root) with its attributes, extended attributes,
/// relationships and version history. With `version`, attribute values and
/// history are those in effect at that stamp.
pub fn get_topics(
    conn: &Connection,
    root_id: Option<i64>,
    recursive: bool,
    version: Option<DateTime<Utc>>,
) -> rusqlite::Result<TopicResultSets> {
    let version = version.map(|version| format_version(&version));

    let mut stmt = conn.prepare(&format!(
        "{TREE_CTE}
        SELECT t.topic_id, t.topic_key, t.content_type, t.parent_id, t.sort_order
        FROM tree JOIN topics t ON t.topic_id = tree.topic_id
        ORDER BY tree.depth, t.sort_order, t.topic_id"
    ))?;
    let topics = stmt
        .query_map(
            named_params! { ":root": root_id, ":recursive": recursive },
            |row| {
                Ok(TopicRow {
                    id: row.get(0)?,
                    key: row.get(1)?,
                    content_type: row.get(2)?,
                    parent_id: row.get(3)?,
                    sort_order: row.get(4)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    if topics.is_empty() {
        return Ok(TopicResultSets::default());
    }

    let mut stmt = conn.prepare(&format!(
        "{TREE_CTE}
        SELECT a.topic_id, a.attribute_key, a.attribute_value, a.version
        FROM attributes a JOIN tree ON a.topic_id = tree.topic_id
        WHERE a.version = (
            SELECT MAX(b.version) FROM attributes b
            WHERE b.topic_id = a.topic_id
              AND b.attribute_key = a.attribute_key
              AND (:version IS NULL OR b.version <= :version)
        )
        ORDER BY a.topic_id, a.attribute_key"
    ))?;
    let attributes = stmt
        .query_map(
            named_params! { ":root": root_id, ":recursive": recursive, ":version": version },
            |row| {
                Ok(AttributeRow {
                    topic_id: row.get(0)?,
                    key: row.get(1)?,
                    value: row.get(2)?,
                    version: version_column(row, 3)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(&format!(
        "{TREE_CTE}
        SELECT e.topic_id, e.attributes_xml, e.version
        FROM extended_attributes e JOIN tree ON e.topic_id = tree.topic_id
        WHERE e.version = (
            SELECT MAX(x.version) FROM extended_attributes x
            WHERE x.topic_id = e.topic_id
              AND (:version IS NULL OR x.version <= :version)
        )
        ORDER BY e.topic_id"
    ))?;
    let extended_attributes = stmt
        .query_map(
            named_params! { ":root": root_id, ":recursive": recursive, ":version": version },
            |row| {
                Ok(ExtendedAttributeRow {
                    topic_id: row.get(0)?,
                    xml: row.get(1)?,
                    version: version_column(row, 2)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(&format!(
        "{TREE_CTE}
        SELECT r.source_id, r.relationship_key, r.target_id
        FROM relationships r JOIN tree ON r.source_id = tree.topic_id
        ORDER BY r.source_id, r.relationship_key, r.target_id"
    ))?;
    let relationships = stmt
        .query_map(
            named_params! { ":root": root_id, ":recursive": recursive },
            |row| {
                Ok(RelationshipRow {
                    source_id: row.get(0)?,
                    relationship_key: row.get(1)?,
                    target_id: row.get(2)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(&format!(
        "{TREE_CTE}
        SELECT v.topic_id, v.version, v.is_draft
        FROM topic_versions v JOIN tree ON v.topic_id = tree.topic_id
        WHERE :version IS NULL OR v.version <= :version
        ORDER BY v.topic_id, v.version DESC"
    ))?;
    let versions = stmt
        .query_map(
            named_params! { ":root": root_id, ":recursive": recursive, ":version": version },
            |row| {
                Ok(VersionRow {
                    topic_id: row.get(0)?,
                    version: version_column(row, 1)?,
                    is_draft: row.get(2)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    debug!(
        "get_topics: {} topics, {} attributes, {} extended, {} relationships, {} versions",
        topics.len(),
        attributes.len(),
        extended_attributes.len(),
        relationships.len(),
        versions.len()
    );

    Ok(TopicResultSets {
        topics,
        attributes,
        extended_attributes,
        relationships,
        versions,
    })
}

/// Resolve a colon-delimited key path (`Root:Web:Home`) to a topic id
pub fn find_topic_id(conn: &Connection, unique_key: &str) -> rusqlite::Result<Option<i64>> {
    let mut segments = unique_key.split(':');
    let Some(first) = segments.next() else {
        return Ok(None);
    };

    let mut current: Option<i64> = conn
        .query_row(
            "SELECT topic_id FROM topics WHERE parent_id IS NULL AND topic_key = ?1",
            params![first],
            |row| row.get(0),
        )
        .optional()?;

    for segment in segments {
        let Some(parent_id) = current else {
            return Ok(None);
        };
        current = conn
            .query_row(
                "SELECT topic_id FROM topics WHERE parent_id = ?1 AND topic_key = ?2",
                params![parent_id, segment],
                |row| row.get(0),
            )
            .optional()?;
    }
    Ok(current)
}

/// Ids of every ancestor of `topic_id`, root first
pub fn ancestor_ids(conn: &Connection, topic_id: i64) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "WITH RECURSIVE ancestors(topic_id, depth) AS (
            SELECT parent_id, 1 FROM topics WHERE topic_id = ?1 AND parent_id IS NOT NULL
            UNION ALL
            SELECT t.parent_id, ancestors.depth + 1
            FROM topics t JOIN ancestors ON t.topic_id = ancestors.topic_id
            WHERE t.parent_id IS NOT NULL
        )
        SELECT topic_id FROM ancestors ORDER BY depth DESC",
    )?;
    let ids = stmt
        .query_map(params![topic_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn topic_versions(conn: &Connection, topic_id: i64) -> rusqlite::Result<Vec<VersionRow>> {
    let mut stmt = conn.prepare(
        "SELECT topic_id, version, is_draft FROM topic_versions
         WHERE topic_id = ?1 ORDER BY version DESC",
    )?;
    let versions = stmt
        .query_map(params![topic_id], |row| {
            Ok(VersionRow {
                topic_id: row.get(0)?,
                version: version_column(row, 1)?,
                is_draft: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(versions)
}

// ============================================================================
// Writes
// ============================================================================

fn write_values(conn: &Connection, topic_id: i64, write: &TopicWrite, version: &str) -> rusqlite::Result<()> {
    let mut insert = conn.prepare_cached(
        "INSERT INTO attributes (topic_id, attribute_key, attribute_value, version)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (key, value) in &write.attributes {
        let value = value.as_deref().filter(|value| !value.is_empty());
        insert.execute(params![topic_id, key, value, version])?;
    }

    if let Some(xml) = &write.extended_xml {
        conn.execute(
            "INSERT INTO extended_attributes (topic_id, attributes_xml, version) VALUES (?1, ?2, ?3)",
            params![topic_id, xml, version],
        )?;
    }

    conn.execute(
        "INSERT INTO topic_versions (topic_id, version, is_draft) VALUES (?1, ?2, ?3)",
        params![topic_id, version, write.is_draft],
    )?;
    Ok(())
}

/// Insert a topic as the last child of its parent. Returns the new id and
/// the version stamp of its first version.
pub fn create_topic(conn: &Connection, write: &TopicWrite) -> rusqlite::Result<(i64, DateTime<Utc>)> {
    let sort_order: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM topics WHERE parent_id IS ?1",
        params![write.parent_id],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO topics (topic_key, content_type, parent_id, sort_order) VALUES (?1, ?2, ?3, ?4)",
        params![write.key, write.content_type, write.parent_id, sort_order],
    )?;
    let topic_id = conn.last_insert_rowid();

    let version = next_version(conn, topic_id)?;
    let stamp = format_version(&version);
    let values = TopicWrite {
        attributes: write
            .attributes
            .iter()
            .filter(|(_, value)| value.as_deref().is_some_and(|value| !value.is_empty()))
            .cloned()
            .collect(),
        ..write.clone()
    };
    write_values(conn, topic_id, &values, &stamp)?;

    debug!("create_topic: '{}' -> {} @ {}", write.key, topic_id, stamp);
    Ok((topic_id, version))
}

/// Write a new version of an existing topic
pub fn update_topic(conn: &Connection, topic_id: i64, write: &TopicWrite) -> rusqlite::Result<DateTime<Utc>> {
    conn.execute(
        "UPDATE topics SET topic_key = ?1, content_type = ?2, parent_id = ?3 WHERE topic_id = ?4",
        params![write.key, write.content_type, write.parent_id, topic_id],
    )?;

    let version = next_version(conn, topic_id)?;
    let stamp = format_version(&version);
    write_values(conn, topic_id, write, &stamp)?;

    let written: HashSet<String> = write
        .attributes
        .iter()
        .map(|(key, _)| key.to_ascii_lowercase())
        .collect();
    let mut null_out = conn.prepare_cached(
        "INSERT INTO attributes (topic_id, attribute_key, attribute_value, version)
         SELECT ?1, ?2, NULL, ?3
         WHERE (
            SELECT a.attribute_value FROM attributes a
            WHERE a.topic_id = ?1 AND a.attribute_key = ?2
            ORDER BY a.version DESC LIMIT 1
         ) IS NOT NULL",
    )?;
    let mut nulled = 0;
    for key in &write.null_attributes {
        if written.contains(&key.to_ascii_lowercase()) {
            continue;
        }
        nulled += null_out.execute(params![topic_id, key, stamp])?;
    }

    debug!(
        "update_topic: {} @ {} ({} values, {} nulled)",
        topic_id,
        stamp,
        write.attributes.len(),
        nulled
    );
    Ok(version)
}

/// Place a topic under `parent_id`, directly after `sibling_id` when it is a
/// child of that parent, otherwise last
pub fn move_topic(
    conn: &Connection,
    topic_id: i64,
    parent_id: i64,
    sibling_id: Option<i64>,
) -> rusqlite::Result<()> {
    let sibling_order: Option<i64> = match sibling_id {
        Some(sibling_id) => conn
            .query_row(
                "SELECT sort_order FROM topics WHERE topic_id = ?1 AND parent_id = ?2",
                params![sibling_id, parent_id],
                |row| row.get(0),
            )
            .optional()?,
        None => None,
    };

    let sort_order = match sibling_order {
        Some(sibling_order) => {
            conn.execute(
                "UPDATE topics SET sort_order = sort_order + 1
                 WHERE parent_id = ?1 AND sort_order > ?2 AND topic_id != ?3",
                params![parent_id, sibling_order, topic_id],
            )?;
            sibling_order + 1
        }
        None => conn.query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM topics WHERE parent_id = ?1 AND topic_id != ?2",
            params![parent_id, topic_id],
            |row| row.get(0),
        )?,
    };

    conn.execute(
        "UPDATE topics SET parent_id = ?1, sort_order = ?2 WHERE topic_id = ?3",
        params![parent_id, sort_order, topic_id],
    )?;
    debug!("move_topic: {} -> {} at {}", topic_id, parent_id, sort_order);
    Ok(())
}

/// Number of stored children of a topic
pub fn child_count(conn: &Connection, topic_id: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM topics WHERE parent_id = ?1",
        params![topic_id],
        |row| row.get(0),
    )
}

/// Remove a topic row; descendants, values and relationships go with it
/// through the schema's cascades. Returns the number of topic rows deleted
/// directly (0 or 1).
pub fn delete_topic(conn: &Connection, topic_id: i64) -> rusqlite::Result<usize> {
    let deleted = conn.execute("DELETE FROM topics WHERE topic_id = ?1", params![topic_id])?;
    debug!("delete_topic: {} ({} rows)", topic_id, deleted);
    Ok(deleted)
}

/// Make the stored targets of one relationship key equal `target_ids`.
/// Returns (added, removed).
pub fn update_relationships(
    conn: &Connection,
    source_id: i64,
    relationship_key: &str,
    target_ids: &[i64],
) -> rusqlite::Result<(usize, usize)> {
    let mut stmt = conn.prepare_cached(
        "SELECT target_id FROM relationships WHERE source_id = ?1 AND relationship_key = ?2",
    )?;
    let existing: HashSet<i64> = stmt
        .query_map(params![source_id, relationship_key], |row| row.get(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    let wanted: HashSet<i64> = target_ids.iter().copied().collect();

    let mut removed = 0;
    for target_id in existing.difference(&wanted) {
        removed += conn.execute(
            "DELETE FROM relationships WHERE source_id = ?1 AND relationship_key = ?2 AND target_id = ?3",
            params![source_id, relationship_key, target_id],
        )?;
    }

    let mut added = 0;
    for target_id in wanted.difference(&existing) {
        added += conn.execute(
            "INSERT INTO relationships (source_id, relationship_key, target_id) VALUES (?1, ?2, ?3)",
            params![source_id, relationship_key, target_id],
        )?;
    }

    debug!(
        "update_relationships: {} '{}' +{} -{}",
        source_id, relationship_key, added, removed
    );
    Ok((added, removed))
}
