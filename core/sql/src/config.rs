use ontopic_graph::{GraphConfig, Result, TopicError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_DATABASE_PATH: &str = "topics.db";

/// Settings for [`crate::SqlTopicRepository`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub database_path: PathBuf,
    /// How long a connection waits on a locked database
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default)]
    pub graph: GraphConfig,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl RepositoryConfig {
    pub fn new<P: AsRef<Path>>(database_path: P) -> Self {
        Self {
            database_path: database_path.as_ref().to_path_buf(),
            busy_timeout_ms: default_busy_timeout_ms(),
            graph: GraphConfig::default(),
        }
    }

    /// Read `TOPICS_DB_PATH`, `TOPICS_BUSY_TIMEOUT_MS`,
    /// `TOPICS_MAX_DERIVED_HOPS` and `TOPICS_MAX_SETTER_DEPTH`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new(
            lookup("TOPICS_DB_PATH").unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string()),
        );
        if let Some(timeout) = parse_var(&lookup, "TOPICS_BUSY_TIMEOUT_MS")? {
            config.busy_timeout_ms = timeout;
        }
        if let Some(hops) = parse_var(&lookup, "TOPICS_MAX_DERIVED_HOPS")? {
            config.graph.max_derived_hops = hops;
        }
        if let Some(depth) = parse_var(&lookup, "TOPICS_MAX_SETTER_DEPTH")? {
            config.graph.max_setter_depth = depth;
        }
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| TopicError::storage("read config", &path.display().to_string(), e))?;
        Ok(serde_json::from_str(&json)?)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            TopicError::InvalidArgument(format!("{name} must be a non-negative number, got '{raw}'"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = RepositoryConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.database_path, PathBuf::from(DEFAULT_DATABASE_PATH));
        assert_eq!(config.busy_timeout_ms, 5_000);
        assert_eq!(config.graph, GraphConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let config = RepositoryConfig::from_lookup(lookup(&[
            ("TOPICS_DB_PATH", "/tmp/site.db"),
            ("TOPICS_MAX_DERIVED_HOPS", "2"),
            ("TOPICS_MAX_SETTER_DEPTH", " 4 "),
        ]))
        .unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/site.db"));
        assert_eq!(config.graph.max_derived_hops, 2);
        assert_eq!(config.graph.max_setter_depth, 4);
    }

    #[test]
    fn test_bad_number_is_rejected() {
        let err = RepositoryConfig::from_lookup(lookup(&[("TOPICS_BUSY_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(matches!(err, TopicError::InvalidArgument(_)));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"database_path": "site.db", "graph": {{"max_setter_depth": 1}}}}"#).unwrap();

        let config = RepositoryConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.database_path, PathBuf::from("site.db"));
        assert_eq!(config.busy_timeout_ms, 5_000);
        assert_eq!(config.graph.max_setter_depth, 1);
        assert_eq!(config.graph.max_derived_hops, 5);
    }
}
