use serde::{Deserialize, Serialize};

/// Limits applied by the in-memory graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// How many derived-topic hops attribute lookups may follow
    #[serde(default = "default_max_derived_hops")]
    pub max_derived_hops: usize,
    /// How deep business-logic setter redirection may nest for one write
    #[serde(default = "default_max_setter_depth")]
    pub max_setter_depth: usize,
}

fn default_max_derived_hops() -> usize {
    5
}

fn default_max_setter_depth() -> usize {
    3
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_derived_hops: default_max_derived_hops(),
            max_setter_depth: default_max_setter_depth(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: GraphConfig = serde_json::from_str(r#"{"max_derived_hops": 2}"#).unwrap();
        assert_eq!(config.max_derived_hops, 2);
        assert_eq!(config.max_setter_depth, 3);
    }
}
