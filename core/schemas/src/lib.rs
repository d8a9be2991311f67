use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

// ============================================================================
// Attribute Descriptors
// ============================================================================

/// How an attribute is stored and whether the save protocol treats it as a
/// plain value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AttributeKind {
    #[serde(rename = "scalar")]
    #[default]
    Scalar,
    #[serde(rename = "relationship")]
    Relationship, // Persisted through the relationships table
    #[serde(rename = "nested_topics")]
    NestedTopics, // Persisted as child topics
    #[serde(rename = "topic_reference")]
    TopicReference, // Single topic id stored as a scalar
}

impl AttributeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeKind::Scalar => "scalar",
            AttributeKind::Relationship => "relationship",
            AttributeKind::NestedTopics => "nested_topics",
            AttributeKind::TopicReference => "topic_reference",
        }
    }

    /// Whether values of this kind live in the attribute tables
    pub fn is_stored_as_attribute(&self) -> bool {
        matches!(self, AttributeKind::Scalar | AttributeKind::TopicReference)
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub key: String,
    #[serde(default = "default_editor_type")]
    pub editor_type: String,
    /// Stored in the per-topic extended attribute document instead of the
    /// indexed attribute table
    #[serde(default)]
    pub is_extended: bool,
    #[serde(default)]
    pub kind: AttributeKind,
    #[serde(default)]
    pub default_value: Option<String>,
}

fn default_editor_type() -> String {
    "TextBox".to_string()
}

impl AttributeDescriptor {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            editor_type: default_editor_type(),
            is_extended: false,
            kind: AttributeKind::Scalar,
            default_value: None,
        }
    }

    pub fn extended(mut self) -> Self {
        self.is_extended = true;
        self
    }

    pub fn with_kind(mut self, kind: AttributeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_editor(mut self, editor_type: &str) -> Self {
        self.editor_type = editor_type.to_string();
        self
    }
}

// ============================================================================
// Content Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentTypeDescriptor {
    pub key: String,
    /// Content type whose attribute descriptors this one inherits
    #[serde(default)]
    pub base_type: Option<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeDescriptor>,
}

impl ContentTypeDescriptor {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            base_type: None,
            attributes: Vec::new(),
        }
    }

    pub fn derived_from(mut self, base_type: &str) -> Self {
        self.base_type = Some(base_type.to_string());
        self
    }

    pub fn with_attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Attribute declared directly on this content type (no inheritance)
    pub fn own_attribute(&self, key: &str) -> Option<&AttributeDescriptor> {
        self.attributes
            .iter()
            .find(|attribute| attribute.key.eq_ignore_ascii_case(key))
    }
}

/// Source of content type metadata consumed by the persistence layer
pub trait ContentTypeProvider {
    fn content_type(&self, key: &str) -> Option<&ContentTypeDescriptor>;

    /// All attribute descriptors of a content type, base types first. A
    /// descriptor redeclared by a derived type replaces the inherited one in
    /// place.
    fn attribute_descriptors(&self, key: &str) -> Vec<&AttributeDescriptor> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = self.content_type(key);

        while let Some(content_type) = next {
            if !seen.insert(content_type.key.to_ascii_lowercase()) {
                break;
            }
            chain.push(content_type);
            next = content_type
                .base_type
                .as_deref()
                .and_then(|base| self.content_type(base));
        }

        let mut descriptors: Vec<&AttributeDescriptor> = Vec::new();
        for content_type in chain.iter().rev() {
            for attribute in &content_type.attributes {
                match descriptors
                    .iter()
                    .position(|existing| existing.key.eq_ignore_ascii_case(&attribute.key))
                {
                    Some(index) => descriptors[index] = attribute,
                    None => descriptors.push(attribute),
                }
            }
        }
        descriptors
    }

    fn attribute_descriptor(&self, content_type: &str, key: &str) -> Option<&AttributeDescriptor> {
        self.attribute_descriptors(content_type)
            .into_iter()
            .find(|attribute| attribute.key.eq_ignore_ascii_case(key))
    }
}

/// In-memory content type registry, loadable from JSON
#[derive(Debug, Clone, Default)]
pub struct ContentTypeRegistry {
    types: HashMap<String, ContentTypeDescriptor>,
}

impl ContentTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a content type
    pub fn register(&mut self, content_type: ContentTypeDescriptor) {
        self.types
            .insert(content_type.key.to_ascii_lowercase(), content_type);
    }

    pub fn with(mut self, content_type: ContentTypeDescriptor) -> Self {
        self.register(content_type);
        self
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.types.values().map(|t| t.key.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    /// Parse a JSON array of content type descriptors
    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        let descriptors: Vec<ContentTypeDescriptor> = serde_json::from_str(json)?;
        Ok(descriptors
            .into_iter()
            .fold(Self::new(), |registry, descriptor| registry.with(descriptor)))
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        let mut descriptors: Vec<&ContentTypeDescriptor> = self.types.values().collect();
        descriptors.sort_by(|a, b| a.key.cmp(&b.key));
        serde_json::to_string_pretty(&descriptors)
    }
}

impl ContentTypeProvider for ContentTypeRegistry {
    fn content_type(&self, key: &str) -> Option<&ContentTypeDescriptor> {
        self.types.get(&key.to_ascii_lowercase())
    }
}
