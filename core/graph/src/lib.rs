pub mod attributes;
pub mod collections;
pub mod config;
pub mod error;
pub mod graph;
pub mod relationships;
pub mod repository;
pub mod setters;
pub mod snapshot;
pub mod topic;

pub use attributes::{AttributeValue, AttributeValueCollection, SetOutcome};
pub use collections::KeyedTopicCollection;
pub use config::GraphConfig;
pub use error::{ErrorKind, Result, TopicError};
pub use graph::TopicGraph;
pub use relationships::{NamedTopicCollection, RelatedTopicCollection, RelationshipSide};
pub use repository::{
    DeleteEvent, MoveEvent, ObserverId, RenameEvent, RepositoryBase, RepositoryObserver,
    TopicRepository,
};
pub use setters::{AttributeSetter, AttributeSetterTable};
pub use snapshot::TopicSnapshot;
pub use topic::{attribute_keys, validate_key, Topic, TopicHandle, UNSAVED_ID};
