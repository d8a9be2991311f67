pub mod config;
pub mod loader;
pub mod procedures;
pub mod repository;
pub mod schema;
pub mod xml;

pub use config::RepositoryConfig;
pub use loader::{apply_result_sets, refresh_result_sets};
pub use procedures::{TopicResultSets, VersionRow};
pub use repository::SqlTopicRepository;
pub use schema::init_schema;
