//! Topics - inspect and edit a topic repository from the command line
//!
//! Usage:
//!   topics [--db-path <path>] [--config <file>] [--content-types <file>] <command>
//!
//! Options:
//!   --db-path: SQLite database (defaults to TOPICS_DB_PATH, then ./topics.db)
//!   --config: JSON repository configuration, used instead of the environment
//!   --content-types: JSON content type registry used by the save protocol
//!
//! Output is JSON on stdout; logs go to stderr (RUST_LOG controls the level).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ontopic_graph::{ErrorKind, TopicGraph, TopicHandle, TopicRepository};
use ontopic_schemas::ContentTypeRegistry;
use ontopic_sql::{RepositoryConfig, SqlTopicRepository};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "topics")]
#[command(about = "Inspect and edit a topic repository")]
struct Args {
    /// Path to SQLite database file
    #[arg(long, short, global = true)]
    db_path: Option<PathBuf>,

    /// JSON repository configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON content type registry
    #[arg(long, global = true)]
    content_types: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the schema and a root topic if there is none
    Init {
        #[arg(long, default_value = "Root")]
        root: String,
        #[arg(long, default_value = "Container")]
        content_type: String,
    },
    /// Create a topic under an existing parent
    Create {
        /// Unique key of the parent, e.g. Root:Web
        #[arg(long)]
        parent: String,
        #[arg(long)]
        key: String,
        #[arg(long, default_value = "Page")]
        content_type: String,
    },
    /// Print a topic (by unique key or id) as JSON
    Show {
        #[arg(long, conflicts_with = "id")]
        key: Option<String>,
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        recursive: bool,
    },
    /// Set one attribute and save a new version
    Set {
        #[arg(long)]
        key: String,
        #[arg(long)]
        attribute: String,
        /// Empty clears the value
        #[arg(long)]
        value: String,
        #[arg(long)]
        draft: bool,
    },
    /// Move a topic under a new parent
    Move {
        #[arg(long)]
        key: String,
        #[arg(long)]
        target: String,
        /// Key of the child of the target to place the topic after
        #[arg(long)]
        sibling: Option<String>,
    },
    /// Delete a topic (and, with --recursive, its descendants)
    Delete {
        #[arg(long)]
        key: String,
        #[arg(long)]
        recursive: bool,
    },
    /// List stored versions of a topic
    History {
        #[arg(long)]
        id: i64,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_topic(graph: &TopicGraph, handle: TopicHandle, recursive: bool) -> Result<()> {
    print_json(&graph.snapshot(handle, recursive)?)
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RepositoryConfig::from_json_file(path)?,
        None => RepositoryConfig::from_env()?,
    };
    if let Some(db_path) = args.db_path {
        config.database_path = db_path;
    }

    let content_types = match &args.content_types {
        Some(path) => ContentTypeRegistry::from_path(path)
            .with_context(|| format!("Failed to read content types from {}", path.display()))?,
        None => ContentTypeRegistry::new(),
    };
    info!("Database: {}", config.database_path.display());

    let mut repository = SqlTopicRepository::open(config, content_types)?;
    let mut graph = repository.new_graph();

    match args.command {
        Command::Init { root, content_type } => match repository.load(&mut graph, Some(&root), false) {
            Ok(existing) => {
                info!("Root topic '{}' already exists", root);
                print_topic(&graph, existing, false)?;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let handle = graph.create_topic(&root, &content_type, None)?;
                let id = repository.save(&mut graph, handle, false, false)?;
                info!("Created root topic '{}' ({})", root, id);
                print_topic(&graph, handle, false)?;
            }
            Err(err) => return Err(err.into()),
        },

        Command::Create {
            parent,
            key,
            content_type,
        } => {
            let parent = repository.load(&mut graph, Some(&parent), false)?;
            let handle = graph.create_topic(&key, &content_type, Some(parent))?;
            repository.save(&mut graph, handle, false, false)?;
            print_topic(&graph, handle, false)?;
        }

        Command::Show { key, id, recursive } => {
            let handle = match (key, id) {
                (Some(key), _) => repository.load(&mut graph, Some(&key), recursive)?,
                (None, Some(id)) => repository.load_by_id(&mut graph, id, recursive)?,
                (None, None) => repository.load(&mut graph, None, recursive)?,
            };
            print_topic(&graph, handle, recursive)?;
        }

        Command::Set {
            key,
            attribute,
            value,
            draft,
        } => {
            let handle = repository.load(&mut graph, Some(&key), false)?;
            let value = (!value.is_empty()).then_some(value.as_str());
            graph.set_attribute(handle, &attribute, value)?;
            repository.save(&mut graph, handle, false, draft)?;
            print_topic(&graph, handle, false)?;
        }

        Command::Move {
            key,
            target,
            sibling,
        } => {
            let handle = repository.load(&mut graph, Some(&key), false)?;
            let target_handle = repository.load(&mut graph, Some(&target), false)?;
            let sibling_handle = match sibling {
                Some(sibling) => Some(repository.load(&mut graph, Some(&format!("{target}:{sibling}")), false)?),
                None => None,
            };
            repository.move_topic(&mut graph, handle, target_handle, sibling_handle)?;
            print_topic(&graph, handle, false)?;
        }

        Command::Delete { key, recursive } => {
            let handle = repository.load(&mut graph, Some(&key), true)?;
            repository.delete(&mut graph, handle, recursive)?;
            info!("Deleted '{}'", key);
        }

        Command::History { id } => {
            print_json(&repository.version_rows(id)?)?;
        }
    }

    Ok(())
}
