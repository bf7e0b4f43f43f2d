//! # Palm RAG CLI (`palm`)
//!
//! ## Usage
//!
//! ```bash
//! palm --config ./config/palm.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `palm init` | Create the SQLite database and run schema migrations |
//! | `palm ingest <file>` | Ingest archive records from a JSON file |
//! | `palm embed pending` | Embed chunks with missing or stale vectors |
//! | `palm search "<query>"` | Search the archive |
//! | `palm chat "<message>"` | Ask one question |
//! | `palm stats` | Show archive counts |
//! | `palm prune` | Delete idle conversations |
//! | `palm serve` | Start the HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use palm_rag::{chat, config, embed_cmd, ingest, logging, migrate, prune, search, server, stats};

/// Palm RAG: retrieval-augmented chat and search over the Palm Island
/// community archive.
#[derive(Parser)]
#[command(name = "palm", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/palm.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest stories, documents, knowledge entries, people and services
    /// from a JSON array.
    Ingest {
        /// Path to the JSON file.
        file: PathBuf,
    },

    /// Manage chunk embeddings.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Search the archive.
    Search {
        /// Search query (at least 2 characters).
        query: String,

        /// One of: all, stories, people, services, knowledge.
        #[arg(long = "type", default_value = "all")]
        search_type: String,

        /// Maximum results per type (1-50).
        #[arg(long)]
        limit: Option<usize>,

        /// Also run semantic search over chunks.
        #[arg(long)]
        semantic: bool,
    },

    /// Ask a question grounded in the archive.
    Chat {
        message: String,

        /// Continue an existing conversation.
        #[arg(long)]
        conversation: Option<String>,
    },

    /// Show item, chunk, embedding and conversation counts.
    Stats,

    /// Delete conversations not updated within the retention window.
    Prune {
        /// Overrides `conversations.retention_days`.
        #[arg(long)]
        older_than_days: Option<u32>,
    },

    /// Start the HTTP server.
    Serve,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks with no vector or a stale one.
    Pending {
        /// Maximum number of chunks to embed.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { file } => {
            ingest::run_ingest(&cfg, &file).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { limit } => {
                embed_cmd::run_embed_pending(&cfg, limit).await?;
            }
        },
        Commands::Search {
            query,
            search_type,
            limit,
            semantic,
        } => {
            search::run_search(&cfg, &query, Some(&search_type), limit, semantic).await?;
        }
        Commands::Chat {
            message,
            conversation,
        } => {
            chat::run_chat(&cfg, &message, conversation).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Prune { older_than_days } => {
            prune::run_prune(&cfg, older_than_days).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
