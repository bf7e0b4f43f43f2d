//! # Palm RAG
//!
//! Retrieval-augmented chat and search over the Palm Island community
//! archive.
//!
//! Stories, documents and knowledge entries are ingested, chunked and
//! embedded into SQLite. A chat turn retrieves relevant chunks (lexical and
//! semantic, merged), assembles them into a token-budgeted context, and
//! asks a hosted model to answer with citations. The same store backs a
//! search endpoint and an admin surface for the response cache and the
//! rate limiter.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌──────────────┐
//! │  ingest   │──▶│ chunk+embed  │──▶│    SQLite    │
//! │  (JSON)   │   │              │   │ items/chunks │
//! └───────────┘   └──────────────┘   └──────┬───────┘
//!                                           │
//!                       ┌───────────────────┤
//!                       ▼                   ▼
//!                 ┌──────────┐       ┌──────────────┐
//!                 │   CLI    │       │     HTTP     │
//!                 │  (palm)  │       │ chat/search  │
//!                 └──────────┘       └──────────────┘
//! ```
//!
//! The pipeline's algorithms live in `palm-rag-core`; this crate supplies
//! configuration, persistence, the hosted-model clients and the surfaces.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite chunk and conversation stores |
//! | [`embedding`] | OpenAI embedding client |
//! | [`llm`] | Anthropic chat client |
//! | [`ingest`] | JSON ingestion |
//! | [`embed_cmd`] | Inline and backfill embedding |
//! | [`search`] | Archive search |
//! | [`chat`] | The chat pipeline |
//! | [`services`] | Shared service graph |
//! | [`server`] | HTTP server |

pub mod chat;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod prune;
pub mod search;
pub mod server;
pub mod services;
pub mod sqlite_store;
pub mod stats;
