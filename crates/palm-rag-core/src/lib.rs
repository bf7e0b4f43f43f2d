//! # Palm RAG Core
//!
//! Runtime-agnostic logic behind the Palm Island archive assistant: data
//! models, chunking, the chunk and conversation store traits (with
//! in-memory implementations), the vector-store adapter, hybrid retrieval,
//! context assembly, chat response generation, rate limiting and response
//! caching.
//!
//! This crate contains no tokio, sqlx, HTTP client or filesystem I/O.
//! Hosted providers (embeddings, chat models) and persistent stores are
//! reached through traits implemented by the `palm-rag` application crate.
//!
//! ## Request flow
//!
//! ```text
//! chat request ─▶ RateLimiter ─▶ ConversationStore::load
//!                                     │
//!                                     ▼
//!                  retrieval::retrieve (lexical ∥ semantic)
//!                                     │
//!                                     ▼
//!                       context::assemble (token budget)
//!                                     │
//!                                     ▼
//!              chat::ResponseGenerator (whole or streamed)
//!                                     │
//!                                     ▼
//!                          ConversationStore::save
//! ```

pub mod cache;
pub mod chat;
pub mod chunk;
pub mod clock;
pub mod context;
pub mod conversation;
pub mod embedding;
pub mod error;
pub mod models;
pub mod ratelimit;
pub mod retrieval;
pub mod store;
pub mod vector;

pub use error::{PalmError, Result};
