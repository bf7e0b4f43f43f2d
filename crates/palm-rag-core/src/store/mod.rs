//! Storage abstraction for archive content.
//!
//! The [`ChunkStore`] trait covers everything retrieval and ingestion need
//! from the persistent store: writing items and chunks, lexical substring
//! search per content kind, and the similarity function that scores stored
//! vectors against a query vector. The application crate backs it with
//! SQLite; [`memory::InMemoryStore`] backs tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ContentChunk, ContentItem, ContentKind};

/// One raw row from the store's similarity function.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityRow {
    pub chunk_id: String,
    /// Cosine similarity as computed by the store.
    pub similarity: f64,
}

/// Abstract storage backend for archive content.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_item`](ChunkStore::upsert_item) | Insert or replace an item |
/// | [`replace_chunks`](ChunkStore::replace_chunks) | Replace all chunks (and vectors) of an item |
/// | [`upsert_embedding`](ChunkStore::upsert_embedding) | Store a vector for one chunk |
/// | [`lexical_search`](ChunkStore::lexical_search) | Case-insensitive substring match on title/summary/body |
/// | [`similarity_rows`](ChunkStore::similarity_rows) | Vector similarity over embedded chunks |
/// | [`get_chunks`](ChunkStore::get_chunks) | Hydrate chunks by ID |
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn upsert_item(&self, item: &ContentItem) -> Result<()>;

    /// Replace every chunk belonging to `item_id`. Vectors of the old
    /// chunks are dropped; vectors carried on the new chunks are stored.
    async fn replace_chunks(&self, item_id: &str, chunks: &[ContentChunk]) -> Result<()>;

    async fn upsert_embedding(&self, chunk_id: &str, vector: &[f32], model: &str) -> Result<()>;

    /// Items of `kind` where any of `terms` (already lowercased) occurs in
    /// the title, summary, or body. Ordered by
    /// [`lexical_score`](crate::retrieval::lexical_score) descending, then
    /// most recently updated, then ID, so `limit` never drops a better
    /// match in favour of a newer one.
    async fn lexical_search(
        &self,
        kind: ContentKind,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<ContentItem>>;

    /// Embedded chunks with similarity `>= threshold`, best first, at most
    /// `limit` rows.
    async fn similarity_rows(
        &self,
        query_vec: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarityRow>>;

    /// Chunks for the given IDs. Unknown IDs are skipped; order is not
    /// guaranteed.
    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<ContentChunk>>;
}

/// True if any term occurs (case-insensitively) in the item's text fields.
///
/// Shared by the in-memory store and by scoring so both agree on what a
/// lexical match is.
pub fn item_matches(item: &ContentItem, terms: &[String]) -> bool {
    let title = item.title.to_lowercase();
    let summary = item.summary.as_deref().unwrap_or("").to_lowercase();
    let body = item.body.to_lowercase();
    terms
        .iter()
        .any(|t| title.contains(t.as_str()) || summary.contains(t.as_str()) || body.contains(t.as_str()))
}
