//! Ingestion of archive records from a JSON file.
//!
//! Flow per record: upsert item → chunk body → replace chunks → embed
//! inline (non-fatal). People and services are stored but never chunked.
//!
//! The input is a JSON array of records:
//!
//! ```json
//! [
//!   {"id": "story-1", "kind": "story", "title": "Bush Tucker and the Sea",
//!    "summary": "Fishing with grandfather", "body": "..."}
//! ]
//! ```
//!
//! `id` is optional; without one the ID is derived from kind and title,
//! so re-ingesting the same file updates records in place.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;

use palm_rag_core::chunk::chunk_item;
use palm_rag_core::embedding::EmbeddingProvider;
use palm_rag_core::models::{ContentItem, ContentKind};
use palm_rag_core::store::ChunkStore;

use crate::config::Config;
use crate::db;
use crate::embed_cmd::{self, EmbedReport};
use crate::embedding;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Clone, Deserialize)]
pub struct IngestRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub kind: ContentKind,
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub body: String,
    /// Unix seconds; defaults to now.
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

impl IngestRecord {
    pub fn into_item(self, now: i64) -> ContentItem {
        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| derive_id(self.kind, &self.title));
        let created_at = self.created_at.unwrap_or(now);
        ContentItem {
            id,
            kind: self.kind,
            title: self.title,
            summary: self.summary,
            body: self.body,
            created_at,
            updated_at: self.updated_at.unwrap_or(created_at),
        }
    }
}

/// `<kind>-<first 16 hex chars of sha256(kind:title)>`.
fn derive_id(kind: ContentKind, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(title.trim().to_lowercase().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}-{}", kind.as_str(), &digest[..16])
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub items: u64,
    pub chunks: u64,
    pub embeddings: EmbedReport,
}

/// Write items and their chunks to `store`, embedding when possible.
pub async fn ingest_items<S: ChunkStore + ?Sized>(
    store: &S,
    embedder: Option<&dyn EmbeddingProvider>,
    items: &[ContentItem],
    max_tokens: usize,
    batch_size: usize,
) -> Result<IngestReport> {
    let mut report = IngestReport::default();

    for item in items {
        store
            .upsert_item(item)
            .await
            .with_context(|| format!("Failed to store item {}", item.id))?;
        report.items += 1;

        if item.kind.source_type().is_none() {
            continue;
        }
        let chunks = chunk_item(item, max_tokens);
        store
            .replace_chunks(&item.id, &chunks)
            .await
            .with_context(|| format!("Failed to store chunks for {}", item.id))?;
        report.chunks += chunks.len() as u64;

        let embedded = embed_cmd::embed_chunks_inline(store, embedder, &chunks, batch_size).await;
        report.embeddings.embedded += embedded.embedded;
        report.embeddings.failed += embedded.failed;
    }

    Ok(report)
}

pub fn read_records(path: &Path) -> Result<Vec<IngestRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;
    let records: Vec<IngestRecord> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse input file: {}", path.display()))?;
    Ok(records)
}

pub async fn run_ingest(config: &Config, path: &Path) -> Result<()> {
    let now = Utc::now().timestamp();
    let items: Vec<ContentItem> = read_records(path)?
        .into_iter()
        .map(|r| r.into_item(now))
        .collect();

    let embedder = embedding::create_provider(&config.embedding)?;
    let store = SqliteStore::new(db::connect(config).await?);

    let report = ingest_items(
        &store,
        embedder.as_deref(),
        &items,
        config.chunking.max_tokens,
        config.embedding.batch_size,
    )
    .await?;

    println!("ingest {}", path.display());
    println!("  items upserted: {}", report.items);
    println!("  chunks written: {}", report.chunks);
    if config.embedding.is_enabled() {
        println!("  embeddings written: {}", report.embeddings.embedded);
        println!("  embeddings pending: {}", report.embeddings.failed);
    }
    println!("ok");

    store.close().await;
    Ok(())
}
