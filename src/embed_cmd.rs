//! Embedding of stored chunks.
//!
//! Two entry points: [`embed_chunks_inline`] runs right after ingestion
//! and never fails the caller, and [`run_embed_pending`] backs
//! `palm embed pending`, catching up on chunks that have no vector or a
//! vector computed from older text.

use anyhow::{bail, Result};

use palm_rag_core::embedding::EmbeddingProvider;
use palm_rag_core::models::ContentChunk;
use palm_rag_core::store::ChunkStore;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::sqlite_store::{PendingChunk, SqliteStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbedReport {
    pub embedded: u64,
    pub failed: u64,
}

/// Embed `texts` in batches and store each vector under the matching ID.
///
/// A failed batch is counted and skipped; a failed store write is too.
pub async fn embed_in_batches<S: ChunkStore + ?Sized>(
    store: &S,
    embedder: &dyn EmbeddingProvider,
    items: &[(String, String)],
    batch_size: usize,
) -> EmbedReport {
    let mut report = EmbedReport::default();

    for batch in items.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
        match embedder.embed_batch(&texts).await {
            Ok(vectors) => {
                for ((id, _), vector) in batch.iter().zip(vectors.iter()) {
                    match store
                        .upsert_embedding(id, vector, embedder.model_name())
                        .await
                    {
                        Ok(()) => report.embedded += 1,
                        Err(e) => {
                            tracing::warn!(chunk_id = %id, error = %e, "failed to store embedding");
                            report.failed += 1;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(batch = batch.len(), error = %e, "embedding batch failed");
                report.failed += batch.len() as u64;
            }
        }
    }

    report
}

/// Embed freshly written chunks. Failures leave the chunks pending.
pub async fn embed_chunks_inline<S: ChunkStore + ?Sized>(
    store: &S,
    embedder: Option<&dyn EmbeddingProvider>,
    chunks: &[ContentChunk],
    batch_size: usize,
) -> EmbedReport {
    let Some(embedder) = embedder else {
        return EmbedReport::default();
    };
    let items: Vec<(String, String)> = chunks
        .iter()
        .map(|c| (c.id.clone(), c.text.clone()))
        .collect();
    embed_in_batches(store, embedder, &items, batch_size).await
}

/// Embed everything [`SqliteStore::pending_embeddings`] reports.
pub async fn embed_pending(
    store: &SqliteStore,
    embedder: &dyn EmbeddingProvider,
    limit: Option<usize>,
    batch_size: usize,
) -> Result<(usize, EmbedReport)> {
    let pending: Vec<PendingChunk> = store.pending_embeddings(limit).await?;
    let items: Vec<(String, String)> = pending.into_iter().map(|p| (p.id, p.text)).collect();
    let report = embed_in_batches(store, embedder, &items, batch_size).await;
    Ok((items.len(), report))
}

pub async fn run_embed_pending(config: &Config, limit: Option<usize>) -> Result<()> {
    let Some(embedder) = embedding::create_provider(&config.embedding)? else {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    };

    let store = SqliteStore::new(db::connect(config).await?);
    let (total, report) = embed_pending(
        &store,
        embedder.as_ref(),
        limit,
        config.embedding.batch_size,
    )
    .await?;

    println!("embed pending");
    if total == 0 {
        println!("  all chunks up to date");
    } else {
        println!("  total pending: {}", total);
        println!("  embedded: {}", report.embedded);
        println!("  failed: {}", report.failed);
    }

    store.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use palm_rag_core::chunk::chunk_item;
    use palm_rag_core::error::{PalmError, Result as CoreResult};
    use palm_rag_core::models::{ContentItem, ContentKind};
    use palm_rag_core::store::memory::InMemoryStore;

    /// Fails any batch containing the word "fail".
    struct PickyEmbedder;

    #[async_trait]
    impl EmbeddingProvider for PickyEmbedder {
        fn model_name(&self) -> &str {
            "picky"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.contains("fail")) {
                return Err(PalmError::Provider("rejected".into()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[tokio::test]
    async fn test_failed_batches_are_counted_not_fatal() {
        let store = InMemoryStore::new();
        let item = ContentItem {
            id: "s1".into(),
            kind: ContentKind::Story,
            title: "T".into(),
            summary: None,
            body: "good one\n\nplease fail\n\ngood two".into(),
            created_at: 0,
            updated_at: 0,
        };
        let chunks = chunk_item(&item, 3);
        assert_eq!(chunks.len(), 3);
        store.replace_chunks("s1", &chunks).await.unwrap();

        let report = embed_chunks_inline(&store, Some(&PickyEmbedder), &chunks, 1).await;
        assert_eq!(report, EmbedReport { embedded: 2, failed: 1 });
    }

    #[tokio::test]
    async fn test_no_embedder_is_noop() {
        let store = InMemoryStore::new();
        let report = embed_chunks_inline(&store, None, &[], 8).await;
        assert_eq!(report, EmbedReport::default());
    }
}
