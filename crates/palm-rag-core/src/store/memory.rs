//! In-memory [`ChunkStore`] for tests and embedded use.
//!
//! Uses `HashMap` behind `std::sync::RwLock`. Similarity is brute-force
//! cosine over every stored vector, mirroring what the database-side
//! function does.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{PalmError, Result};
use crate::models::{ContentChunk, ContentItem, ContentKind};
use crate::retrieval::lexical_score;

use super::{item_matches, ChunkStore, SimilarityRow};

pub struct InMemoryStore {
    items: RwLock<HashMap<String, ContentItem>>,
    chunks: RwLock<Vec<ContentChunk>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            chunks: RwLock::new(Vec::new()),
        }
    }

    pub fn item_count(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn upsert_item(&self, item: &ContentItem) -> Result<()> {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn replace_chunks(&self, item_id: &str, chunks: &[ContentChunk]) -> Result<()> {
        let mut stored = self.chunks.write().unwrap_or_else(PoisonError::into_inner);
        stored.retain(|c| c.source_id != item_id);
        stored.extend(chunks.iter().cloned());
        Ok(())
    }

    async fn upsert_embedding(&self, chunk_id: &str, vector: &[f32], _model: &str) -> Result<()> {
        let mut stored = self.chunks.write().unwrap_or_else(PoisonError::into_inner);
        let chunk = stored
            .iter_mut()
            .find(|c| c.id == chunk_id)
            .ok_or_else(|| PalmError::NotFound(format!("chunk not found: {}", chunk_id)))?;
        chunk.embedding = Some(vector.to_vec());
        Ok(())
    }

    async fn lexical_search(
        &self,
        kind: ContentKind,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<ContentItem>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
        let mut matches: Vec<ContentItem> = items
            .values()
            .filter(|i| i.kind == kind && item_matches(i, terms))
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            lexical_score(terms, b)
                .partial_cmp(&lexical_score(terms, a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.updated_at.cmp(&a.updated_at))
                .then(a.id.cmp(&b.id))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    async fn similarity_rows(
        &self,
        query_vec: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarityRow>> {
        let stored = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        let mut rows: Vec<SimilarityRow> = stored
            .iter()
            .filter_map(|c| {
                let vector = c.embedding.as_ref()?;
                let similarity = cosine_similarity(query_vec, vector) as f64;
                (similarity >= threshold).then(|| SimilarityRow {
                    chunk_id: c.id.clone(),
                    similarity,
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<ContentChunk>> {
        let stored = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        Ok(stored
            .iter()
            .filter(|c| ids.contains(&c.id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_item;

    fn item(id: &str, kind: ContentKind, title: &str, body: &str, updated_at: i64) -> ContentItem {
        ContentItem {
            id: id.to_string(),
            kind,
            title: title.to_string(),
            summary: None,
            body: body.to_string(),
            created_at: updated_at,
            updated_at,
        }
    }

    #[tokio::test]
    async fn test_lexical_search_filters_kind_and_orders_recent_first() {
        let store = InMemoryStore::new();
        store
            .upsert_item(&item("a", ContentKind::Story, "Old net", "fishing at dawn", 1))
            .await
            .unwrap();
        store
            .upsert_item(&item("b", ContentKind::Story, "New net", "Fishing at dusk", 2))
            .await
            .unwrap();
        store
            .upsert_item(&item("c", ContentKind::Service, "Bait shop", "fishing supplies", 3))
            .await
            .unwrap();

        let hits = store
            .lexical_search(ContentKind::Story, &["fishing".to_string()], 10)
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_lexical_search_ranks_by_relevance_before_limit() {
        let store = InMemoryStore::new();
        store
            .upsert_item(&item("sea", ContentKind::Story, "Bush Tucker and the Sea", "fishing at low tide", 1))
            .await
            .unwrap();
        for n in 0..10 {
            store
                .upsert_item(&item(&format!("new-{}", n), ContentKind::Story, "Festival", "the oval", 10 + n))
                .await
                .unwrap();
        }

        let terms = vec!["the".to_string(), "fishing".to_string()];
        let hits = store.lexical_search(ContentKind::Story, &terms, 2).await.unwrap();
        assert_eq!(hits[0].id, "sea");
        assert_eq!(hits[1].id, "new-9");
    }

    #[tokio::test]
    async fn test_replace_chunks_drops_old_vectors() {
        let store = InMemoryStore::new();
        let it = item("a", ContentKind::Story, "T", "one", 1);
        let mut chunks = chunk_item(&it, 100);
        chunks[0].embedding = Some(vec![1.0, 0.0]);
        store.replace_chunks("a", &chunks).await.unwrap();
        assert_eq!(
            store.similarity_rows(&[1.0, 0.0], 0.5, 10).await.unwrap().len(),
            1
        );

        let fresh = chunk_item(&item("a", ContentKind::Story, "T", "two", 2), 100);
        store.replace_chunks("a", &fresh).await.unwrap();
        assert_eq!(store.chunk_count(), 1);
        assert!(store
            .similarity_rows(&[1.0, 0.0], 0.0, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_upsert_embedding_unknown_chunk() {
        let store = InMemoryStore::new();
        let err = store.upsert_embedding("missing", &[1.0], "m").await;
        assert!(matches!(err, Err(PalmError::NotFound(_))));
    }
}
