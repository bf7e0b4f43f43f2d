//! Hybrid retrieval across the story, document and knowledge pools.
//!
//! # Algorithm
//!
//! 1. Split the query into lowercase terms and run a lexical (substring)
//!    search against every requested pool.
//! 2. If semantic mode is on, embed the query once and run a similarity
//!    search over the chunk store. Lexical and semantic searches run
//!    concurrently and are joined before anything is merged.
//! 3. Per pool, deduplicate by source ID, keeping the higher score; on a
//!    tie the semantic result wins.
//! 4. Truncate each pool to `per_pool_limit`, then the merged list to
//!    `limit`.
//!
//! A failing embedding call or vector search does not fail the query: the
//! lexical results come back wrapped in [`Retrieval::Degraded`] with the
//! reason. Lexical store failures are real errors.

use std::collections::{BTreeMap, HashMap};

use futures_util::future::{join, join_all};
use serde::Serialize;

use crate::embedding::EmbeddingProvider;
use crate::error::{PalmError, Result};
use crate::models::{ContentChunk, ContentItem, ContentKind, MatchKind, RetrievalResult, SourceType};
use crate::store::{item_matches, ChunkStore};
use crate::vector::{similarity_search, SimilarityQuery};

/// Terms shorter than this are ignored unless nothing else is left.
const MIN_TERM_CHARS: usize = 2;

#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    /// Maximum results overall.
    pub limit: usize,
    /// Maximum results from any single pool.
    pub per_pool_limit: usize,
    pub pools: Vec<SourceType>,
    pub semantic: bool,
    pub similarity_threshold: f64,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            per_pool_limit: 5,
            pools: SourceType::ALL.to_vec(),
            semantic: true,
            similarity_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalSet {
    /// Merged results, best first, at most `limit`.
    pub chunks: Vec<RetrievalResult>,
    /// Results from the knowledge pool alone, at most `per_pool_limit`.
    pub knowledge_entries: Vec<RetrievalResult>,
    /// Distinct sources matched across all pools before truncation.
    pub total_matched: usize,
}

/// Outcome of a retrieval: either everything that was asked for ran, or
/// the semantic half failed and only lexical results are present.
#[derive(Debug, Clone)]
pub enum Retrieval {
    Complete(RetrievalSet),
    Degraded { set: RetrievalSet, reason: String },
}

impl Retrieval {
    pub fn set(&self) -> &RetrievalSet {
        match self {
            Retrieval::Complete(set) => set,
            Retrieval::Degraded { set, .. } => set,
        }
    }

    pub fn into_set(self) -> RetrievalSet {
        match self {
            Retrieval::Complete(set) => set,
            Retrieval::Degraded { set, .. } => set,
        }
    }

    pub fn degradation(&self) -> Option<&str> {
        match self {
            Retrieval::Complete(_) => None,
            Retrieval::Degraded { reason, .. } => Some(reason),
        }
    }
}

/// Lowercase, punctuation-stripped, deduplicated query terms.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for raw in query.split_whitespace() {
        let term: String = raw
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if term.chars().count() >= MIN_TERM_CHARS && !terms.contains(&term) {
            terms.push(term);
        }
    }
    if terms.is_empty() {
        let whole = query.trim().to_lowercase();
        if !whole.is_empty() {
            terms.push(whole);
        }
    }
    terms
}

/// Score a lexical match in `[0.0, 1.0]`.
///
/// `0.2` for any match, up to `0.6` more for the fraction of terms found,
/// and `0.2` if a term hits the title.
pub fn lexical_score(terms: &[String], item: &ContentItem) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let title = item.title.to_lowercase();
    let summary = item.summary.as_deref().unwrap_or("").to_lowercase();
    let body = item.body.to_lowercase();

    let matched = terms
        .iter()
        .filter(|t| title.contains(t.as_str()) || summary.contains(t.as_str()) || body.contains(t.as_str()))
        .count();
    if matched == 0 {
        return 0.0;
    }
    let title_hit = terms.iter().any(|t| title.contains(t.as_str()));

    let score = 0.2 + 0.6 * (matched as f64 / terms.len() as f64) + if title_hit { 0.2 } else { 0.0 };
    score.clamp(0.0, 1.0)
}

/// Lexically matched items of one kind, scored and sorted best first.
pub async fn lexical_candidates<S: ChunkStore + ?Sized>(
    store: &S,
    kind: ContentKind,
    terms: &[String],
    limit: usize,
) -> Result<Vec<(ContentItem, f64)>> {
    if terms.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }
    let items = store
        .lexical_search(kind, terms, limit)
        .await?;

    let mut scored: Vec<(ContentItem, f64)> = items
        .into_iter()
        .filter(|item| item_matches(item, terms))
        .map(|item| {
            let score = lexical_score(terms, &item);
            (item, score)
        })
        .collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.0.updated_at.cmp(&a.0.updated_at))
            .then(a.0.id.cmp(&b.0.id))
    });
    scored.truncate(limit);
    Ok(scored)
}

/// Represent a whole item as a single chunk so lexical and semantic
/// results can be merged.
fn item_as_chunk(item: &ContentItem, source_type: SourceType) -> ContentChunk {
    let text = match item.summary.as_deref() {
        Some(summary) if !summary.trim().is_empty() && item.body.trim().is_empty() => {
            summary.to_string()
        }
        _ => item.body.clone(),
    };
    ContentChunk {
        id: item.id.clone(),
        source_id: item.id.clone(),
        source_type,
        title: item.title.clone(),
        chunk_index: 0,
        hash: crate::chunk::content_hash(&text),
        text,
        embedding: None,
        created_at: item.created_at,
    }
}

/// Embed the query and fetch semantically similar chunks.
async fn semantic_results<S: ChunkStore + ?Sized>(
    store: &S,
    embedder: &dyn EmbeddingProvider,
    query: &str,
    threshold: f64,
    limit: usize,
) -> Result<Vec<RetrievalResult>> {
    let query_vec = embedder.embed(query).await?;
    let matches = similarity_search(
        store,
        &query_vec,
        &SimilarityQuery {
            threshold,
            limit: limit.max(1),
        },
    )
    .await?;

    let ids: Vec<String> = matches.iter().map(|m| m.id.clone()).collect();
    let chunks: HashMap<String, ContentChunk> = store
        .get_chunks(&ids)
        .await?
        .into_iter()
        .map(|c| (c.id.clone(), c))
        .collect();

    Ok(matches
        .into_iter()
        .filter_map(|m| {
            chunks.get(&m.id).map(|chunk| RetrievalResult {
                chunk: chunk.clone(),
                score: m.score,
                match_kind: MatchKind::Semantic,
            })
        })
        .collect())
}

/// Ordering for merged results: score desc, semantic before lexical,
/// then source ID for determinism.
fn rank(a: &RetrievalResult, b: &RetrievalResult) -> std::cmp::Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| match (a.match_kind, b.match_kind) {
            (MatchKind::Semantic, MatchKind::Lexical) => std::cmp::Ordering::Less,
            (MatchKind::Lexical, MatchKind::Semantic) => std::cmp::Ordering::Greater,
            _ => std::cmp::Ordering::Equal,
        })
        .then_with(|| a.chunk.source_id.cmp(&b.chunk.source_id))
}

/// Insert into a per-source map, keeping the better result.
fn merge_into(map: &mut HashMap<String, RetrievalResult>, candidate: RetrievalResult) {
    match map.get(&candidate.chunk.source_id) {
        Some(existing) => {
            let better = candidate.score > existing.score
                || (candidate.score == existing.score
                    && candidate.match_kind == MatchKind::Semantic
                    && existing.match_kind == MatchKind::Lexical);
            if better {
                map.insert(candidate.chunk.source_id.clone(), candidate);
            }
        }
        None => {
            map.insert(candidate.chunk.source_id.clone(), candidate);
        }
    }
}

/// Run a hybrid retrieval.
///
/// `embedder` may be `None` (embeddings not configured); with
/// `opts.semantic` set that degrades to lexical-only.
pub async fn retrieve<S: ChunkStore + ?Sized>(
    store: &S,
    embedder: Option<&dyn EmbeddingProvider>,
    query: &str,
    opts: &RetrieveOptions,
) -> Result<Retrieval> {
    let terms = query_terms(query);
    if terms.is_empty() || opts.limit == 0 || opts.pools.is_empty() {
        return Ok(Retrieval::Complete(RetrievalSet::default()));
    }
    let per_pool = opts.per_pool_limit.max(1);

    let lexical = join_all(opts.pools.iter().map(|pool| {
        let terms = &terms;
        async move {
            lexical_candidates(store, pool.kind(), terms, per_pool)
                .await
                .map(|hits| (*pool, hits))
        }
    }));

    let semantic = async {
        if !opts.semantic {
            return None;
        }
        Some(match embedder {
            Some(embedder) => {
                semantic_results(
                    store,
                    embedder,
                    query,
                    opts.similarity_threshold,
                    per_pool * opts.pools.len(),
                )
                .await
            }
            None => Err(PalmError::Provider(
                "embedding provider is not configured".to_string(),
            )),
        })
    };

    let (lexical, semantic) = join(lexical, semantic).await;

    let mut pools: BTreeMap<SourceType, HashMap<String, RetrievalResult>> = opts
        .pools
        .iter()
        .map(|p| (*p, HashMap::new()))
        .collect();

    for outcome in lexical {
        let (pool, hits) = outcome?;
        let merged = pools.entry(pool).or_default();
        for (item, score) in hits {
            merge_into(
                merged,
                RetrievalResult {
                    chunk: item_as_chunk(&item, pool),
                    score,
                    match_kind: MatchKind::Lexical,
                },
            );
        }
    }

    let mut degraded = None;
    match semantic {
        Some(Ok(results)) => {
            for result in results {
                if let Some(merged) = pools.get_mut(&result.chunk.source_type) {
                    merge_into(merged, result);
                }
            }
        }
        Some(Err(e)) => {
            tracing::warn!(error = %e, "semantic retrieval failed, using lexical results only");
            degraded = Some(e.to_string());
        }
        None => {}
    }

    let mut total_matched = 0;
    let mut knowledge_entries = Vec::new();
    let mut all: Vec<RetrievalResult> = Vec::new();
    for (pool, merged) in pools {
        total_matched += merged.len();
        let mut ranked: Vec<RetrievalResult> = merged.into_values().collect();
        ranked.sort_by(rank);
        ranked.truncate(per_pool);
        if pool == SourceType::KnowledgeEntry {
            knowledge_entries = ranked.clone();
        }
        all.extend(ranked);
    }
    all.sort_by(rank);
    all.truncate(opts.limit);

    let set = RetrievalSet {
        chunks: all,
        knowledge_entries,
        total_matched,
    };
    Ok(match degraded {
        Some(reason) => Retrieval::Degraded { set, reason },
        None => Retrieval::Complete(set),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_item;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;

    /// Maps known phrases to fixed vectors.
    struct FixedEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("sea") || t.contains("fishing") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        fn model_name(&self) -> &str {
            "failing"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(PalmError::Provider("embedding service unavailable".to_string()))
        }
    }

    fn item(id: &str, kind: ContentKind, title: &str, body: &str) -> ContentItem {
        ContentItem {
            id: id.to_string(),
            kind,
            title: title.to_string(),
            summary: None,
            body: body.to_string(),
            created_at: 100,
            updated_at: 100,
        }
    }

    async fn seeded_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        let entries = [
            item(
                "story-sea",
                ContentKind::Story,
                "Bush Tucker and the Sea",
                "Grandfather taught us fishing from the jetty at low tide.",
            ),
            item(
                "story-dance",
                ContentKind::Story,
                "Dance Festival",
                "The community gathered for the annual festival.",
            ),
            item(
                "kb-tides",
                ContentKind::KnowledgeEntry,
                "Tide times",
                "Traditional methods of reading the tides before going fishing.",
            ),
            item(
                "doc-report",
                ContentKind::Document,
                "Annual report",
                "Programs delivered by the community company.",
            ),
        ];
        for it in &entries {
            store.upsert_item(it).await.unwrap();
            let mut chunks = chunk_item(it, 200);
            for c in &mut chunks {
                c.embedding = Some(if c.text.contains("fishing") {
                    vec![1.0, 0.0]
                } else {
                    vec![0.0, 1.0]
                });
            }
            store.replace_chunks(&it.id, &chunks).await.unwrap();
        }
        store
    }

    #[test]
    fn test_query_terms() {
        assert_eq!(
            query_terms("Traditional, fishing METHODS!"),
            vec!["traditional", "fishing", "methods"]
        );
        assert_eq!(query_terms("a fishing a"), vec!["fishing"]);
        assert_eq!(query_terms("x"), vec!["x"]);
        assert!(query_terms("   ").is_empty());
    }

    #[test]
    fn test_lexical_score_bounds() {
        let terms = query_terms("traditional fishing methods");
        let it = item("s", ContentKind::Story, "Bush Tucker and the Sea", "fishing");
        let s = lexical_score(&terms, &it);
        assert!(s > 0.0 && s <= 1.0);
        let full = item("s", ContentKind::Story, "Traditional fishing methods", "");
        assert!((lexical_score(&terms, &full) - 1.0).abs() < 1e-9);
        let none = item("s", ContentKind::Story, "Dance", "festival");
        assert_eq!(lexical_score(&terms, &none), 0.0);
    }

    #[tokio::test]
    async fn test_lexical_only_finds_substring_match() {
        let store = seeded_store().await;
        let opts = RetrieveOptions {
            semantic: false,
            ..RetrieveOptions::default()
        };
        let retrieval = retrieve(&store, None, "traditional fishing methods", &opts)
            .await
            .unwrap();
        assert!(retrieval.degradation().is_none());
        let ids: Vec<&str> = retrieval
            .set()
            .chunks
            .iter()
            .map(|r| r.chunk.source_id.as_str())
            .collect();
        assert!(ids.contains(&"story-sea"), "got {:?}", ids);
        assert!(!ids.contains(&"story-dance"));
        assert!(retrieval
            .set()
            .chunks
            .iter()
            .all(|r| r.match_kind == MatchKind::Lexical));
    }

    #[tokio::test]
    async fn test_hybrid_dedupes_by_source() {
        let store = seeded_store().await;
        let opts = RetrieveOptions {
            similarity_threshold: 0.5,
            ..RetrieveOptions::default()
        };
        let retrieval = retrieve(&store, Some(&FixedEmbedder), "fishing", &opts)
            .await
            .unwrap();
        let set = retrieval.set();
        let mut ids: Vec<&str> = set.chunks.iter().map(|r| r.chunk.source_id.as_str()).collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(before, ids.len(), "duplicate sources in {:?}", ids);
        // Semantic similarity 1.0 beats the lexical score for the same source.
        let sea = set
            .chunks
            .iter()
            .find(|r| r.chunk.source_id == "story-sea")
            .unwrap();
        assert_eq!(sea.match_kind, MatchKind::Semantic);
        assert_eq!(set.knowledge_entries.len(), 1);
        assert_eq!(set.knowledge_entries[0].chunk.source_id, "kb-tides");
    }

    #[tokio::test]
    async fn test_degrades_when_embedding_fails() {
        let store = seeded_store().await;
        let retrieval = retrieve(
            &store,
            Some(&FailingEmbedder),
            "fishing",
            &RetrieveOptions::default(),
        )
        .await
        .unwrap();
        match &retrieval {
            Retrieval::Degraded { set, reason } => {
                assert!(reason.contains("unavailable"));
                assert!(!set.chunks.is_empty());
            }
            Retrieval::Complete(_) => panic!("expected degraded retrieval"),
        }
    }

    #[tokio::test]
    async fn test_degrades_without_embedder() {
        let store = seeded_store().await;
        let retrieval = retrieve(&store, None, "fishing", &RetrieveOptions::default())
            .await
            .unwrap();
        assert!(retrieval.degradation().is_some());
    }

    #[tokio::test]
    async fn test_limit_and_score_bounds() {
        let store = seeded_store().await;
        for limit in [1, 2, 3, 10] {
            let opts = RetrieveOptions {
                limit,
                per_pool_limit: 2,
                similarity_threshold: 0.0,
                ..RetrieveOptions::default()
            };
            let set = retrieve(&store, Some(&FixedEmbedder), "community fishing", &opts)
                .await
                .unwrap()
                .into_set();
            assert!(set.chunks.len() <= limit);
            assert!(set.chunks.iter().all(|r| (0.0..=1.0).contains(&r.score)));
        }
    }

    #[tokio::test]
    async fn test_common_term_does_not_crowd_out_best_match() {
        let store = seeded_store().await;
        for n in 0..20 {
            let mut festival = item(
                &format!("festival-{:02}", n),
                ContentKind::Story,
                "Festival",
                "Families came to the oval for the dancing.",
            );
            festival.updated_at = 1_000 + n;
            store.upsert_item(&festival).await.unwrap();
        }
        let opts = RetrieveOptions {
            semantic: false,
            ..RetrieveOptions::default()
        };
        let set = retrieve(&store, None, "the fishing", &opts).await.unwrap().into_set();
        let stories: Vec<&str> = set
            .chunks
            .iter()
            .filter(|r| r.chunk.source_type == SourceType::Story)
            .map(|r| r.chunk.source_id.as_str())
            .collect();
        assert_eq!(stories.first(), Some(&"story-sea"), "got {:?}", stories);
    }

    #[tokio::test]
    async fn test_no_matches_is_empty_not_error() {
        let store = seeded_store().await;
        let opts = RetrieveOptions {
            semantic: false,
            ..RetrieveOptions::default()
        };
        let set = retrieve(&store, None, "volcano", &opts).await.unwrap().into_set();
        assert!(set.chunks.is_empty());
        assert!(set.knowledge_entries.is_empty());
        assert_eq!(set.total_matched, 0);
    }

    #[tokio::test]
    async fn test_pools_restrict_results() {
        let store = seeded_store().await;
        let opts = RetrieveOptions {
            semantic: false,
            pools: vec![SourceType::KnowledgeEntry],
            ..RetrieveOptions::default()
        };
        let set = retrieve(&store, None, "fishing", &opts).await.unwrap().into_set();
        assert!(set
            .chunks
            .iter()
            .all(|r| r.chunk.source_type == SourceType::KnowledgeEntry));
    }
}
