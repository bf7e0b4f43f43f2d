//! Archive search: per-type lexical fan-out plus optional semantic chunks.
//!
//! Backs both `GET /api/search` and `palm search`. The query is validated
//! before any store access. Each requested content type is searched
//! concurrently; when semantic search is requested the hybrid retriever
//! runs alongside and its results come back as `ragChunks`.

use anyhow::Result as AnyResult;
use futures_util::future::{join, join_all};
use serde::Serialize;

use palm_rag_core::embedding::EmbeddingProvider;
use palm_rag_core::error::{PalmError, Result};
use palm_rag_core::models::{ContentItem, ContentKind, MatchKind, RetrievalResult, SourceType};
use palm_rag_core::retrieval::{self, lexical_candidates, query_terms, RetrieveOptions};
use palm_rag_core::store::ChunkStore;

use crate::config::{Config, RetrievalConfig};
use crate::db;
use crate::embedding;
use crate::sqlite_store::SqliteStore;

pub const MIN_QUERY_CHARS: usize = 2;
pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 50;

const EXCERPT_CHARS: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    All,
    Stories,
    People,
    Services,
    Knowledge,
}

impl SearchType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(SearchType::All),
            "stories" => Some(SearchType::Stories),
            "people" => Some(SearchType::People),
            "services" => Some(SearchType::Services),
            "knowledge" => Some(SearchType::Knowledge),
            _ => None,
        }
    }

    fn includes(&self, kind: ContentKind) -> bool {
        match self {
            SearchType::All => true,
            SearchType::Stories => kind == ContentKind::Story,
            SearchType::People => kind == ContentKind::Person,
            SearchType::Services => kind == ContentKind::Service,
            SearchType::Knowledge => kind == ContentKind::KnowledgeEntry,
        }
    }

    /// Chunk pools searched semantically for this type.
    fn pools(&self) -> Vec<SourceType> {
        match self {
            SearchType::All => SourceType::ALL.to_vec(),
            SearchType::Stories => vec![SourceType::Story],
            SearchType::Knowledge => vec![SourceType::KnowledgeEntry],
            SearchType::People | SearchType::Services => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: String,
    pub search_type: SearchType,
    pub limit: usize,
    pub semantic: bool,
}

impl SearchParams {
    /// Validate raw request values. `limit` is clamped to `[1, 50]`.
    pub fn from_raw(
        query: Option<&str>,
        search_type: Option<&str>,
        limit: Option<usize>,
        semantic: Option<bool>,
    ) -> Result<Self> {
        let query = query.unwrap_or("").trim();
        if query.chars().count() < MIN_QUERY_CHARS {
            return Err(PalmError::Validation(format!(
                "Search query must be at least {} characters",
                MIN_QUERY_CHARS
            )));
        }
        let search_type = match search_type {
            None | Some("") => SearchType::All,
            Some(raw) => SearchType::parse(raw).ok_or_else(|| {
                PalmError::Validation(format!(
                    "Unknown search type: '{}'. Use all, stories, people, services, or knowledge.",
                    raw
                ))
            })?,
        };
        Ok(Self {
            query: query.to_string(),
            search_type,
            limit: limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
            semantic: semantic.unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub excerpt: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHit {
    pub chunk_id: String,
    pub source_id: String,
    pub source_type: SourceType,
    pub title: String,
    pub excerpt: String,
    pub score: f64,
    pub match_kind: MatchKind,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub stories: Vec<SearchHit>,
    pub people: Vec<SearchHit>,
    pub services: Vec<SearchHit>,
    pub knowledge: Vec<SearchHit>,
    pub rag_chunks: Vec<ChunkHit>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub query: String,
    pub results: SearchResults,
    pub total: usize,
    /// Why semantic search fell back to lexical, if it did.
    pub degraded: Option<String>,
}

fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= EXCERPT_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(EXCERPT_CHARS).collect();
    format!("{}...", cut.trim_end())
}

fn to_hit((item, score): (ContentItem, f64)) -> SearchHit {
    let source = if item.body.trim().is_empty() {
        item.summary.as_deref().unwrap_or("")
    } else {
        item.body.as_str()
    };
    SearchHit {
        excerpt: excerpt(source),
        id: item.id,
        title: item.title,
        summary: item.summary,
        score,
    }
}

fn to_chunk_hit(result: RetrievalResult) -> ChunkHit {
    ChunkHit {
        excerpt: excerpt(&result.chunk.text),
        chunk_id: result.chunk.id,
        source_id: result.chunk.source_id,
        source_type: result.chunk.source_type,
        title: result.chunk.title,
        score: result.score,
        match_kind: result.match_kind,
    }
}

/// Kinds `/api/search` reports, one result list each.
const SEARCH_KINDS: [ContentKind; 4] = [
    ContentKind::Story,
    ContentKind::Person,
    ContentKind::Service,
    ContentKind::KnowledgeEntry,
];

/// Run a validated search.
pub async fn search<S: ChunkStore + ?Sized>(
    store: &S,
    embedder: Option<&dyn EmbeddingProvider>,
    retrieval_config: &RetrievalConfig,
    params: &SearchParams,
) -> Result<SearchResponse> {
    let terms = query_terms(&params.query);
    let kinds: Vec<ContentKind> = SEARCH_KINDS
        .into_iter()
        .filter(|k| params.search_type.includes(*k))
        .collect();

    let lexical = join_all(kinds.iter().map(|kind| {
        let terms = &terms;
        async move {
            lexical_candidates(store, *kind, terms, params.limit)
                .await
                .map(|hits| (*kind, hits))
        }
    }));

    let pools = params.search_type.pools();
    let semantic = async {
        if !params.semantic || pools.is_empty() {
            return None;
        }
        let opts = RetrieveOptions {
            limit: params.limit,
            per_pool_limit: params.limit,
            pools: pools.clone(),
            semantic: true,
            similarity_threshold: retrieval_config.similarity_threshold,
        };
        Some(retrieval::retrieve(store, embedder, &params.query, &opts).await)
    };

    let (lexical, semantic) = join(lexical, semantic).await;

    let mut results = SearchResults::default();
    for outcome in lexical {
        let (kind, hits) = outcome?;
        let hits: Vec<SearchHit> = hits.into_iter().map(to_hit).collect();
        match kind {
            ContentKind::Story => results.stories = hits,
            ContentKind::Person => results.people = hits,
            ContentKind::Service => results.services = hits,
            ContentKind::KnowledgeEntry => results.knowledge = hits,
            ContentKind::Document => {}
        }
    }

    let mut degraded = None;
    if let Some(retrieval) = semantic {
        let retrieval = retrieval?;
        degraded = retrieval.degradation().map(str::to_string);
        results.rag_chunks = retrieval
            .into_set()
            .chunks
            .into_iter()
            .map(to_chunk_hit)
            .collect();
    }

    let total = results.stories.len()
        + results.people.len()
        + results.services.len()
        + results.knowledge.len()
        + results.rag_chunks.len();

    Ok(SearchResponse {
        query: params.query.clone(),
        results,
        total,
        degraded,
    })
}

pub async fn run_search(
    config: &Config,
    query: &str,
    search_type: Option<&str>,
    limit: Option<usize>,
    semantic: bool,
) -> AnyResult<()> {
    let params = SearchParams::from_raw(Some(query), search_type, limit, Some(semantic))?;
    let embedder = if semantic {
        embedding::create_provider(&config.embedding)?
    } else {
        None
    };
    let store = SqliteStore::new(db::connect(config).await?);

    let response = search(&store, embedder.as_deref(), &config.retrieval, &params).await?;
    store.close().await;

    if response.total == 0 {
        println!("No results.");
        return Ok(());
    }
    if let Some(reason) = &response.degraded {
        println!("(semantic search unavailable: {})", reason);
        println!();
    }

    let sections: [(&str, &Vec<SearchHit>); 4] = [
        ("stories", &response.results.stories),
        ("people", &response.results.people),
        ("services", &response.results.services),
        ("knowledge", &response.results.knowledge),
    ];
    for (label, hits) in sections {
        if hits.is_empty() {
            continue;
        }
        println!("{} ({})", label, hits.len());
        for (i, hit) in hits.iter().enumerate() {
            println!("  {}. [{:.2}] {}", i + 1, hit.score, hit.title);
            println!("      excerpt: \"{}\"", hit.excerpt);
            println!("      id: {}", hit.id);
        }
        println!();
    }

    if !response.results.rag_chunks.is_empty() {
        println!("chunks ({})", response.results.rag_chunks.len());
        for (i, chunk) in response.results.rag_chunks.iter().enumerate() {
            println!(
                "  {}. [{:.2} {:?}] {} / {}",
                i + 1,
                chunk.score,
                chunk.match_kind,
                chunk.source_type.as_str(),
                chunk.title
            );
            println!("      excerpt: \"{}\"", chunk.excerpt);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use palm_rag_core::store::memory::InMemoryStore;

    fn item(id: &str, kind: ContentKind, title: &str, body: &str) -> ContentItem {
        ContentItem {
            id: id.to_string(),
            kind,
            title: title.to_string(),
            summary: None,
            body: body.to_string(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_short_query_rejected() {
        for q in [None, Some(""), Some(" a "), Some("x")] {
            assert!(matches!(
                SearchParams::from_raw(q, None, None, None),
                Err(PalmError::Validation(_))
            ));
        }
    }

    #[test]
    fn test_limit_clamped_and_type_parsed() {
        let p = SearchParams::from_raw(Some("reef"), Some("people"), Some(500), None).unwrap();
        assert_eq!(p.limit, MAX_LIMIT);
        assert_eq!(p.search_type, SearchType::People);
        let p = SearchParams::from_raw(Some("reef"), None, Some(0), None).unwrap();
        assert_eq!(p.limit, 1);
        assert!(SearchParams::from_raw(Some("reef"), Some("videos"), None, None).is_err());
    }

    #[test]
    fn test_excerpt_truncates() {
        let long = "word ".repeat(100);
        let e = excerpt(&long);
        assert!(e.ends_with("..."));
        assert!(e.chars().count() <= EXCERPT_CHARS + 3);
    }

    #[tokio::test]
    async fn test_fan_out_by_type() {
        let store = InMemoryStore::new();
        for it in [
            item("s1", ContentKind::Story, "Bush Tucker and the Sea", "fishing at low tide"),
            item("p1", ContentKind::Person, "Uncle Ray", "fishing guide and Elder"),
            item("v1", ContentKind::Service, "Fishing Co-op", "boat hire"),
            item("k1", ContentKind::KnowledgeEntry, "Tides", "reading tides before fishing"),
        ] {
            store.upsert_item(&it).await.unwrap();
        }

        let params = SearchParams::from_raw(Some("fishing"), None, None, None).unwrap();
        let response = search(&store, None, &RetrievalConfig::default(), &params)
            .await
            .unwrap();
        assert_eq!(response.results.stories.len(), 1);
        assert_eq!(response.results.people.len(), 1);
        assert_eq!(response.results.services.len(), 1);
        assert_eq!(response.results.knowledge.len(), 1);
        assert!(response.results.rag_chunks.is_empty());
        assert_eq!(response.total, 4);
        assert!(response.degraded.is_none());

        let params = SearchParams::from_raw(Some("fishing"), Some("people"), None, None).unwrap();
        let response = search(&store, None, &RetrievalConfig::default(), &params)
            .await
            .unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.results.people[0].id, "p1");
    }

    #[tokio::test]
    async fn test_semantic_without_embedder_is_degraded() {
        let store = InMemoryStore::new();
        store
            .upsert_item(&item("s1", ContentKind::Story, "Reef", "reef walk"))
            .await
            .unwrap();
        let params = SearchParams::from_raw(Some("reef"), None, None, Some(true)).unwrap();
        let response = search(&store, None, &RetrievalConfig::default(), &params)
            .await
            .unwrap();
        assert!(response.degraded.is_some());
        assert_eq!(response.results.stories.len(), 1);
    }
}
