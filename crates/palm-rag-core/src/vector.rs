//! Vector-store adapter.
//!
//! The nearest-neighbour computation belongs to the store
//! ([`ChunkStore::similarity_rows`]). This adapter validates the query
//! parameters and turns the raw rows into typed, ordered matches.

use serde::Serialize;

use crate::error::{PalmError, Result};
use crate::store::ChunkStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityQuery {
    /// Minimum similarity, in `[0.0, 1.0]`.
    pub threshold: f64,
    /// Maximum matches, `> 0`.
    pub limit: usize,
}

impl SimilarityQuery {
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return Err(PalmError::Validation(format!(
                "similarity threshold must be in [0, 1], got {}",
                self.threshold
            )));
        }
        if self.limit == 0 {
            return Err(PalmError::Validation(
                "similarity limit must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorMatch {
    /// Chunk ID.
    pub id: String,
    /// Similarity in `[0.0, 1.0]`.
    pub score: f64,
}

/// Run a similarity search and return matches in descending score order.
///
/// Ties keep the order the store produced them in. Rows below the
/// threshold or with non-finite scores are dropped, whatever the store did.
pub async fn similarity_search<S: ChunkStore + ?Sized>(
    store: &S,
    query_vec: &[f32],
    query: &SimilarityQuery,
) -> Result<Vec<VectorMatch>> {
    query.validate()?;
    if query_vec.is_empty() {
        return Err(PalmError::Validation(
            "query vector must not be empty".to_string(),
        ));
    }

    let rows = store
        .similarity_rows(query_vec, query.threshold, query.limit)
        .await?;

    let mut matches: Vec<VectorMatch> = rows
        .into_iter()
        .filter(|r| r.similarity.is_finite() && r.similarity >= query.threshold)
        .map(|r| VectorMatch {
            id: r.chunk_id,
            score: r.similarity.clamp(0.0, 1.0),
        })
        .collect();

    // sort_by is stable, so equal scores keep store order.
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    matches.truncate(query.limit);
    Ok(matches)
}
