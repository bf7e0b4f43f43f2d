//! Context assembly under a token budget.
//!
//! Retrieved chunks are laid out best-first as numbered, titled entries
//! until the budget (estimated at 4 bytes per token) runs out. A chunk that
//! does not fit is skipped and the next one is tried, so a single long
//! chunk cannot starve shorter ones behind it. When enough room is left the
//! oversized chunk is cut down instead of dropped.
//!
//! Everything that was not included still surfaces as an
//! `available_sources` entry so the caller can offer it as a citation.

use std::collections::HashSet;

use serde::Serialize;

use crate::chunk::snap_to_char_boundary;
use crate::embedding::CHARS_PER_TOKEN;
use crate::models::{RetrievalResult, SourceRef};

/// Don't bother truncating a chunk to less than this many bytes of text.
const MIN_TRUNCATED_CHARS: usize = 100;

const ENTRY_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, Copy)]
pub struct AssembleOptions {
    pub max_context_tokens: usize,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self {
            max_context_tokens: 3000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledContext {
    /// Formatted context block; empty when nothing was retrieved.
    pub context: String,
    /// Sources actually present in `context`, in order of appearance.
    pub sources: Vec<SourceRef>,
    /// Retrieved but excluded for budget reasons.
    pub available_sources: Vec<SourceRef>,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.context.is_empty()
    }
}

fn entry_header(n: usize, result: &RetrievalResult) -> String {
    format!(
        "[{}] {} ({})\n",
        n,
        result.chunk.title,
        result.chunk.source_type.as_str()
    )
}

/// Build the context block from retrieval results.
///
/// Deterministic for identical input: results are stable-sorted by score
/// and every step after that is order-preserving.
pub fn assemble(results: &[RetrievalResult], opts: &AssembleOptions) -> AssembledContext {
    let budget = opts.max_context_tokens * CHARS_PER_TOKEN;

    let mut ordered: Vec<&RetrievalResult> = results.iter().collect();
    ordered.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut context = String::new();
    let mut sources: Vec<SourceRef> = Vec::new();
    let mut included: HashSet<String> = HashSet::new();
    let mut excluded: Vec<SourceRef> = Vec::new();

    for result in ordered {
        let separator = if context.is_empty() { 0 } else { ENTRY_SEPARATOR.len() };
        let source = SourceRef::from_chunk(&result.chunk);
        // Chunks of one source share its number in `sources`.
        let number = sources
            .iter()
            .position(|s| s.id == source.id)
            .map_or(sources.len() + 1, |i| i + 1);
        let header = entry_header(number, result);
        let text = result.chunk.text.trim();
        let needed = separator + header.len() + text.len();
        let remaining = budget.saturating_sub(context.len());

        let body = if needed <= remaining {
            text.to_string()
        } else {
            let room = remaining.saturating_sub(separator + header.len());
            if room < MIN_TRUNCATED_CHARS {
                excluded.push(source);
                continue;
            }
            let cut = snap_to_char_boundary(text, room);
            text[..cut].to_string()
        };

        if separator > 0 {
            context.push_str(ENTRY_SEPARATOR);
        }
        context.push_str(&header);
        context.push_str(&body);

        if included.insert(source.id.clone()) {
            sources.push(source);
        }
    }

    let mut seen: HashSet<String> = included.clone();
    let available_sources = excluded
        .into_iter()
        .filter(|s| seen.insert(s.id.clone()))
        .collect();

    AssembledContext {
        context,
        sources,
        available_sources,
    }
}

/// One line per source, numbered to match the context entries.
pub fn format_sources(sources: &[SourceRef]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(i, s)| format!("[{}] {} ({})", i + 1, s.title, s.source_type.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}
