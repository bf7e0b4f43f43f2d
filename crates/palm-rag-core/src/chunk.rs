//! Paragraph-boundary chunker for archive content.
//!
//! Splits an item's body into [`ContentChunk`]s that fit a `max_tokens`
//! budget, using the same 4 chars/token estimate as the rest of the
//! pipeline. Paragraphs (`\n\n`) are kept together where possible;
//! paragraphs larger than the budget are cut at the last newline or space
//! before the limit.
//!
//! ```rust
//! use palm_rag_core::chunk::chunk_item;
//! use palm_rag_core::models::{ContentItem, ContentKind};
//!
//! let item = ContentItem {
//!     id: "story-1".into(),
//!     kind: ContentKind::Story,
//!     title: "Bush Tucker and the Sea".into(),
//!     summary: None,
//!     body: "Low tide.\n\nThe reef walk.".into(),
//!     created_at: 0,
//!     updated_at: 0,
//! };
//! let chunks = chunk_item(&item, 700);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].source_id, "story-1");
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::embedding::CHARS_PER_TOKEN;
use crate::models::{ContentChunk, ContentItem, SourceType};

/// Split an item into chunks. Returns an empty vector for directory kinds
/// (people, services), which are never chunked.
///
/// For chunked kinds at least one chunk is always produced and indices are
/// contiguous from 0.
pub fn chunk_item(item: &ContentItem, max_tokens: usize) -> Vec<ContentChunk> {
    let source_type = match item.kind.source_type() {
        Some(t) => t,
        None => return Vec::new(),
    };

    let pieces = split_text(&item.body, max_tokens * CHARS_PER_TOKEN);
    let now = chrono::Utc::now().timestamp();

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, text)| make_chunk(item, source_type, i as i64, text, now))
        .collect()
}

/// Split text on paragraph boundaries so that no piece exceeds `max_chars`
/// bytes. Always returns at least one (possibly empty) piece.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut pieces = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        let joined_len = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };
        if joined_len > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }

        if para.len() > max_chars {
            if !buf.is_empty() {
                pieces.push(std::mem::take(&mut buf));
            }
            pieces.extend(hard_split(para, max_chars));
            continue;
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }

    if !buf.is_empty() {
        pieces.push(buf);
    }
    if pieces.is_empty() {
        pieces.push(text.trim().to_string());
    }
    pieces
}

/// Cut an oversized paragraph into pieces of at most `max_chars` bytes,
/// preferring newline, then space, boundaries.
fn hard_split(para: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = para;

    while !rest.is_empty() {
        if rest.len() <= max_chars {
            out.push(rest.trim().to_string());
            break;
        }
        let limit = snap_to_char_boundary(rest, max_chars);
        let cut = rest[..limit]
            .rfind('\n')
            .or_else(|| rest[..limit].rfind(' '))
            .map(|pos| pos + 1)
            .unwrap_or(limit);
        // A single char wider than the budget still has to make progress.
        let cut = if cut == 0 {
            rest.chars().next().map(char::len_utf8).unwrap_or(rest.len())
        } else {
            cut
        };
        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        rest = &rest[cut..];
    }

    out.retain(|p| !p.is_empty());
    out
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
pub fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// SHA-256 hex digest of chunk text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

fn make_chunk(
    item: &ContentItem,
    source_type: SourceType,
    index: i64,
    text: String,
    now: i64,
) -> ContentChunk {
    ContentChunk {
        id: Uuid::new_v4().to_string(),
        source_id: item.id.clone(),
        source_type,
        title: item.title.clone(),
        chunk_index: index,
        hash: content_hash(&text),
        text,
        embedding: None,
        created_at: now,
    }
}
