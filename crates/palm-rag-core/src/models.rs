//! Core data models for the archive and the chat pipeline.
//!
//! Content flows in as [`ContentItem`]s (stories, documents, knowledge
//! entries, people, services), is split into [`ContentChunk`]s for
//! retrieval, and comes back out of a query as [`RetrievalResult`]s.
//! Conversations are linear lists of [`ChatMessage`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retrievable content pools. Only these kinds are chunked and embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Story,
    Document,
    KnowledgeEntry,
}

impl SourceType {
    pub const ALL: [SourceType; 3] = [
        SourceType::Story,
        SourceType::Document,
        SourceType::KnowledgeEntry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Story => "story",
            SourceType::Document => "document",
            SourceType::KnowledgeEntry => "knowledge_entry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "story" => Some(SourceType::Story),
            "document" => Some(SourceType::Document),
            "knowledge_entry" => Some(SourceType::KnowledgeEntry),
            _ => None,
        }
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            SourceType::Story => ContentKind::Story,
            SourceType::Document => ContentKind::Document,
            SourceType::KnowledgeEntry => ContentKind::KnowledgeEntry,
        }
    }
}

/// Every kind of record stored in the archive.
///
/// People and services are directory records: they are searchable by text
/// but never chunked or embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Story,
    Document,
    KnowledgeEntry,
    Person,
    Service,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Story => "story",
            ContentKind::Document => "document",
            ContentKind::KnowledgeEntry => "knowledge_entry",
            ContentKind::Person => "person",
            ContentKind::Service => "service",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "person" => Some(ContentKind::Person),
            "service" => Some(ContentKind::Service),
            other => SourceType::parse(other).map(|t| t.kind()),
        }
    }

    /// The retrieval pool this kind belongs to, if it is chunked at all.
    pub fn source_type(&self) -> Option<SourceType> {
        match self {
            ContentKind::Story => Some(SourceType::Story),
            ContentKind::Document => Some(SourceType::Document),
            ContentKind::KnowledgeEntry => Some(SourceType::KnowledgeEntry),
            ContentKind::Person | ContentKind::Service => None,
        }
    }
}

/// A stored archive record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub kind: ContentKind,
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub body: String,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub updated_at: i64,
}

/// A unit of retrievable text extracted from a story, document, or
/// knowledge entry.
///
/// Immutable once embedded; editing the parent item replaces its chunks
/// and therefore their vectors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentChunk {
    pub id: String,
    /// ID of the owning [`ContentItem`].
    pub source_id: String,
    pub source_type: SourceType,
    /// Title of the owning item, carried along for citations.
    pub title: String,
    pub chunk_index: i64,
    pub text: String,
    /// SHA-256 of `text`, used to detect stale embeddings.
    pub hash: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    /// Unix seconds.
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Lexical,
    Semantic,
}

/// A scored retrieval candidate. Built per query, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalResult {
    pub chunk: ContentChunk,
    /// Relevance in `[0.0, 1.0]`.
    pub score: f64,
    pub match_kind: MatchKind,
}

/// Citation metadata for a piece of retrieved content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub id: String,
    pub title: String,
    pub source_type: SourceType,
}

impl SourceRef {
    pub fn from_chunk(chunk: &ContentChunk) -> Self {
        Self {
            id: chunk.source_id.clone(),
            title: chunk.title.clone(),
            source_type: chunk.source_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(ChatRole::User),
            "assistant" => Some(ChatRole::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceRef>>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            sources: None,
        }
    }

    pub fn assistant(content: impl Into<String>, sources: Vec<SourceRef>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            sources: Some(sources),
        }
    }
}

/// A conversation as persisted: an id plus its append-only message list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub messages: Vec<ChatMessage>,
}
