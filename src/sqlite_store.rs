//! SQLite-backed [`ChunkStore`] and [`ConversationStore`].
//!
//! Lexical search is a case-insensitive `LIKE` over title, summary and
//! body. Vector similarity is brute-force cosine over every stored BLOB
//! vector, computed in Rust after a single scan of `chunk_vectors`.
//!
//! Conversation saves replace the full message list inside one
//! transaction, so a reader never sees a half-written conversation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use palm_rag_core::conversation::ConversationStore;
use palm_rag_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use palm_rag_core::error::{PalmError, Result};
use palm_rag_core::models::{
    ChatMessage, ChatRole, ContentChunk, ContentItem, ContentKind, SourceRef, SourceType,
};
use palm_rag_core::store::{ChunkStore, SimilarityRow};

/// A chunk that has no vector, or whose vector was computed from
/// different text.
#[derive(Debug, Clone)]
pub struct PendingChunk {
    pub id: String,
    pub text: String,
    pub hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct StoreCounts {
    pub items: i64,
    pub chunks: i64,
    pub embedded: i64,
    pub conversations: i64,
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn db_err(e: sqlx::Error) -> PalmError {
    PalmError::internal(e)
}

/// Escape `%`, `_` and `\` for use inside a `LIKE ... ESCAPE '\'` pattern.
fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// `(title LIKE p OR summary LIKE p OR body LIKE p)`, which SQLite
/// evaluates to 0 or 1.
fn push_field_match(qb: &mut QueryBuilder<'_, Sqlite>, pattern: &str) {
    qb.push("(LOWER(title) LIKE ");
    qb.push_bind(pattern.to_string());
    qb.push(" ESCAPE '\\' OR LOWER(COALESCE(summary, '')) LIKE ");
    qb.push_bind(pattern.to_string());
    qb.push(" ESCAPE '\\' OR LOWER(body) LIKE ");
    qb.push_bind(pattern.to_string());
    qb.push(" ESCAPE '\\')");
}

fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> Result<ContentItem> {
    let kind: String = row.get("kind");
    let kind = ContentKind::parse(&kind)
        .ok_or_else(|| PalmError::Internal(format!("unknown content kind in store: {}", kind)))?;
    Ok(ContentItem {
        id: row.get("id"),
        kind,
        title: row.get("title"),
        summary: row.get("summary"),
        body: row.get("body"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<ContentChunk> {
    let source_type: String = row.get("source_type");
    let source_type = SourceType::parse(&source_type).ok_or_else(|| {
        PalmError::Internal(format!("unknown source type in store: {}", source_type))
    })?;
    Ok(ContentChunk {
        id: row.get("id"),
        source_id: row.get("source_id"),
        source_type,
        title: row.get("title"),
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        hash: row.get("hash"),
        embedding: None,
        created_at: row.get("created_at"),
    })
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Chunks needing a (re-)embedding, oldest first.
    pub async fn pending_embeddings(&self, limit: Option<usize>) -> Result<Vec<PendingChunk>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.text, c.hash
            FROM chunks c
            LEFT JOIN chunk_vectors cv ON cv.chunk_id = c.id
            WHERE cv.chunk_id IS NULL OR cv.hash != c.hash
            ORDER BY c.created_at, c.id
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| PendingChunk {
                id: row.get("id"),
                text: row.get("text"),
                hash: row.get("hash"),
            })
            .collect())
    }

    /// Delete conversations last updated before `before` (Unix seconds).
    pub async fn prune_conversations(&self, before: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            "DELETE FROM conversation_messages WHERE conversation_id IN \
             (SELECT id FROM conversations WHERE updated_at < ?)",
        )
        .bind(before)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        let deleted = sqlx::query("DELETE FROM conversations WHERE updated_at < ?")
            .bind(before)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();
        tx.commit().await.map_err(db_err)?;
        Ok(deleted)
    }

    pub async fn counts(&self) -> Result<StoreCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM content_items) AS items,
                (SELECT COUNT(*) FROM chunks) AS chunks,
                (SELECT COUNT(*) FROM chunk_vectors) AS embedded,
                (SELECT COUNT(*) FROM conversations) AS conversations
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(StoreCounts {
            items: row.get("items"),
            chunks: row.get("chunks"),
            embedded: row.get("embedded"),
            conversations: row.get("conversations"),
        })
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn upsert_item(&self, item: &ContentItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO content_items (id, kind, title, summary, body, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                title = excluded.title,
                summary = excluded.summary,
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&item.id)
        .bind(item.kind.as_str())
        .bind(&item.title)
        .bind(&item.summary)
        .bind(&item.body)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn replace_chunks(&self, item_id: &str, chunks: &[ContentChunk]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE source_id = ?)",
        )
        .bind(item_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query("DELETE FROM chunks WHERE source_id = ?")
            .bind(item_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, source_id, source_type, title, chunk_index, text, hash, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(item_id)
            .bind(chunk.source_type.as_str())
            .bind(&chunk.title)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(chunk.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if let Some(vector) = &chunk.embedding {
                sqlx::query(
                    r#"
                    INSERT INTO chunk_vectors (chunk_id, model, dims, hash, embedding, created_at)
                    VALUES (?, '', ?, ?, ?, ?)
                    "#,
                )
                .bind(&chunk.id)
                .bind(vector.len() as i64)
                .bind(&chunk.hash)
                .bind(vec_to_blob(vector))
                .bind(chunk.created_at)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn upsert_embedding(&self, chunk_id: &str, vector: &[f32], model: &str) -> Result<()> {
        let hash: Option<String> = sqlx::query_scalar("SELECT hash FROM chunks WHERE id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let hash = hash.ok_or_else(|| PalmError::NotFound(format!("chunk not found: {}", chunk_id)))?;

        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, model, dims, hash, embedding, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                model = excluded.model,
                dims = excluded.dims,
                hash = excluded.hash,
                embedding = excluded.embedding,
                created_at = excluded.created_at
            "#,
        )
        .bind(chunk_id)
        .bind(model)
        .bind(vector.len() as i64)
        .bind(&hash)
        .bind(vec_to_blob(vector))
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn lexical_search(
        &self,
        kind: ContentKind,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<ContentItem>> {
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let patterns: Vec<String> = terms.iter().map(|t| like_pattern(t)).collect();
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, kind, title, summary, body, created_at, updated_at \
             FROM content_items WHERE kind = ",
        );
        qb.push_bind(kind.as_str());
        qb.push(" AND (");
        for (i, pattern) in patterns.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            push_field_match(&mut qb, pattern);
        }

        // 3 * matched_terms + n * title_hit orders rows exactly like
        // 0.6 * matched / n + 0.2 * title_hit.
        qb.push(") ORDER BY (3 * (");
        for (i, pattern) in patterns.iter().enumerate() {
            if i > 0 {
                qb.push(" + ");
            }
            push_field_match(&mut qb, pattern);
        }
        qb.push(format!(") + {} * (", patterns.len()));
        for (i, pattern) in patterns.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            qb.push("LOWER(title) LIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" ESCAPE '\\'");
        }
        qb.push(")) DESC, updated_at DESC, id ASC LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(row_to_item).collect()
    }

    async fn similarity_rows(
        &self,
        query_vec: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarityRow>> {
        let rows = sqlx::query("SELECT chunk_id, embedding FROM chunk_vectors")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut scored: Vec<SimilarityRow> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                (similarity >= threshold).then(|| SimilarityRow {
                    chunk_id: row.get("chunk_id"),
                    similarity,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<ContentChunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, source_id, source_type, title, chunk_index, text, hash, created_at \
             FROM chunks WHERE id IN (",
        );
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(row_to_chunk).collect()
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<Vec<ChatMessage>>> {
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Ok(None);
        }

        let rows = sqlx::query(
            r#"
            SELECT role, content, timestamp, sources_json
            FROM conversation_messages
            WHERE conversation_id = ?
            ORDER BY position
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let role: String = row.get("role");
            let role = ChatRole::parse(&role)
                .ok_or_else(|| PalmError::Internal(format!("unknown chat role in store: {}", role)))?;
            let timestamp: String = row.get("timestamp");
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map_err(PalmError::internal)?
                .with_timezone(&Utc);
            let sources_json: Option<String> = row.get("sources_json");
            let sources = match sources_json {
                Some(raw) => Some(
                    serde_json::from_str::<Vec<SourceRef>>(&raw).map_err(PalmError::internal)?,
                ),
                None => None,
            };
            messages.push(ChatMessage {
                role,
                content: row.get("content"),
                timestamp,
                sources,
            });
        }
        Ok(Some(messages))
    }

    async fn save(&self, conversation_id: &str, messages: &[ChatMessage]) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO conversations (id, created_at, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at
            "#,
        )
        .bind(conversation_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("DELETE FROM conversation_messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for (position, message) in messages.iter().enumerate() {
            let sources_json = match &message.sources {
                Some(sources) => Some(serde_json::to_string(sources).map_err(PalmError::internal)?),
                None => None,
            };
            sqlx::query(
                r#"
                INSERT INTO conversation_messages
                    (conversation_id, position, role, content, timestamp, sources_json)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(conversation_id)
            .bind(position as i64)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(message.timestamp.to_rfc3339())
            .bind(sources_json)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}
