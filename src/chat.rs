//! The chat pipeline.
//!
//! ```text
//! validate → load conversation (timeout, fail open)
//!          → retrieve → assemble context → generate / stream
//!          → save conversation (failure logged, never fatal)
//! ```
//!
//! Validation runs before anything touches the stores or providers. The
//! conversation is saved once the full reply is known: after `generate`
//! returns, or when the stream produces its `Done` event (before that
//! event reaches the client).
//!
//! Saves replace the whole message list, so a turn whose load failed or
//! timed out is answered but not saved. Otherwise the stored history
//! would be overwritten by the new turn alone.

use anyhow::Result as AnyResult;
use futures_util::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use palm_rag_core::chat::{
    ChatEvent, GeneratedResponse, GenerationContext, ResponseGenerator, Usage,
};
use palm_rag_core::context::{assemble, AssembleOptions};
use palm_rag_core::conversation::ConversationStore;
use palm_rag_core::embedding::EmbeddingProvider;
use palm_rag_core::error::{PalmError, Result};
use palm_rag_core::models::{ChatMessage, ChatRole, SourceRef};
use palm_rag_core::retrieval::{self, RetrieveOptions};
use palm_rag_core::store::ChunkStore;

use crate::config::Config;
use crate::services::Services;

/// A prior turn supplied by the client when the server holds no history.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChatInput {
    pub message: String,
    pub conversation_id: Option<String>,
    pub messages: Vec<ClientMessage>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub response: String,
    pub sources: Vec<SourceRef>,
    pub usage: Usage,
    pub conversation_id: String,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub retrieve: RetrieveOptions,
    pub assemble: AssembleOptions,
    pub max_message_chars: usize,
    pub load_timeout: Duration,
}

impl ChatSettings {
    pub fn from_config(config: &Config) -> Self {
        let retrieval = &config.retrieval;
        Self {
            retrieve: RetrieveOptions {
                limit: retrieval.final_limit,
                per_pool_limit: retrieval.per_pool_limit,
                pools: retrieval.pools.clone(),
                semantic: retrieval.semantic,
                similarity_threshold: retrieval.similarity_threshold,
            },
            assemble: AssembleOptions {
                max_context_tokens: retrieval.max_context_tokens,
            },
            max_message_chars: config.chat.max_message_chars,
            load_timeout: Duration::from_secs(config.conversations.load_timeout_secs),
        }
    }
}

/// Result of loading a stored conversation.
enum StoredHistory {
    Found(Vec<ChatMessage>),
    Missing,
    /// The load failed or timed out.
    Unavailable,
}

/// Everything resolved before generation starts.
struct Prepared {
    message: String,
    ctx: GenerationContext,
    degraded: Option<String>,
    /// False when the stored history could not be read.
    save: bool,
}

pub struct ChatService {
    store: Arc<dyn ChunkStore>,
    conversations: Arc<dyn ConversationStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    generator: ResponseGenerator,
    settings: ChatSettings,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        conversations: Arc<dyn ConversationStore>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        generator: ResponseGenerator,
        settings: ChatSettings,
    ) -> Self {
        Self {
            store,
            conversations,
            embedder,
            generator,
            settings,
        }
    }

    pub fn model_name(&self) -> &str {
        self.generator.model_name()
    }

    fn validate(&self, input: &ChatInput) -> Result<String> {
        let message = input.message.trim();
        if message.is_empty() {
            return Err(PalmError::Validation("Message is required".to_string()));
        }
        if message.chars().count() > self.settings.max_message_chars {
            return Err(PalmError::Validation(format!(
                "Message is too long (max {} characters)",
                self.settings.max_message_chars
            )));
        }
        if let Some(id) = &input.conversation_id {
            if id.trim().is_empty() {
                return Err(PalmError::Validation(
                    "conversationId must not be empty".to_string(),
                ));
            }
        }
        Ok(message.to_string())
    }

    async fn load_history(&self, conversation_id: &str) -> StoredHistory {
        let load = self.conversations.load(conversation_id);
        match tokio::time::timeout(self.settings.load_timeout, load).await {
            Ok(Ok(Some(messages))) => StoredHistory::Found(messages),
            Ok(Ok(None)) => StoredHistory::Missing,
            Ok(Err(e)) => {
                tracing::warn!(conversation_id, error = %e, "conversation load failed, starting fresh");
                StoredHistory::Unavailable
            }
            Err(_) => {
                tracing::warn!(
                    conversation_id,
                    timeout_secs = self.settings.load_timeout.as_secs(),
                    "conversation load timed out, starting fresh"
                );
                StoredHistory::Unavailable
            }
        }
    }

    async fn prepare(&self, input: &ChatInput) -> Result<Prepared> {
        let message = self.validate(input)?;

        let stored = match &input.conversation_id {
            Some(id) => self.load_history(id).await,
            None => StoredHistory::Missing,
        };
        let save = !matches!(stored, StoredHistory::Unavailable);
        let history = match stored {
            StoredHistory::Found(messages) => messages,
            StoredHistory::Missing | StoredHistory::Unavailable => input
                .messages
                .iter()
                .filter(|m| !m.content.trim().is_empty())
                .map(|m| match m.role {
                    ChatRole::User => ChatMessage::user(m.content.clone()),
                    ChatRole::Assistant => ChatMessage::assistant(m.content.clone(), Vec::new()),
                })
                .collect(),
        };

        let retrieval = retrieval::retrieve(
            self.store.as_ref(),
            self.embedder.as_deref(),
            &message,
            &self.settings.retrieve,
        )
        .await?;
        let degraded = retrieval.degradation().map(str::to_string);
        let assembled = assemble(&retrieval.set().chunks, &self.settings.assemble);

        Ok(Prepared {
            message,
            ctx: GenerationContext {
                conversation_id: input.conversation_id.clone(),
                history,
                assembled: Some(assembled),
            },
            degraded,
            save,
        })
    }

    pub async fn chat(&self, input: &ChatInput) -> Result<ChatReply> {
        let prepared = self.prepare(input).await?;
        let GeneratedResponse {
            message,
            sources,
            conversation_id,
            usage,
            cached,
        } = self.generator.generate(&prepared.message, &prepared.ctx).await?;

        if prepared.save {
            let mut messages = prepared.ctx.history;
            messages.push(ChatMessage::user(prepared.message));
            messages.push(ChatMessage::assistant(message.clone(), sources.clone()));
            persist(self.conversations.as_ref(), &conversation_id, &messages).await;
        } else {
            skip_save(&conversation_id);
        }

        Ok(ChatReply {
            response: message,
            sources,
            usage,
            conversation_id,
            cached,
            degraded: prepared.degraded,
        })
    }

    /// Stream a reply. Errors before the stream opens are returned; later
    /// ones arrive as a terminal [`ChatEvent::Error`].
    pub async fn chat_stream(&self, input: &ChatInput) -> Result<BoxStream<'static, ChatEvent>> {
        let prepared = self.prepare(input).await?;
        let events = self
            .generator
            .generate_stream(&prepared.message, &prepared.ctx)?;

        let mut history = prepared.ctx.history;
        history.push(ChatMessage::user(prepared.message));
        let history = Arc::new(history);
        let conversations = Arc::clone(&self.conversations);
        let save = prepared.save;

        Ok(events
            .then(move |event| {
                let history = Arc::clone(&history);
                let conversations = Arc::clone(&conversations);
                async move {
                    if let ChatEvent::Done {
                        message,
                        sources,
                        conversation_id,
                    } = &event
                    {
                        if save {
                            let mut messages = history.as_ref().clone();
                            messages.push(ChatMessage::assistant(message.clone(), sources.clone()));
                            persist(conversations.as_ref(), conversation_id, &messages).await;
                        } else {
                            skip_save(conversation_id);
                        }
                    }
                    event
                }
            })
            .boxed())
    }
}

async fn persist(store: &dyn ConversationStore, conversation_id: &str, messages: &[ChatMessage]) {
    if let Err(e) = store.save(conversation_id, messages).await {
        tracing::warn!(conversation_id, error = %e, "conversation save failed");
    }
}

fn skip_save(conversation_id: &str) {
    tracing::warn!(
        conversation_id,
        "conversation history unavailable, not saving this turn"
    );
}

/// `palm chat`: one turn against the configured stores and models.
pub async fn run_chat(config: &Config, message: &str, conversation_id: Option<String>) -> AnyResult<()> {
    let services = Services::from_config(config).await?;
    let input = ChatInput {
        message: message.to_string(),
        conversation_id,
        messages: Vec::new(),
    };
    let reply = services.chat.chat(&input).await?;

    println!("{}", reply.response);
    println!();
    if let Some(reason) = &reply.degraded {
        println!("(semantic search unavailable: {})", reason);
    }
    if !reply.sources.is_empty() {
        println!("sources:");
        for (i, source) in reply.sources.iter().enumerate() {
            println!("  [{}] {} ({})", i + 1, source.title, source.source_type.as_str());
        }
    }
    println!(
        "conversation: {}  tokens: {} in / {} out{}",
        reply.conversation_id,
        reply.usage.input_tokens,
        reply.usage.output_tokens,
        if reply.cached { "  (cached)" } else { "" }
    );

    services.close().await;
    Ok(())
}
