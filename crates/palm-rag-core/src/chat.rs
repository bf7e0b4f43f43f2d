//! Chat response generation.
//!
//! [`ResponseGenerator`] turns a user message, its conversation history and
//! an [`AssembledContext`] into a model request, then runs it either in one
//! shot ([`ResponseGenerator::generate`]) or as a stream of [`ChatEvent`]s
//! ([`ResponseGenerator::generate_stream`]).
//!
//! # Streaming state machine
//!
//! ```text
//! Idle ──open ok──▶ Streaming ──deltas──▶ Streaming ──end──▶ Complete (Done)
//!   │                   │
//!   └──open failed──▶ Errored (Error) ◀──delta failed──┘
//! ```
//!
//! Every stream ends with exactly one terminal event, `Done` or `Error`,
//! and nothing is emitted after it. Dropping the stream is the only way to
//! stop a generation early.
//!
//! Hosted-model calls are not retried. A non-streaming failure is returned
//! as an error; a streaming failure becomes the in-band `Error` event.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{fingerprint, ResponseCache};
use crate::context::{format_sources, AssembledContext};
use crate::error::{PalmError, Result};
use crate::models::{ChatMessage, ChatRole, SourceRef};

pub const CONTEXT_PLACEHOLDER: &str = "{CONTEXT}";
pub const SOURCES_PLACEHOLDER: &str = "{SOURCES}";

/// Substituted for `{CONTEXT}` when nothing was retrieved.
pub const NO_CONTEXT: &str = "No specific context available.";
/// Substituted for `{SOURCES}` when nothing was retrieved.
pub const NO_SOURCES: &str = "No sources retrieved.";

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a helpful assistant for the Palm Island Community Company archive. \
You answer questions about the community's stories, history, people, services \
and cultural knowledge.

Use the context below when it is relevant. When you use it, cite the entry \
number in square brackets, for example [1]. If the context does not contain \
the answer, say so plainly instead of guessing. Speak respectfully about \
Elders, culture and community members.

Context:
{CONTEXT}

Sources:
{SOURCES}";

/// A message as sent to the hosted model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<ModelMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

/// A hosted chat model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, request: &ChatRequest) -> Result<Completion>;

    /// Open a streaming completion yielding text deltas in order.
    async fn stream(&self, request: &ChatRequest) -> Result<BoxStream<'static, Result<String>>>;
}

/// Fill the template's placeholders from an assembled context.
pub fn render_system_prompt(template: &str, assembled: Option<&AssembledContext>) -> String {
    let (context, sources) = match assembled {
        Some(a) if !a.is_empty() => {
            let mut sources = format_sources(&a.sources);
            if !a.available_sources.is_empty() {
                sources.push_str("\n\nAlso relevant (not included above):");
                for s in &a.available_sources {
                    sources.push_str(&format!("\n- {} ({})", s.title, s.source_type.as_str()));
                }
            }
            (a.context.clone(), sources)
        }
        _ => (NO_CONTEXT.to_string(), NO_SOURCES.to_string()),
    };
    template
        .replace(CONTEXT_PLACEHOLDER, &context)
        .replace(SOURCES_PLACEHOLDER, &sources)
}

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Most recent history messages sent with each request.
    pub history_window: usize,
    pub system_prompt: String,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.7,
            history_window: 10,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Everything a generation needs besides the new user message.
#[derive(Debug, Clone, Default)]
pub struct GenerationContext {
    /// Existing conversation, or `None` to start a new one.
    pub conversation_id: Option<String>,
    /// Prior turns, oldest first.
    pub history: Vec<ChatMessage>,
    pub assembled: Option<AssembledContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedResponse {
    pub message: String,
    pub sources: Vec<SourceRef>,
    pub conversation_id: String,
    pub usage: Usage,
    /// Served from the response cache without calling the model.
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    TextDelta {
        text: String,
    },
    Done {
        /// Full concatenated response text.
        message: String,
        sources: Vec<SourceRef>,
        conversation_id: String,
    },
    Error {
        message: String,
    },
}

impl ChatEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChatEvent::TextDelta { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Streaming,
    Complete,
    Errored,
}

struct StreamState {
    phase: StreamPhase,
    model: Arc<dyn ChatModel>,
    request: ChatRequest,
    deltas: Option<BoxStream<'static, Result<String>>>,
    text: String,
    sources: Vec<SourceRef>,
    conversation_id: String,
}

impl StreamState {
    /// Advance the state machine by one emitted event.
    async fn step(mut self) -> Option<(ChatEvent, StreamState)> {
        loop {
            match self.phase {
                StreamPhase::Complete | StreamPhase::Errored => return None,
                StreamPhase::Idle => {
                    let opened = self.model.stream(&self.request).await;
                    match opened {
                        Ok(deltas) => {
                            self.deltas = Some(deltas);
                            self.phase = StreamPhase::Streaming;
                        }
                        Err(e) => return Some(self.fail(e)),
                    }
                }
                StreamPhase::Streaming => {
                    let next = match self.deltas.as_mut() {
                        Some(deltas) => deltas.next().await,
                        None => None,
                    };
                    match next {
                        Some(Ok(delta)) if delta.is_empty() => continue,
                        Some(Ok(delta)) => {
                            self.text.push_str(&delta);
                            return Some((ChatEvent::TextDelta { text: delta }, self));
                        }
                        Some(Err(e)) => return Some(self.fail(e)),
                        None => {
                            self.phase = StreamPhase::Complete;
                            self.deltas = None;
                            let event = ChatEvent::Done {
                                message: self.text.clone(),
                                sources: self.sources.clone(),
                                conversation_id: self.conversation_id.clone(),
                            };
                            return Some((event, self));
                        }
                    }
                }
            }
        }
    }

    fn fail(mut self, err: PalmError) -> (ChatEvent, StreamState) {
        tracing::warn!(error = %err, phase = ?self.phase, "chat stream failed");
        self.phase = StreamPhase::Errored;
        self.deltas = None;
        (
            ChatEvent::Error {
                message: err.to_string(),
            },
            self,
        )
    }
}

#[derive(Serialize)]
struct CacheKey<'a> {
    model: &'a str,
    request: &'a ChatRequest,
}

pub struct ResponseGenerator {
    model: Arc<dyn ChatModel>,
    cache: Option<Arc<dyn ResponseCache>>,
    settings: GeneratorSettings,
}

impl ResponseGenerator {
    pub fn new(
        model: Arc<dyn ChatModel>,
        cache: Option<Arc<dyn ResponseCache>>,
        settings: GeneratorSettings,
    ) -> Self {
        Self {
            model,
            cache,
            settings,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Build the model request: rendered system prompt, the last
    /// `history_window` turns (never starting with an assistant turn),
    /// then the new user message.
    pub fn build_request(&self, message: &str, ctx: &GenerationContext) -> ChatRequest {
        let start = ctx
            .history
            .len()
            .saturating_sub(self.settings.history_window);
        let mut messages: Vec<ModelMessage> = ctx.history[start..]
            .iter()
            .skip_while(|m| m.role == ChatRole::Assistant)
            .map(|m| ModelMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        messages.push(ModelMessage {
            role: ChatRole::User,
            content: message.to_string(),
        });

        ChatRequest {
            system: render_system_prompt(&self.settings.system_prompt, ctx.assembled.as_ref()),
            messages,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        }
    }

    fn validate(message: &str) -> Result<()> {
        if message.trim().is_empty() {
            return Err(PalmError::Validation("message is required".to_string()));
        }
        Ok(())
    }

    fn sources(ctx: &GenerationContext) -> Vec<SourceRef> {
        ctx.assembled
            .as_ref()
            .map(|a| a.sources.clone())
            .unwrap_or_default()
    }

    fn conversation_id(ctx: &GenerationContext) -> String {
        ctx.conversation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    /// Generate a complete response, consulting the cache first.
    pub async fn generate(&self, message: &str, ctx: &GenerationContext) -> Result<GeneratedResponse> {
        Self::validate(message)?;
        let request = self.build_request(message, ctx);
        let key = fingerprint(&CacheKey {
            model: self.model.model_name(),
            request: &request,
        });

        let cached = self
            .cache
            .as_ref()
            .and_then(|c| c.get(&key))
            .and_then(|raw| serde_json::from_str::<Completion>(&raw).ok());

        let (completion, was_cached) = match cached {
            Some(completion) => (completion, true),
            None => {
                let completion = self.model.complete(&request).await?;
                if let Some(cache) = &self.cache {
                    match serde_json::to_string(&completion) {
                        Ok(raw) => cache.set(&key, raw),
                        Err(e) => tracing::warn!(error = %e, "failed to serialize completion for cache"),
                    }
                }
                (completion, false)
            }
        };

        Ok(GeneratedResponse {
            message: completion.text,
            sources: Self::sources(ctx),
            conversation_id: Self::conversation_id(ctx),
            usage: completion.usage,
            cached: was_cached,
        })
    }

    /// Generate a response as a stream of events.
    ///
    /// Validation happens before the stream exists; everything after that,
    /// including failing to open the model stream, is reported in-band.
    pub fn generate_stream(
        &self,
        message: &str,
        ctx: &GenerationContext,
    ) -> Result<BoxStream<'static, ChatEvent>> {
        Self::validate(message)?;
        let state = StreamState {
            phase: StreamPhase::Idle,
            model: Arc::clone(&self.model),
            request: self.build_request(message, ctx),
            deltas: None,
            text: String::new(),
            sources: Self::sources(ctx),
            conversation_id: Self::conversation_id(ctx),
        };
        Ok(stream::unfold(state, StreamState::step).boxed())
    }
}
