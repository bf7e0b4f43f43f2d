//! Process-wide service graph shared by the server and the CLI.
//!
//! [`Services::from_config`] wires the SQLite store and the hosted
//! providers; [`Services::new`] takes the stores, models and [`Guards`] as
//! trait objects so tests can run the whole pipeline in memory on a
//! manual clock.

use std::sync::Arc;

use palm_rag_core::cache::{InMemoryCache, ResponseCache};
use palm_rag_core::chat::{ChatModel, GeneratorSettings, ResponseGenerator};
use palm_rag_core::conversation::ConversationStore;
use palm_rag_core::embedding::EmbeddingProvider;
use palm_rag_core::error::{PalmError, Result};
use palm_rag_core::ratelimit::{FixedWindowLimiter, RateLimiter};
use palm_rag_core::store::ChunkStore;

use crate::chat::{ChatService, ChatSettings};
use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::llm;
use crate::search::{self, SearchParams, SearchResponse};
use crate::sqlite_store::SqliteStore;

/// Response cache and rate limiter shared by every request.
pub struct Guards {
    pub cache: Option<Arc<dyn ResponseCache>>,
    pub limiter: Arc<dyn RateLimiter>,
}

impl Guards {
    /// In-process cache (when enabled) and limiter on the system clock.
    pub fn from_config(config: &Config) -> Self {
        let cache: Option<Arc<dyn ResponseCache>> = if config.cache.enabled {
            Some(Arc::new(InMemoryCache::new(config.cache.ttl_secs)))
        } else {
            None
        };
        Self {
            cache,
            limiter: Arc::new(FixedWindowLimiter::new(config.rate_limit_rules())),
        }
    }
}

pub struct Services {
    pub config: Config,
    pub store: Arc<dyn ChunkStore>,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
    pub cache: Option<Arc<dyn ResponseCache>>,
    pub limiter: Arc<dyn RateLimiter>,
    pub chat: ChatService,
    sqlite: Option<SqliteStore>,
}

impl Services {
    pub fn new(
        config: Config,
        store: Arc<dyn ChunkStore>,
        conversations: Arc<dyn ConversationStore>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        model: Arc<dyn ChatModel>,
        guards: Guards,
    ) -> Self {
        let Guards { cache, limiter } = guards;

        let generator = ResponseGenerator::new(
            model,
            cache.clone(),
            GeneratorSettings {
                max_tokens: config.chat.max_tokens,
                temperature: config.chat.temperature,
                history_window: config.chat.history_window,
                system_prompt: config.chat.system_prompt(),
            },
        );
        let chat = ChatService::new(
            Arc::clone(&store),
            conversations,
            embedder.clone(),
            generator,
            ChatSettings::from_config(&config),
        );

        Self {
            config,
            store,
            embedder,
            cache,
            limiter,
            chat,
            sqlite: None,
        }
    }

    /// Connect to the configured database and build the hosted clients.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let embedder = embedding::create_provider(&config.embedding)?;
        let model = llm::create_model(&config.chat)?;
        let sqlite = SqliteStore::new(db::connect(config).await?);

        let mut services = Self::new(
            config.clone(),
            Arc::new(sqlite.clone()),
            Arc::new(sqlite.clone()),
            embedder,
            model,
            Guards::from_config(config),
        );
        services.sqlite = Some(sqlite);
        Ok(services)
    }

    /// Count a request against `class` for `identifier`.
    pub fn admit(&self, identifier: &str, class: &str) -> Result<()> {
        let decision = self.limiter.check(identifier, class);
        if decision.allowed {
            return Ok(());
        }
        tracing::warn!(
            identifier,
            class,
            retry_after_secs = decision.retry_after_secs,
            "rate limit exceeded"
        );
        Err(PalmError::RateLimited {
            retry_after_secs: decision.retry_after_secs,
            reset_at: decision.reset_at,
        })
    }

    pub async fn search(&self, params: &SearchParams) -> Result<SearchResponse> {
        search::search(
            self.store.as_ref(),
            self.embedder.as_deref(),
            &self.config.retrieval,
            params,
        )
        .await
    }

    pub async fn close(&self) {
        if let Some(sqlite) = &self.sqlite {
            sqlite.close().await;
        }
    }
}
