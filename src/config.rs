//! TOML configuration.
//!
//! Every section except `[db]`, `[chunking]` and `[server]` is optional
//! and falls back to defaults. API keys are never read from the file; see
//! [`OPENAI_API_KEY_ENV`] and [`ANTHROPIC_API_KEY_ENV`].

use anyhow::{Context, Result};
use palm_rag_core::chat::DEFAULT_SYSTEM_PROMPT;
use palm_rag_core::models::SourceType;
use palm_rag_core::ratelimit::{default_rules, RateLimitRule};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitRule>,
    #[serde(default)]
    pub conversations: ConversationsConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_true")]
    pub semantic: bool,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_per_pool_limit")]
    pub per_pool_limit: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    #[serde(default = "default_pools")]
    pub pools: Vec<SourceType>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            semantic: true,
            similarity_threshold: default_similarity_threshold(),
            per_pool_limit: default_per_pool_limit(),
            final_limit: default_final_limit(),
            max_context_tokens: default_max_context_tokens(),
            pools: default_pools(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_similarity_threshold() -> f64 {
    0.7
}
fn default_per_pool_limit() -> usize {
    5
}
fn default_final_limit() -> usize {
    10
}
fn default_max_context_tokens() -> usize {
    3000
}
fn default_pools() -> Vec<SourceType> {
    SourceType::ALL.to_vec()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,
    /// Texts per request when embedding in bulk.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
    /// Base URL override, e.g. for a proxy.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            max_input_tokens: default_max_input_tokens(),
            batch_size: default_batch_size(),
            timeout_secs: default_embedding_timeout(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_max_input_tokens() -> usize {
    8000
}
fn default_batch_size() -> usize {
    64
}
fn default_embedding_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_chat_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    /// Replaces the built-in template; must keep the placeholders.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_chat_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            max_tokens: default_chat_max_tokens(),
            temperature: default_temperature(),
            history_window: default_history_window(),
            max_message_chars: default_max_message_chars(),
            system_prompt: None,
            timeout_secs: default_chat_timeout(),
            url: None,
        }
    }
}

impl ChatConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn system_prompt(&self) -> String {
        self.system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
    }
}

fn default_chat_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f32 {
    0.7
}
fn default_history_window() -> usize {
    10
}
fn default_max_message_chars() -> usize {
    4000
}
fn default_chat_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationsConfig {
    #[serde(default = "default_load_timeout")]
    pub load_timeout_secs: u64,
    /// Used by `palm prune` when `--older-than-days` is not given.
    #[serde(default)]
    pub retention_days: Option<u32>,
}

impl Default for ConversationsConfig {
    fn default() -> Self {
        Self {
            load_timeout_secs: default_load_timeout(),
            retention_days: None,
        }
    }
}

fn default_load_timeout() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Bearer token required by the admin endpoint, when set.
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Config {
    /// Built-in rate-limit rules overlaid with the configured ones.
    pub fn rate_limit_rules(&self) -> BTreeMap<String, RateLimitRule> {
        let mut rules = default_rules();
        for (class, rule) in &self.rate_limits {
            rules.insert(class.clone(), *rule);
        }
        rules
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content).with_context(|| format!("Invalid config file: {}", path.display()))
}

/// Parse and validate TOML config text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    let retrieval = &config.retrieval;
    if retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if retrieval.per_pool_limit < 1 {
        anyhow::bail!("retrieval.per_pool_limit must be >= 1");
    }
    if retrieval.max_context_tokens < 1 {
        anyhow::bail!("retrieval.max_context_tokens must be >= 1");
    }
    if !(0.0..=1.0).contains(&retrieval.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.chat.provider.as_str() {
        "disabled" | "anthropic" => {}
        other => anyhow::bail!(
            "Unknown chat provider: '{}'. Must be disabled or anthropic.",
            other
        ),
    }
    if config.chat.is_enabled() && config.chat.model.is_none() {
        anyhow::bail!(
            "chat.model must be specified when provider is '{}'",
            config.chat.provider
        );
    }
    if config.chat.max_message_chars == 0 {
        anyhow::bail!("chat.max_message_chars must be > 0");
    }

    for (class, rule) in &config.rate_limits {
        if rule.max_requests < 1 || rule.window_secs < 1 {
            anyhow::bail!(
                "rate_limits.{}: max_requests and window_secs must be >= 1",
                class
            );
        }
    }

    Ok(())
}
