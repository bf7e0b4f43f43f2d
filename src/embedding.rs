//! Hosted embedding client.
//!
//! [`OpenAIEmbedder`] implements the core [`EmbeddingProvider`] trait
//! against `POST /v1/embeddings`. Every input goes through
//! [`prepare_input`] first (whitespace collapsed, cut to
//! `embedding.max_input_tokens`).
//!
//! There is no retry loop: a failed call becomes
//! [`PalmError::Provider`]. Retrieval falls back to lexical results on
//! that error; `palm embed pending` reports it and moves on.
//!
//! # Provider Selection
//!
//! | Config Value | Result of [`create_provider`] |
//! |-------------|----------|
//! | `"disabled"` | `None` |
//! | `"openai"` | [`OpenAIEmbedder`] |

use anyhow::{bail, Context};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use palm_rag_core::embedding::{prepare_input, EmbeddingProvider};
use palm_rag_core::error::{PalmError, Result};

use crate::config::{EmbeddingConfig, OPENAI_API_KEY_ENV};

const OPENAI_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAIEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dims: usize,
    max_input_tokens: usize,
}

impl OpenAIEmbedder {
    /// Build from config, reading the key from `OPENAI_API_KEY`.
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(OPENAI_API_KEY_ENV)
            .with_context(|| format!("{} environment variable not set", OPENAI_API_KEY_ENV))?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &EmbeddingConfig, api_key: String) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model,
            dims,
            max_input_tokens: config.max_input_tokens,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let inputs: Vec<String> = texts
            .iter()
            .map(|t| prepare_input(t, self.max_input_tokens))
            .collect();

        let body = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });

        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| PalmError::Provider(format!("embedding request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(PalmError::Provider(format!(
                "OpenAI API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PalmError::Provider(format!("invalid embedding response: {}", e)))?;
        let vectors = parse_openai_response(&json)?;

        if vectors.len() != texts.len() {
            return Err(PalmError::Provider(format!(
                "embedding response has {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dims) {
            return Err(PalmError::Provider(format!(
                "embedding has {} dims, expected {}",
                bad.len(),
                self.dims
            )));
        }
        Ok(vectors)
    }
}

/// Extract `data[].embedding`, ordered by each entry's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| PalmError::Provider("Invalid OpenAI response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| PalmError::Provider("Invalid OpenAI response: missing embedding".into()))?;

        let mut vec = Vec::with_capacity(embedding.len());
        for v in embedding {
            let f = v.as_f64().ok_or_else(|| {
                PalmError::Provider("Invalid OpenAI response: non-numeric embedding value".into())
            })?;
            vec.push(f as f32);
        }

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Build the configured embedding provider, or `None` when disabled.
pub fn create_provider(config: &EmbeddingConfig) -> anyhow::Result<Option<Arc<dyn EmbeddingProvider>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAIEmbedder::new(config)?))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let missing = serde_json::json!({"object": "list"});
        assert!(matches!(
            parse_openai_response(&missing),
            Err(PalmError::Provider(_))
        ));
        let non_numeric = serde_json::json!({"data": [{"embedding": ["x"]}]});
        assert!(parse_openai_response(&non_numeric).is_err());
    }

    #[test]
    fn test_disabled_provider_is_none() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert!(provider.is_none());
    }

    #[test]
    fn test_base_url_override() {
        let config = EmbeddingConfig {
            provider: "openai".into(),
            model: Some("text-embedding-3-small".into()),
            dims: Some(2),
            url: Some("http://127.0.0.1:9999/".into()),
            ..EmbeddingConfig::default()
        };
        let embedder = OpenAIEmbedder::with_api_key(&config, "sk-test".into()).unwrap();
        assert_eq!(embedder.base_url, "http://127.0.0.1:9999");
        assert_eq!(embedder.dims(), 2);
    }
}
