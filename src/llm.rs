//! Hosted chat model clients.
//!
//! [`AnthropicModel`] speaks the Messages API (`POST /v1/messages`), both
//! whole and as server-sent events. Streaming reads the response body on
//! a spawned task and forwards text deltas through a channel; a transport
//! error, an `error` event, or a body that closes before `message_stop`
//! ends the stream with one `Err` item.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use palm_rag_core::chat::{ChatModel, ChatRequest, Completion, Usage};
use palm_rag_core::error::{PalmError, Result};

use crate::config::{ChatConfig, ANTHROPIC_API_KEY_ENV};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicModel {
    pub fn new(config: &ChatConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(ANTHROPIC_API_KEY_ENV)
            .with_context(|| format!("{} environment variable not set", ANTHROPIC_API_KEY_ENV))?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &ChatConfig, api_key: String) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("chat.model required for Anthropic provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model,
        })
    }

    fn body(&self, request: &ChatRequest, stream: bool) -> Value {
        json!({
            "model": self.model,
            "system": request.system,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": stream,
        })
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| PalmError::Provider(format!("chat request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PalmError::Provider(format!(
                "Anthropic API error {}: {}",
                status, text
            )));
        }
        Ok(response)
    }
}

/// Concatenate the text blocks of a Messages API response.
fn parse_completion(payload: &Value) -> Result<Completion> {
    let blocks = payload["content"]
        .as_array()
        .ok_or_else(|| PalmError::Provider("Invalid Anthropic response: missing content".into()))?;
    let text: String = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect();
    let usage = Usage {
        input_tokens: payload["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: payload["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
    };
    Ok(Completion { text, usage })
}

/// What one SSE `data:` payload means for the stream.
#[derive(Debug, PartialEq)]
enum SseData {
    Text(String),
    Stop,
    Error(String),
    Ignore,
}

fn parse_sse_data(data: &str) -> SseData {
    let json: Value = match serde_json::from_str(data) {
        Ok(json) => json,
        Err(_) => return SseData::Ignore,
    };
    match json["type"].as_str() {
        Some("content_block_delta") => match json["delta"]["text"].as_str() {
            Some(text) if !text.is_empty() => SseData::Text(text.to_string()),
            _ => SseData::Ignore,
        },
        Some("message_stop") => SseData::Stop,
        Some("error") => SseData::Error(
            json["error"]["message"]
                .as_str()
                .unwrap_or("unknown streaming error")
                .to_string(),
        ),
        _ => SseData::Ignore,
    }
}

/// Splits a byte stream into SSE `data:` payloads.
///
/// Bytes are held until a full line arrives, so a multi-byte character
/// split across network chunks decodes intact.
#[derive(Default)]
struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(data) = line.trim().strip_prefix("data:") {
                payloads.push(data.trim().to_string());
            }
        }
        payloads
    }
}

/// Read an SSE body and forward text deltas to `tx`.
///
/// The stream ends cleanly only on `message_stop`. A transport error, an
/// `error` event, or a body that closes early sends one `Err` instead.
async fn forward_deltas<S, B, E>(body: S, tx: mpsc::Sender<Result<String>>)
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut lines = SseLines::default();
    while let Some(item) = body.next().await {
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx
                    .send(Err(PalmError::Provider(format!("chat stream failed: {}", e))))
                    .await;
                return;
            }
        };
        for data in lines.push(bytes.as_ref()) {
            match parse_sse_data(&data) {
                SseData::Text(text) => {
                    if tx.send(Ok(text)).await.is_err() {
                        return;
                    }
                }
                SseData::Stop => return,
                SseData::Error(message) => {
                    let _ = tx.send(Err(PalmError::Provider(message))).await;
                    return;
                }
                SseData::Ignore => {}
            }
        }
    }
    let _ = tx
        .send(Err(PalmError::Provider(
            "chat stream ended before message_stop".to_string(),
        )))
        .await;
}

#[async_trait]
impl ChatModel for AnthropicModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Completion> {
        let response = self.send(&self.body(request, false)).await?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| PalmError::Provider(format!("invalid chat response: {}", e)))?;
        parse_completion(&payload)
    }

    async fn stream(&self, request: &ChatRequest) -> Result<BoxStream<'static, Result<String>>> {
        let response = self.send(&self.body(request, true)).await?;

        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        tokio::spawn(forward_deltas(response.bytes_stream(), tx));

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

/// Stands in when `chat.provider = "disabled"`; every call fails.
pub struct DisabledChatModel;

#[async_trait]
impl ChatModel for DisabledChatModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _request: &ChatRequest) -> Result<Completion> {
        Err(PalmError::Provider("chat provider is disabled".to_string()))
    }

    async fn stream(&self, _request: &ChatRequest) -> Result<BoxStream<'static, Result<String>>> {
        Err(PalmError::Provider("chat provider is disabled".to_string()))
    }
}

pub fn create_model(config: &ChatConfig) -> anyhow::Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledChatModel)),
        "anthropic" => Ok(Arc::new(AnthropicModel::new(config)?)),
        other => bail!("Unknown chat provider: {}", other),
    }
}
