//! End-to-end tests against the real router on a local port.
//!
//! Stores are in memory (or a temp SQLite file) and the hosted model is a
//! mock, so nothing leaves the machine.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use palm_rag::config::{parse_config, Config};
use palm_rag::db;
use palm_rag::ingest::ingest_items;
use palm_rag::migrate;
use palm_rag::server::router;
use palm_rag::services::{Guards, Services};
use palm_rag::sqlite_store::SqliteStore;
use palm_rag_core::cache::InMemoryCache;
use palm_rag_core::chat::{ChatModel, ChatRequest, Completion, Usage};
use palm_rag_core::clock::ManualClock;
use palm_rag_core::conversation::InMemoryConversationStore;
use palm_rag_core::error::{PalmError, Result};
use palm_rag_core::models::{ContentItem, ContentKind};
use palm_rag_core::ratelimit::FixedWindowLimiter;
use palm_rag_core::store::memory::InMemoryStore;

/// Answers "Hello" with "Hi there"; otherwise reports how many messages
/// it was sent. Fails on "explode".
struct MockModel {
    calls: AtomicUsize,
}

impl MockModel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn reply(request: &ChatRequest) -> Result<String> {
        let last = request
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or("");
        if last.contains("explode") {
            return Err(PalmError::Provider("model overloaded".into()));
        }
        if last == "Hello" {
            return Ok("Hi there".to_string());
        }
        Ok(format!("seen {} messages", request.messages.len()))
    }
}

#[async_trait]
impl ChatModel for MockModel {
    fn model_name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Completion {
            text: Self::reply(request)?,
            usage: Usage {
                input_tokens: 12,
                output_tokens: 3,
            },
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<BoxStream<'static, Result<String>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = Self::reply(request)?;
        let parts: Vec<Result<String>> = text
            .split_inclusive(' ')
            .map(|p| Ok(p.to_string()))
            .collect();
        Ok(stream::iter(parts).boxed())
    }
}

fn test_config(extra: &str) -> Config {
    parse_config(&format!(
        r#"
[db]
path = "unused.sqlite"

[chunking]
max_tokens = 700

[retrieval]
semantic = false

[server]
bind = "127.0.0.1:0"
admin_token = "secret"
{}
"#,
        extra
    ))
    .unwrap()
}

fn story(id: &str, title: &str, body: &str) -> ContentItem {
    ContentItem {
        id: id.to_string(),
        kind: ContentKind::Story,
        title: title.to_string(),
        summary: None,
        body: body.to_string(),
        created_at: 0,
        updated_at: 0,
    }
}

async fn seeded_store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    let items = vec![
        story(
            "story-bush-tucker",
            "Bush Tucker and the Sea",
            "Grandfather showed us fishing at low tide with spears.",
        ),
        ContentItem {
            kind: ContentKind::Person,
            ..story("person-may", "Aunty May", "Elder who remembers the fishing camps.")
        },
    ];
    ingest_items(store.as_ref(), None, &items, 700, 8).await.unwrap();
    store
}

/// Serve `services` on a free port and return its base URL.
async fn spawn_server(services: Services) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(Arc::new(services));
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (format!("http://{}", addr), handle)
}

async fn start(extra_config: &str) -> (String, tokio::task::JoinHandle<()>, Arc<MockModel>) {
    let model = MockModel::new();
    let config = test_config(extra_config);
    let guards = Guards::from_config(&config);
    let services = Services::new(
        config,
        seeded_store().await,
        Arc::new(InMemoryConversationStore::new()),
        None,
        model.clone(),
        guards,
    );
    let (base, handle) = spawn_server(services).await;
    (base, handle, model)
}

fn sse_data(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health() {
    let (base, handle, _) = start("").await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    handle.abort();
}

#[tokio::test]
async fn test_chat_hello_returns_conversation_id() {
    let (base, handle, _) = start("").await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/chat", base))
        .json(&json!({"message": "Hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["response"], "Hi there");
    assert_eq!(body["sources"], json!([]));
    assert_eq!(body["usage"]["inputTokens"], 12);
    assert!(!body["conversationId"].as_str().unwrap().is_empty());

    handle.abort();
}

#[tokio::test]
async fn test_chat_follow_up_and_cache() {
    let (base, handle, model) = start("").await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/chat", base);

    let first: Value = client
        .post(&url)
        .json(&json!({"message": "Tell me about fishing"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["response"], "seen 1 messages");
    assert_eq!(first["sources"][0]["title"], "Bush Tucker and the Sea");
    let conversation_id = first["conversationId"].as_str().unwrap().to_string();

    let second: Value = client
        .post(&url)
        .json(&json!({"message": "What about spears?", "conversationId": conversation_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["response"], "seen 3 messages");
    assert_eq!(second["conversationId"], conversation_id.as_str());

    // A fresh conversation asking the same first question hits the cache.
    let third: Value = client
        .post(&url)
        .json(&json!({"message": "Tell me about fishing"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(third["cached"], true);
    assert_eq!(model.calls.load(Ordering::SeqCst), 2);

    handle.abort();
}

#[tokio::test]
async fn test_chat_validation_errors() {
    let (base, handle, model) = start("").await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/chat", base);

    let resp = client.post(&url).json(&json!({})).send().await.unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("required"));

    let resp = client
        .post(&url)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert!(resp.json::<Value>().await.unwrap()["error"].is_string());

    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    handle.abort();
}

#[tokio::test]
async fn test_chat_provider_failure_is_500() {
    let (base, handle, _) = start("").await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat", base))
        .json(&json!({"message": "please explode"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "model overloaded");
    handle.abort();
}

#[tokio::test]
async fn test_chat_streaming() {
    let (base, handle, _) = start("").await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat", base))
        .json(&json!({"message": "Hello", "stream": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let events = sse_data(&resp.text().await.unwrap());
    assert_eq!(events.len(), 3, "got: {:?}", events);
    assert_eq!(events[0]["text"], "Hi ");
    assert_eq!(events[1]["text"], "there");
    assert_eq!(events[2]["done"], true);
    assert_eq!(events[2]["sources"], json!([]));
    assert!(events[2]["conversationId"].is_string());

    handle.abort();
}

#[tokio::test]
async fn test_chat_streaming_error_is_in_band() {
    let (base, handle, _) = start("").await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat", base))
        .json(&json!({"message": "explode", "stream": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let events = sse_data(&resp.text().await.unwrap());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["error"], "model overloaded");

    handle.abort();
}

#[tokio::test]
async fn test_chat_rate_limited() {
    let (base, handle, _) = start("[rate_limits.chat]\nmax_requests = 2\nwindow_secs = 60\n").await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/chat", base);

    for _ in 0..2 {
        let resp = client
            .post(&url)
            .header("x-forwarded-for", "203.0.113.7")
            .json(&json!({"message": "Hello"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    let resp = client
        .post(&url)
        .header("x-forwarded-for", "203.0.113.7")
        .json(&json!({"message": "Hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);
    assert!(resp.headers().contains_key("retry-after"));
    let body: Value = resp.json().await.unwrap();
    assert!(body["retryAfter"].as_u64().unwrap() >= 1);
    assert!(body["error"].is_string());

    // Another client has its own window.
    let resp = client
        .post(&url)
        .header("x-forwarded-for", "198.51.100.1")
        .json(&json!({"message": "Hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    handle.abort();
}

#[tokio::test]
async fn test_rate_limit_window_resets_on_clock() {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let config = test_config("[rate_limits.chat]\nmax_requests = 1\nwindow_secs = 60\n");
    let guards = Guards {
        cache: Some(Arc::new(InMemoryCache::with_clock(3600, clock.clone()))),
        limiter: Arc::new(FixedWindowLimiter::with_clock(
            config.rate_limit_rules(),
            clock.clone(),
        )),
    };
    let services = Services::new(
        config,
        seeded_store().await,
        Arc::new(InMemoryConversationStore::new()),
        None,
        MockModel::new(),
        guards,
    );
    let (base, handle) = spawn_server(services).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/chat", base);
    let send = || {
        client
            .post(&url)
            .header("x-forwarded-for", "203.0.113.9")
            .json(&json!({"message": "Hello"}))
            .send()
    };

    assert_eq!(send().await.unwrap().status(), 200);
    assert_eq!(send().await.unwrap().status(), 429);
    clock.advance_secs(61);
    assert_eq!(send().await.unwrap().status(), 200);

    handle.abort();
}

#[tokio::test]
async fn test_search() {
    let (base, handle, _) = start("").await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/api/search", base))
        .query(&[("q", "traditional fishing methods")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["results"]["stories"][0]["title"], "Bush Tucker and the Sea");
    assert_eq!(body["results"]["people"][0]["title"], "Aunty May");
    assert_eq!(body["results"]["ragChunks"], json!([]));
    assert_eq!(body["total"], 2);

    let resp = client
        .get(format!("{}/api/search", base))
        .query(&[("q", "f")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert!(resp.json::<Value>().await.unwrap()["error"].is_string());

    let resp = client
        .get(format!("{}/api/search", base))
        .query(&[("q", "fishing"), ("type", "videos")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .get(format!("{}/api/search", base))
        .query(&[("q", "fishing"), ("semantic", "true")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert!(body["degraded"].is_string());
    assert_eq!(body["results"]["ragChunks"][0]["sourceId"], "story-bush-tucker");

    handle.abort();
}

#[tokio::test]
async fn test_admin_requires_token() {
    let (base, handle, _) = start("").await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/admin/stats", base);

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 401);
    let resp = client.get(&url).bearer_auth("wrong").send().await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client.get(&url).bearer_auth("secret").send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["cache"]["hitRate"], 0.0);
    assert_eq!(body["rateLimits"]["rules"]["chat"]["maxRequests"], 20);
    assert_eq!(body["model"], "mock");

    handle.abort();
}

#[tokio::test]
async fn test_admin_actions() {
    let (base, handle, _) = start("").await;
    let client = reqwest::Client::new();
    let admin = format!("{}/api/admin/stats", base);

    client
        .post(format!("{}/api/chat", base))
        .header("x-forwarded-for", "client-1")
        .json(&json!({"message": "Hello"}))
        .send()
        .await
        .unwrap();

    let stats: Value = client
        .get(&admin)
        .bearer_auth("secret")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["cache"]["size"], 1);
    assert_eq!(stats["rateLimits"]["totalEntries"], 1);

    let resp: Value = client
        .post(&admin)
        .bearer_auth("secret")
        .json(&json!({"action": "clear-cache"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["success"], true);
    assert_eq!(resp["removed"], 1);

    let resp: Value = client
        .post(&admin)
        .bearer_auth("secret")
        .json(&json!({"action": "reset-rate-limit", "identifier": "client-1"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["removed"], 1);

    let resp = client
        .post(&admin)
        .bearer_auth("secret")
        .json(&json!({"action": "reset-rate-limit"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(&admin)
        .bearer_auth("secret")
        .json(&json!({"action": "reboot"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    for action in ["cleanup-cache", "cleanup-rate-limits"] {
        let resp = client
            .post(&admin)
            .bearer_auth("secret")
            .json(&json!({ "action": action }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200, "action {}", action);
    }

    handle.abort();
}

#[tokio::test]
async fn test_sqlite_backed_conversation() {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("palm.sqlite")).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let store = SqliteStore::new(pool);

    let items = vec![story(
        "story-reef",
        "Reef Walk",
        "At low tide the reef flats are exposed and families gather shellfish.",
    )];
    ingest_items(&store, None, &items, 700, 8).await.unwrap();
    assert_eq!(store.counts().await.unwrap().chunks, 1);

    let config = test_config("");
    let guards = Guards::from_config(&config);
    let services = Services::new(
        config,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        None,
        MockModel::new(),
        guards,
    );
    let (base, handle) = spawn_server(services).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/chat", base);

    let first: Value = client
        .post(&url)
        .json(&json!({"message": "When do families gather shellfish?"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["sources"][0]["id"], "story-reef");
    let conversation_id = first["conversationId"].as_str().unwrap().to_string();

    let resp = client
        .post(&url)
        .json(&json!({"message": "And the reef?", "conversationId": conversation_id, "stream": true}))
        .send()
        .await
        .unwrap();
    let events = sse_data(&resp.text().await.unwrap());
    let done = events.last().unwrap();
    assert_eq!(done["done"], true);

    let history = palm_rag_core::conversation::ConversationStore::load(&store, &conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[3].content, "seen 3 messages");
    assert!(history[1].sources.as_ref().is_some_and(|s| !s.is_empty()));
    assert_eq!(store.counts().await.unwrap().conversations, 1);

    handle.abort();
    store.close().await;
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (base, handle, _) = start("").await;
    let resp = reqwest::get(format!("{}/api/nope", base)).await.unwrap();
    assert_eq!(resp.status(), 404);
    handle.abort();
}

