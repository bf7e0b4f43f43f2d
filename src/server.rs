//! HTTP server for the chat, search and admin surfaces.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/api/chat` | Chat turn, JSON or `text/event-stream` |
//! | `GET`  | `/api/search` | Archive search |
//! | `GET`  | `/api/admin/stats` | Cache and rate-limiter statistics |
//! | `POST` | `/api/admin/stats` | Maintenance actions |
//!
//! # Error Contract
//!
//! Every failure is `{"error": message}` with the status from
//! [`ApiError`]. Once a chat stream has started, failures arrive in-band
//! as `data: {"error": ...}` instead.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the archive's web
//! front end can call the API from another origin.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::{header, HeaderMap},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use palm_rag_core::cache::CacheStats;
use palm_rag_core::chat::ChatEvent;
use palm_rag_core::error::PalmError;
use palm_rag_core::ratelimit::RateLimitSnapshot;

use crate::chat::{ChatInput, ClientMessage};
use crate::config::Config;
use crate::error::ApiError;
use crate::search::SearchParams;
use crate::services::Services;

const ANONYMOUS_CLIENT: &str = "anonymous";

type AppState = Arc<Services>;

/// Build the application router around a ready service graph.
pub fn router(services: Arc<Services>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/chat", post(handle_chat))
        .route("/api/search", get(handle_search))
        .route(
            "/api/admin/stats",
            get(handle_admin_stats).post(handle_admin_action),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(services)
}

/// Starts the HTTP server on `[server].bind`. Runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Arc::new(Services::from_config(config).await?);
    let bind_addr = config.server.bind.clone();

    tracing::info!(
        bind = %bind_addr,
        model = services.chat.model_name(),
        semantic = services.embedder.is_some(),
        "starting server"
    );

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("palm server listening on http://{}", bind_addr);
    axum::serve(listener, router(services)).await?;

    Ok(())
}

/// First hop of `x-forwarded-for`, then `x-real-ip`, else `"anonymous"`.
pub fn client_identifier(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    forwarded
        .or_else(real_ip)
        .unwrap_or(ANONYMOUS_CLIENT)
        .to_string()
}

// ============ Health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ Chat ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    messages: Vec<ClientMessage>,
    #[serde(default)]
    stream: bool,
}

fn sse_payload(event: &ChatEvent) -> Value {
    match event {
        ChatEvent::TextDelta { text } => json!({ "text": text }),
        ChatEvent::Done {
            sources,
            conversation_id,
            ..
        } => json!({
            "done": true,
            "sources": sources,
            "conversationId": conversation_id,
        }),
        ChatEvent::Error { message } => json!({ "error": message }),
    }
}

async fn handle_chat(
    State(services): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let client = client_identifier(&headers);
    services.admit(&client, "chat")?;

    let Json(body) = body.map_err(|e| ApiError::validation(e.body_text()))?;
    let input = ChatInput {
        message: body.message.unwrap_or_default(),
        conversation_id: body.conversation_id,
        messages: body.messages,
    };

    if !body.stream {
        let reply = services.chat.chat(&input).await?;
        return Ok(Json(reply).into_response());
    }

    let events = services.chat.chat_stream(&input).await?;
    let sse = events.map(|event| Ok::<_, Infallible>(Event::default().data(sse_payload(&event).to_string())));
    Ok(Sse::new(sse).keep_alive(KeepAlive::default()).into_response())
}

// ============ Search ============

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: Option<String>,
    #[serde(rename = "type")]
    search_type: Option<String>,
    limit: Option<usize>,
    semantic: Option<bool>,
}

async fn handle_search(
    State(services): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::validation(e.body_text()))?;
    let params = SearchParams::from_raw(
        query.q.as_deref(),
        query.search_type.as_deref(),
        query.limit,
        query.semantic,
    )?;

    let client = client_identifier(&headers);
    services.admit(&client, "search")?;

    let response = services.search(&params).await?;
    Ok(Json(response).into_response())
}

// ============ Admin ============

fn authorize(services: &Services, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = services.config.server.admin_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match presented {
        Some(token) if token == expected => Ok(()),
        _ => Err(ApiError(PalmError::Unauthorized)),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminStats {
    cache: Option<CacheStats>,
    rate_limits: RateLimitSnapshot,
    model: String,
}

async fn handle_admin_stats(
    State(services): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AdminStats>, ApiError> {
    authorize(&services, &headers)?;
    Ok(Json(AdminStats {
        cache: services.cache.as_ref().map(|c| c.stats()),
        rate_limits: services.limiter.snapshot(),
        model: services.chat.model_name().to_string(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminAction {
    action: String,
    #[serde(default)]
    identifier: Option<String>,
    #[serde(default)]
    endpoint_class: Option<String>,
}

async fn handle_admin_action(
    State(services): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AdminAction>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    authorize(&services, &headers)?;
    let Json(body) = body.map_err(|e| ApiError::validation(e.body_text()))?;

    let removed = match body.action.as_str() {
        "clear-cache" => match &services.cache {
            Some(cache) => {
                let size = cache.stats().size;
                cache.clear();
                size
            }
            None => 0,
        },
        "cleanup-cache" => services.cache.as_ref().map_or(0, |c| c.cleanup()),
        "reset-rate-limit" => {
            let identifier = body
                .identifier
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| ApiError::validation("identifier is required for reset-rate-limit"))?;
            services
                .limiter
                .reset(identifier, body.endpoint_class.as_deref())
        }
        "cleanup-rate-limits" => services.limiter.cleanup(),
        other => {
            return Err(ApiError::validation(format!(
                "Unknown action: '{}'. Use clear-cache, cleanup-cache, reset-rate-limit, or cleanup-rate-limits.",
                other
            )))
        }
    };

    tracing::info!(action = %body.action, removed, "admin action");
    Ok(Json(json!({
        "success": true,
        "action": body.action,
        "removed": removed,
    })))
}
