//! The web server: browser chat plus the dashboard API, multiplexed on one
//! listener.

use super::channel::WebChannel;
use super::sse::SseManager;
use crate::tasks::TaskManager;
use axum::{
    extract::{Query, State},
    http::{HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::sse::{KeepAlive, Sse},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use switchboard_channels::ChannelManager;
use switchboard_core::traits::Channel as _;
use switchboard_store::{HistoryStore, Journal};
use tracing::{error, info};

/// The single-page browser client, served from a cached string.
const INDEX_HTML: &str = include_str!("index.html");

/// Shared state for every route handler.
#[derive(Clone)]
pub struct AppState {
    pub web: Arc<WebChannel>,
    pub sse: SseManager,
    pub history: HistoryStore,
    pub journal: Journal,
    pub tasks: Arc<TaskManager>,
    pub channels: Arc<ChannelManager>,
    pub started: Instant,
}

/// Build the router (exposed separately for route tests).
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/index.html", get(index))
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", get(chat_stream))
        .route("/api/history", get(history))
        .route("/api/conversations", get(conversations))
        .route("/api/status", get(status))
        .route("/api/tasks", get(tasks))
        .route("/api/journal", get(journal))
        .fallback(fallback)
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Start the server. Runs until the listener is closed.
pub async fn serve(state: AppState, port: u16) {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("web server failed to bind {addr}: {e}");
            return;
        }
    };
    info!("web server listening on {addr}");
    if let Err(e) = axum::serve(listener, app).await {
        error!("web server error: {e}");
    }
}

/// Permissive CORS on every response. Preflight is answered here so that
/// `OPTIONS` gets a 204 even on paths whose routes only accept other methods.
async fn cors(req: axum::extract::Request, next: Next) -> Response {
    let mut resp = if req.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };
    let headers = resp.headers_mut();
    headers.insert(
        "Access-Control-Allow-Origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Content-Type"),
    );
    resp
}

async fn fallback() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": "Not found"}))).into_response()
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Deserialize)]
struct ChatRequest {
    text: Option<serde_json::Value>,
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
}

/// `POST /api/chat`: inject a browser message, fire-and-forget.
async fn chat(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid JSON body"})),
        )
            .into_response();
    };
    let text = match request.text.as_ref().and_then(|t| t.as_str()) {
        Some(text) if !text.trim().is_empty() => text.to_string(),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "text must be a non-empty string"})),
            )
                .into_response();
        }
    };

    let (conversation_id, message_id) = state.web.inject_message(&text, request.conversation_id);
    Json(json!({
        "conversationId": conversation_id,
        "messageId": message_id,
    }))
    .into_response()
}

/// `GET /api/chat/stream?conversationId=…`: the SSE response stream.
async fn chat_stream(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(conversation_id) = params.get("conversationId") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "conversationId is required"})),
        )
            .into_response();
    };

    let rx = state.sse.register(conversation_id).await;
    let stream: std::pin::Pin<
        Box<dyn Stream<Item = Result<axum::response::sse::Event, Infallible>> + Send>,
    > = Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    }));

    Sse::new(stream)
        .keep_alive(KeepAlive::new().text("ok"))
        .into_response()
}

/// `GET /api/history?conversationId=…`
async fn history(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(conversation_id) = params.get("conversationId") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "conversationId is required"})),
        )
            .into_response();
    };
    let entries = match state
        .history
        .get_messages(state.web.id(), conversation_id, 200)
        .await
    {
        Ok(entries) => entries,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };
    let messages: Vec<serde_json::Value> = entries
        .iter()
        .map(|entry| {
            let mut obj = json!({
                "role": entry.role.as_str(),
                "content": entry.content,
            });
            if let Some(id) = &entry.tool_call_id {
                obj["toolCallId"] = json!(id);
            }
            obj
        })
        .collect();
    Json(json!({
        "conversationId": conversation_id,
        "messages": messages,
    }))
    .into_response()
}

/// `GET /api/conversations`
async fn conversations(State(state): State<AppState>) -> Response {
    match state.history.list_conversations(state.web.id()).await {
        Ok(ids) => Json(json!({"conversations": ids})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// Process memory from procfs: (rss, data segment, virtual size) in bytes.
fn memory_snapshot() -> (u64, u64, u64) {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return (0, 0, 0);
    };
    let field = |name: &str| -> u64 {
        status
            .lines()
            .find_map(|l| l.strip_prefix(name))
            .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
            .unwrap_or(0)
            * 1024
    };
    (field("VmRSS:"), field("VmData:"), field("VmSize:"))
}

/// `GET /api/status`
async fn status(State(state): State<AppState>) -> Response {
    let (rss, heap_used, heap_total) = memory_snapshot();
    Json(json!({
        "channels": state.channels.statuses().await,
        "activeTasks": state.tasks.active_count().await,
        "memory": {
            "rss": rss,
            "heapUsed": heap_used,
            "heapTotal": heap_total,
        },
        "uptime": state.started.elapsed().as_secs(),
    }))
    .into_response()
}

/// `GET /api/tasks`
async fn tasks(State(state): State<AppState>) -> Response {
    Json(json!({
        "active": state.tasks.active_snapshot().await,
        "persisted": state.tasks.store().list_active().await,
    }))
    .into_response()
}

/// `GET /api/journal?channelId=…&conversationId=…&limit=…`
async fn journal(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let limit = params
        .get("limit")
        .and_then(|l| l.parse::<usize>().ok())
        .unwrap_or(50);
    let entries = state
        .journal
        .read_entries(
            params.get("channelId").map(String::as_str),
            params.get("conversationId").map(String::as_str),
            limit,
        )
        .await;
    Json(json!({"entries": entries})).into_response()
}
