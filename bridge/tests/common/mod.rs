//! Shared fixtures: the mock stdio server, a counting connector and an
//! in-process HTTP+SSE capability server.

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use toolbridge_core::{
    BridgeConfig, BridgeResult, CapabilityTransport, DefaultConnector, ServerConfig,
    ServerDefinition, TransportConnector,
};

pub const MOCK_SERVER: &str = env!("CARGO_BIN_EXE_toolbridge-mock-server");

pub fn mock_stdio(id: &str, tenant: &str, flags: &[&str]) -> ServerDefinition {
    ServerDefinition::stdio(
        id,
        tenant,
        MOCK_SERVER,
        flags.iter().map(|f| f.to_string()).collect(),
    )
}

/// Defaults with short grace and reconnect delays.
pub fn fast_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.invocation.default_timeout_secs = 5;
    config.stdio.shutdown_grace_ms = 500;
    config.http.reconnect_base_delay_ms = 20;
    config
}

/// Real connector that counts connect attempts.
pub struct SpyConnector {
    inner: DefaultConnector,
    connects: AtomicUsize,
}

impl SpyConnector {
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: DefaultConnector::new(config),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for SpyConnector {
    async fn connect(&self, server: &ServerConfig) -> BridgeResult<Arc<dyn CapabilityTransport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.connect(server).await
    }
}

// ============================================================================
// HTTP+SSE mock
// ============================================================================

pub const SESSION_ID: &str = "sess-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseMode {
    /// Drops the call stream after two events; resumes on GET.
    Resumable,
    /// Drops the call stream after two events; GET is not allowed.
    NotResumable,
    /// Every request is rejected with 401.
    Unauthorized,
    /// Drops the call stream halfway through the event carrying the
    /// response; the response is replayed on GET.
    CutMidEvent,
    /// Sends the call stream in chunks that split multibyte characters.
    SplitUtf8,
    /// Every resumed stream also drops before the response.
    KeepsDropping,
}

pub struct SseServerState {
    mode: SseMode,
    pub posts: AtomicUsize,
    pub deletes: AtomicUsize,
    pub resume_ids: Mutex<Vec<String>>,
    pub session_headers: Mutex<Vec<Option<String>>>,
    pending_call: Mutex<Option<Value>>,
}

pub struct SseServer {
    pub url: String,
    pub state: Arc<SseServerState>,
}

impl SseServer {
    pub async fn start(mode: SseMode) -> Self {
        let state = Arc::new(SseServerState {
            mode,
            posts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            resume_ids: Mutex::new(Vec::new()),
            session_headers: Mutex::new(Vec::new()),
            pending_call: Mutex::new(None),
        });
        let app = Router::new()
            .route("/mcp", post(handle_post).get(handle_get).delete(handle_delete))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{}/mcp", addr),
            state,
        }
    }

    pub fn definition(&self, id: &str, tenant: &str) -> ServerDefinition {
        ServerDefinition::http_sse(id, tenant, self.url.clone())
            .with_header("Authorization", "Bearer test-token")
    }
}

fn progress(n: u64) -> String {
    json!({
        "jsonrpc": "2.0",
        "method": "notifications/progress",
        "params": {"progress": n, "total": 3}
    })
    .to_string()
}

fn stream_result() -> Value {
    json!({
        "content": [{"type": "text", "text": "streamed"}],
        "structuredContent": {"chunks": 3},
        "isError": false
    })
}

fn json_reply(id: &Value, result: Value) -> Response {
    (
        StatusCode::OK,
        [("content-type", "application/json"), ("mcp-session-id", SESSION_ID)],
        json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string(),
    )
        .into_response()
}

fn json_error(id: &Value, code: i64, message: &str) -> Response {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
            .to_string(),
    )
        .into_response()
}

fn event_stream(body: String) -> Response {
    (StatusCode::OK, [("content-type", "text/event-stream")], body).into_response()
}

pub const UNICODE_TEXT: &str = "héllo ✓ 日本";

/// Event stream written in pieces, each cut one byte into a multibyte
/// character.
fn split_event_stream(body: String) -> Response {
    let bytes = body.into_bytes();
    let mut cuts: Vec<usize> = ["é", "✓", "日"]
        .iter()
        .filter_map(|c| {
            bytes
                .windows(c.len())
                .position(|w| w == c.as_bytes())
                .map(|at| at + 1)
        })
        .collect();
    cuts.push(bytes.len());

    let mut chunks = Vec::new();
    let mut start = 0;
    for end in cuts {
        chunks.push(Bytes::copy_from_slice(&bytes[start..end]));
        start = end;
    }
    let stream = futures::stream::iter(chunks).then(|chunk| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok::<_, std::io::Error>(chunk)
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn handle_post(
    State(state): State<Arc<SseServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.posts.fetch_add(1, Ordering::SeqCst);
    state.session_headers.lock().push(
        headers
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );

    if state.mode == SseMode::Unauthorized {
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    }

    let Ok(message) = serde_json::from_slice::<Value>(&body) else {
        return (StatusCode::BAD_REQUEST, "bad json").into_response();
    };
    let Some(id) = message.get("id").cloned() else {
        return StatusCode::ACCEPTED.into_response();
    };
    let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
    let accepts_stream = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"));

    match method {
        "initialize" => json_reply(
            &id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "sse-mock", "version": "0.1.0"}
            }),
        ),
        "ping" => json_reply(&id, json!({})),
        "tools/list" => json_reply(
            &id,
            json!({"tools": [{"name": "stream", "description": "Streams three chunks"}]}),
        ),
        "tools/call" if accepts_stream && state.mode == SseMode::CutMidEvent => {
            let response = json!({"jsonrpc": "2.0", "id": id, "result": stream_result()});
            *state.pending_call.lock() = Some(id);
            // The second event stops partway through its data line.
            let text = response.to_string();
            event_stream(format!(
                "id: 1\ndata: {}\n\nid: 2\ndata: {}",
                progress(1),
                &text[..20]
            ))
        }
        "tools/call" if accepts_stream && state.mode == SseMode::SplitUtf8 => {
            let result = json!({
                "content": [{"type": "text", "text": UNICODE_TEXT}],
                "isError": false
            });
            let response = json!({"jsonrpc": "2.0", "id": id, "result": result});
            split_event_stream(format!("id: 1\ndata: {}\n\n", response))
        }
        "tools/call" if accepts_stream => {
            *state.pending_call.lock() = Some(id);
            // Two events, then the connection ends before the response.
            event_stream(format!(
                "id: 1\ndata: {}\n\nid: 2\ndata: {}\n\n",
                progress(1),
                progress(2)
            ))
        }
        "tools/call" => json_reply(&id, stream_result()),
        _ => json_error(&id, -32601, "Method not found"),
    }
}

async fn handle_get(State(state): State<Arc<SseServerState>>, headers: HeaderMap) -> Response {
    if !matches!(
        state.mode,
        SseMode::Resumable | SseMode::CutMidEvent | SseMode::KeepsDropping
    ) {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let Some(last_id) = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let resumes = {
        let mut ids = state.resume_ids.lock();
        ids.push(last_id);
        ids.len() as u64
    };

    if state.mode == SseMode::KeepsDropping {
        // One more event, then the stream drops again.
        let next = resumes + 2;
        return event_stream(format!("id: {}\ndata: {}\n\n", next, progress(next)));
    }

    let Some(call_id) = state.pending_call.lock().take() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let response = json!({"jsonrpc": "2.0", "id": call_id, "result": stream_result()});
    if state.mode == SseMode::CutMidEvent {
        return event_stream(format!("id: 2\ndata: {}\n\n", response));
    }
    event_stream(format!(
        "id: 3\ndata: {}\n\nid: 4\ndata: {}\n\n",
        progress(3),
        response
    ))
}

async fn handle_delete(State(state): State<Arc<SseServerState>>) -> StatusCode {
    state.deletes.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
