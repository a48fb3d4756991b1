//! HTTP + Server-Sent Events transport.
//!
//! Each request is a POST of one JSON-RPC message. The server answers with
//! either a single JSON body or an SSE stream carrying notifications and,
//! last, the response. A stream that drops before the response is resumed
//! with `Last-Event-ID`; servers that cannot resume get the request again in
//! plain JSON mode.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE},
    StatusCode,
};
use serde_json::Value;
use sse_stream::{Error as SseError, SseStream};
use tracing::{debug, info, warn};

use super::{
    protocol::{self, Incoming, JsonRpcNotification, JsonRpcRequest, RpcChannel},
    CapabilityTransport, ChunkSink,
};
use crate::{
    core::{
        config::{HttpConfig, ProxyConfig, ServerId, TransportKind},
        reconnect::ReconnectPolicy,
    },
    error::{BridgeError, BridgeResult},
    inventory::CapabilitySet,
};

pub const SESSION_HEADER: &str = "mcp-session-id";
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

const ACCEPT_STREAMING: &str = "application/json, text/event-stream";
const ACCEPT_JSON: &str = "application/json";
const ACCEPT_EVENT_STREAM: &str = "text/event-stream";

fn build_request_headers(custom_headers: &HashMap<String, String>) -> BridgeResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (key, value) in custom_headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| BridgeError::Config(format!("header name '{}': {}", key, e)))?;
        let mut value = HeaderValue::from_str(value)
            .map_err(|e| BridgeError::Config(format!("header value for '{}': {}", key, e)))?;
        value.set_sensitive(true);
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Build the keep-alive client with default headers and proxy applied.
pub(crate) fn build_http_client(
    custom_headers: &HashMap<String, String>,
    proxy_config: Option<&ProxyConfig>,
    config: &HttpConfig,
) -> BridgeResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout())
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout())
        .tcp_keepalive(Duration::from_secs(30));

    if let Some(proxy_cfg) = proxy_config {
        builder = crate::core::proxy::apply_proxy_to_builder(builder, proxy_cfg)?;
    }

    let req_headers = build_request_headers(custom_headers)?;
    if !req_headers.is_empty() {
        builder = builder.default_headers(req_headers);
    }

    builder
        .build()
        .map_err(|e| BridgeError::Config(format!("build HTTP client: {}", e)))
}

fn send_error(err: reqwest::Error) -> BridgeError {
    if err.is_timeout() {
        BridgeError::Connection(format!("request timed out: {}", err))
    } else {
        BridgeError::Connection(format!("request failed: {}", err))
    }
}

fn is_event_stream(response: &reqwest::Response) -> bool {
    content_type(response).starts_with(ACCEPT_EVENT_STREAM)
}

fn content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

enum StreamOutcome {
    Completed(BridgeResult<Value>),
    Disconnected(String),
}

pub struct HttpSseTransport {
    server_id: ServerId,
    endpoint: String,
    client: reqwest::Client,
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    reconnect: ReconnectPolicy,
}

impl HttpSseTransport {
    /// Build the client and complete the initialize handshake.
    pub async fn connect(
        server_id: ServerId,
        url: &str,
        headers: &HashMap<String, String>,
        proxy: Option<&ProxyConfig>,
        config: &HttpConfig,
    ) -> BridgeResult<Self> {
        let client = build_http_client(headers, proxy, config)?;
        let transport = Self {
            server_id,
            endpoint: url.to_string(),
            client,
            session_id: RwLock::new(None),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            reconnect: ReconnectPolicy::from_config(config),
        };

        protocol::handshake(&transport).await?;
        info!(
            server_id = %transport.server_id,
            session = transport.session_id.read().as_deref().unwrap_or("none"),
            "Connected to http_sse server at {}",
            transport.endpoint
        );
        Ok(transport)
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    fn ensure_open(&self) -> BridgeResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::Connection("session closed".to_string()));
        }
        Ok(())
    }

    fn with_session(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.session_id.read().as_deref() {
            Some(session) => builder.header(SESSION_HEADER, session),
            None => builder,
        }
    }

    async fn post(&self, body: &[u8], accept: &'static str) -> BridgeResult<reqwest::Response> {
        let builder = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, accept)
            .body(body.to_vec());
        let response = self
            .with_session(builder)
            .send()
            .await
            .map_err(send_error)?;
        let response = self.check_status(response).await?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = self.session_id.write();
            if current.as_deref() != Some(session) {
                *current = Some(session.to_string());
            }
        }
        Ok(response)
    }

    async fn check_status(&self, response: reqwest::Response) -> BridgeResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = format!("HTTP {}: {}", status, body.chars().take(200).collect::<String>());
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BridgeError::Auth(detail),
            StatusCode::NOT_FOUND if self.session_id.read().is_some() => {
                BridgeError::Connection(format!("session expired ({})", detail))
            }
            s if s.is_server_error() => BridgeError::Connection(detail),
            _ => BridgeError::Protocol(detail),
        })
    }

    async fn read_json(&self, response: reqwest::Response, id: u64, method: &str) -> BridgeResult<Value> {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BridgeError::Connection(format!("reading response body: {}", e)))?;
        match Incoming::parse_slice(&bytes)? {
            Incoming::Response { id: rid, outcome } if protocol::id_matches(&rid, id) => {
                outcome.map_err(|e| protocol::rpc_error(method, e))
            }
            other => Err(BridgeError::Protocol(format!(
                "expected response to request {}, got {:?}",
                id, other
            ))),
        }
    }

    /// Drain events until the response to `id` arrives or the stream ends.
    ///
    /// An event cut off by the end of the stream is never dispatched, so a
    /// mid-event disconnect surfaces as `Disconnected` and gets resumed.
    async fn consume_events(
        &self,
        response: reqwest::Response,
        id: u64,
        method: &str,
        sink: Option<&ChunkSink>,
        last_event_id: &mut Option<String>,
    ) -> StreamOutcome {
        let mut events = SseStream::from_bytes_stream(response.bytes_stream()).boxed();

        loop {
            let event = match events.next().await {
                Some(Ok(event)) => event,
                Some(Err(SseError::Body(e))) => return StreamOutcome::Disconnected(e.to_string()),
                Some(Err(e)) => {
                    return StreamOutcome::Completed(Err(BridgeError::Protocol(format!(
                        "malformed event stream: {}",
                        e
                    ))))
                }
                None => {
                    return StreamOutcome::Disconnected(
                        "stream ended before the response".to_string(),
                    )
                }
            };

            if let Some(event_id) = event.id.filter(|v| !v.is_empty()) {
                *last_event_id = Some(event_id);
            }
            let Some(data) = event.data.filter(|d| !d.trim().is_empty()) else {
                continue;
            };
            match Incoming::parse(&data) {
                Ok(Incoming::Response { id: rid, outcome }) if protocol::id_matches(&rid, id) => {
                    return StreamOutcome::Completed(
                        outcome.map_err(|e| protocol::rpc_error(method, e)),
                    );
                }
                Ok(Incoming::Response { id: rid, .. }) => {
                    debug!(server_id = %self.server_id, stale_id = %rid, "Discarding unrelated response");
                }
                Ok(Incoming::Notification { params, .. }) => {
                    if let Some(sink) = sink {
                        sink.push(params);
                    }
                }
                Ok(Incoming::Request { method, .. }) => {
                    debug!(server_id = %self.server_id, "Ignoring server request '{}' on event stream", method);
                }
                Err(e) => return StreamOutcome::Completed(Err(e)),
            }
        }
    }

    /// Reopen the event stream after `last_event_id`.
    ///
    /// `Ok(None)` means the server does not support resumption.
    async fn resume(&self, last_event_id: &str) -> BridgeResult<Option<reqwest::Response>> {
        let builder = self
            .client
            .get(&self.endpoint)
            .header(ACCEPT, ACCEPT_EVENT_STREAM)
            .header(LAST_EVENT_ID_HEADER, last_event_id);
        let response = self
            .with_session(builder)
            .send()
            .await
            .map_err(send_error)?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => return Ok(None),
            _ => {}
        }
        let response = self.check_status(response).await?;
        if !is_event_stream(&response) {
            return Ok(None);
        }
        Ok(Some(response))
    }

    /// Re-send the request asking for a single JSON response.
    async fn fallback(&self, body: &[u8], id: u64, method: &str, sink: Option<&ChunkSink>) -> BridgeResult<Value> {
        info!(server_id = %self.server_id, method, "Stream not resumable, retrying without streaming");
        let response = self.post(body, ACCEPT_JSON).await?;
        if is_event_stream(&response) {
            let mut ignored = None;
            return match self.consume_events(response, id, method, sink, &mut ignored).await {
                StreamOutcome::Completed(result) => result,
                StreamOutcome::Disconnected(reason) => Err(BridgeError::Connection(reason)),
            };
        }
        self.read_json(response, id, method).await
    }

    async fn read_stream(
        &self,
        response: reqwest::Response,
        body: &[u8],
        id: u64,
        method: &str,
        sink: Option<&ChunkSink>,
    ) -> BridgeResult<Value> {
        let mut last_event_id: Option<String> = None;
        let mut reason = match self
            .consume_events(response, id, method, sink, &mut last_event_id)
            .await
        {
            StreamOutcome::Completed(result) => return result,
            StreamOutcome::Disconnected(reason) => reason,
        };

        for attempt in 1..=self.reconnect.max_attempts {
            let Some(event_id) = last_event_id.clone() else {
                return self.fallback(body, id, method, sink).await;
            };
            let delay = self.reconnect.calculate_backoff(attempt);
            warn!(
                server_id = %self.server_id,
                attempt,
                last_event_id = %event_id,
                "Event stream lost ({}), resuming in {:?}",
                reason,
                delay
            );
            tokio::time::sleep(delay).await;

            match self.resume(&event_id).await {
                Ok(Some(resumed)) => {
                    match self
                        .consume_events(resumed, id, method, sink, &mut last_event_id)
                        .await
                    {
                        StreamOutcome::Completed(result) => {
                            if result.is_ok() {
                                info!(server_id = %self.server_id, attempt, "Event stream resumed");
                            }
                            return result;
                        }
                        StreamOutcome::Disconnected(next) => reason = next,
                    }
                }
                Ok(None) => return self.fallback(body, id, method, sink).await,
                Err(e @ BridgeError::Auth(_)) => return Err(e),
                Err(e) => reason = e.to_string(),
            }
        }

        Err(BridgeError::Connection(format!(
            "event stream lost after {} resume attempts: {}",
            self.reconnect.max_attempts, reason
        )))
    }
}

#[async_trait]
impl RpcChannel for HttpSseTransport {
    fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        sink: Option<&ChunkSink>,
    ) -> BridgeResult<Value> {
        self.ensure_open()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_vec(&JsonRpcRequest::new(id, method, params.as_ref()))?;

        let response = self.post(&body, ACCEPT_STREAMING).await?;
        if is_event_stream(&response) {
            return self.read_stream(response, &body, id, method, sink).await;
        }
        let content_type = content_type(&response);
        if content_type.starts_with(ACCEPT_JSON) || content_type.is_empty() {
            return self.read_json(response, id, method).await;
        }
        Err(BridgeError::Protocol(format!(
            "unexpected content type '{}'",
            content_type
        )))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> BridgeResult<()> {
        self.ensure_open()?;
        let body = serde_json::to_vec(&JsonRpcNotification::new(method, params.as_ref()))?;
        self.post(&body, ACCEPT_STREAMING).await.map(|_| ())
    }
}

#[async_trait]
impl CapabilityTransport for HttpSseTransport {
    fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::HttpSse
    }

    async fn list_capabilities(&self) -> BridgeResult<CapabilitySet> {
        protocol::discover(self).await
    }

    async fn invoke_tool(
        &self,
        name: &str,
        arguments: Value,
        sink: &ChunkSink,
    ) -> BridgeResult<Value> {
        protocol::call_tool(self, name, arguments, sink).await
    }

    async fn read_resource(&self, uri: &str, sink: &ChunkSink) -> BridgeResult<Value> {
        protocol::read_resource(self, uri, sink).await
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Value,
        sink: &ChunkSink,
    ) -> BridgeResult<Value> {
        protocol::get_prompt(self, name, arguments, sink).await
    }

    async fn ping(&self) -> BridgeResult<()> {
        protocol::ping(self).await
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Terminate the server-side session, if one was issued.
    async fn close(&self) -> BridgeResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(session) = self.session_id.write().take() else {
            return Ok(());
        };
        let result = self
            .client
            .delete(&self.endpoint)
            .header(SESSION_HEADER, session)
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        if let Err(e) = result {
            debug!(server_id = %self.server_id, "Session delete failed: {}", e);
        }
        Ok(())
    }
}
