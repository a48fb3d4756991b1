//! JSON-RPC 2.0 framing and the capability-server method set.
//!
//! Both transports move the same messages; they differ only in how a
//! request reaches the server and how the response comes back. The
//! [`RpcChannel`] seam captures that difference, and the helpers here
//! build the handshake, discovery and invocation calls on top of it.

use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParam, ClientCapabilities, ConstString, ErrorCode, ErrorData,
    GetPromptRequestParam, Implementation, InitializeRequestParam, JsonObject,
    JsonRpcVersion2_0, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListToolsResult, NumberOrString, PaginatedRequestParam, ProgressToken, Prompt,
    ProtocolVersion, ReadResourceRequestParam, RequestId, Resource, ResourceTemplate, Tool,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::ChunkSink;
use crate::{
    core::config::ServerId,
    error::{BridgeError, BridgeResult},
    inventory::{Capability, CapabilityKind, CapabilitySet},
};

pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::V_2024_11_05;

/// Upper bound on `nextCursor` pages fetched per listing.
const MAX_PAGES: usize = 64;

pub mod methods {
    use rmcp::model::{
        CallToolRequestMethod, ConstString, GetPromptRequestMethod, InitializeResultMethod,
        InitializedNotificationMethod, ListPromptsRequestMethod,
        ListResourceTemplatesRequestMethod, ListResourcesRequestMethod, ListToolsRequestMethod,
        PingRequestMethod, ReadResourceRequestMethod,
    };

    pub const INITIALIZE: &str = InitializeResultMethod::VALUE;
    pub const INITIALIZED: &str = InitializedNotificationMethod::VALUE;
    pub const PING: &str = PingRequestMethod::VALUE;
    pub const TOOLS_LIST: &str = ListToolsRequestMethod::VALUE;
    pub const TOOLS_CALL: &str = CallToolRequestMethod::VALUE;
    pub const RESOURCES_LIST: &str = ListResourcesRequestMethod::VALUE;
    pub const RESOURCE_TEMPLATES_LIST: &str = ListResourceTemplatesRequestMethod::VALUE;
    pub const RESOURCES_READ: &str = ReadResourceRequestMethod::VALUE;
    pub const PROMPTS_LIST: &str = ListPromptsRequestMethod::VALUE;
    pub const PROMPTS_GET: &str = GetPromptRequestMethod::VALUE;
}

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<&'a Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion2_0,
            id: NumberOrString::Number(id as i64),
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JsonRpcNotification<'a> {
    pub jsonrpc: JsonRpcVersion2_0,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

impl<'a> JsonRpcNotification<'a> {
    pub fn new(method: &'a str, params: Option<&'a Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion2_0,
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorData>,
}

/// A message received from a server.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response {
        id: RequestId,
        outcome: Result<Value, ErrorData>,
    },
    Notification {
        method: String,
        params: Value,
    },
    /// Server-initiated request (e.g. `ping`)
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
}

impl Incoming {
    pub fn parse(text: &str) -> BridgeResult<Self> {
        let raw: RawMessage = serde_json::from_str(text).map_err(|e| {
            BridgeError::Protocol(format!("malformed message: {} ({})", e, truncate(text)))
        })?;
        Self::from_raw(raw, text)
    }

    pub fn parse_slice(bytes: &[u8]) -> BridgeResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| BridgeError::Protocol(format!("response body is not UTF-8: {}", e)))?;
        Self::parse(text)
    }

    fn from_raw(raw: RawMessage, text: &str) -> BridgeResult<Self> {
        match (raw.id, raw.method) {
            (Some(id), Some(method)) => Ok(Incoming::Request {
                id,
                method,
                params: raw.params.unwrap_or(Value::Null),
            }),
            (None, Some(method)) => Ok(Incoming::Notification {
                method,
                params: raw.params.unwrap_or(Value::Null),
            }),
            (Some(id), None) => {
                let outcome = match (raw.result, raw.error) {
                    (_, Some(error)) => Err(error),
                    (Some(result), None) => Ok(result),
                    (None, None) => Ok(Value::Null),
                };
                Ok(Incoming::Response { id, outcome })
            }
            (None, None) => Err(BridgeError::Protocol(format!(
                "message has neither id nor method: {}",
                truncate(text)
            ))),
        }
    }

    /// Whether this is the response to request `expected`.
    pub fn answers(&self, expected: u64) -> bool {
        match self {
            Incoming::Response { id, .. } => id_matches(id, expected),
            _ => false,
        }
    }
}

pub fn id_matches(id: &RequestId, expected: u64) -> bool {
    match id {
        NumberOrString::Number(n) => u64::try_from(*n).ok() == Some(expected),
        NumberOrString::String(s) => s.parse::<u64>().ok() == Some(expected),
    }
}

/// Convert a JSON-RPC error object into a bridge error.
pub fn rpc_error(method: &str, error: ErrorData) -> BridgeError {
    BridgeError::Rpc {
        method: method.to_string(),
        code: i64::from(error.code.0),
        message: error.message.into_owned(),
    }
}

/// Reply sent for a server-initiated request.
pub fn reply_to_server_request(id: &RequestId, method: &str) -> Value {
    if method == methods::PING {
        json!({"jsonrpc": JsonRpcVersion2_0.as_str(), "id": id, "result": {}})
    } else {
        let error = ErrorData::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
            None,
        );
        json!({"jsonrpc": JsonRpcVersion2_0.as_str(), "id": id, "error": error})
    }
}

fn truncate(text: &str) -> &str {
    const LIMIT: usize = 200;
    match text.char_indices().nth(LIMIT) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Request/response channel to one server session.
#[async_trait]
pub(crate) trait RpcChannel: Send + Sync {
    fn server_id(&self) -> &ServerId;

    /// Send a request and wait for its response. Notifications received in
    /// the meantime are pushed into `sink`.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        sink: Option<&ChunkSink>,
    ) -> BridgeResult<Value>;

    async fn notify(&self, method: &str, params: Option<Value>) -> BridgeResult<()>;
}

pub(crate) async fn handshake<C: RpcChannel + ?Sized>(channel: &C) -> BridgeResult<Value> {
    let params = InitializeRequestParam {
        protocol_version: PROTOCOL_VERSION,
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            title: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            icons: None,
            website_url: None,
        },
    };
    let result = channel
        .request(methods::INITIALIZE, Some(serde_json::to_value(params)?), None)
        .await?;
    if !result.is_object() {
        return Err(BridgeError::Protocol(format!(
            "initialize returned a non-object result: {}",
            result
        )));
    }
    let protocol_version = result
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    debug!(
        server_id = %channel.server_id(),
        protocol_version,
        "Session initialized"
    );
    channel.notify(methods::INITIALIZED, None).await?;
    Ok(result)
}

pub(crate) async fn ping<C: RpcChannel + ?Sized>(channel: &C) -> BridgeResult<()> {
    channel.request(methods::PING, None, None).await.map(|_| ())
}

fn argument_object(arguments: Value) -> BridgeResult<Option<JsonObject>> {
    match arguments {
        Value::Null => Ok(Some(JsonObject::new())),
        Value::Object(map) => Ok(Some(map)),
        other => Err(BridgeError::Config(format!(
            "arguments must be a JSON object, got {}",
            other
        ))),
    }
}

pub(crate) async fn call_tool<C: RpcChannel + ?Sized>(
    channel: &C,
    name: &str,
    arguments: Value,
    sink: &ChunkSink,
) -> BridgeResult<Value> {
    let request = CallToolRequestParam {
        name: name.to_string().into(),
        arguments: argument_object(arguments)?,
    };
    let mut params = serde_json::to_value(request)?;
    let token = ProgressToken(NumberOrString::String(
        uuid::Uuid::new_v4().to_string().into(),
    ));
    params["_meta"] = json!({"progressToken": token});
    channel
        .request(methods::TOOLS_CALL, Some(params), Some(sink))
        .await
}

pub(crate) async fn read_resource<C: RpcChannel + ?Sized>(
    channel: &C,
    uri: &str,
    sink: &ChunkSink,
) -> BridgeResult<Value> {
    let params = serde_json::to_value(ReadResourceRequestParam {
        uri: uri.to_string(),
    })?;
    channel
        .request(methods::RESOURCES_READ, Some(params), Some(sink))
        .await
}

pub(crate) async fn get_prompt<C: RpcChannel + ?Sized>(
    channel: &C,
    name: &str,
    arguments: Value,
    sink: &ChunkSink,
) -> BridgeResult<Value> {
    // Prompt arguments are string-valued.
    let arguments = match arguments {
        Value::Object(args) => Some(
            args.into_iter()
                .map(|(k, v)| match v {
                    Value::String(s) => (k, Value::String(s)),
                    other => (k, Value::String(other.to_string())),
                })
                .collect::<JsonObject>(),
        ),
        _ => None,
    };
    let params = serde_json::to_value(GetPromptRequestParam {
        name: name.to_string(),
        arguments,
    })?;
    channel
        .request(methods::PROMPTS_GET, Some(params), Some(sink))
        .await
}

/// One page of a paginated `*/list` result.
trait Listing: DeserializeOwned {
    type Item;
    const METHOD: &'static str;
    const FIELD: &'static str;

    fn into_page(self) -> (Vec<Self::Item>, Option<String>);

    /// Patch up a raw page before it is deserialized.
    fn normalize(_page: &mut Value) {}
}

impl Listing for ListToolsResult {
    type Item = Tool;
    const METHOD: &'static str = methods::TOOLS_LIST;
    const FIELD: &'static str = "tools";

    fn into_page(self) -> (Vec<Tool>, Option<String>) {
        (self.tools, self.next_cursor)
    }

    /// Servers that omit `inputSchema` accept an empty object.
    fn normalize(page: &mut Value) {
        if let Some(Value::Array(tools)) = page.get_mut(Self::FIELD) {
            for tool in tools.iter_mut().filter_map(Value::as_object_mut) {
                tool.entry("inputSchema")
                    .or_insert_with(|| json!({"type": "object"}));
            }
        }
    }
}

impl Listing for ListResourcesResult {
    type Item = Resource;
    const METHOD: &'static str = methods::RESOURCES_LIST;
    const FIELD: &'static str = "resources";

    fn into_page(self) -> (Vec<Resource>, Option<String>) {
        (self.resources, self.next_cursor)
    }
}

impl Listing for ListResourceTemplatesResult {
    type Item = ResourceTemplate;
    const METHOD: &'static str = methods::RESOURCE_TEMPLATES_LIST;
    const FIELD: &'static str = "resourceTemplates";

    fn into_page(self) -> (Vec<ResourceTemplate>, Option<String>) {
        (self.resource_templates, self.next_cursor)
    }
}

impl Listing for ListPromptsResult {
    type Item = Prompt;
    const METHOD: &'static str = methods::PROMPTS_LIST;
    const FIELD: &'static str = "prompts";

    fn into_page(self) -> (Vec<Prompt>, Option<String>) {
        (self.prompts, self.next_cursor)
    }
}

/// List every tool, resource, resource template and prompt.
///
/// A server answering "method not found" for a primitive simply does not
/// expose it.
pub(crate) async fn discover<C: RpcChannel + ?Sized>(channel: &C) -> BridgeResult<CapabilitySet> {
    let server_id = channel.server_id().clone();
    let mut set = CapabilitySet::new(server_id.clone());

    for tool in list_paginated::<ListToolsResult, _>(channel).await? {
        let mut cap =
            Capability::new(server_id.clone(), CapabilityKind::Tool, tool.name.into_owned());
        cap.description = tool.description.map(|d| d.into_owned());
        cap.input_schema = Some(Value::Object((*tool.input_schema).clone()));
        set.tools.push(cap);
    }

    for resource in list_paginated::<ListResourcesResult, _>(channel).await? {
        let raw = resource.raw;
        let mut cap = Capability::new(server_id.clone(), CapabilityKind::Resource, raw.name);
        cap.description = raw.description;
        cap.uri = Some(raw.uri);
        cap.mime_type = raw.mime_type;
        set.resources.push(cap);
    }

    for template in list_paginated::<ListResourceTemplatesResult, _>(channel).await? {
        let raw = template.raw;
        let mut cap = Capability::new(server_id.clone(), CapabilityKind::Resource, raw.name);
        cap.description = raw.description;
        cap.uri_template = Some(raw.uri_template);
        cap.mime_type = raw.mime_type;
        set.resources.push(cap);
    }

    for prompt in list_paginated::<ListPromptsResult, _>(channel).await? {
        let mut cap = Capability::new(server_id.clone(), CapabilityKind::Prompt, prompt.name);
        cap.description = prompt.description;
        cap.input_schema = prompt
            .arguments
            .map(serde_json::to_value)
            .transpose()?;
        set.prompts.push(cap);
    }

    Ok(set)
}

async fn list_paginated<L: Listing, C: RpcChannel + ?Sized>(
    channel: &C,
) -> BridgeResult<Vec<L::Item>> {
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_PAGES {
        let params = cursor
            .take()
            .map(|cursor| {
                serde_json::to_value(PaginatedRequestParam {
                    cursor: Some(cursor),
                })
            })
            .transpose()?;
        let mut page = match channel.request(L::METHOD, params, None).await {
            Ok(page) => page,
            Err(BridgeError::Rpc { code, .. })
                if code == i64::from(ErrorCode::METHOD_NOT_FOUND.0) =>
            {
                debug!(server_id = %channel.server_id(), method = L::METHOD, "Primitive not supported");
                return Ok(items);
            }
            Err(e) => return Err(e),
        };

        if let Some(object) = page.as_object_mut() {
            let field = object.entry(L::FIELD).or_insert(Value::Null);
            if field.is_null() {
                *field = Value::Array(Vec::new());
            }
        }
        L::normalize(&mut page);
        let listing: L = serde_json::from_value(page).map_err(|e| {
            BridgeError::Protocol(format!("invalid {} result: {}", L::METHOD, e))
        })?;

        let (page_items, next) = listing.into_page();
        items.extend(page_items);
        match next {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(items),
        }
    }

    Err(BridgeError::Protocol(format!(
        "{} exceeded {} pages",
        L::METHOD,
        MAX_PAGES
    )))
}
