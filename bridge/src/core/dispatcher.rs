//! Invocation dispatcher.
//!
//! Routes one capability call through: resolve owning server, circuit
//! check, tenant budget check, session acquisition and the bounded call.
//! Every outcome is returned as a value; nothing here panics or aborts the
//! caller's run except a budget rejection, which the caller is told about
//! through [`InvocationFailure::aborts_run`].

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, field, info_span, warn, Instrument};

use super::{
    catalog::ServerCatalog,
    config::{ServerConfig, ServerId},
    metrics::BridgeMetrics,
    pool::BridgePool,
};
use crate::{
    error::{BridgeError, BridgeResult},
    health::HealthTracker,
    inventory::{Capability, CapabilityKind, CapabilityRegistry, QualifiedCapability, ToolAssignment},
    tenant::{BudgetProvider, ExecutionContextId},
    transport::{ChunkSink, TransportConnector},
};

/// Category of a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Connection,
    Auth,
    Protocol,
    Timeout,
    CircuitOpen,
    BudgetExceeded,
    NotFound,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Connection => "connection",
            FailureKind::Auth => "auth",
            FailureKind::Protocol => "protocol",
            FailureKind::Timeout => "timeout",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::BudgetExceeded => "budget_exceeded",
            FailureKind::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&BridgeError> for FailureKind {
    fn from(error: &BridgeError) -> Self {
        match error {
            BridgeError::Connection(_) | BridgeError::Io(_) => FailureKind::Connection,
            BridgeError::Http(e) if e.is_timeout() => FailureKind::Timeout,
            BridgeError::Http(_) => FailureKind::Connection,
            BridgeError::Auth(_) => FailureKind::Auth,
            BridgeError::Protocol(_)
            | BridgeError::Rpc { .. }
            | BridgeError::Json(_)
            | BridgeError::Config(_) => FailureKind::Protocol,
            BridgeError::Timeout(_) => FailureKind::Timeout,
            BridgeError::CircuitOpen(_) => FailureKind::CircuitOpen,
            BridgeError::BudgetExceeded(_) => FailureKind::BudgetExceeded,
            BridgeError::ServerNotFound(_)
            | BridgeError::CapabilityNotFound(_)
            | BridgeError::ContextEnded(_) => FailureKind::NotFound,
        }
    }
}

/// Structured failure attributed to a capability and, when resolved, its server.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{kind} failure invoking '{capability}': {message}")]
pub struct InvocationFailure {
    pub kind: FailureKind,
    pub server_id: Option<ServerId>,
    pub capability: String,
    pub message: String,
    /// Chunks streamed before the failure.
    pub partial_chunks: Vec<Value>,
}

impl InvocationFailure {
    pub fn new(kind: FailureKind, capability: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            server_id: None,
            capability: capability.into(),
            message: message.into(),
            partial_chunks: Vec::new(),
        }
    }

    fn from_error(error: &BridgeError, capability: &Capability) -> Self {
        Self {
            kind: FailureKind::from(error),
            server_id: Some(capability.server_id.clone()),
            capability: capability.name.clone(),
            message: error.to_string(),
            partial_chunks: Vec::new(),
        }
    }

    fn with_partial_chunks(mut self, chunks: Vec<Value>) -> Self {
        self.partial_chunks = chunks;
        self
    }

    /// Whether the caller should stop the whole run.
    pub fn aborts_run(&self) -> bool {
        self.kind == FailureKind::BudgetExceeded
    }
}

/// Result of a successful invocation.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationOutput {
    pub server_id: ServerId,
    pub capability: String,
    pub kind: CapabilityKind,
    /// Raw result object returned by the server.
    pub result: Value,
    /// The server flagged the result as a tool-level error.
    pub is_error: bool,
    /// Progress chunks streamed during the call.
    pub chunks: Vec<Value>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl InvocationOutput {
    /// Structured payload when the server provided one, else the raw result.
    pub fn structured(&self) -> &Value {
        self.result.get("structuredContent").unwrap_or(&self.result)
    }

    /// Concatenated text content items.
    pub fn text(&self) -> Option<String> {
        let items = self.result.get("content")?.as_array()?;
        let text: Vec<&str> = items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect();
        if text.is_empty() {
            None
        } else {
            Some(text.join("\n"))
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

pub type InvocationResult = Result<InvocationOutput, InvocationFailure>;

pub struct Dispatcher {
    registry: Arc<CapabilityRegistry>,
    catalog: Arc<ServerCatalog>,
    health: Arc<HealthTracker>,
    pool: Arc<BridgePool>,
    connector: Arc<dyn TransportConnector>,
    budget: Arc<dyn BudgetProvider>,
    metrics: Arc<BridgeMetrics>,
    default_timeout: Duration,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        catalog: Arc<ServerCatalog>,
        health: Arc<HealthTracker>,
        pool: Arc<BridgePool>,
        connector: Arc<dyn TransportConnector>,
        budget: Arc<dyn BudgetProvider>,
        metrics: Arc<BridgeMetrics>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            catalog,
            health,
            pool,
            connector,
            budget,
            metrics,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Invoke a capability by name, or by `server:name` when the bare name
    /// is unknown.
    pub async fn invoke(
        &self,
        context_id: &ExecutionContextId,
        capability: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> InvocationResult {
        let resolved = self.registry.resolve(capability).or_else(|| {
            QualifiedCapability::parse(capability)
                .and_then(|q| self.registry.resolve_qualified(&q))
        });
        let Some(resolved) = resolved else {
            debug!(context_id = %context_id, "Unknown capability '{}'", capability);
            return Err(InvocationFailure::new(
                FailureKind::NotFound,
                capability,
                format!("no registered server exposes '{}'", capability),
            ));
        };
        self.dispatch(context_id, resolved, arguments, timeout).await
    }

    /// Invoke the exact capability an agent was assigned.
    pub async fn invoke_assigned(
        &self,
        context_id: &ExecutionContextId,
        assignment: &ToolAssignment,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> InvocationResult {
        let Some(resolved) = self.registry.resolve_assignment(assignment) else {
            return Err(InvocationFailure {
                server_id: Some(assignment.server_id.clone()),
                ..InvocationFailure::new(
                    FailureKind::NotFound,
                    assignment.capability_name.clone(),
                    format!(
                        "{} '{}' is not exposed by server '{}'",
                        assignment.kind, assignment.capability_name, assignment.server_id
                    ),
                )
            });
        };
        self.dispatch(context_id, resolved, arguments, timeout).await
    }

    async fn dispatch(
        &self,
        context_id: &ExecutionContextId,
        capability: Capability,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> InvocationResult {
        let span = info_span!(
            "capability.invoke",
            context_id = %context_id,
            server_id = %capability.server_id,
            capability = %capability.name,
            kind = capability.kind.as_str(),
            outcome = field::Empty,
            duration_ms = field::Empty,
        );

        let qualified = capability.qualified();
        let start = Instant::now();
        self.metrics.record_invocation_start();
        // Cancelled callers still balance the active-invocation count.
        let pending = scopeguard::guard((), |_| {
            self.metrics
                .record_invocation_end(&qualified, "cancelled", start.elapsed());
        });

        let result = self
            .execute(context_id, &capability, arguments, timeout)
            .instrument(span.clone())
            .await;
        scopeguard::ScopeGuard::into_inner(pending);

        let elapsed = start.elapsed();
        let outcome = match &result {
            Ok(_) => "success",
            Err(failure) => failure.kind.as_str(),
        };
        span.record("outcome", outcome);
        span.record("duration_ms", elapsed.as_millis() as u64);
        self.metrics.record_invocation_end(&qualified, outcome, elapsed);

        result.map(|mut output| {
            output.duration = elapsed;
            output
        })
    }

    async fn execute(
        &self,
        context_id: &ExecutionContextId,
        capability: &Capability,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> InvocationResult {
        let fail = |error: BridgeError| InvocationFailure::from_error(&error, capability);

        let server = self
            .catalog
            .get(&capability.server_id)
            .ok_or_else(|| fail(BridgeError::ServerNotFound(capability.server_id.to_string())))?;

        if self.health.is_open(&server.id) {
            self.metrics.record_circuit_rejection(&server.id);
            return Err(fail(BridgeError::CircuitOpen(server.id.to_string())));
        }

        self.check_budget(&server).await.map_err(fail)?;

        let target = match capability.kind {
            CapabilityKind::Resource => resource_uri(capability, &arguments).map_err(fail)?,
            _ => capability.name.clone(),
        };

        let bridge = self
            .pool
            .get_or_create(context_id, std::slice::from_ref(&server.id))
            .map_err(fail)?;
        let sink = ChunkSink::new();
        let timeout = timeout.unwrap_or(self.default_timeout);

        let call = async {
            let transport = bridge
                .session(&server, self.connector.as_ref(), &self.metrics)
                .await?;
            match capability.kind {
                CapabilityKind::Tool => transport.invoke_tool(&target, arguments, &sink).await,
                CapabilityKind::Resource => transport.read_resource(&target, &sink).await,
                CapabilityKind::Prompt => transport.get_prompt(&target, arguments, &sink).await,
            }
        };

        let error = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => {
                self.health.record_success(&server.id);
                let is_error = result
                    .get("isError")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                return Ok(InvocationOutput {
                    server_id: server.id.clone(),
                    capability: capability.name.clone(),
                    kind: capability.kind,
                    result,
                    is_error,
                    chunks: sink.take(),
                    duration: Duration::ZERO,
                });
            }
            Ok(Err(error)) => error,
            Err(_) => {
                self.metrics.record_timeout();
                BridgeError::Timeout(timeout)
            }
        };

        if error.is_transport_failure() {
            self.health.record_failure(&server.id, &error);
        } else {
            debug!(server_id = %server.id, "Invocation rejected by server: {}", error);
        }
        Err(fail(error).with_partial_chunks(sink.take()))
    }

    /// Budget is checked against the owning server's tenant. A provider
    /// error blocks the call.
    async fn check_budget(&self, server: &ServerConfig) -> BridgeResult<()> {
        match self.budget.remaining(&server.tenant_id).await {
            Ok(Some(remaining)) if remaining <= 0.0 => {
                self.metrics.record_budget_rejection();
                Err(BridgeError::BudgetExceeded(server.tenant_id.to_string()))
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(
                    tenant_id = %server.tenant_id,
                    "Budget lookup failed, rejecting invocation: {}",
                    e
                );
                self.metrics.record_budget_rejection();
                Err(BridgeError::BudgetExceeded(format!(
                    "{} (budget unavailable)",
                    server.tenant_id
                )))
            }
        }
    }
}

/// Resolve the URI to read, expanding `{var}` placeholders of a template
/// from string or number arguments.
fn resource_uri(capability: &Capability, arguments: &Value) -> BridgeResult<String> {
    if let Some(uri) = &capability.uri {
        return Ok(uri.clone());
    }
    let Some(template) = &capability.uri_template else {
        return Ok(capability.name.clone());
    };
    expand_template(template, arguments)
}

pub(crate) fn expand_template(template: &str, arguments: &Value) -> BridgeResult<String> {
    let mut expanded = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        expanded.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            BridgeError::Protocol(format!("unterminated placeholder in '{}'", template))
        })?;
        let var = &after[..close];
        let value = match arguments.get(var) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(BridgeError::Protocol(format!(
                    "missing string or number argument '{}' for '{}'",
                    var, template
                )))
            }
        };
        expanded.push_str(&value);
        rest = &after[close + 1..];
    }
    expanded.push_str(rest);
    if expanded.is_empty() {
        warn!("Resource template '{}' expanded to an empty URI", template);
    }
    Ok(expanded)
}
