//! Bridge configuration types.
//!
//! Defines server records, transport parameters, proxies and the tunables
//! for invocation, health probing and the two transports.

use std::{collections::HashMap, fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{BridgeError, BridgeResult},
    tenant::TenantId,
};

/// Unique identifier for a registered capability server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ServerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport kind, used for connector selection and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stdio,
    HttpSse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::HttpSse => "http_sse",
        }
    }
}

#[derive(Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    HttpSse {
        url: String,
        /// Sent on every request (e.g. Authorization, X-API-Key)
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        /// Per-server proxy override (falls back to the global proxy)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proxy: Option<ProxyConfig>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Stdio { .. } => TransportKind::Stdio,
            TransportConfig::HttpSse { .. } => TransportKind::HttpSse,
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        match self {
            TransportConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(BridgeError::Config(
                        "stdio transport requires a command".to_string(),
                    ));
                }
            }
            TransportConfig::HttpSse { url, .. } => {
                let parsed = url::Url::parse(url)
                    .map_err(|e| BridgeError::Config(format!("Invalid URL '{}': {}", url, e)))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(BridgeError::Config(format!(
                        "Unsupported URL scheme '{}' for http_sse transport",
                        parsed.scheme()
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportConfig::Stdio { command, args, env } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("env", &format!("{} vars", env.len()))
                .finish(),
            TransportConfig::HttpSse {
                url,
                headers,
                proxy,
            } => {
                let masked: Vec<(&String, &str)> =
                    headers.keys().map(|k| (k, "****")).collect();
                f.debug_struct("HttpSse")
                    .field("url", url)
                    .field("headers", &masked)
                    .field("proxy", proxy)
                    .finish()
            }
        }
    }
}

/// Proxy configuration for http_sse servers.
#[derive(Clone, PartialEq, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// HTTP proxy URL (e.g., "http://proxy.internal:8080")
    pub http: Option<String>,

    /// HTTPS proxy URL
    pub https: Option<String>,

    /// Comma-separated hosts to exclude from proxying
    pub no_proxy: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("http", &self.http)
            .field("https", &self.https)
            .field("no_proxy", &self.no_proxy)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}

impl ProxyConfig {
    /// Load proxy config from environment variables.
    ///
    /// `TOOLBRIDGE_*` variables take precedence over the standard ones.
    pub fn from_env() -> Option<Self> {
        let http = std::env::var("TOOLBRIDGE_HTTP_PROXY")
            .ok()
            .or_else(|| std::env::var("HTTP_PROXY").ok());

        let https = std::env::var("TOOLBRIDGE_HTTPS_PROXY")
            .ok()
            .or_else(|| std::env::var("HTTPS_PROXY").ok());

        let no_proxy = std::env::var("TOOLBRIDGE_NO_PROXY")
            .ok()
            .or_else(|| std::env::var("NO_PROXY").ok());

        if http.is_some() || https.is_some() {
            Some(Self {
                http,
                https,
                no_proxy,
                username: None,
                password: None,
            })
        } else {
            None
        }
    }
}

/// Lifecycle status of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    #[default]
    Active,
    /// Failing but below the circuit threshold
    Error,
    Inactive,
}

impl ServerStatus {
    pub fn from_failures(consecutive_failures: u32, threshold: u32) -> Self {
        match consecutive_failures {
            0 => ServerStatus::Active,
            n if n >= threshold => ServerStatus::Inactive,
            _ => ServerStatus::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Active => "active",
            ServerStatus::Error => "error",
            ServerStatus::Inactive => "inactive",
        }
    }
}

/// Registration payload for a capability server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerDefinition {
    pub id: ServerId,
    #[serde(default)]
    pub tenant_id: TenantId,
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
}

impl ServerDefinition {
    pub fn stdio(
        id: impl Into<ServerId>,
        tenant_id: impl Into<TenantId>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            tenant_id: tenant_id.into(),
            transport: TransportConfig::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
        }
    }

    pub fn http_sse(
        id: impl Into<ServerId>,
        tenant_id: impl Into<TenantId>,
        url: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            tenant_id: tenant_id.into(),
            transport: TransportConfig::HttpSse {
                url: url.into(),
                headers: HashMap::new(),
                proxy: None,
            },
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::HttpSse { headers, .. } = &mut self.transport {
            headers.insert(key.into(), value.into());
        }
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Stdio { env, .. } = &mut self.transport {
            env.insert(key.into(), value.into());
        }
        self
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(BridgeError::Config("server id must not be empty".to_string()));
        }
        self.transport.validate()
    }
}

/// Stored server record.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub id: ServerId,
    pub tenant_id: TenantId,
    pub name: String,
    pub transport: TransportConfig,
    pub status: ServerStatus,
    pub consecutive_failures: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ServerConfig {
    pub fn from_definition(def: ServerDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: def.id,
            tenant_id: def.tenant_id,
            name: def.name,
            transport: def.transport,
            status: ServerStatus::Active,
            consecutive_failures: 0,
            last_health_check: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_removed(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Partial update applied through the registration API.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerEdit {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub transport: Option<TransportConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub invocation: InvocationConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub stdio: StdioConfig,

    #[serde(default)]
    pub http: HttpConfig,

    /// Global proxy for http_sse servers, overridable per server
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InvocationConfig {
    /// Per-call timeout (seconds)
    #[serde(default = "default_call_timeout")]
    pub default_timeout_secs: u64,

    /// Whole-run timeout (seconds), 10..=600
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StdioConfig {
    /// Wait after closing stdin before the child is killed (milliseconds)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// SSE resumption attempts after a stream disconnect
    #[serde(default = "default_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// First resumption delay (milliseconds), doubled per attempt
    #[serde(default = "default_reconnect_base_delay")]
    pub reconnect_base_delay_ms: u64,
}

// Default value functions
fn default_call_timeout() -> u64 {
    30
}

fn default_run_timeout() -> u64 {
    300 // 5 minutes
}

fn default_probe_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_shutdown_grace() -> u64 {
    2000
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_pool_max_idle() -> usize {
    8
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_base_delay() -> u64 {
    2000
}

// Default implementations
impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_call_timeout(),
            run_timeout_secs: default_run_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            pool_max_idle_per_host: default_pool_max_idle(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            max_reconnect_attempts: default_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay(),
        }
    }
}

impl InvocationConfig {
    pub const MIN_RUN_TIMEOUT_SECS: u64 = 10;
    pub const MAX_RUN_TIMEOUT_SECS: u64 = 600;

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl StdioConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> BridgeResult<()> {
        let run = self.invocation.run_timeout_secs;
        if !(InvocationConfig::MIN_RUN_TIMEOUT_SECS..=InvocationConfig::MAX_RUN_TIMEOUT_SECS)
            .contains(&run)
        {
            return Err(BridgeError::Config(format!(
                "run_timeout_secs must be within {}..={}, got {}",
                InvocationConfig::MIN_RUN_TIMEOUT_SECS,
                InvocationConfig::MAX_RUN_TIMEOUT_SECS,
                run
            )));
        }
        if self.invocation.default_timeout_secs == 0 {
            return Err(BridgeError::Config(
                "default_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.health.failure_threshold == 0 {
            return Err(BridgeError::Config(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.health.probe_interval_secs == 0 {
            return Err(BridgeError::Config(
                "probe_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Fill the global proxy from the environment when none is configured.
    pub fn with_env_proxy(mut self) -> Self {
        if self.proxy.is_none() {
            self.proxy = ProxyConfig::from_env();
        }
        self
    }
}
