//! Bridge error types.
//!
//! Defines error variants for transport, discovery, health and dispatch
//! operations. The dispatcher converts these into structured
//! [`InvocationFailure`](crate::core::dispatcher::InvocationFailure) values.

use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON-RPC error object returned by the server
    #[error("{method} rejected by server (code {code}): {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Circuit open for server: {0}")]
    CircuitOpen(String),

    #[error("Budget exceeded for tenant: {0}")]
    BudgetExceeded(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    /// The run owning this execution context has ended
    #[error("Execution context has ended: {0}")]
    ContextEnded(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Whether this error reflects the health of the remote server.
    ///
    /// Only these count toward the circuit breaker. A JSON-RPC error object
    /// means the server answered, so it does not.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            BridgeError::Connection(_)
                | BridgeError::Auth(_)
                | BridgeError::Protocol(_)
                | BridgeError::Timeout(_)
                | BridgeError::Io(_)
                | BridgeError::Http(_)
                | BridgeError::Json(_)
        )
    }
}
