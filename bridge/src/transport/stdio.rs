//! Child-process transport.
//!
//! One JSON-RPC message per line on stdin/stdout. The session is
//! single-stream: requests are serialized, and responses to abandoned
//! requests are discarded by id.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::Mutex,
};
use tracing::{debug, info, warn};

use super::{
    protocol::{self, Incoming, JsonRpcNotification, JsonRpcRequest, RpcChannel},
    CapabilityTransport, ChunkSink,
};
use crate::{
    core::config::{ServerId, StdioConfig, TransportKind},
    error::{BridgeError, BridgeResult},
    inventory::CapabilitySet,
};

struct StdioIo {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    /// Set while a write is in progress; still set on the next request means
    /// a cancelled call left a partial line on the pipe.
    write_pending: bool,
    /// Shared with the transport; cleared when a write is abandoned.
    alive: Arc<AtomicBool>,
}

impl StdioIo {
    async fn write_line(&mut self, line: &str) -> BridgeResult<()> {
        if self.write_pending {
            return Err(BridgeError::Connection(
                "previous request was interrupted mid-write".to_string(),
            ));
        }
        self.write_pending = true;
        let interrupted = scopeguard::guard(Arc::clone(&self.alive), |alive| {
            alive.store(false, Ordering::Release);
        });
        let result = async {
            self.stdin.write_all(line.as_bytes()).await?;
            self.stdin.write_all(b"\n").await?;
            self.stdin.flush().await
        }
        .await;
        scopeguard::ScopeGuard::into_inner(interrupted);
        self.write_pending = false;
        result.map_err(|e| BridgeError::Connection(format!("write to server failed: {}", e)))
    }

    async fn read_message(&mut self) -> BridgeResult<Incoming> {
        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|e| BridgeError::Connection(format!("read from server failed: {}", e)))?
                .ok_or_else(|| BridgeError::Connection("server process exited".to_string()))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return Incoming::parse(line);
        }
    }
}

pub struct StdioTransport {
    server_id: ServerId,
    io: Mutex<Option<StdioIo>>,
    child: Mutex<Option<Child>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    closed: AtomicBool,
    shutdown_grace: Duration,
}

impl StdioTransport {
    /// Spawn the server process and complete the initialize handshake.
    pub async fn connect(
        server_id: ServerId,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        config: &StdioConfig,
    ) -> BridgeResult<Self> {
        let child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BridgeError::Connection(format!("failed to spawn '{}': {}", command, e))
            })?;

        info!(
            server_id = %server_id,
            pid = child.id().unwrap_or_default(),
            "Spawned stdio server '{}'",
            command
        );

        let transport = Self::from_child(server_id, child, config)?;
        if let Err(e) = protocol::handshake(&transport).await {
            if let Err(close_err) = transport.close().await {
                warn!(server_id = %transport.server_id, "Close after failed handshake: {}", close_err);
            }
            return Err(e);
        }
        Ok(transport)
    }

    /// Take over a spawned child's pipes without performing the handshake.
    fn from_child(server_id: ServerId, mut child: Child, config: &StdioConfig) -> BridgeResult<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Connection("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Connection("child stdout unavailable".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            let id = server_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server_id = %id, "stderr: {}", line);
                }
            });
        }

        let alive = Arc::new(AtomicBool::new(true));
        Ok(Self {
            server_id,
            io: Mutex::new(Some(StdioIo {
                stdin,
                stdout: BufReader::new(stdout).lines(),
                write_pending: false,
                alive: Arc::clone(&alive),
            })),
            child: Mutex::new(Some(child)),
            next_id: AtomicU64::new(1),
            alive,
            closed: AtomicBool::new(false),
            shutdown_grace: config.shutdown_grace(),
        })
    }

    fn mark_broken(&self, err: &BridgeError) {
        if matches!(err, BridgeError::Connection(_) | BridgeError::Protocol(_))
            && self.alive.swap(false, Ordering::AcqRel)
        {
            warn!(server_id = %self.server_id, "stdio session broken: {}", err);
        }
    }

    fn ensure_open(&self) -> BridgeResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::Connection("session closed".to_string()));
        }
        Ok(())
    }

    async fn exchange(
        &self,
        id: u64,
        line: &str,
        sink: Option<&ChunkSink>,
        method: &str,
    ) -> BridgeResult<Value> {
        let mut guard = self.io.lock().await;
        let io = guard
            .as_mut()
            .ok_or_else(|| BridgeError::Connection("session closed".to_string()))?;

        io.write_line(line).await?;
        loop {
            match io.read_message().await? {
                Incoming::Response { id: rid, outcome } if protocol::id_matches(&rid, id) => {
                    return outcome.map_err(|e| protocol::rpc_error(method, e));
                }
                Incoming::Response { id: rid, .. } => {
                    debug!(server_id = %self.server_id, stale_id = %rid, "Discarding stale response");
                }
                Incoming::Notification { method, params } => {
                    if let Some(sink) = sink {
                        sink.push(params);
                    } else {
                        debug!(server_id = %self.server_id, "Notification '{}' outside a call", method);
                    }
                }
                Incoming::Request { id: rid, method, .. } => {
                    let reply = protocol::reply_to_server_request(&rid, &method);
                    io.write_line(&reply.to_string()).await?;
                }
            }
        }
    }
}

#[async_trait]
impl RpcChannel for StdioTransport {
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
        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params.as_ref()))?;

        let result = self.exchange(id, &line, sink, method).await;
        if let Err(e) = &result {
            self.mark_broken(e);
        }
        result
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> BridgeResult<()> {
        self.ensure_open()?;
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params.as_ref()))?;
        let mut guard = self.io.lock().await;
        let io = guard
            .as_mut()
            .ok_or_else(|| BridgeError::Connection("session closed".to_string()))?;
        let result = io.write_line(&line).await;
        if let Err(e) = &result {
            self.mark_broken(e);
        }
        result
    }
}

#[async_trait]
impl CapabilityTransport for StdioTransport {
    fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
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
        self.alive.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    /// Close stdin, give the process `shutdown_grace` to exit, then kill it.
    async fn close(&self) -> BridgeResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.alive.store(false, Ordering::Release);

        // A call in flight keeps the pipes; the kill below unblocks it.
        if let Ok(mut io) = self.io.try_lock() {
            io.take();
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(server_id = %self.server_id, "stdio server exited: {}", status);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(server_id = %self.server_id, "Failed to wait for stdio server: {}", e);
                child.kill().await.map_err(BridgeError::from)
            }
            Err(_) => {
                warn!(
                    server_id = %self.server_id,
                    "stdio server did not exit within {:?}, killing",
                    self.shutdown_grace
                );
                child.kill().await.map_err(BridgeError::from)
            }
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            debug!(server_id = %self.server_id, "stdio transport dropped without close");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use serde_json::json;

    use super::*;

    /// A child that never reads its stdin, so large writes block.
    fn idle_transport() -> StdioTransport {
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let config = StdioConfig {
            shutdown_grace_ms: 100,
        };
        StdioTransport::from_child(ServerId::new("idle"), child, &config).unwrap()
    }

    #[tokio::test]
    async fn test_abandoned_write_marks_session_dead() {
        let transport = idle_transport();
        assert!(transport.is_alive());

        // Larger than any pipe buffer.
        let payload = json!({"blob": "x".repeat(4 * 1024 * 1024)});
        let attempt = tokio::time::timeout(
            Duration::from_millis(200),
            transport.request("tools/call", Some(payload), None),
        )
        .await;
        assert!(attempt.is_err(), "write should still be blocked");
        assert!(!transport.is_alive());

        let next = transport.request("ping", None, None).await;
        assert!(matches!(next, Err(BridgeError::Connection(_))));

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_kills_unresponsive_child() {
        let transport = idle_transport();
        transport.close().await.unwrap();
        assert!(!transport.is_alive());
        // Idempotent.
        transport.close().await.unwrap();
        assert!(matches!(
            transport.request("ping", None, None).await,
            Err(BridgeError::Connection(_))
        ));
    }
}
