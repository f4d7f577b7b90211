use crate::config::DaemonConfig;
use crate::pid_lock::is_process_running;
use crate::protocol::{BridgeState, BridgeStatus, ToolDescriptor};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{unix::OwnedReadHalf, unix::OwnedWriteHalf, UnixStream};
use tracing::{debug, info, warn};

/// Failure classes for bridge-backed operations. Every variant carries a
/// human-readable reason; clients branch on the variant.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("IDE bridge workflow is not enabled in the tool manifest")]
    WorkflowDisabled,
    #[error("IDE bridge endpoint not found at {0}")]
    NotFound(PathBuf),
    #[error("IDE bridge unavailable, retry suppressed by backoff")]
    Backoff,
    #[error("failed to connect to IDE bridge: {0}")]
    Connect(std::io::Error),
    #[error("IDE bridge connection lost: {0}")]
    ConnectionLost(String),
    #[error("IDE bridge protocol error: {0}")]
    Protocol(String),
    #[error("IDE bridge rejected the call: {0}")]
    Rpc(String),
}

struct BridgeConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
    tools: Vec<ToolDescriptor>,
}

/// Link to the external IDE tool bridge.
///
/// Connection is lazy: nothing happens until a bridge-backed request arrives,
/// and a failed attempt is not retried until the backoff window passes. The
/// published status is replaced wholesale on every attempt so readers never
/// observe a half-updated record.
pub struct BridgeManager {
    config: Arc<DaemonConfig>,
    workflow_enabled: bool,
    status: RwLock<Arc<BridgeStatus>>,
    conn: tokio::sync::Mutex<Option<BridgeConn>>,
    last_failure: StdMutex<Option<Instant>>,
}

impl BridgeManager {
    pub fn new(config: Arc<DaemonConfig>, workflow_enabled: bool) -> Self {
        let initial = BridgeStatus {
            state: BridgeState::Unknown,
            available: false,
            workflow_enabled,
            bridge_path: None,
            xcode_running: false,
            connected: false,
            bridge_pid: None,
            proxied_tool_count: 0,
            last_error: None,
        };
        Self {
            config,
            workflow_enabled,
            status: RwLock::new(Arc::new(initial)),
            conn: tokio::sync::Mutex::new(None),
            last_failure: StdMutex::new(None),
        }
    }

    /// Current snapshot. Cheap; never touches the socket.
    pub fn status(&self) -> BridgeStatus {
        let guard = match self.status.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        (**guard).clone()
    }

    fn publish(&self, status: BridgeStatus) {
        let mut guard = match self.status.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(status);
    }

    fn endpoint_path(&self) -> PathBuf {
        if let Some(p) = &self.config.bridge_socket_override {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("Library/Developer/Xcode/ToolBridge/bridge.sock")
    }

    fn bridge_pid(&self) -> Option<u32> {
        let pid_path = self.endpoint_path().with_file_name("bridge.pid");
        let contents = std::fs::read_to_string(pid_path).ok()?;
        contents.trim().parse().ok()
    }

    /// Tools currently proxied by the bridge. Connects on demand.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BridgeError> {
        let mut conn = self.conn.lock().await;
        self.ensure_connected(&mut conn).await?;
        // ensure_connected leaves a populated connection behind on success.
        match conn.as_ref() {
            Some(c) => Ok(c.tools.clone()),
            None => Err(BridgeError::Protocol("connection vanished".to_string())),
        }
    }

    /// Proxy one tool invocation to the bridge and return its result payload.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, BridgeError> {
        let mut conn = self.conn.lock().await;
        self.ensure_connected(&mut conn).await?;

        let result = match conn.as_mut() {
            Some(c) => {
                self.round_trip(
                    c,
                    "tools/call",
                    json!({ "name": name, "arguments": arguments }),
                )
                .await
            }
            None => Err(BridgeError::Protocol("connection vanished".to_string())),
        };

        match result {
            Ok(value) => Ok(value),
            Err(e @ BridgeError::Rpc(_)) => Err(e),
            Err(e) => {
                // Transport-level failure: tear the connection down and
                // publish a Disconnected snapshot so status reflects reality.
                *conn = None;
                self.note_failure(BridgeState::Disconnected, &e);
                Err(e)
            }
        }
    }

    async fn ensure_connected(
        &self,
        conn: &mut Option<BridgeConn>,
    ) -> Result<(), BridgeError> {
        if !self.workflow_enabled {
            return Err(BridgeError::WorkflowDisabled);
        }
        if conn.is_some() {
            return Ok(());
        }

        if let Some(last) = *lock_or_recover(&self.last_failure) {
            if last.elapsed() < self.config.bridge_backoff {
                return Err(BridgeError::Backoff);
            }
        }

        self.publish(self.snapshot(BridgeState::Discovering, false, 0, None));

        let path = self.endpoint_path();
        if !path.exists() {
            let err = BridgeError::NotFound(path);
            self.note_failure(BridgeState::Unavailable, &err);
            return Err(err);
        }

        debug!("Connecting to IDE bridge at {}", path.display());
        let stream = match UnixStream::connect(&path).await {
            Ok(s) => s,
            Err(e) => {
                let err = BridgeError::Connect(e);
                self.note_failure(BridgeState::Unavailable, &err);
                return Err(err);
            }
        };

        let (read_half, write_half) = stream.into_split();
        let mut new_conn = BridgeConn {
            reader: BufReader::new(read_half),
            writer: write_half,
            next_id: 1,
            tools: Vec::new(),
        };

        match self.handshake(&mut new_conn).await {
            Ok(()) => {
                let tool_count = new_conn.tools.len();
                *lock_or_recover(&self.last_failure) = None;
                info!(
                    "Connected to IDE bridge ({} proxied tools)",
                    tool_count
                );
                self.publish(self.snapshot(BridgeState::Connected, true, tool_count, None));
                *conn = Some(new_conn);
                Ok(())
            }
            Err(e) => {
                self.note_failure(BridgeState::Unavailable, &e);
                Err(e)
            }
        }
    }

    async fn handshake(&self, conn: &mut BridgeConn) -> Result<(), BridgeError> {
        self.round_trip(
            conn,
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "clientInfo": { "name": "xcd", "version": env!("CARGO_PKG_VERSION") },
                "capabilities": {}
            }),
        )
        .await?;

        let note = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
        self.send_line(conn, &note).await?;

        let listed = self.round_trip(conn, "tools/list", json!({})).await?;
        let tools = listed
            .get("tools")
            .and_then(Value::as_array)
            .ok_or_else(|| BridgeError::Protocol("tools/list result missing tools".to_string()))?;
        conn.tools = tools
            .iter()
            .map(|t| ToolDescriptor {
                name: t
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                description: t
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                input_schema: t.get("inputSchema").cloned().unwrap_or(Value::Null),
            })
            .filter(|t| !t.name.is_empty())
            .collect();
        Ok(())
    }

    /// One JSON-RPC request/response exchange over the line transport.
    async fn round_trip(
        &self,
        conn: &mut BridgeConn,
        method: &str,
        params: Value,
    ) -> Result<Value, BridgeError> {
        let id = conn.next_id;
        conn.next_id += 1;
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        self.send_line(conn, &request).await?;

        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(
                self.config.io_timeout,
                conn.reader.read_line(&mut line),
            )
            .await
            .map_err(|_| BridgeError::ConnectionLost("read timeout".to_string()))?
            .map_err(|e| BridgeError::ConnectionLost(e.to_string()))?;
            if read == 0 {
                return Err(BridgeError::ConnectionLost("bridge closed".to_string()));
            }

            let message: Value = serde_json::from_str(line.trim())
                .map_err(|e| BridgeError::Protocol(format!("invalid JSON from bridge: {e}")))?;
            // Notifications interleave with responses; skip anything that is
            // not the answer to our id.
            if message.get("id").and_then(Value::as_u64) != Some(id) {
                continue;
            }
            if let Some(error) = message.get("error") {
                let text = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(BridgeError::Rpc(text.to_string()));
            }
            return Ok(message.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    async fn send_line(&self, conn: &mut BridgeConn, message: &Value) -> Result<(), BridgeError> {
        let mut bytes = serde_json::to_vec(message)
            .map_err(|e| BridgeError::Protocol(e.to_string()))?;
        bytes.push(b'\n');
        tokio::time::timeout(self.config.io_timeout, conn.writer.write_all(&bytes))
            .await
            .map_err(|_| BridgeError::ConnectionLost("write timeout".to_string()))?
            .map_err(|e| BridgeError::ConnectionLost(e.to_string()))
    }

    fn snapshot(
        &self,
        state: BridgeState,
        connected: bool,
        tool_count: usize,
        last_error: Option<String>,
    ) -> BridgeStatus {
        let path = self.endpoint_path();
        let pid = self.bridge_pid();
        // A connected snapshot always names the endpoint it is talking to,
        // even if the socket file has since been unlinked; the exists() probe
        // only informs failure snapshots.
        let bridge_path = if connected {
            Some(path)
        } else {
            path.exists().then_some(path)
        };
        BridgeStatus {
            state,
            available: connected,
            workflow_enabled: self.workflow_enabled,
            bridge_path,
            xcode_running: pid.map(is_process_running).unwrap_or(false),
            connected,
            bridge_pid: pid,
            proxied_tool_count: tool_count,
            last_error,
        }
    }

    fn note_failure(&self, state: BridgeState, error: &BridgeError) {
        warn!("IDE bridge attempt failed: {}", error);
        *lock_or_recover(&self.last_failure) = Some(Instant::now());
        self.publish(self.snapshot(state, false, 0, Some(error.to_string())));
    }
}

fn lock_or_recover<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    fn manager_for(dir: &TempDir, enabled: bool, backoff_ms: u64) -> BridgeManager {
        let config = DaemonConfig {
            bridge_socket_override: Some(
                dir.path().join("bridge.sock").to_string_lossy().to_string(),
            ),
            bridge_backoff: Duration::from_millis(backoff_ms),
            ..DaemonConfig::default()
        };
        BridgeManager::new(Arc::new(config), enabled)
    }

    /// Minimal scripted bridge: answers initialize and tools/list, then one
    /// tools/call.
    async fn serve_scripted_bridge(listener: UnixListener) {
        let (stream, _) = listener.accept().await.unwrap();
        serve_scripted_stream(stream).await;
    }

    async fn serve_scripted_stream(stream: tokio::net::UnixStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let message: Value = serde_json::from_str(&line).unwrap();
            let Some(id) = message.get("id").and_then(Value::as_u64) else {
                continue; // notification
            };
            let result = match message.get("method").and_then(Value::as_str) {
                Some("initialize") => json!({ "serverInfo": { "name": "bridge" } }),
                Some("tools/list") => json!({
                    "tools": [
                        { "name": "build_sim", "description": "Build for simulator",
                          "inputSchema": { "type": "object" } },
                        { "name": "run_tests", "inputSchema": { "type": "object" } }
                    ]
                }),
                Some("tools/call") => json!({ "content": [{ "type": "text", "text": "ok" }] }),
                _ => Value::Null,
            };
            let response = json!({ "jsonrpc": "2.0", "id": id, "result": result });
            let mut bytes = serde_json::to_vec(&response).unwrap();
            bytes.push(b'\n');
            write_half.write_all(&bytes).await.unwrap();
        }
    }

    #[tokio::test]
    async fn disabled_workflow_short_circuits() {
        let dir = TempDir::new().unwrap();
        let manager = manager_for(&dir, false, 10);
        match manager.list_tools().await {
            Err(BridgeError::WorkflowDisabled) => {}
            other => panic!("expected WorkflowDisabled, got {other:?}"),
        }
        // Status never left Unknown; no attempt was made.
        assert_eq!(manager.status().state, BridgeState::Unknown);
    }

    #[tokio::test]
    async fn missing_endpoint_yields_unavailable_snapshot() {
        let dir = TempDir::new().unwrap();
        let manager = manager_for(&dir, true, 10);
        assert!(matches!(
            manager.list_tools().await,
            Err(BridgeError::NotFound(_))
        ));
        let status = manager.status();
        assert_eq!(status.state, BridgeState::Unavailable);
        assert!(!status.connected);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn backoff_suppresses_immediate_retry() {
        let dir = TempDir::new().unwrap();
        let manager = manager_for(&dir, true, 60_000);
        assert!(matches!(
            manager.list_tools().await,
            Err(BridgeError::NotFound(_))
        ));
        // Second attempt inside the window is gated without touching disk.
        assert!(matches!(
            manager.list_tools().await,
            Err(BridgeError::Backoff)
        ));
    }

    #[tokio::test]
    async fn connects_and_proxies_tool_calls() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("bridge.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(serve_scripted_bridge(listener));

        let manager = manager_for(&dir, true, 10);
        let tools = manager.list_tools().await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "build_sim");

        let status = manager.status();
        assert_eq!(status.state, BridgeState::Connected);
        assert!(status.connected);
        assert_eq!(status.proxied_tool_count, 2);

        let result = manager.call_tool("build_sim", json!({})).await.unwrap();
        assert!(result.get("content").is_some());
    }

    #[tokio::test]
    async fn connected_snapshot_keeps_endpoint_path_after_unlink() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("bridge.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        // Unlink the socket file as soon as the connection is accepted, so
        // the Connected snapshot is published while nothing is on disk.
        let unlink = socket.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            std::fs::remove_file(&unlink).unwrap();
            serve_scripted_stream(stream).await;
        });

        let manager = manager_for(&dir, true, 10);
        manager.list_tools().await.unwrap();

        let status = manager.status();
        assert_eq!(status.state, BridgeState::Connected);
        assert!(status.connected);
        assert_eq!(status.bridge_path.as_deref(), Some(socket.as_path()));
    }
}
