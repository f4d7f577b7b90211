use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Shared limit for length-prefixed messages (client and daemon).
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonRequest {
    Connect {
        client_id: Uuid,
    },
    Ping {
        request_id: Uuid,
    },
    Status {
        request_id: Uuid,
    },
    Shutdown {
        request_id: Uuid,
    },
    GetLogs {
        request_id: Uuid,
        lines: usize,
    },

    // Session defaults
    GetDefaults {
        request_id: Uuid,
    },
    SetDefaults {
        request_id: Uuid,
        defaults: SessionDefaults,
    },
    ClearDefaults {
        request_id: Uuid,
    },

    // Log capture sessions
    StartLogCapture {
        request_id: Uuid,
        spec: LogCaptureSpec,
    },
    FollowLogCapture {
        request_id: Uuid,
        resource_id: Uuid,
    },
    StopLogCapture {
        request_id: Uuid,
        resource_id: Uuid,
    },
    ListResources {
        request_id: Uuid,
    },

    // Debug sessions
    AttachDebugger {
        request_id: Uuid,
        target: DebugTarget,
    },
    DebugCommand {
        request_id: Uuid,
        resource_id: Uuid,
        command: String,
    },
    StopDebugSession {
        request_id: Uuid,
        resource_id: Uuid,
    },

    // Bridge proxy and tool catalog
    BridgeStatus {
        request_id: Uuid,
    },
    ListTools {
        request_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        workflow: Option<String>,
    },
    CallTool {
        request_id: Uuid,
        name: String,
        arguments: Value,
    },
}

impl DaemonRequest {
    /// Correlation id echoed back in the response. `Connect` reuses the
    /// client id for this.
    pub fn request_id(&self) -> Uuid {
        match self {
            DaemonRequest::Connect { client_id } => *client_id,
            DaemonRequest::Ping { request_id }
            | DaemonRequest::Status { request_id }
            | DaemonRequest::Shutdown { request_id }
            | DaemonRequest::GetLogs { request_id, .. }
            | DaemonRequest::GetDefaults { request_id }
            | DaemonRequest::SetDefaults { request_id, .. }
            | DaemonRequest::ClearDefaults { request_id }
            | DaemonRequest::StartLogCapture { request_id, .. }
            | DaemonRequest::FollowLogCapture { request_id, .. }
            | DaemonRequest::StopLogCapture { request_id, .. }
            | DaemonRequest::ListResources { request_id }
            | DaemonRequest::AttachDebugger { request_id, .. }
            | DaemonRequest::DebugCommand { request_id, .. }
            | DaemonRequest::StopDebugSession { request_id, .. }
            | DaemonRequest::BridgeStatus { request_id }
            | DaemonRequest::ListTools { request_id, .. }
            | DaemonRequest::CallTool { request_id, .. } => *request_id,
        }
    }
}

/// Operation tags the router understands. A frame whose `type` tag is not in
/// this list is rejected as "not supported" rather than "malformed".
pub const KNOWN_OPERATIONS: &[&str] = &[
    "Connect",
    "Ping",
    "Status",
    "Shutdown",
    "GetLogs",
    "GetDefaults",
    "SetDefaults",
    "ClearDefaults",
    "StartLogCapture",
    "FollowLogCapture",
    "StopLogCapture",
    "ListResources",
    "AttachDebugger",
    "DebugCommand",
    "StopDebugSession",
    "BridgeStatus",
    "ListTools",
    "CallTool",
];

pub fn operation_is_known(tag: &str) -> bool {
    KNOWN_OPERATIONS.contains(&tag)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonResponse {
    Connected {
        request_id: Uuid,
        daemon_version: String,
        workspace_key: String,
    },
    Pong {
        request_id: Uuid,
    },
    Status {
        request_id: Uuid,
        status: DaemonStatusInfo,
    },
    ShuttingDown {
        request_id: Uuid,
    },
    Logs {
        request_id: Uuid,
        entries: Vec<LogEntry>,
    },
    Defaults {
        request_id: Uuid,
        defaults: SessionDefaults,
    },
    DefaultsUpdated {
        request_id: Uuid,
        defaults: SessionDefaults,
    },
    LogCaptureStarted {
        request_id: Uuid,
        resource: ResourceInfo,
        already_running: bool,
    },
    LogCaptureStopped {
        request_id: Uuid,
        resource_id: Uuid,
        was_active: bool,
    },
    Resources {
        request_id: Uuid,
        resources: Vec<ResourceInfo>,
    },
    DebuggerAttached {
        request_id: Uuid,
        resource: ResourceInfo,
    },
    DebugSessionStopped {
        request_id: Uuid,
        resource_id: Uuid,
        was_active: bool,
    },
    /// Acknowledges a streaming request; framed `StreamEvent`s follow on the
    /// same connection until an `End` event.
    StreamStarted {
        request_id: Uuid,
        resource_id: Uuid,
    },
    BridgeStatus {
        request_id: Uuid,
        status: BridgeStatus,
    },
    Tools {
        request_id: Uuid,
        tools: Vec<ToolDescriptor>,
    },
    ToolResult {
        request_id: Uuid,
        result: Value,
    },
    Error {
        request_id: Uuid,
        kind: ErrorKind,
        message: String,
    },
}

/// Framed events emitted after `StreamStarted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    Line {
        resource_id: Uuid,
        line: String,
    },
    DebugOutput {
        resource_id: Uuid,
        line: String,
    },
    End {
        resource_id: Uuid,
        reason: StreamEndReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEndReason {
    ResourceStopped,
    CommandCompleted,
    SubprocessExited,
    DaemonDraining,
}

/// Typed failure classes carried in error responses. Clients branch on the
/// kind, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidRequest,
    UnsupportedOperation,
    NotFound,
    DebugTargetBusy,
    BridgeUnavailable,
    Draining,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::UnsupportedOperation => "unsupported operation",
            ErrorKind::NotFound => "not found",
            ErrorKind::DebugTargetBusy => "debug target busy",
            ErrorKind::BridgeUnavailable => "bridge unavailable",
            ErrorKind::Draining => "daemon draining",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// Per-workspace user defaults applied when a build/run/test request omits
/// explicit overrides. All fields optional; `merge` applies set fields over
/// the current record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl SessionDefaults {
    pub fn merge(&mut self, patch: SessionDefaults) {
        if patch.project_path.is_some() {
            self.project_path = patch.project_path;
        }
        if patch.scheme.is_some() {
            self.scheme = patch.scheme;
        }
        if patch.configuration.is_some() {
            self.configuration = patch.configuration;
        }
        if patch.simulator.is_some() {
            self.simulator = patch.simulator;
        }
        if patch.device_id.is_some() {
            self.device_id = patch.device_id;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.project_path.is_none()
            && self.scheme.is_none()
            && self.configuration.is_none()
            && self.simulator.is_none()
            && self.device_id.is_none()
    }
}

/// What a log capture session tails. The logical key derived from a spec is
/// the idempotency unit: one subprocess per (device, subsystem, predicate).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCaptureSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
}

impl LogCaptureSpec {
    pub fn logical_key(&self) -> String {
        format!(
            "log:{}:{}:{}",
            self.device.as_deref().unwrap_or("-"),
            self.subsystem.as_deref().unwrap_or("-"),
            self.predicate.as_deref().unwrap_or("-"),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugTarget {
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
}

impl DebugTarget {
    pub fn logical_key(&self) -> String {
        format!("debug:{}", self.pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    LogCapture,
    DebugSession,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::LogCapture => f.write_str("log-capture"),
            ResourceKind::DebugSession => f.write_str("debug-session"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: Uuid,
    pub kind: ResourceKind,
    pub logical_key: String,
    pub created_at: String,
    pub active: bool,
    pub observers: usize,
}

/// Daemon lifecycle as observed through the control surface. `NotRunning` is
/// the absence of a daemon, so it never appears in a status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Starting,
    Ready,
    Draining,
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Ready => "ready",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatusInfo {
    pub lifecycle: LifecycleState,
    pub workspace_key: String,
    pub workspace_root: PathBuf,
    pub socket_path: String,
    pub uptime_secs: u64,
    pub active_connections: usize,
    pub resource_count: usize,
    pub total_requests: u64,
    pub version: String,
}

/// Bridge connection state machine observed through the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeState {
    Unknown,
    Discovering,
    Connected,
    Disconnected,
    Unavailable,
}

/// Point-in-time snapshot of the link to the external IDE tool bridge.
/// Rebuilt whole on every connect attempt; `connected == true` implies
/// `bridge_path` is set and `last_error` reflects only the latest attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub state: BridgeState,
    pub available: bool,
    pub workflow_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_path: Option<PathBuf>,
    pub xcode_running: bool,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_pid: Option<u32>,
    pub proxied_tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub sequence: u64,
    pub timestamp: String,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

pub struct MessageCodec;

impl MessageCodec {
    /// Length-prefixed (u32 BE) JSON encoding, shared by requests, responses
    /// and stream events.
    pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(msg)?;
        if json.len() > MAX_MESSAGE_SIZE {
            return Err(anyhow::anyhow!(
                "Message size {} exceeds maximum allowed size of {} bytes",
                json.len(),
                MAX_MESSAGE_SIZE
            ));
        }
        let mut encoded = Vec::with_capacity(4 + json.len());
        encoded.extend_from_slice(&(json.len() as u32).to_be_bytes());
        encoded.extend_from_slice(&json);
        Ok(encoded)
    }

    pub fn decode_request(bytes: &[u8]) -> Result<DaemonRequest> {
        let body = Self::frame_body(bytes)?;
        Ok(serde_json::from_slice(body)?)
    }

    pub fn decode_response(bytes: &[u8]) -> Result<DaemonResponse> {
        let body = Self::frame_body(bytes)?;
        Ok(serde_json::from_slice(body)?)
    }

    pub fn decode_event(bytes: &[u8]) -> Result<StreamEvent> {
        let body = Self::frame_body(bytes)?;
        Ok(serde_json::from_slice(body)?)
    }

    fn frame_body(bytes: &[u8]) -> Result<&[u8]> {
        if bytes.len() < 4 {
            return Err(anyhow::anyhow!("Message too short"));
        }
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(anyhow::anyhow!(
                "Message size {} exceeds maximum allowed size of {} bytes",
                len,
                MAX_MESSAGE_SIZE
            ));
        }
        if bytes.len() < 4 + len {
            return Err(anyhow::anyhow!("Incomplete message"));
        }
        Ok(&bytes[4..4 + len])
    }

    /// Read one framed message body with a timeout on each phase.
    pub async fn read_framed<R>(reader: &mut R, read_timeout: Duration) -> Result<Vec<u8>>
    where
        R: AsyncReadExt + Unpin,
    {
        let mut length_buf = [0u8; 4];
        timeout(read_timeout, reader.read_exact(&mut length_buf))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout reading message length"))?
            .map_err(|e| anyhow::anyhow!("Failed to read message length: {}", e))?;

        let message_len = u32::from_be_bytes(length_buf) as usize;
        if message_len > MAX_MESSAGE_SIZE {
            return Err(anyhow::anyhow!(
                "Message size {} exceeds maximum allowed size of {} bytes",
                message_len,
                MAX_MESSAGE_SIZE
            ));
        }

        let mut message_buf = vec![0u8; message_len];
        timeout(read_timeout, reader.read_exact(&mut message_buf))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout reading message body"))?
            .map_err(|e| anyhow::anyhow!("Failed to read message body: {}", e))?;

        Ok(message_buf)
    }

    /// Write one framed message with a timeout.
    pub async fn write_framed<W>(writer: &mut W, data: &[u8], write_timeout: Duration) -> Result<()>
    where
        W: AsyncWriteExt + Unpin,
    {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(anyhow::anyhow!(
                "Message size {} exceeds maximum allowed size of {} bytes",
                data.len(),
                MAX_MESSAGE_SIZE
            ));
        }
        let mut frame = Vec::with_capacity(4 + data.len());
        frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
        frame.extend_from_slice(data);

        timeout(write_timeout, writer.write_all(&frame))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout writing message"))?
            .map_err(|e| anyhow::anyhow!("Failed to write message: {}", e))?;
        timeout(write_timeout, writer.flush())
            .await
            .map_err(|_| anyhow::anyhow!("Timeout flushing message"))?
            .map_err(|e| anyhow::anyhow!("Failed to flush message: {}", e))?;
        Ok(())
    }
}
