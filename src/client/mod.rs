//! Client side of the workspace daemon: endpoint resolution, connection with
//! automatic daemon start, and stream following.

use anyhow::Result;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;
use xcd_daemon::ipc::IpcStream;
use xcd_daemon::pid_lock::is_process_running;
use xcd_daemon::protocol::{
    DaemonRequest, DaemonResponse, DaemonStatusInfo, DebugTarget, ErrorKind, LogCaptureSpec,
    MessageCodec, SessionDefaults, StreamEvent,
};
use xcd_daemon::socket_path::remove_socket_file;
use xcd_daemon::workspace_key::{self, ResolvedWorkspace, SOCKET_PREFIX, SOCKET_SUFFIX};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const IO_TIMEOUT: Duration = Duration::from_secs(30);
const STARTUP_LOCK_STALE: Duration = Duration::from_secs(30);

/// Client-visible failure classes. "The daemon could not be started" and "I
/// could not talk to a daemon" are different problems with different fixes,
/// so they are different variants.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot resolve workspace: {0}")]
    Addressing(String),
    #[error("daemon failed to start: {0}")]
    StartFailed(String),
    #[error("daemon did not become ready in time")]
    StartTimeout,
    #[error("daemon is not running")]
    NotRunning,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("{kind}: {message}")]
    Daemon { kind: ErrorKind, message: String },
    #[error("unexpected response from daemon: {0}")]
    Protocol(String),
}

/// Connection to the daemon serving one workspace.
pub struct DaemonClient {
    workspace: ResolvedWorkspace,
    stream: Option<IpcStream>,
    auto_start: bool,
}

impl DaemonClient {
    /// Resolve the workspace for `cwd` and prepare a client. No I/O against
    /// the daemon happens until the first request.
    pub fn for_workspace(
        cwd: &std::path::Path,
        explicit_config: Option<&std::path::Path>,
        auto_start: bool,
    ) -> Result<Self, ClientError> {
        let workspace = workspace_key::resolve(cwd, explicit_config)
            .map_err(|e| ClientError::Addressing(e.to_string()))?;
        Ok(Self {
            workspace,
            stream: None,
            auto_start,
        })
    }

    pub fn workspace(&self) -> &ResolvedWorkspace {
        &self.workspace
    }

    pub fn socket_path(&self) -> &str {
        &self.workspace.socket_path
    }

    /// Connect, auto-starting the daemon when allowed. Also restarts a daemon
    /// whose version no longer matches this binary.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.stream.is_some() {
            return Ok(());
        }

        match timeout(CONNECT_TIMEOUT, IpcStream::connect(self.socket_path())).await {
            Ok(Ok(stream)) => {
                self.stream = Some(stream);
                match self.handshake().await {
                    Ok(daemon_version) => {
                        if daemon_version == env!("CARGO_PKG_VERSION") {
                            return Ok(());
                        }
                        info!(
                            "Daemon version {} differs from client {}, restarting it",
                            daemon_version,
                            env!("CARGO_PKG_VERSION")
                        );
                        let _ = self.send_raw(shutdown_request()).await;
                        self.stream = None;
                        if !self.auto_start {
                            return Err(ClientError::NotRunning);
                        }
                        // The old daemon holds its PID lock through drain; a
                        // replacement spawned too early loses the lock and
                        // exits, so wait for the endpoint to go quiet first.
                        self.wait_for_daemon_exit().await;
                    }
                    Err(e) => {
                        warn!("Handshake with existing daemon failed: {}", e);
                        self.stream = None;
                    }
                }
            }
            Ok(Err(e)) => {
                debug!("No daemon at {}: {}", self.socket_path(), e);
            }
            Err(_) => {
                debug!("Connection attempt to {} timed out", self.socket_path());
            }
        }

        if !self.auto_start {
            return Err(ClientError::NotRunning);
        }

        self.start_daemon_detached().await?;

        // Quick attempts first, then slower ones; a cold daemon needs a
        // moment to bind its endpoint.
        let retry_delays = [100, 200, 300, 500, 1000, 1000, 2000, 2000, 3000];
        for delay_ms in retry_delays {
            sleep(Duration::from_millis(delay_ms)).await;

            match timeout(CONNECT_TIMEOUT, IpcStream::connect(self.socket_path())).await {
                Ok(Ok(stream)) => {
                    self.stream = Some(stream);
                    match self.handshake().await {
                        Ok(_) => return Ok(()),
                        Err(e) => {
                            debug!("Handshake with new daemon failed: {}", e);
                            self.stream = None;
                        }
                    }
                }
                Ok(Err(e)) => debug!("Daemon not ready yet: {}", e),
                Err(_) => debug!("Connection attempt timed out"),
            }
        }

        Err(ClientError::StartTimeout)
    }

    async fn handshake(&mut self) -> Result<String, ClientError> {
        let response = self
            .send_raw(DaemonRequest::Connect {
                client_id: Uuid::new_v4(),
            })
            .await?;
        match response {
            DaemonResponse::Connected { daemon_version, .. } => Ok(daemon_version),
            other => Err(ClientError::Protocol(format!(
                "expected Connected, got {other:?}"
            ))),
        }
    }

    /// Send one request and read one response, connecting first if needed.
    /// Daemon-reported errors become `ClientError::Daemon`.
    pub async fn request(&mut self, request: DaemonRequest) -> Result<DaemonResponse, ClientError> {
        self.connect().await?;
        match self.send_raw(request).await? {
            DaemonResponse::Error { kind, message, .. } => {
                Err(ClientError::Daemon { kind, message })
            }
            response => Ok(response),
        }
    }

    async fn send_raw(&mut self, request: DaemonRequest) -> Result<DaemonResponse, ClientError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ClientError::Connection("not connected".to_string()))?;
        let encoded = serde_json::to_vec(&request)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        MessageCodec::write_framed(stream, &encoded, IO_TIMEOUT)
            .await
            .map_err(|e| {
                self.stream = None;
                ClientError::Connection(e.to_string())
            })?;

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ClientError::Connection("not connected".to_string()))?;
        let data = MessageCodec::read_framed(stream, IO_TIMEOUT)
            .await
            .map_err(|e| {
                self.stream = None;
                ClientError::Connection(e.to_string())
            })?;
        serde_json::from_slice(&data).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    /// After a `StreamStarted` response, read framed events until `End`,
    /// feeding each line to the callback. Returns the end reason.
    pub async fn follow_stream<F>(
        &mut self,
        mut on_line: F,
    ) -> Result<xcd_daemon::protocol::StreamEndReason, ClientError>
    where
        F: FnMut(&str),
    {
        loop {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| ClientError::Connection("not connected".to_string()))?;
            // Long timeout per event: a quiet capture is not an error.
            let data = MessageCodec::read_framed(stream, Duration::from_secs(3600))
                .await
                .map_err(|e| {
                    self.stream = None;
                    ClientError::Connection(e.to_string())
                })?;
            let event: StreamEvent = serde_json::from_slice(&data)
                .map_err(|e| ClientError::Protocol(e.to_string()))?;
            match event {
                StreamEvent::Line { line, .. } | StreamEvent::DebugOutput { line, .. } => {
                    on_line(&line);
                }
                StreamEvent::End { reason, .. } => return Ok(reason),
            }
        }
    }

    // Typed convenience wrappers used by the CLI.

    pub async fn status(&mut self) -> Result<DaemonStatusInfo, ClientError> {
        match self.request(status_request()).await? {
            DaemonResponse::Status { status, .. } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), ClientError> {
        match self.request(shutdown_request()).await? {
            DaemonResponse::ShuttingDown { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_defaults(&mut self) -> Result<SessionDefaults, ClientError> {
        match self
            .request(DaemonRequest::GetDefaults {
                request_id: Uuid::new_v4(),
            })
            .await?
        {
            DaemonResponse::Defaults { defaults, .. } => Ok(defaults),
            other => Err(unexpected(other)),
        }
    }

    pub async fn set_defaults(
        &mut self,
        defaults: SessionDefaults,
    ) -> Result<SessionDefaults, ClientError> {
        match self
            .request(DaemonRequest::SetDefaults {
                request_id: Uuid::new_v4(),
                defaults,
            })
            .await?
        {
            DaemonResponse::DefaultsUpdated { defaults, .. } => Ok(defaults),
            other => Err(unexpected(other)),
        }
    }

    pub async fn clear_defaults(&mut self) -> Result<SessionDefaults, ClientError> {
        match self
            .request(DaemonRequest::ClearDefaults {
                request_id: Uuid::new_v4(),
            })
            .await?
        {
            DaemonResponse::DefaultsUpdated { defaults, .. } => Ok(defaults),
            other => Err(unexpected(other)),
        }
    }

    pub async fn start_log_capture(
        &mut self,
        spec: LogCaptureSpec,
    ) -> Result<(xcd_daemon::protocol::ResourceInfo, bool), ClientError> {
        match self
            .request(DaemonRequest::StartLogCapture {
                request_id: Uuid::new_v4(),
                spec,
            })
            .await?
        {
            DaemonResponse::LogCaptureStarted {
                resource,
                already_running,
                ..
            } => Ok((resource, already_running)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn attach_debugger(
        &mut self,
        target: DebugTarget,
    ) -> Result<xcd_daemon::protocol::ResourceInfo, ClientError> {
        match self
            .request(DaemonRequest::AttachDebugger {
                request_id: Uuid::new_v4(),
                target,
            })
            .await?
        {
            DaemonResponse::DebuggerAttached { resource, .. } => Ok(resource),
            other => Err(unexpected(other)),
        }
    }

    pub async fn call_tool(&mut self, name: String, arguments: Value) -> Result<Value, ClientError> {
        match self
            .request(DaemonRequest::CallTool {
                request_id: Uuid::new_v4(),
                name,
                arguments,
            })
            .await?
        {
            DaemonResponse::ToolResult { result, .. } => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    /// Bounded wait for a shut-down daemon to drop its endpoint and PID file.
    async fn wait_for_daemon_exit(&self) {
        let pid_path = format!("{}.pid", self.socket_path());
        for _ in 0..50 {
            if !endpoint_answers(self.socket_path()).await
                && !std::path::Path::new(&pid_path).exists()
            {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
        warn!("Old daemon did not release its endpoint in time");
    }

    /// Spawn `xcd daemon run` detached, coordinated through a startup lock so
    /// parallel clients elect a single starter.
    async fn start_daemon_detached(&self) -> Result<(), ClientError> {
        let _lock = acquire_startup_lock(self.socket_path())
            .map_err(|e| ClientError::StartFailed(e.to_string()))?;

        // The lock winner may find a daemon already started by the previous
        // holder, or the first handshake may have failed transiently. An
        // endpoint that still answers is authoritative; only a dead socket
        // file is reclaimed before spawning.
        if endpoint_answers(self.socket_path()).await {
            debug!("Endpoint already answering, skipping daemon spawn");
            return Ok(());
        }
        let _ = remove_socket_file(self.socket_path());

        let binary = std::env::current_exe()
            .map_err(|e| ClientError::StartFailed(format!("cannot locate own binary: {e}")))?;

        let mut cmd = std::process::Command::new(&binary);
        cmd.args(["daemon", "run"])
            .current_dir(self.workspace.key.root())
            .stdin(std::process::Stdio::null());
        if std::env::var("XCD_VERBOSE_SPAWN").ok().as_deref() == Some("1") {
            cmd.stdout(std::process::Stdio::inherit())
                .stderr(std::process::Stdio::inherit());
        } else {
            cmd.stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null());
        }
        cmd.spawn()
            .map_err(|e| ClientError::StartFailed(e.to_string()))?;

        info!("Started workspace daemon in background");
        Ok(())
    }
}

/// Whether anything accepts connections at the endpoint right now.
async fn endpoint_answers(socket_path: &str) -> bool {
    matches!(
        timeout(CONNECT_TIMEOUT, IpcStream::connect(socket_path)).await,
        Ok(Ok(_))
    )
}

fn unexpected(response: DaemonResponse) -> ClientError {
    ClientError::Protocol(format!("unexpected response: {response:?}"))
}

fn status_request() -> DaemonRequest {
    DaemonRequest::Status {
        request_id: Uuid::new_v4(),
    }
}

fn shutdown_request() -> DaemonRequest {
    DaemonRequest::Shutdown {
        request_id: Uuid::new_v4(),
    }
}

/// Startup lock file that cleans up on drop.
struct StartupLock {
    _file: std::fs::File,
    path: String,
}

impl Drop for StartupLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        debug!("Released daemon startup lock");
    }
}

fn read_pid_from_lock(lock_path: &str) -> Option<u32> {
    std::fs::read_to_string(lock_path)
        .ok()
        .and_then(|contents| contents.trim().parse::<u32>().ok())
}

fn lock_file_age(lock_path: &str) -> Option<Duration> {
    let metadata = std::fs::metadata(lock_path).ok()?;
    let modified = metadata.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn cleanup_stale_startup_lock(lock_path: &str) -> Result<bool> {
    let age = lock_file_age(lock_path);

    if let Some(pid) = read_pid_from_lock(lock_path) {
        if is_process_running(pid) {
            return Ok(false);
        }
        if age.map_or(true, |age| age > STARTUP_LOCK_STALE) {
            debug!("Removing stale startup lock left by PID {}", pid);
            std::fs::remove_file(lock_path)?;
            return Ok(true);
        }
        return Ok(false);
    }

    if age.map_or(false, |age| age > STARTUP_LOCK_STALE) {
        debug!("Removing stale startup lock with no PID information");
        std::fs::remove_file(lock_path)?;
        return Ok(true);
    }
    Ok(false)
}

fn acquire_startup_lock(socket_path: &str) -> Result<StartupLock> {
    let lock_path = format!("{socket_path}.start.lock");
    let mut start_time = Instant::now();
    let max_wait = Duration::from_secs(10);

    loop {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                debug!("Acquired daemon startup lock");
                return Ok(StartupLock {
                    _file: file,
                    path: lock_path,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if cleanup_stale_startup_lock(&lock_path)? {
                    start_time = Instant::now();
                    continue;
                }
                if start_time.elapsed() > max_wait {
                    anyhow::bail!("timeout waiting for daemon startup lock at {lock_path}");
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => anyhow::bail!("failed to acquire daemon startup lock: {e}"),
        }
    }
}

/// One entry per daemon socket found in the endpoint directory.
pub struct DiscoveredDaemon {
    pub socket_path: String,
    pub status: Option<DaemonStatusInfo>,
}

/// Enumerate daemon endpoints in the socket directory and probe each one.
/// Sockets that refuse connections are reported with no status (stale files).
pub async fn discover_daemons() -> Vec<DiscoveredDaemon> {
    let dir = std::env::temp_dir();
    let mut found = Vec::new();

    let entries = match std::fs::read_dir(&dir) {
        Ok(e) => e,
        Err(_) => return found,
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(SOCKET_PREFIX) || !name.ends_with(SOCKET_SUFFIX) {
            continue;
        }
        let socket_path = entry.path().to_string_lossy().to_string();
        let status = probe_daemon(&socket_path).await;
        found.push(DiscoveredDaemon {
            socket_path,
            status,
        });
    }
    found.sort_by(|a, b| a.socket_path.cmp(&b.socket_path));
    found
}

async fn probe_daemon(socket_path: &str) -> Option<DaemonStatusInfo> {
    let mut stream = timeout(Duration::from_secs(2), IpcStream::connect(socket_path))
        .await
        .ok()?
        .ok()?;
    let encoded = serde_json::to_vec(&status_request()).ok()?;
    MessageCodec::write_framed(&mut stream, &encoded, Duration::from_secs(2))
        .await
        .ok()?;
    let data = MessageCodec::read_framed(&mut stream, Duration::from_secs(2))
        .await
        .ok()?;
    match serde_json::from_slice(&data).ok()? {
        DaemonResponse::Status { status, .. } => Some(status),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_workspace_is_an_addressing_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        match DaemonClient::for_workspace(&missing, None, false) {
            Err(ClientError::Addressing(_)) => {}
            other => panic!("expected Addressing error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn no_daemon_and_no_autostart_is_not_running() {
        let dir = TempDir::new().unwrap();
        std::env::set_var(
            "XCD_SOCKET_PATH",
            dir.path().join("absent.sock").to_str().unwrap(),
        );
        let mut client = DaemonClient::for_workspace(dir.path(), None, false).unwrap();
        std::env::remove_var("XCD_SOCKET_PATH");
        match client.connect().await {
            Err(ClientError::NotRunning) => {}
            other => panic!("expected NotRunning, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn auto_start_leaves_a_live_endpoint_alone() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("xcd-live.sock");
        let _listener = tokio::net::UnixListener::bind(&socket).unwrap();

        std::env::set_var("XCD_SOCKET_PATH", socket.to_str().unwrap());
        let client = DaemonClient::for_workspace(dir.path(), None, true).unwrap();
        std::env::remove_var("XCD_SOCKET_PATH");

        client.start_daemon_detached().await.unwrap();
        assert!(socket.exists());
    }

    #[tokio::test]
    async fn only_a_dead_socket_file_is_reclaimable() {
        let dir = TempDir::new().unwrap();

        let live = dir.path().join("live.sock");
        let _listener = tokio::net::UnixListener::bind(&live).unwrap();
        assert!(endpoint_answers(live.to_str().unwrap()).await);

        let stale = dir.path().join("stale.sock");
        std::fs::write(&stale, b"").unwrap();
        assert!(!endpoint_answers(stale.to_str().unwrap()).await);
    }

    #[test]
    fn startup_lock_is_exclusive_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("xcd-test.sock");
        let socket = socket.to_str().unwrap();

        let lock_path = format!("{socket}.start.lock");
        {
            let _lock = acquire_startup_lock(socket).unwrap();
            assert!(std::path::Path::new(&lock_path).exists());
        }
        assert!(!std::path::Path::new(&lock_path).exists());
    }
}
