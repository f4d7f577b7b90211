use crate::bridge::{BridgeError, BridgeManager};
use crate::catalog::ToolCatalog;
use crate::config::DaemonConfig;
use crate::ipc::{BindError, IpcListener, IpcStream};
use crate::logging::LogBuffer;
use crate::pid_lock::PidLock;
use crate::protocol::{
    operation_is_known, DaemonRequest, DaemonResponse, DaemonStatusInfo, ErrorKind,
    LifecycleState, MessageCodec, ResourceKind, StreamEndReason, StreamEvent,
};
use crate::registry::{AttachError, SessionRegistry, StopOutcome};
use crate::resource::{CaptureEvent, ManagedResource};
use crate::workspace_key::WorkspaceKey;
use anyhow::{Context, Result};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// A debug command is considered complete once its output has been quiet for
// this long. lldb has no end-of-output marker on its line protocol.
const DEBUG_OUTPUT_QUIET_PERIOD: Duration = Duration::from_millis(500);

/// Per-workspace daemon: lifecycle controller, accept loop and request
/// router over one Unix socket endpoint.
pub struct WorkspaceDaemon {
    config: Arc<DaemonConfig>,
    workspace: WorkspaceKey,
    socket_path: String,
    registry: Arc<SessionRegistry>,
    bridge: Arc<BridgeManager>,
    catalog: Arc<ToolCatalog>,
    log_buffer: LogBuffer,
    lifecycle: Arc<RwLock<LifecycleState>>,
    connections: Arc<DashMap<Uuid, Instant>>,
    connection_semaphore: Arc<Semaphore>,
    start_time: Instant,
    request_count: Arc<RwLock<u64>>,
    shutdown: Arc<RwLock<bool>>,
    last_activity: Arc<RwLock<Instant>>,
    pid_lock: Arc<Mutex<Option<PidLock>>>,
}

impl WorkspaceDaemon {
    pub fn new(
        workspace: WorkspaceKey,
        socket_path: String,
        config: DaemonConfig,
        log_buffer: LogBuffer,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let catalog = ToolCatalog::load(config.tool_manifest_override.as_deref())
            .context("failed to load tool manifest")?;
        let bridge = BridgeManager::new(Arc::clone(&config), catalog.has_workflow("ide-bridge"));

        Ok(Self {
            registry: Arc::new(SessionRegistry::new(Arc::clone(&config))),
            bridge: Arc::new(bridge),
            catalog: Arc::new(catalog),
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config,
            workspace,
            socket_path,
            log_buffer,
            lifecycle: Arc::new(RwLock::new(LifecycleState::Starting)),
            connections: Arc::new(DashMap::new()),
            start_time: Instant::now(),
            request_count: Arc::new(RwLock::new(0)),
            shutdown: Arc::new(RwLock::new(false)),
            last_activity: Arc::new(RwLock::new(Instant::now())),
            pid_lock: Arc::new(Mutex::new(None)),
        })
    }

    pub async fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.read().await
    }

    /// Run until shutdown. Losing the endpoint to an already-running daemon
    /// is a clean exit: the winner is the daemon clients should use.
    pub async fn run(&self) -> Result<()> {
        let mut lock = PidLock::new(&self.socket_path);
        if let Err(e) = lock.try_lock() {
            info!("Not starting, another instance holds the PID lock: {}", e);
            return Ok(());
        }
        *self.pid_lock.lock().await = Some(lock);

        let listener = match IpcListener::bind(&self.socket_path).await {
            Ok(l) => l,
            Err(BindError::AddrInUse(path)) => {
                info!("Endpoint {} already owned by a live daemon, exiting", path);
                self.release_pid_lock().await;
                return Ok(());
            }
            Err(BindError::Io(e)) => {
                self.release_pid_lock().await;
                return Err(e).context("failed to bind daemon endpoint");
            }
        };

        *self.lifecycle.write().await = LifecycleState::Ready;
        info!(
            "Daemon ready for workspace {} on {}",
            self.workspace, self.socket_path
        );

        // SIGTERM/SIGINT request a drain, same as a Shutdown request.
        {
            let shutdown = self.shutdown.clone();
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                *shutdown.write().await = true;
            });
        }

        let daemon = self.clone_refs();
        let idle_handle = tokio::spawn(async move {
            daemon.idle_checker().await;
        });

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok(stream) => {
                            let semaphore = self.connection_semaphore.clone();
                            match semaphore.try_acquire_owned() {
                                Ok(permit) => {
                                    let daemon = self.clone_refs();
                                    tokio::spawn(async move {
                                        let _permit = permit;
                                        if let Err(e) = daemon.handle_connection(stream).await {
                                            error!("Error handling connection: {}", e);
                                        }
                                    });
                                }
                                Err(_) => {
                                    warn!(
                                        "Connection limit reached ({}), rejecting client",
                                        self.config.max_connections
                                    );
                                    let io_timeout = self.config.io_timeout;
                                    tokio::spawn(async move {
                                        let (_reader, mut writer) = stream.into_split();
                                        let busy = error_response(
                                            Uuid::nil(),
                                            ErrorKind::Internal,
                                            "connection limit reached, try again later"
                                                .to_string(),
                                        );
                                        if let Ok(encoded) = serde_json::to_vec(&busy) {
                                            let _ = MessageCodec::write_framed(
                                                &mut writer,
                                                &encoded,
                                                io_timeout,
                                            )
                                            .await;
                                        }
                                    });
                                }
                            }
                        }
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                        }
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }

        idle_handle.abort();
        self.drain().await;
        drop(listener); // removes the socket file
        self.release_pid_lock().await;
        *self.lifecycle.write().await = LifecycleState::Stopped;
        info!("Daemon stopped");
        Ok(())
    }

    async fn drain(&self) {
        *self.lifecycle.write().await = LifecycleState::Draining;
        info!(
            "Draining {} resources with {:?} grace",
            self.registry.resource_count(),
            self.config.drain_grace
        );
        self.registry.drain_all().await;
    }

    async fn release_pid_lock(&self) {
        if let Some(mut lock) = self.pid_lock.lock().await.take() {
            if let Err(e) = lock.unlock() {
                warn!("Failed to release PID lock: {}", e);
            }
        }
    }

    /// Shut down once there have been no connections, no resources and no
    /// requests for the configured idle window.
    async fn idle_checker(&self) {
        loop {
            tokio::time::sleep(self.config.idle_check_interval).await;

            if *self.shutdown.read().await {
                break;
            }
            if !self.connections.is_empty() || self.registry.resource_count() > 0 {
                *self.last_activity.write().await = Instant::now();
                continue;
            }
            if self.last_activity.read().await.elapsed() >= self.config.idle_timeout {
                info!(
                    "Idle for {:?} with no connections or resources, shutting down",
                    self.config.idle_timeout
                );
                *self.shutdown.write().await = true;
                break;
            }
        }
    }

    async fn handle_connection(&self, stream: IpcStream) -> Result<()> {
        let client_id = Uuid::new_v4();
        debug!("New client connected: {}", client_id);
        self.connections.insert(client_id, Instant::now());

        let (mut reader, mut writer) = stream.into_split();

        loop {
            if *self.shutdown.read().await {
                break;
            }

            let message_data =
                match MessageCodec::read_framed(&mut reader, self.config.io_timeout).await {
                    Ok(data) => data,
                    Err(e) => {
                        let text = e.to_string();
                        if text.contains("Timeout") {
                            continue;
                        }
                        if text.contains("early eof")
                            || text.contains("UnexpectedEof")
                            || text.contains("Connection reset")
                            || text.contains("Broken pipe")
                        {
                            debug!("[{}] Client disconnected", client_id);
                        } else {
                            error!("[{}] Failed to read message: {}", client_id, e);
                        }
                        break;
                    }
                };

            self.connections.insert(client_id, Instant::now());
            *self.last_activity.write().await = Instant::now();
            *self.request_count.write().await += 1;

            // Tag check before typed decode so unknown operations get a
            // distinct answer from malformed known ones.
            let raw: Value = match serde_json::from_slice(&message_data) {
                Ok(v) => v,
                Err(e) => {
                    let response = error_response(
                        Uuid::nil(),
                        ErrorKind::InvalidRequest,
                        format!("malformed frame: {e}"),
                    );
                    if self.send_response(&mut writer, &response).await.is_err() {
                        break;
                    }
                    continue;
                }
            };
            let request_id = raw
                .get("request_id")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(Uuid::nil());
            let tag = raw
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if !operation_is_known(&tag) {
                let response = error_response(
                    request_id,
                    ErrorKind::UnsupportedOperation,
                    format!("operation {tag:?} is not supported by this daemon"),
                );
                if self.send_response(&mut writer, &response).await.is_err() {
                    break;
                }
                continue;
            }

            let request = match serde_json::from_value::<DaemonRequest>(raw) {
                Ok(r) => r,
                Err(e) => {
                    let response = error_response(
                        request_id,
                        ErrorKind::InvalidRequest,
                        format!("invalid {tag} payload: {e}"),
                    );
                    if self.send_response(&mut writer, &response).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match self.handle_request(request).await {
                RequestOutcome::Respond(response) => {
                    let shutdown_requested = matches!(response, DaemonResponse::ShuttingDown { .. });
                    if self.send_response(&mut writer, &response).await.is_err() {
                        break;
                    }
                    if shutdown_requested {
                        *self.shutdown.write().await = true;
                        break;
                    }
                }
                RequestOutcome::Stream(stream_job) => {
                    let keep_going = self.run_stream(&mut writer, stream_job).await;
                    if !keep_going {
                        break;
                    }
                }
            }
        }

        self.connections.remove(&client_id);
        *self.last_activity.write().await = Instant::now();
        debug!("Client disconnected: {}", client_id);
        Ok(())
    }

    async fn handle_request(&self, request: DaemonRequest) -> RequestOutcome {
        use DaemonRequest::*;

        // Once draining, only observation and shutdown still go through.
        if *self.lifecycle.read().await == LifecycleState::Draining
            && !matches!(
                request,
                Connect { .. } | Ping { .. } | Status { .. } | Shutdown { .. }
            )
        {
            return RequestOutcome::Respond(error_response(
                request.request_id(),
                ErrorKind::Draining,
                "daemon is draining, no new work accepted".to_string(),
            ));
        }

        match request {
            Connect { client_id } => RequestOutcome::Respond(DaemonResponse::Connected {
                request_id: client_id,
                daemon_version: env!("CARGO_PKG_VERSION").to_string(),
                workspace_key: self.workspace.as_str().to_string(),
            }),
            Ping { request_id } => RequestOutcome::Respond(DaemonResponse::Pong { request_id }),
            Status { request_id } => RequestOutcome::Respond(DaemonResponse::Status {
                request_id,
                status: self.status_info().await,
            }),
            Shutdown { request_id } => {
                info!("Shutdown requested");
                RequestOutcome::Respond(DaemonResponse::ShuttingDown { request_id })
            }
            GetLogs { request_id, lines } => RequestOutcome::Respond(DaemonResponse::Logs {
                request_id,
                entries: self.log_buffer.get_last(lines),
            }),

            GetDefaults { request_id } => RequestOutcome::Respond(DaemonResponse::Defaults {
                request_id,
                defaults: self.registry.get_defaults(),
            }),
            SetDefaults {
                request_id,
                defaults,
            } => RequestOutcome::Respond(DaemonResponse::DefaultsUpdated {
                request_id,
                defaults: self.registry.set_defaults(defaults),
            }),
            ClearDefaults { request_id } => {
                RequestOutcome::Respond(DaemonResponse::DefaultsUpdated {
                    request_id,
                    defaults: self.registry.clear_defaults(),
                })
            }

            StartLogCapture { request_id, spec } => {
                match self.registry.start_log_capture(&spec).await {
                    Ok((resource, already_running)) => {
                        RequestOutcome::Respond(DaemonResponse::LogCaptureStarted {
                            request_id,
                            resource,
                            already_running,
                        })
                    }
                    Err(e) => RequestOutcome::Respond(error_response(
                        request_id,
                        ErrorKind::Internal,
                        format!("failed to start log capture: {e}"),
                    )),
                }
            }
            FollowLogCapture {
                request_id,
                resource_id,
            } => match self.resource_of_kind(request_id, resource_id, ResourceKind::LogCapture) {
                Ok(resource) => RequestOutcome::Stream(StreamJob {
                    request_id,
                    resource,
                    mode: StreamMode::Follow,
                }),
                Err(response) => RequestOutcome::Respond(response),
            },
            StopLogCapture {
                request_id,
                resource_id,
            } => self
                .stop_resource(request_id, resource_id, ResourceKind::LogCapture)
                .await,
            ListResources { request_id } => RequestOutcome::Respond(DaemonResponse::Resources {
                request_id,
                resources: self.registry.list(),
            }),

            AttachDebugger { request_id, target } => {
                match self.registry.attach_debugger(&target).await {
                    Ok(resource) => RequestOutcome::Respond(DaemonResponse::DebuggerAttached {
                        request_id,
                        resource,
                    }),
                    Err(AttachError::TargetBusy(id)) => RequestOutcome::Respond(error_response(
                        request_id,
                        ErrorKind::DebugTargetBusy,
                        format!("pid {} already has debug session {}", target.pid, id),
                    )),
                    Err(AttachError::Spawn(e)) => RequestOutcome::Respond(error_response(
                        request_id,
                        ErrorKind::Internal,
                        format!("failed to attach debugger: {e}"),
                    )),
                }
            }
            DebugCommand {
                request_id,
                resource_id,
                command,
            } => match self.resource_of_kind(request_id, resource_id, ResourceKind::DebugSession) {
                Ok(resource) => RequestOutcome::Stream(StreamJob {
                    request_id,
                    resource,
                    mode: StreamMode::Command(command),
                }),
                Err(response) => RequestOutcome::Respond(response),
            },
            StopDebugSession {
                request_id,
                resource_id,
            } => self
                .stop_resource(request_id, resource_id, ResourceKind::DebugSession)
                .await,

            BridgeStatus { request_id } => RequestOutcome::Respond(DaemonResponse::BridgeStatus {
                request_id,
                status: self.bridge.status(),
            }),
            ListTools {
                request_id,
                workflow,
            } => self.list_tools(request_id, workflow.as_deref()).await,
            CallTool {
                request_id,
                name,
                arguments,
            } => match self.bridge.call_tool(&name, arguments).await {
                Ok(result) => RequestOutcome::Respond(DaemonResponse::ToolResult {
                    request_id,
                    result,
                }),
                Err(e) => RequestOutcome::Respond(bridge_error_response(request_id, e)),
            },
        }
    }

    async fn list_tools(&self, request_id: Uuid, workflow: Option<&str>) -> RequestOutcome {
        // The ide-bridge workflow is answered live by the bridge; everything
        // else comes from the static manifest.
        let tools = match workflow {
            Some("ide-bridge") => match self.bridge.list_tools().await {
                Ok(tools) => tools,
                Err(e) => return RequestOutcome::Respond(bridge_error_response(request_id, e)),
            },
            Some(w) => self.catalog.tools_for(w),
            None => self.catalog.all_tools(),
        };
        RequestOutcome::Respond(DaemonResponse::Tools { request_id, tools })
    }

    /// Resolve a resource id, insisting on the expected kind.
    fn resource_of_kind(
        &self,
        request_id: Uuid,
        resource_id: Uuid,
        kind: ResourceKind,
    ) -> Result<Arc<ManagedResource>, DaemonResponse> {
        match self.registry.get(resource_id) {
            Some(r) if r.kind == kind => Ok(r),
            Some(r) => Err(error_response(
                request_id,
                ErrorKind::InvalidRequest,
                format!("resource {resource_id} is a {}, expected {kind}", r.kind),
            )),
            None => Err(error_response(
                request_id,
                ErrorKind::NotFound,
                format!("no resource with id {resource_id}"),
            )),
        }
    }

    async fn stop_resource(
        &self,
        request_id: Uuid,
        resource_id: Uuid,
        kind: ResourceKind,
    ) -> RequestOutcome {
        if let Some(resource) = self.registry.get(resource_id) {
            if resource.kind != kind {
                return RequestOutcome::Respond(error_response(
                    request_id,
                    ErrorKind::InvalidRequest,
                    format!("resource {resource_id} is a {}, expected {kind}", resource.kind),
                ));
            }
        }
        match self.registry.stop(resource_id).await {
            Ok(StopOutcome::Stopped(was_active)) => {
                RequestOutcome::Respond(stopped_response(request_id, resource_id, kind, was_active))
            }
            // Duplicate stop is idempotent success, reported as not-active.
            Ok(StopOutcome::AlreadyStopped) => {
                RequestOutcome::Respond(stopped_response(request_id, resource_id, kind, false))
            }
            Ok(StopOutcome::NotFound) => RequestOutcome::Respond(error_response(
                request_id,
                ErrorKind::NotFound,
                format!("no resource with id {resource_id}"),
            )),
            Err(e) => RequestOutcome::Respond(error_response(
                request_id,
                ErrorKind::Internal,
                format!("failed to stop resource: {e}"),
            )),
        }
    }

    /// Drive one streaming response. Returns false when the connection
    /// should close (write failure).
    async fn run_stream(&self, writer: &mut OwnedWriteHalf, job: StreamJob) -> bool {
        let resource_id = job.resource.id;
        let mut events = job.resource.subscribe();

        let started = DaemonResponse::StreamStarted {
            request_id: job.request_id,
            resource_id,
        };
        if self.send_response(writer, &started).await.is_err() {
            self.finish_stream(&job, true);
            return false;
        }

        if let StreamMode::Command(command) = &job.mode {
            if let Err(e) = job.resource.send_command(command).await {
                let end = StreamEvent::End {
                    resource_id,
                    reason: StreamEndReason::SubprocessExited,
                };
                warn!("Failed to send debugger command: {}", e);
                let ok = self.send_event(writer, &end).await.is_ok();
                self.finish_stream(&job, !ok);
                return ok;
            }
        }

        let reason = loop {
            let next = match job.mode {
                // A command's output is done after a quiet period.
                StreamMode::Command(_) => {
                    match tokio::time::timeout(DEBUG_OUTPUT_QUIET_PERIOD, events.recv()).await {
                        Ok(r) => r,
                        Err(_) => break StreamEndReason::CommandCompleted,
                    }
                }
                StreamMode::Follow => {
                    match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
                        Ok(r) => r,
                        Err(_) => {
                            if *self.shutdown.read().await {
                                break StreamEndReason::DaemonDraining;
                            }
                            continue;
                        }
                    }
                }
            };

            match next {
                Ok(CaptureEvent::Line(line)) => {
                    let event = match job.mode {
                        StreamMode::Follow => StreamEvent::Line { resource_id, line },
                        StreamMode::Command(_) => StreamEvent::DebugOutput { resource_id, line },
                    };
                    if self.send_event(writer, &event).await.is_err() {
                        self.finish_stream(&job, true);
                        return false;
                    }
                }
                Ok(CaptureEvent::Eof) => {
                    break if self.registry.get(resource_id).is_some() {
                        StreamEndReason::SubprocessExited
                    } else {
                        StreamEndReason::ResourceStopped
                    };
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Stream observer lagged, dropped {} lines", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break StreamEndReason::SubprocessExited;
                }
            }
        };

        let end = StreamEvent::End {
            resource_id,
            reason,
        };
        let ok = self.send_event(writer, &end).await.is_ok();
        self.finish_stream(&job, !ok);
        ok
    }

    fn finish_stream(&self, job: &StreamJob, client_gone: bool) {
        let remaining = job.resource.unsubscribe();
        // A debug session whose last observer disconnects mid-command gets
        // its debugger interrupted so the command does not spin unobserved.
        // A command that ran to completion leaves the session untouched.
        if client_gone
            && job.resource.kind == ResourceKind::DebugSession
            && remaining == 0
            && job.resource.is_active()
            && matches!(job.mode, StreamMode::Command(_))
        {
            job.resource.interrupt();
        }
    }

    async fn status_info(&self) -> DaemonStatusInfo {
        DaemonStatusInfo {
            lifecycle: *self.lifecycle.read().await,
            workspace_key: self.workspace.as_str().to_string(),
            workspace_root: self.workspace.root().to_path_buf(),
            socket_path: self.socket_path.clone(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            active_connections: self.connections.len(),
            resource_count: self.registry.resource_count(),
            total_requests: *self.request_count.read().await,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn send_response(
        &self,
        writer: &mut OwnedWriteHalf,
        response: &DaemonResponse,
    ) -> Result<()> {
        let encoded = serde_json::to_vec(response)?;
        MessageCodec::write_framed(writer, &encoded, self.config.io_timeout).await
    }

    async fn send_event(&self, writer: &mut OwnedWriteHalf, event: &StreamEvent) -> Result<()> {
        let encoded = serde_json::to_vec(event)?;
        MessageCodec::write_framed(writer, &encoded, self.config.io_timeout).await
    }

    fn clone_refs(&self) -> Self {
        Self {
            config: self.config.clone(),
            workspace: self.workspace.clone(),
            socket_path: self.socket_path.clone(),
            registry: self.registry.clone(),
            bridge: self.bridge.clone(),
            catalog: self.catalog.clone(),
            log_buffer: self.log_buffer.clone(),
            lifecycle: self.lifecycle.clone(),
            connections: self.connections.clone(),
            connection_semaphore: self.connection_semaphore.clone(),
            start_time: self.start_time,
            request_count: self.request_count.clone(),
            shutdown: self.shutdown.clone(),
            last_activity: self.last_activity.clone(),
            pid_lock: self.pid_lock.clone(),
        }
    }
}

enum RequestOutcome {
    Respond(DaemonResponse),
    Stream(StreamJob),
}

struct StreamJob {
    request_id: Uuid,
    resource: Arc<ManagedResource>,
    mode: StreamMode,
}

enum StreamMode {
    Follow,
    Command(String),
}

fn error_response(request_id: Uuid, kind: ErrorKind, message: String) -> DaemonResponse {
    DaemonResponse::Error {
        request_id,
        kind,
        message,
    }
}

fn stopped_response(
    request_id: Uuid,
    resource_id: Uuid,
    kind: ResourceKind,
    was_active: bool,
) -> DaemonResponse {
    match kind {
        ResourceKind::LogCapture => DaemonResponse::LogCaptureStopped {
            request_id,
            resource_id,
            was_active,
        },
        ResourceKind::DebugSession => DaemonResponse::DebugSessionStopped {
            request_id,
            resource_id,
            was_active,
        },
    }
}

fn bridge_error_response(request_id: Uuid, error: BridgeError) -> DaemonResponse {
    let kind = match error {
        BridgeError::Rpc(_) => ErrorKind::Internal,
        _ => ErrorKind::BridgeUnavailable,
    };
    error_response(request_id, kind, error.to_string())
}
