use crate::config::DaemonConfig;
use crate::protocol::{DebugTarget, LogCaptureSpec, ResourceInfo, ResourceKind};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

// Followers that fall this far behind start dropping lines rather than
// stalling the reader.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Output fan-out from a managed subprocess. `Eof` is sent exactly once, by
/// the reader task, when the subprocess closes stdout.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Line(String),
    Eof,
}

/// One supervised subprocess owned by the daemon: a log capture stream or an
/// interactive debug session.
///
/// All mutating operations go through `op_lock`, so stop/command/observer
/// changes on the same resource serialize while distinct resources proceed
/// in parallel.
pub struct ManagedResource {
    pub id: Uuid,
    pub kind: ResourceKind,
    pub logical_key: String,
    pub created_at: DateTime<Utc>,
    active: AtomicBool,
    observers: AtomicUsize,
    op_lock: Mutex<()>,
    events: broadcast::Sender<CaptureEvent>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    child_pid: Option<u32>,
}

impl ManagedResource {
    /// Spawn the log-stream subprocess for a capture spec.
    pub async fn spawn_log_capture(
        config: &DaemonConfig,
        spec: &LogCaptureSpec,
    ) -> Result<Arc<Self>> {
        let command_line = capture_command_line(config, spec);
        Self::spawn(
            ResourceKind::LogCapture,
            spec.logical_key(),
            command_line,
            false,
        )
        .await
    }

    /// Spawn an interactive debugger attached to the target process.
    pub async fn spawn_debug_session(
        config: &DaemonConfig,
        target: &DebugTarget,
    ) -> Result<Arc<Self>> {
        let command_line = debugger_command_line(config, target);
        Self::spawn(
            ResourceKind::DebugSession,
            target.logical_key(),
            command_line,
            true,
        )
        .await
    }

    async fn spawn(
        kind: ResourceKind,
        logical_key: String,
        command_line: Vec<String>,
        keep_stdin: bool,
    ) -> Result<Arc<Self>> {
        let (program, args) = command_line
            .split_first()
            .context("empty subprocess command line")?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if keep_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let child_pid = child.id();
        let stdout = child
            .stdout
            .take()
            .context("subprocess stdout not captured")?;
        let stdin = if keep_stdin { child.stdin.take() } else { None };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let resource = Arc::new(Self {
            id: Uuid::new_v4(),
            kind,
            logical_key,
            created_at: Utc::now(),
            active: AtomicBool::new(true),
            observers: AtomicUsize::new(0),
            op_lock: Mutex::new(()),
            events,
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(stdin),
            child_pid,
        });

        let reader = Arc::clone(&resource);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                // SendError just means nobody is following right now.
                let _ = reader.events.send(CaptureEvent::Line(line));
            }
            reader.active.store(false, Ordering::SeqCst);
            let _ = reader.events.send(CaptureEvent::Eof);
            tracing::debug!(
                "Subprocess output ended for {} resource {}",
                reader.kind,
                reader.id
            );
        });

        Ok(resource)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            kind: self.kind,
            logical_key: self.logical_key.clone(),
            created_at: self.created_at.to_rfc3339(),
            active: self.is_active(),
            observers: self.observers.load(Ordering::SeqCst),
        }
    }

    /// Register a follower and get a receiver positioned at the current tail.
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.observers.fetch_add(1, Ordering::SeqCst);
        self.events.subscribe()
    }

    /// Deregister a follower; returns the remaining observer count.
    pub fn unsubscribe(&self) -> usize {
        let previous = self.observers.fetch_sub(1, Ordering::SeqCst);
        previous.saturating_sub(1)
    }

    /// Interrupt the debugger subprocess (SIGINT), used when the last
    /// observer of a busy debug session disconnects. Only signals while the
    /// child slot still holds the process; once teardown has taken the child
    /// its PID may already belong to someone else.
    pub fn interrupt(&self) {
        let Ok(child) = self.child.try_lock() else {
            // Contended slot means a stop is already in flight.
            return;
        };
        if child.is_none() {
            return;
        }
        if let Some(pid) = self.child_pid {
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }
        }
    }

    /// Write one command line to the subprocess stdin (debug sessions only).
    pub async fn send_command(&self, command: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin
            .as_mut()
            .context("resource does not accept commands")?;
        stdin
            .write_all(command.as_bytes())
            .await
            .context("failed to write debugger command")?;
        stdin
            .write_all(b"\n")
            .await
            .context("failed to write debugger command")?;
        stdin.flush().await.context("failed to flush debugger stdin")?;
        Ok(())
    }

    /// Stop the subprocess: SIGTERM, bounded wait, then SIGKILL. Returns
    /// whether the resource was still active; a second stop is a no-op that
    /// reports `false`.
    pub async fn stop(&self, grace: Duration) -> Result<bool> {
        let _guard = self.op_lock.lock().await;
        let was_active = self.active.swap(false, Ordering::SeqCst);

        let mut child_slot = self.child.lock().await;
        if let Some(mut child) = child_slot.take() {
            terminate_child(&mut child, grace).await;
        }
        // Wake followers even if the reader task already sent its own Eof;
        // duplicates are harmless, a missing Eof is a hang.
        let _ = self.events.send(CaptureEvent::Eof);
        Ok(was_active)
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate_child(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => return,
            Err(_) => {
                tracing::warn!("Subprocess {} ignored SIGTERM, sending SIGKILL", pid);
            }
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn capture_command_line(config: &DaemonConfig, spec: &LogCaptureSpec) -> Vec<String> {
    if let Some(cmd) = &config.capture_command {
        return cmd.clone();
    }
    let device = spec.device.as_deref().unwrap_or("booted");
    let mut cmd: Vec<String> = [
        "xcrun", "simctl", "spawn", device, "log", "stream", "--style", "compact",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    if let Some(subsystem) = &spec.subsystem {
        cmd.push("--predicate".to_string());
        cmd.push(format!("subsystem == \"{subsystem}\""));
    }
    if let Some(predicate) = &spec.predicate {
        cmd.push("--predicate".to_string());
        cmd.push(predicate.clone());
    }
    cmd
}

fn debugger_command_line(config: &DaemonConfig, target: &DebugTarget) -> Vec<String> {
    if let Some(cmd) = &config.debugger_command {
        return cmd.clone();
    }
    vec![
        "lldb".to_string(),
        "--no-use-colors".to_string(),
        "-p".to_string(),
        target.pid.to_string(),
    ]
}
