//! End-to-end tests running a daemon in-process against a tempdir endpoint.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};
use uuid::Uuid;
use xcd_daemon::config::DaemonConfig;
use xcd_daemon::daemon::WorkspaceDaemon;
use xcd_daemon::ipc::IpcStream;
use xcd_daemon::logging::LogBuffer;
use xcd_daemon::protocol::{
    DaemonRequest, DaemonResponse, ErrorKind, LogCaptureSpec, MessageCodec, SessionDefaults,
    StreamEvent,
};
use xcd_daemon::workspace_key;

const IO: Duration = Duration::from_secs(10);

struct TestDaemon {
    socket_path: String,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    _dir: TempDir,
}

async fn spawn_daemon(mut config: DaemonConfig) -> TestDaemon {
    let dir = TempDir::new().unwrap();
    let resolved = workspace_key::resolve(dir.path(), None).unwrap();
    let socket_path = dir.path().join("daemon.sock").to_string_lossy().to_string();

    if config.capture_command.is_none() {
        config.capture_command = Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "while true; do echo tick; sleep 0.05; done".to_string(),
        ]);
    }
    if config.debugger_command.is_none() {
        config.debugger_command = Some(vec!["/bin/cat".to_string()]);
    }

    let daemon = Arc::new(
        WorkspaceDaemon::new(resolved.key, socket_path.clone(), config, LogBuffer::new()).unwrap(),
    );
    let runner = Arc::clone(&daemon);
    let handle = tokio::spawn(async move { runner.run().await });

    // Wait for the endpoint to come up.
    for _ in 0..100 {
        if IpcStream::connect(&socket_path).await.is_ok() {
            return TestDaemon {
                socket_path,
                handle,
                _dir: dir,
            };
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("daemon did not bind its endpoint");
}

async fn connect(socket_path: &str) -> IpcStream {
    IpcStream::connect(socket_path).await.unwrap()
}

async fn send(stream: &mut IpcStream, request: &DaemonRequest) -> DaemonResponse {
    let encoded = serde_json::to_vec(request).unwrap();
    MessageCodec::write_framed(stream, &encoded, IO).await.unwrap();
    let data = MessageCodec::read_framed(stream, IO).await.unwrap();
    serde_json::from_slice(&data).unwrap()
}

async fn send_raw(stream: &mut IpcStream, body: &str) -> DaemonResponse {
    MessageCodec::write_framed(stream, body.as_bytes(), IO)
        .await
        .unwrap();
    let data = MessageCodec::read_framed(stream, IO).await.unwrap();
    serde_json::from_slice(&data).unwrap()
}

async fn read_event(stream: &mut IpcStream) -> StreamEvent {
    let data = MessageCodec::read_framed(stream, IO).await.unwrap();
    serde_json::from_slice(&data).unwrap()
}

fn rid() -> Uuid {
    Uuid::new_v4()
}

#[tokio::test]
async fn full_session_lifecycle() {
    let daemon = spawn_daemon(DaemonConfig {
        drain_grace: Duration::from_millis(500),
        ..DaemonConfig::default()
    })
    .await;

    // Client A connects and sets workspace defaults.
    let mut a = connect(&daemon.socket_path).await;
    match send(
        &mut a,
        &DaemonRequest::Connect {
            client_id: Uuid::new_v4(),
        },
    )
    .await
    {
        DaemonResponse::Connected { daemon_version, .. } => {
            assert_eq!(daemon_version, env!("CARGO_PKG_VERSION"));
        }
        other => panic!("expected Connected, got {other:?}"),
    }

    let defaults = SessionDefaults {
        scheme: Some("App".to_string()),
        simulator: Some("iPhone 16".to_string()),
        ..Default::default()
    };
    match send(
        &mut a,
        &DaemonRequest::SetDefaults {
            request_id: rid(),
            defaults,
        },
    )
    .await
    {
        DaemonResponse::DefaultsUpdated { defaults, .. } => {
            assert_eq!(defaults.scheme.as_deref(), Some("App"));
        }
        other => panic!("expected DefaultsUpdated, got {other:?}"),
    }

    // A starts a capture.
    let spec = LogCaptureSpec {
        subsystem: Some("com.example.app".to_string()),
        ..Default::default()
    };
    let resource_id = match send(
        &mut a,
        &DaemonRequest::StartLogCapture {
            request_id: rid(),
            spec: spec.clone(),
        },
    )
    .await
    {
        DaemonResponse::LogCaptureStarted {
            resource,
            already_running,
            ..
        } => {
            assert!(!already_running);
            resource.id
        }
        other => panic!("expected LogCaptureStarted, got {other:?}"),
    };

    // Client B sees A's defaults and joins the same capture.
    let mut b = connect(&daemon.socket_path).await;
    match send(&mut b, &DaemonRequest::GetDefaults { request_id: rid() }).await {
        DaemonResponse::Defaults { defaults, .. } => {
            assert_eq!(defaults.simulator.as_deref(), Some("iPhone 16"));
        }
        other => panic!("expected Defaults, got {other:?}"),
    }
    match send(
        &mut b,
        &DaemonRequest::StartLogCapture {
            request_id: rid(),
            spec,
        },
    )
    .await
    {
        DaemonResponse::LogCaptureStarted {
            resource,
            already_running,
            ..
        } => {
            assert!(already_running);
            assert_eq!(resource.id, resource_id);
        }
        other => panic!("expected LogCaptureStarted, got {other:?}"),
    }

    // B follows the capture and sees lines flowing.
    match send(
        &mut b,
        &DaemonRequest::FollowLogCapture {
            request_id: rid(),
            resource_id,
        },
    )
    .await
    {
        DaemonResponse::StreamStarted { .. } => {}
        other => panic!("expected StreamStarted, got {other:?}"),
    }
    match timeout(IO, read_event(&mut b)).await.unwrap() {
        StreamEvent::Line { line, .. } => assert_eq!(line, "tick"),
        other => panic!("expected Line, got {other:?}"),
    }
    // B disconnects mid-stream; the capture must survive.
    drop(b);
    sleep(Duration::from_millis(200)).await;

    match send(&mut a, &DaemonRequest::ListResources { request_id: rid() }).await {
        DaemonResponse::Resources { resources, .. } => {
            assert_eq!(resources.len(), 1);
            assert!(resources[0].active);
        }
        other => panic!("expected Resources, got {other:?}"),
    }

    // Stop is idempotent: active first, already-stopped after.
    match send(
        &mut a,
        &DaemonRequest::StopLogCapture {
            request_id: rid(),
            resource_id,
        },
    )
    .await
    {
        DaemonResponse::LogCaptureStopped { was_active, .. } => assert!(was_active),
        other => panic!("expected LogCaptureStopped, got {other:?}"),
    }
    match send(
        &mut a,
        &DaemonRequest::StopLogCapture {
            request_id: rid(),
            resource_id,
        },
    )
    .await
    {
        DaemonResponse::LogCaptureStopped { was_active, .. } => assert!(!was_active),
        other => panic!("expected LogCaptureStopped, got {other:?}"),
    }

    // Stopping an id that never existed is NotFound, not already-stopped.
    match send(
        &mut a,
        &DaemonRequest::StopLogCapture {
            request_id: rid(),
            resource_id: Uuid::new_v4(),
        },
    )
    .await
    {
        DaemonResponse::Error { kind, .. } => assert_eq!(kind, ErrorKind::NotFound),
        other => panic!("expected Error, got {other:?}"),
    }

    match send(&mut a, &DaemonRequest::Shutdown { request_id: rid() }).await {
        DaemonResponse::ShuttingDown { .. } => {}
        other => panic!("expected ShuttingDown, got {other:?}"),
    }
    timeout(Duration::from_secs(10), daemon.handle)
        .await
        .expect("daemon did not stop after shutdown")
        .unwrap()
        .unwrap();
    assert!(!std::path::Path::new(&daemon.socket_path).exists());
}

#[tokio::test]
async fn unknown_operations_and_malformed_payloads_are_rejected_per_request() {
    let daemon = spawn_daemon(DaemonConfig::default()).await;
    let mut stream = connect(&daemon.socket_path).await;

    let id = Uuid::new_v4();
    match send_raw(
        &mut stream,
        &format!(r#"{{"type":"FormatDisk","request_id":"{id}"}}"#),
    )
    .await
    {
        DaemonResponse::Error {
            request_id, kind, ..
        } => {
            assert_eq!(kind, ErrorKind::UnsupportedOperation);
            assert_eq!(request_id, id);
        }
        other => panic!("expected Error, got {other:?}"),
    }

    // Known tag, broken payload; the rejection names the operation.
    match send_raw(&mut stream, r#"{"type":"GetLogs","lines":"many"}"#).await {
        DaemonResponse::Error { kind, message, .. } => {
            assert_eq!(kind, ErrorKind::InvalidRequest);
            assert!(message.contains("GetLogs"));
        }
        other => panic!("expected Error, got {other:?}"),
    }

    // The connection survives both rejections.
    match send(&mut stream, &DaemonRequest::Ping { request_id: rid() }).await {
        DaemonResponse::Pong { .. } => {}
        other => panic!("expected Pong, got {other:?}"),
    }

    send(&mut stream, &DaemonRequest::Shutdown { request_id: rid() }).await;
}

#[tokio::test]
async fn debug_session_round_trip() {
    let daemon = spawn_daemon(DaemonConfig {
        drain_grace: Duration::from_millis(500),
        ..DaemonConfig::default()
    })
    .await;
    let mut stream = connect(&daemon.socket_path).await;

    let target = xcd_daemon::protocol::DebugTarget {
        pid: 7777,
        process_name: Some("TestApp".to_string()),
    };
    let resource_id = match send(
        &mut stream,
        &DaemonRequest::AttachDebugger {
            request_id: rid(),
            target: target.clone(),
        },
    )
    .await
    {
        DaemonResponse::DebuggerAttached { resource, .. } => resource.id,
        other => panic!("expected DebuggerAttached, got {other:?}"),
    };

    // Second attach to the same pid is refused as busy.
    match send(
        &mut stream,
        &DaemonRequest::AttachDebugger {
            request_id: rid(),
            target,
        },
    )
    .await
    {
        DaemonResponse::Error { kind, .. } => assert_eq!(kind, ErrorKind::DebugTargetBusy),
        other => panic!("expected Error, got {other:?}"),
    }

    // The scripted debugger (/bin/cat) echoes commands back as output.
    match send(
        &mut stream,
        &DaemonRequest::DebugCommand {
            request_id: rid(),
            resource_id,
            command: "breakpoint list".to_string(),
        },
    )
    .await
    {
        DaemonResponse::StreamStarted { .. } => {}
        other => panic!("expected StreamStarted, got {other:?}"),
    }
    match timeout(IO, read_event(&mut stream)).await.unwrap() {
        StreamEvent::DebugOutput { line, .. } => assert_eq!(line, "breakpoint list"),
        other => panic!("expected DebugOutput, got {other:?}"),
    }
    loop {
        match timeout(IO, read_event(&mut stream)).await.unwrap() {
            StreamEvent::End { reason, .. } => {
                assert_eq!(reason, xcd_daemon::protocol::StreamEndReason::CommandCompleted);
                break;
            }
            StreamEvent::DebugOutput { .. } => continue,
            other => panic!("expected End, got {other:?}"),
        }
    }

    match send(
        &mut stream,
        &DaemonRequest::StopDebugSession {
            request_id: rid(),
            resource_id,
        },
    )
    .await
    {
        DaemonResponse::DebugSessionStopped { was_active, .. } => assert!(was_active),
        other => panic!("expected DebugSessionStopped, got {other:?}"),
    }

    send(&mut stream, &DaemonRequest::Shutdown { request_id: rid() }).await;
}

#[tokio::test]
async fn sole_observer_disconnect_interrupts_running_debug_command() {
    // Scripted debugger that never finishes a command on its own: it streams
    // output until SIGINT, at which point it drops a marker file and exits.
    let marker_dir = TempDir::new().unwrap();
    let marker = marker_dir.path().join("interrupted");
    let script = format!(
        "trap 'touch {}; exit 0' INT; while true; do echo out; sleep 0.05; done",
        marker.display()
    );
    let daemon = spawn_daemon(DaemonConfig {
        debugger_command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
        drain_grace: Duration::from_millis(500),
        ..DaemonConfig::default()
    })
    .await;

    let mut control = connect(&daemon.socket_path).await;
    let resource_id = match send(
        &mut control,
        &DaemonRequest::AttachDebugger {
            request_id: rid(),
            target: xcd_daemon::protocol::DebugTarget {
                pid: 4321,
                process_name: None,
            },
        },
    )
    .await
    {
        DaemonResponse::DebuggerAttached { resource, .. } => resource.id,
        other => panic!("expected DebuggerAttached, got {other:?}"),
    };

    // A second connection runs a command, sees output, and vanishes
    // mid-stream.
    let mut observer = connect(&daemon.socket_path).await;
    match send(
        &mut observer,
        &DaemonRequest::DebugCommand {
            request_id: rid(),
            resource_id,
            command: "continue".to_string(),
        },
    )
    .await
    {
        DaemonResponse::StreamStarted { .. } => {}
        other => panic!("expected StreamStarted, got {other:?}"),
    }
    match timeout(IO, read_event(&mut observer)).await.unwrap() {
        StreamEvent::DebugOutput { line, .. } => assert_eq!(line, "out"),
        other => panic!("expected DebugOutput, got {other:?}"),
    }
    drop(observer);

    // The daemon notices the dead peer on its next event write and sends
    // SIGINT to the debugger, which leaves the marker behind.
    for _ in 0..100 {
        if marker.exists() {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(marker.exists());

    send(&mut control, &DaemonRequest::Shutdown { request_id: rid() }).await;
}

#[tokio::test]
async fn connection_over_the_limit_gets_a_typed_rejection() {
    let daemon = spawn_daemon(DaemonConfig {
        max_connections: 1,
        ..DaemonConfig::default()
    })
    .await;
    // Give the readiness probe's connection time to release its slot.
    sleep(Duration::from_millis(200)).await;

    let mut held = connect(&daemon.socket_path).await;
    match send(&mut held, &DaemonRequest::Ping { request_id: rid() }).await {
        DaemonResponse::Pong { .. } => {}
        other => panic!("expected Pong, got {other:?}"),
    }

    // The slot is taken; the next client gets an error frame, not a silently
    // dropped connection.
    let mut rejected = connect(&daemon.socket_path).await;
    let data = MessageCodec::read_framed(&mut rejected, IO).await.unwrap();
    match serde_json::from_slice::<DaemonResponse>(&data).unwrap() {
        DaemonResponse::Error { kind, message, .. } => {
            assert_eq!(kind, ErrorKind::Internal);
            assert!(message.contains("connection limit"));
        }
        other => panic!("expected Error, got {other:?}"),
    }

    send(&mut held, &DaemonRequest::Shutdown { request_id: rid() }).await;
}

#[tokio::test]
async fn idle_daemon_shuts_itself_down() {
    let daemon = spawn_daemon(DaemonConfig {
        idle_timeout: Duration::from_millis(500),
        idle_check_interval: Duration::from_millis(100),
        ..DaemonConfig::default()
    })
    .await;

    // No connections, no resources: the daemon should exit on its own and
    // remove its endpoint.
    let result = timeout(Duration::from_secs(10), daemon.handle)
        .await
        .expect("daemon did not shut down when idle")
        .unwrap();
    result.unwrap();
    assert!(!std::path::Path::new(&daemon.socket_path).exists());
}

#[tokio::test]
async fn second_daemon_loses_the_endpoint_race_cleanly() {
    let daemon = spawn_daemon(DaemonConfig::default()).await;

    // A second instance pointed at the same endpoint must exit cleanly
    // without disturbing the winner.
    let dir = TempDir::new().unwrap();
    let resolved = workspace_key::resolve(dir.path(), None).unwrap();
    let loser = WorkspaceDaemon::new(
        resolved.key,
        daemon.socket_path.clone(),
        DaemonConfig::default(),
        LogBuffer::new(),
    )
    .unwrap();
    timeout(Duration::from_secs(10), loser.run())
        .await
        .expect("loser should exit promptly")
        .unwrap();

    // Winner still answers.
    let mut stream = connect(&daemon.socket_path).await;
    match send(&mut stream, &DaemonRequest::Ping { request_id: rid() }).await {
        DaemonResponse::Pong { .. } => {}
        other => panic!("expected Pong, got {other:?}"),
    }

    send(&mut stream, &DaemonRequest::Shutdown { request_id: rid() }).await;
}
