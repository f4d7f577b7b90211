use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use uuid::Uuid;
use xcd_daemon::protocol::{
    DaemonRequest, DaemonResponse, DebugTarget, LogCaptureSpec, SessionDefaults,
};
use xcd_daemon::{DaemonConfig, LogBuffer, MemoryLogLayer, WorkspaceDaemon};

mod cli;
mod client;

use cli::{
    BridgeCommand, Cli, Command, DaemonCommand, DebugCommand, DefaultsCommand, LogCommand,
    ToolsCommand,
};
use client::{discover_daemons, ClientError, DaemonClient};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config.clone();

    match cli.command {
        Command::Daemon {
            command: DaemonCommand::Run,
        } => run_daemon(config.as_deref()).await,
        command => {
            init_cli_logging();
            dispatch(config.as_deref(), command).await
        }
    }
}

/// Foreground daemon process. Logs go to the in-memory buffer (queryable via
/// `GetLogs`) and, when XCD_LOG_LEVEL is set, to stderr.
async fn run_daemon(config_path: Option<&Path>) -> Result<()> {
    let log_buffer = LogBuffer::new();
    let memory_layer = MemoryLogLayer::new(log_buffer.clone());

    let registry = tracing_subscriber::registry().with(memory_layer);
    if let Ok(level) = std::env::var("XCD_LOG_LEVEL") {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(EnvFilter::new(level)),
            )
            .init();
    } else {
        registry.init();
    }

    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    let resolved = xcd_daemon::workspace_key::resolve(&cwd, config_path)?;
    let config = DaemonConfig::from_env();

    let daemon = WorkspaceDaemon::new(
        resolved.key,
        resolved.socket_path,
        config,
        log_buffer,
    )?;
    daemon.run().await
}

fn init_cli_logging() {
    let filter = EnvFilter::try_from_env("XCD_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(config_path: Option<&Path>, command: Command) -> Result<()> {
    match command {
        Command::Daemon { command } => daemon_command(config_path, command).await,
        Command::Defaults { command } => defaults_command(config_path, command).await,
        Command::Log { command } => log_command(config_path, command).await,
        Command::Debug { command } => debug_command(config_path, command).await,
        Command::Bridge { command } => bridge_command(config_path, command).await,
        Command::Tools { command } => tools_command(config_path, command).await,
    }
}

fn client_for(config_path: Option<&Path>, auto_start: bool) -> Result<DaemonClient> {
    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    DaemonClient::for_workspace(&cwd, config_path, auto_start)
        .map_err(anyhow::Error::from)
}

async fn daemon_command(config_path: Option<&Path>, command: DaemonCommand) -> Result<()> {
    match command {
        DaemonCommand::Status => {
            let mut client = client_for(config_path, false)?;
            match client.status().await {
                Ok(status) => print_status(&status),
                Err(ClientError::NotRunning) => println!("daemon: not running"),
                Err(e) => return Err(e.into()),
            }
        }
        DaemonCommand::Start => {
            let mut client = client_for(config_path, true)?;
            client.connect().await?;
            let status = client.status().await?;
            println!("daemon: {} on {}", status.lifecycle, status.socket_path);
        }
        DaemonCommand::Stop => {
            let mut client = client_for(config_path, false)?;
            match client.shutdown().await {
                Ok(()) => println!("daemon: shutting down"),
                Err(ClientError::NotRunning) => println!("daemon: not running"),
                Err(e) => return Err(e.into()),
            }
        }
        DaemonCommand::Restart => {
            let mut client = client_for(config_path, false)?;
            match client.shutdown().await {
                Ok(()) => {
                    // Give the old daemon a moment to release the endpoint.
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
                Err(ClientError::NotRunning) => {}
                Err(e) => return Err(e.into()),
            }
            let mut client = client_for(config_path, true)?;
            client.connect().await?;
            let status = client.status().await?;
            println!("daemon: {} on {}", status.lifecycle, status.socket_path);
        }
        DaemonCommand::List => {
            let daemons = discover_daemons().await;
            if daemons.is_empty() {
                println!("no daemons found");
            }
            for daemon in daemons {
                match daemon.status {
                    Some(status) => println!(
                        "{}  {}  workspace {} ({} connections, {} resources)",
                        daemon.socket_path,
                        status.lifecycle,
                        status.workspace_key,
                        status.active_connections,
                        status.resource_count,
                    ),
                    None => println!("{}  (stale, not responding)", daemon.socket_path),
                }
            }
        }
        DaemonCommand::Logs { lines } => {
            let mut client = client_for(config_path, false)?;
            let response = client
                .request(DaemonRequest::GetLogs {
                    request_id: Uuid::new_v4(),
                    lines,
                })
                .await;
            match response {
                Ok(DaemonResponse::Logs { entries, .. }) => {
                    for entry in entries {
                        println!(
                            "{} {:>5} {} {}",
                            entry.timestamp, entry.level, entry.target, entry.message
                        );
                    }
                }
                Ok(other) => anyhow::bail!("unexpected response: {other:?}"),
                Err(ClientError::NotRunning) => println!("daemon: not running"),
                Err(e) => return Err(e.into()),
            }
        }
        DaemonCommand::Run => unreachable!("handled in main"),
    }
    Ok(())
}

fn print_status(status: &xcd_daemon::protocol::DaemonStatusInfo) {
    println!("daemon: {}", status.lifecycle);
    println!("  workspace:   {} ({})", status.workspace_key, status.workspace_root.display());
    println!("  endpoint:    {}", status.socket_path);
    println!("  version:     {}", status.version);
    println!("  uptime:      {}s", status.uptime_secs);
    println!("  connections: {}", status.active_connections);
    println!("  resources:   {}", status.resource_count);
    println!("  requests:    {}", status.total_requests);
}

async fn defaults_command(config_path: Option<&Path>, command: DefaultsCommand) -> Result<()> {
    let mut client = client_for(config_path, true)?;
    let defaults = match command {
        DefaultsCommand::Show => client.get_defaults().await?,
        DefaultsCommand::Set(args) => {
            client
                .set_defaults(SessionDefaults {
                    project_path: args.project,
                    scheme: args.scheme,
                    configuration: args.configuration,
                    simulator: args.simulator,
                    device_id: args.device,
                })
                .await?
        }
        DefaultsCommand::Clear => client.clear_defaults().await?,
    };
    if defaults.is_empty() {
        println!("defaults: (none)");
        return Ok(());
    }
    println!("defaults:");
    if let Some(p) = &defaults.project_path {
        println!("  project:       {}", p.display());
    }
    if let Some(s) = &defaults.scheme {
        println!("  scheme:        {s}");
    }
    if let Some(c) = &defaults.configuration {
        println!("  configuration: {c}");
    }
    if let Some(s) = &defaults.simulator {
        println!("  simulator:     {s}");
    }
    if let Some(d) = &defaults.device_id {
        println!("  device:        {d}");
    }
    Ok(())
}

async fn log_command(config_path: Option<&Path>, command: LogCommand) -> Result<()> {
    let mut client = client_for(config_path, true)?;
    match command {
        LogCommand::Start(args) => {
            let spec = LogCaptureSpec {
                device: args.device,
                subsystem: args.subsystem,
                predicate: args.predicate,
            };
            let (resource, already_running) = client.start_log_capture(spec).await?;
            if already_running {
                println!("joined existing capture {}", resource.id);
            } else {
                println!("started capture {}", resource.id);
            }
            if args.follow {
                follow_resource(&mut client, resource.id).await?;
            }
        }
        LogCommand::Tail { resource_id } => {
            follow_resource(&mut client, resource_id).await?;
        }
        LogCommand::Stop { resource_id } => {
            let response = client
                .request(DaemonRequest::StopLogCapture {
                    request_id: Uuid::new_v4(),
                    resource_id,
                })
                .await?;
            match response {
                DaemonResponse::LogCaptureStopped { was_active, .. } => {
                    if was_active {
                        println!("stopped capture {resource_id}");
                    } else {
                        println!("capture {resource_id} was already stopped");
                    }
                }
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        }
        LogCommand::List => {
            let response = client
                .request(DaemonRequest::ListResources {
                    request_id: Uuid::new_v4(),
                })
                .await?;
            match response {
                DaemonResponse::Resources { resources, .. } => {
                    if resources.is_empty() {
                        println!("no active resources");
                    }
                    for r in resources {
                        println!(
                            "{}  {}  {}  {}  {} observer(s)",
                            r.id,
                            r.kind,
                            r.logical_key,
                            if r.active { "active" } else { "stopped" },
                            r.observers,
                        );
                    }
                }
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        }
    }
    Ok(())
}

async fn follow_resource(client: &mut DaemonClient, resource_id: Uuid) -> Result<()> {
    let response = client
        .request(DaemonRequest::FollowLogCapture {
            request_id: Uuid::new_v4(),
            resource_id,
        })
        .await?;
    match response {
        DaemonResponse::StreamStarted { .. } => {
            let reason = client.follow_stream(|line| println!("{line}")).await?;
            eprintln!("stream ended: {reason:?}");
            Ok(())
        }
        other => anyhow::bail!("unexpected response: {other:?}"),
    }
}

async fn debug_command(config_path: Option<&Path>, command: DebugCommand) -> Result<()> {
    let mut client = client_for(config_path, true)?;
    match command {
        DebugCommand::Attach { pid, name } => {
            let resource = client
                .attach_debugger(DebugTarget {
                    pid,
                    process_name: name,
                })
                .await?;
            println!("attached debug session {} to pid {pid}", resource.id);
        }
        DebugCommand::Exec {
            resource_id,
            command,
        } => {
            let response = client
                .request(DaemonRequest::DebugCommand {
                    request_id: Uuid::new_v4(),
                    resource_id,
                    command: command.join(" "),
                })
                .await?;
            match response {
                DaemonResponse::StreamStarted { .. } => {
                    client.follow_stream(|line| println!("{line}")).await?;
                }
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        }
        DebugCommand::Stop { resource_id } => {
            let response = client
                .request(DaemonRequest::StopDebugSession {
                    request_id: Uuid::new_v4(),
                    resource_id,
                })
                .await?;
            match response {
                DaemonResponse::DebugSessionStopped { was_active, .. } => {
                    if was_active {
                        println!("stopped debug session {resource_id}");
                    } else {
                        println!("debug session {resource_id} was already stopped");
                    }
                }
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        }
    }
    Ok(())
}

async fn bridge_command(config_path: Option<&Path>, command: BridgeCommand) -> Result<()> {
    match command {
        BridgeCommand::Status => {
            let mut client = client_for(config_path, true)?;
            let response = client
                .request(DaemonRequest::BridgeStatus {
                    request_id: Uuid::new_v4(),
                })
                .await?;
            match response {
                DaemonResponse::BridgeStatus { status, .. } => {
                    println!("bridge: {:?}", status.state);
                    println!("  workflow enabled: {}", status.workflow_enabled);
                    println!("  connected:        {}", status.connected);
                    if let Some(p) = &status.bridge_path {
                        println!("  endpoint:         {}", p.display());
                    }
                    if let Some(pid) = status.bridge_pid {
                        println!("  bridge pid:       {pid}");
                    }
                    println!("  xcode running:    {}", status.xcode_running);
                    println!("  proxied tools:    {}", status.proxied_tool_count);
                    if let Some(e) = &status.last_error {
                        println!("  last error:       {e}");
                    }
                }
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        }
    }
    Ok(())
}

async fn tools_command(config_path: Option<&Path>, command: ToolsCommand) -> Result<()> {
    match command {
        ToolsCommand::List { workflow } => {
            // Static workflows are answered from the manifest without waking
            // a daemon; only the live bridge listing needs one.
            let tools = if workflow.as_deref() == Some("ide-bridge") {
                let mut client = client_for(config_path, true)?;
                let response = client
                    .request(DaemonRequest::ListTools {
                        request_id: Uuid::new_v4(),
                        workflow,
                    })
                    .await?;
                match response {
                    DaemonResponse::Tools { tools, .. } => tools,
                    other => anyhow::bail!("unexpected response: {other:?}"),
                }
            } else {
                let manifest = std::env::var("XCD_TOOL_MANIFEST").ok();
                let catalog = xcd_daemon::ToolCatalog::load(manifest.as_deref())?;
                match &workflow {
                    Some(w) => catalog.tools_for(w),
                    None => catalog.all_tools(),
                }
            };
            if tools.is_empty() {
                println!("no tools");
            }
            for tool in tools {
                match tool.description {
                    Some(d) => println!("{:<20} {d}", tool.name),
                    None => println!("{}", tool.name),
                }
            }
        }
        ToolsCommand::Call { name, args } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            let mut client = client_for(config_path, true)?;
            let result = client.call_tool(name, arguments).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}
