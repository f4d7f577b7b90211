use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xcd", version, about = "Workspace daemon and CLI front end for Apple platform developer tooling")]
pub struct Cli {
    /// Explicit project config file; changes the workspace identity.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Manage the per-workspace daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
    /// Show or edit session defaults for this workspace
    Defaults {
        #[command(subcommand)]
        command: DefaultsCommand,
    },
    /// Log capture sessions
    Log {
        #[command(subcommand)]
        command: LogCommand,
    },
    /// Debug sessions
    Debug {
        #[command(subcommand)]
        command: DebugCommand,
    },
    /// IDE bridge link
    Bridge {
        #[command(subcommand)]
        command: BridgeCommand,
    },
    /// Tool catalog and proxied tool calls
    Tools {
        #[command(subcommand)]
        command: ToolsCommand,
    },
}

#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Show the daemon's status for this workspace
    Status,
    /// Start the daemon for this workspace (detached)
    Start,
    /// Ask the daemon to shut down
    Stop,
    /// Stop the daemon and start a fresh one
    Restart,
    /// List all live daemons on this machine
    List,
    /// Print recent entries from the daemon's in-memory log buffer
    Logs {
        /// Number of entries to print
        #[arg(long, short = 'n', default_value_t = 200)]
        lines: usize,
    },
    /// Run the daemon in the foreground (used internally by auto-start)
    Run,
}

#[derive(Subcommand)]
pub enum DefaultsCommand {
    /// Print the current defaults
    Show,
    /// Set one or more default fields
    Set(DefaultsSetArgs),
    /// Clear all defaults
    Clear,
}

#[derive(Args)]
pub struct DefaultsSetArgs {
    #[arg(long)]
    pub project: Option<PathBuf>,
    #[arg(long)]
    pub scheme: Option<String>,
    #[arg(long)]
    pub configuration: Option<String>,
    #[arg(long)]
    pub simulator: Option<String>,
    #[arg(long)]
    pub device: Option<String>,
}

#[derive(Subcommand)]
pub enum LogCommand {
    /// Start (or join) a log capture session
    Start(LogStartArgs),
    /// Follow a capture session's lines until it ends
    Tail { resource_id: uuid::Uuid },
    /// Stop a capture session
    Stop { resource_id: uuid::Uuid },
    /// List resources managed by the daemon
    List,
}

#[derive(Args)]
pub struct LogStartArgs {
    /// Simulator/device identifier (defaults to the booted simulator)
    #[arg(long)]
    pub device: Option<String>,
    /// Filter to one subsystem
    #[arg(long)]
    pub subsystem: Option<String>,
    /// Raw log predicate
    #[arg(long)]
    pub predicate: Option<String>,
    /// Follow the capture after starting it
    #[arg(long, short = 'f')]
    pub follow: bool,
}

#[derive(Subcommand)]
pub enum DebugCommand {
    /// Attach a debugger to a running process
    Attach {
        #[arg(long)]
        pid: u32,
        #[arg(long)]
        name: Option<String>,
    },
    /// Execute a debugger command and stream its output
    Exec {
        resource_id: uuid::Uuid,
        /// Command passed to the debugger verbatim
        command: Vec<String>,
    },
    /// Detach and stop a debug session
    Stop { resource_id: uuid::Uuid },
}

#[derive(Subcommand)]
pub enum BridgeCommand {
    /// Show the IDE bridge connection status
    Status,
}

#[derive(Subcommand)]
pub enum ToolsCommand {
    /// List available tools, optionally for one workflow
    List {
        #[arg(long)]
        workflow: Option<String>,
    },
    /// Call a bridge-proxied tool with JSON arguments
    Call {
        name: String,
        /// JSON object of arguments
        #[arg(long, default_value = "{}")]
        args: String,
    },
}
