use std::time::Duration;

/// Runtime knobs for one daemon instance. Every field has a built-in default
/// and an `XCD_*` environment override, read once at startup.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Shut down after this long with no connections and no live resources.
    pub idle_timeout: Duration,
    /// How often the idle checker wakes up.
    pub idle_check_interval: Duration,
    /// Grace period for in-flight requests and resource teardown during drain.
    pub drain_grace: Duration,
    /// Minimum wait between bridge reconnect attempts.
    pub bridge_backoff: Duration,
    /// Maximum concurrent client connections.
    pub max_connections: usize,
    /// Read/write timeout for a single framed message.
    pub io_timeout: Duration,
    /// Verbatim replacement for the log capture subprocess command line.
    /// When unset the simulator log-stream invocation is assembled from the
    /// capture spec; tests set this to a scripted producer.
    pub capture_command: Option<Vec<String>>,
    /// Verbatim replacement for the debugger subprocess command line.
    pub debugger_command: Option<Vec<String>>,
    /// Explicit bridge endpoint override; when unset the discovery path under
    /// the user's Xcode support directory is probed.
    pub bridge_socket_override: Option<String>,
    /// Explicit tool manifest override; when unset the embedded manifest is
    /// used.
    pub tool_manifest_override: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            idle_check_interval: Duration::from_secs(10),
            drain_grace: Duration::from_secs(3),
            bridge_backoff: Duration::from_secs(2),
            max_connections: 100,
            io_timeout: Duration::from_secs(30),
            capture_command: None,
            debugger_command: None,
            bridge_socket_override: None,
            tool_manifest_override: None,
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            idle_timeout: env_secs("XCD_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            idle_check_interval: env_secs("XCD_IDLE_CHECK_INTERVAL_SECS", defaults.idle_check_interval),
            drain_grace: env_secs("XCD_DRAIN_GRACE_SECS", defaults.drain_grace),
            bridge_backoff: env_millis("XCD_BRIDGE_BACKOFF_MS", defaults.bridge_backoff),
            max_connections: std::env::var("XCD_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            io_timeout: env_secs("XCD_IO_TIMEOUT_SECS", defaults.io_timeout),
            capture_command: env_command("XCD_CAPTURE_COMMAND"),
            debugger_command: env_command("XCD_DEBUGGER_COMMAND"),
            bridge_socket_override: std::env::var("XCD_BRIDGE_SOCKET").ok(),
            tool_manifest_override: std::env::var("XCD_TOOL_MANIFEST").ok(),
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

// Whitespace-split; command overrides never need quoted arguments.
fn env_command(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().and_then(|v| split_command(&v))
}

fn split_command(value: &str) -> Option<Vec<String>> {
    let parts: Vec<String> = value.split_whitespace().map(str::to_string).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}
