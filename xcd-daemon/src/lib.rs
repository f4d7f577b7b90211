pub mod bridge;
pub mod catalog;
pub mod config;
pub mod daemon;
pub mod ipc;
pub mod logging;
pub mod pid_lock;
pub mod protocol;
pub mod registry;
pub mod resource;
pub mod socket_path;
pub mod workspace_key;

pub use bridge::{BridgeError, BridgeManager};
pub use catalog::ToolCatalog;
pub use config::DaemonConfig;
pub use daemon::WorkspaceDaemon;
pub use ipc::{BindError, IpcListener, IpcStream};
pub use logging::{LogBuffer, MemoryLogLayer};
pub use pid_lock::PidLock;
pub use protocol::{
    DaemonRequest, DaemonResponse, ErrorKind, LifecycleState, MessageCodec, StreamEndReason,
    StreamEvent,
};
pub use registry::{SessionRegistry, StopOutcome};
pub use resource::ManagedResource;
pub use workspace_key::{resolve, ResolvedWorkspace, WorkspaceKey};
