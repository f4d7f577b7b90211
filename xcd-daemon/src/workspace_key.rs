use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Stable identifier for one project root (plus optional explicit config file).
///
/// Two invocations from the same directory always produce the same key and
/// therefore address the same daemon endpoint; different project roots get
/// different keys with cryptographically negligible collision probability
/// (truncated blake3 digest of the canonical paths).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceKey {
    key: String,
    root: PathBuf,
    config_path: Option<PathBuf>,
}

impl WorkspaceKey {
    /// Short hex digest used in endpoint paths and status output.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Canonicalized project root this key was derived from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

impl std::fmt::Display for WorkspaceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

/// Result of workspace resolution: the key plus the IPC endpoint it maps to.
#[derive(Debug, Clone)]
pub struct ResolvedWorkspace {
    pub key: WorkspaceKey,
    pub socket_path: String,
}

/// Resolve a workspace from the current working directory and an optional
/// explicit config file path.
///
/// Pure over its inputs and the filesystem's canonical path resolution
/// (symlinks resolved). The only error path is a nonexistent input path,
/// which is propagated.
pub fn resolve(cwd: &Path, explicit_config: Option<&Path>) -> Result<ResolvedWorkspace> {
    let root = cwd
        .canonicalize()
        .with_context(|| format!("cannot resolve workspace root {}", cwd.display()))?;

    let config_path = match explicit_config {
        Some(p) => Some(
            p.canonicalize()
                .with_context(|| format!("cannot resolve config path {}", p.display()))?,
        ),
        None => None,
    };

    let key = derive_key(&root, config_path.as_deref());
    let socket_path = socket_path_for_key(&key);

    Ok(ResolvedWorkspace {
        key: WorkspaceKey {
            key,
            root,
            config_path,
        },
        socket_path,
    })
}

fn derive_key(root: &Path, config_path: Option<&Path>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(root.as_os_str().as_encoded_bytes());
    hasher.update(&[0]);
    if let Some(config) = config_path {
        hasher.update(config.as_os_str().as_encoded_bytes());
    }
    let digest = hasher.finalize();
    digest.to_hex()[..16].to_string()
}

/// Endpoint path for a workspace key. `XCD_SOCKET_PATH` overrides the
/// derived location (used by tests and sandboxed environments).
pub fn socket_path_for_key(key: &str) -> String {
    if let Ok(p) = std::env::var("XCD_SOCKET_PATH") {
        return p;
    }
    std::env::temp_dir()
        .join(format!("xcd-{key}.sock"))
        .to_string_lossy()
        .to_string()
}

/// Prefix shared by all daemon sockets in the endpoint directory, used by
/// `daemon list` to enumerate live instances.
pub const SOCKET_PREFIX: &str = "xcd-";
pub const SOCKET_SUFFIX: &str = ".sock";
