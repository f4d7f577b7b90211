use std::path::PathBuf;

/// Check if a socket path exists on disk.
pub fn socket_exists(path: &str) -> bool {
    std::path::Path::new(path).exists()
}

/// Remove a socket file if present.
pub fn remove_socket_file(path: &str) -> std::io::Result<()> {
    if std::path::Path::new(path).exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

/// Parent directory of a socket file, for pre-bind directory creation.
pub fn socket_parent_dir(path: &str) -> Option<PathBuf> {
    std::path::Path::new(path).parent().map(|p| p.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn remove_missing_socket_is_ok() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.sock");
        assert!(remove_socket_file(path.to_str().unwrap()).is_ok());
    }

    #[test]
    fn remove_existing_socket_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("live.sock");
        std::fs::write(&path, b"").unwrap();
        let p = path.to_str().unwrap();
        assert!(socket_exists(p));
        remove_socket_file(p).unwrap();
        assert!(!socket_exists(p));
    }
}
