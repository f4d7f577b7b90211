use crate::socket_path::socket_parent_dir;
use anyhow::Result;
use std::path::Path;
use thiserror::Error;
use tokio::net::{unix::OwnedReadHalf, unix::OwnedWriteHalf, UnixListener, UnixStream};
use tracing::{info, trace};

/// Bind failures that callers must tell apart: losing the endpoint-bind race
/// to a live daemon is not an error condition for the loser, it means the
/// winner is the daemon to use.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("endpoint {0} is already owned by a live daemon")]
    AddrInUse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct IpcListener {
    listener: UnixListener,
    path: String,
}

impl IpcListener {
    /// Bind the workspace endpoint. A socket file with a live listener behind
    /// it yields `BindError::AddrInUse`; a stale socket file (no listener) is
    /// removed and re-bound.
    pub async fn bind(path: &str) -> Result<Self, BindError> {
        if Path::new(path).exists() {
            match UnixStream::connect(path).await {
                Ok(_) => return Err(BindError::AddrInUse(path.to_string())),
                Err(_) => {
                    info!("Removing stale socket file: {}", path);
                    std::fs::remove_file(path)?;
                }
            }
        }

        if let Some(parent) = socket_parent_dir(path) {
            std::fs::create_dir_all(&parent)?;
        }

        let listener = match UnixListener::bind(path) {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                // Lost the bind race in the window between the stale check
                // and the bind call.
                return Err(BindError::AddrInUse(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            listener,
            path: path.to_string(),
        })
    }

    pub async fn accept(&self) -> Result<IpcStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(IpcStream { stream })
    }

    pub fn local_addr(&self) -> &str {
        &self.path
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            trace!("Socket cleanup for {} skipped: {}", self.path, e);
        } else {
            trace!("Removed socket file: {}", self.path);
        }
    }
}

pub struct IpcStream {
    stream: UnixStream,
}

impl IpcStream {
    pub async fn connect(path: &str) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self { stream })
    }

    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}

impl tokio::io::AsyncRead for IpcStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for IpcStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
