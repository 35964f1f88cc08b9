//! Unix socket server for the mount connector.
//!
//! Accepts connections and hands each one to its own [`ConnectionHandler`].
//! The server keeps no state across connections.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use connector_core::Config;
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::time::Instant;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandler, ConnectionLimits};
use crate::mount::MountLauncher;
use crate::session::SessionOptions;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    /// Lifetime of each connection from accept.
    pub idle_timeout: Duration,
    pub max_line_bytes: usize,
    pub channel_capacity: usize,
    pub session: SessionOptions,
}

impl ServerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            socket_path: config.daemon.socket_path.clone(),
            idle_timeout: config.daemon.idle_timeout(),
            max_line_bytes: config.daemon.max_line_bytes,
            channel_capacity: config.session.channel_capacity,
            session: SessionOptions::from(&config.session),
        }
    }

    #[must_use]
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    #[must_use]
    pub const fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Bound listener plus the launcher shared by all connections.
pub struct SocketServer {
    config: ServerConfig,
    listener: UnixListener,
    launcher: Arc<MountLauncher>,
}

impl SocketServer {
    /// Bind the socket, replacing a stale socket file and creating the parent
    /// directory as needed.
    pub fn bind(config: ServerConfig, launcher: Arc<MountLauncher>) -> Result<Self, ServerError> {
        let path = &config.socket_path;
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path).map_err(|source| ServerError::Bind {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "Listening on Unix socket");

        Ok(Self {
            config,
            listener,
            launcher,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Accept connections until `shutdown` fires, then remove the socket file.
    ///
    /// Open connections are cancelled through child tokens of `shutdown`.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let Self {
            config,
            listener,
            launcher,
        } = self;
        let mut incoming = UnixListenerStream::new(listener);

        loop {
            let stream = tokio::select! {
                () = shutdown.cancelled() => break,
                next = incoming.next() => match next {
                    Some(Ok(stream)) => stream,
                    Some(Err(e)) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                    None => break,
                },
            };

            let limits = ConnectionLimits {
                deadline: Instant::now() + config.idle_timeout,
                max_line_bytes: config.max_line_bytes,
                channel_capacity: config.channel_capacity,
            };
            let handler = ConnectionHandler::new(
                Arc::clone(&launcher),
                limits,
                config.session,
                shutdown.child_token(),
            );
            debug!(connection_id = %handler.id(), "Accepted connection");
            tokio::spawn(async move {
                // Outcome is logged by the handler.
                let _ = handler.run(stream).await;
            });
        }

        drop(incoming);
        info!("Socket server stopped");
        match std::fs::remove_file(&config.socket_path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mount::{HelperBinaries, HelperDirs};
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixStream;

    fn launcher(root: &Path) -> Arc<MountLauncher> {
        Arc::new(MountLauncher::new(
            HelperBinaries {
                filesystem_client: PathBuf::from("/bin/sh"),
                sync_tool: PathBuf::from("/bin/sh"),
            },
            HelperDirs {
                config_dir: root.join("config"),
                cache_dir: root.join("cache"),
                log_dir: root.join("log"),
            },
            "MountConnector/test".to_string(),
        ))
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket_and_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("connector.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "stale").unwrap();

        let config = ServerConfig::default().with_socket_path(&path);
        let server = SocketServer::bind(config, launcher(dir.path())).unwrap();
        assert_eq!(server.socket_path(), path);

        let fresh = dir.path().join("fresh").join("nested").join("c.sock");
        let config = ServerConfig::default().with_socket_path(&fresh);
        SocketServer::bind(config, launcher(dir.path())).unwrap();
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn serve_removes_socket_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connector.sock");
        let server = SocketServer::bind(
            ServerConfig::default().with_socket_path(&path),
            launcher(dir.path()),
        )
        .unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.serve(shutdown.clone()));
        UnixStream::connect(&path).await.unwrap();

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn connection_closed_at_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connector.sock");
        let config = ServerConfig::default()
            .with_socket_path(&path)
            .with_idle_timeout(Duration::from_millis(200));
        let server = SocketServer::bind(config, launcher(dir.path())).unwrap();

        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(shutdown.clone()));

        let mut client = UnixStream::connect(&path).await.unwrap();
        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(10), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn shutdown_cancels_open_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connector.sock");
        let server = SocketServer::bind(
            ServerConfig::default().with_socket_path(&path),
            launcher(dir.path()),
        )
        .unwrap();

        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(shutdown.clone()));
        let mut client = UnixStream::connect(&path).await.unwrap();
        // Let the server accept before shutting down.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(buf.is_empty());
    }
}
