use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use common::error::AppError;
use common::events::AtlasEvent;

use crate::router::DaemonRouter;
use crate::rpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PARSE_ERROR};

/// Newline-delimited JSON-RPC 2.0 over a Unix socket, with an optional TCP
/// listener. Every connection also receives `atlas.event` notifications.
pub struct DaemonServer {
    router: Arc<DaemonRouter>,
}

impl DaemonServer {
    pub fn new(router: Arc<DaemonRouter>) -> Arc<Self> {
        Arc::new(Self { router })
    }

    /// Bind and serve the Unix socket until the task is cancelled. A stale
    /// socket file from a dead daemon is removed first.
    pub async fn serve_unix(self: Arc<Self>, socket_path: PathBuf) -> Result<(), AppError> {
        if socket_path.exists() {
            tokio::fs::remove_file(&socket_path).await?;
        }
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        info!(socket = %socket_path.display(), "daemon listening on unix socket");
        self.router.events().emit(AtlasEvent::DaemonStarted {
            socket: socket_path.display().to_string(),
        });

        loop {
            let (stream, _) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.handle_connection(stream).await;
            });
        }
    }

    pub async fn serve_tcp(self: Arc<Self>, port: u16) -> Result<(), AppError> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        info!(port, "daemon listening on tcp");

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "tcp client connected");
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.handle_connection(stream).await;
            });
        }
    }

    /// One connection: a reader loop dispatching requests and an event pump
    /// forwarding bus events, both feeding a single writer task.
    pub async fn handle_connection<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);

        let writer = tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.write_all(b"\n").await.is_err() {
                    break;
                }
            }
        });

        // Connection-scoped event queue.
        let mut events = self.router.events().subscribe();
        let event_tx = out_tx.clone();
        let event_pump = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let params = match serde_json::to_value(&event) {
                    Ok(params) => params,
                    Err(_) => continue,
                };
                let notification = JsonRpcNotification::new("atlas.event", params);
                let Ok(line) = serde_json::to_string(&notification) else {
                    continue;
                };
                if event_tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                Ok(request) => self.router.handle(request).await,
                Err(err) => Some(JsonRpcResponse::failure(
                    serde_json::Value::Null,
                    PARSE_ERROR,
                    format!("parse error: {err}"),
                )),
            };

            if let Some(response) = response {
                match serde_json::to_string(&response) {
                    Ok(encoded) => {
                        if out_tx.send(encoded).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "response failed to encode"),
                }
            }
        }

        event_pump.abort();
        drop(out_tx);
        let _ = writer.await;
        debug!("client disconnected");
    }
}

/// Remove a socket file on shutdown; best-effort.
pub fn cleanup_socket(socket_path: &Path) {
    if socket_path.exists() {
        if let Err(err) = std::fs::remove_file(socket_path) {
            warn!(socket = %socket_path.display(), error = %err, "socket cleanup failed");
        }
    }
}
