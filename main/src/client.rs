use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use common::error::AppError;

/// One-shot JSON-RPC call against a running daemon's Unix socket.
/// Interleaved `atlas.event` notifications are skipped.
pub async fn call(
    socket: &Path,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, AppError> {
    let stream = UnixStream::connect(socket).await.map_err(|err| {
        AppError::Configuration(format!(
            "no daemon at {}: {err}",
            socket.display()
        ))
    })?;
    let (read_half, mut write_half) = stream.into_split();

    let request = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });
    let mut encoded = serde_json::to_string(&request)
        .map_err(|err| AppError::Protocol(err.to_string()))?;
    encoded.push('\n');
    write_half.write_all(encoded.as_bytes()).await?;

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let value: serde_json::Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(_) => continue,
        };
        if value.get("method").is_some() {
            // Notification; keep waiting for our response.
            continue;
        }
        if value.get("id") != Some(&serde_json::json!(1)) {
            continue;
        }
        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown daemon error");
            return Err(AppError::Protocol(message.to_string()));
        }
        return Ok(value.get("result").cloned().unwrap_or(serde_json::Value::Null));
    }

    Err(AppError::Protocol(
        "daemon closed the connection without answering".to_string(),
    ))
}
