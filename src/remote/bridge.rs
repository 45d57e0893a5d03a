use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::RemoteConfig;
use crate::errors::{EngineError, EngineResult};
use crate::remote::RemoteDesktopController;

/// Production [`RemoteDesktopController`] speaking newline-delimited JSON
/// to a remote-desktop bridge daemon.
///
/// Requests look like `{"op": "click", "x": 400, "y": 300}`; the daemon
/// answers one line per request, `{"ok": true, ...}` on success or
/// `{"ok": false, "error": "..."}` on failure.
pub struct BridgeController {
    config: RemoteConfig,
    typing_delay_ms: u64,
    conn: Mutex<Option<BridgeConn>>,
}

struct BridgeConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl BridgeController {
    pub fn new(config: RemoteConfig, typing_delay_ms: u64) -> Self {
        Self {
            config,
            typing_delay_ms,
            conn: Mutex::new(None),
        }
    }

    async fn request(
        &self,
        payload: serde_json::Value,
        cancel: &CancellationToken,
    ) -> EngineResult<serde_json::Value> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| EngineError::Device("bridge is not connected".into()))?;

        let mut line = serde_json::to_string(&payload)?;
        line.push('\n');

        let mut reply = String::new();
        let io = async {
            conn.writer.write_all(line.as_bytes()).await?;
            conn.writer.flush().await?;
            conn.reader.read_line(&mut reply).await?;
            Ok::<(), std::io::Error>(())
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                // The request/response framing is now ambiguous; force a
                // reconnect before the next use.
                *guard = None;
                return Err(EngineError::Cancelled);
            }
            result = io => {
                if let Err(e) = result {
                    *guard = None;
                    return Err(EngineError::Device(format!("bridge I/O failed: {e}")));
                }
            }
        }

        if reply.is_empty() {
            *guard = None;
            return Err(EngineError::Device("bridge closed the connection".into()));
        }

        let value: serde_json::Value = serde_json::from_str(reply.trim_end())
            .map_err(|e| EngineError::Device(format!("malformed bridge reply: {e}")))?;

        if value["ok"].as_bool() != Some(true) {
            let message = value["error"].as_str().unwrap_or("unknown bridge error");
            return Err(EngineError::Device(message.to_string()));
        }
        Ok(value)
    }
}

#[async_trait]
impl RemoteDesktopController for BridgeController {
    async fn connect(&self, cancel: &CancellationToken) -> EngineResult<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        tracing::info!(addr = %addr, "connecting to remote desktop bridge");

        let connect = tokio::time::timeout(
            Duration::from_secs(self.config.connect_timeout_seconds),
            TcpStream::connect(&addr),
        );
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = connect => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(EngineError::Device(format!("cannot reach bridge at {addr}: {e}")))
                }
                Err(_) => {
                    return Err(EngineError::Device(format!(
                        "bridge connect to {addr} timed out after {}s",
                        self.config.connect_timeout_seconds
                    )))
                }
            },
        };

        let (read_half, write_half) = stream.into_split();
        *self.conn.lock().await = Some(BridgeConn {
            reader: BufReader::new(read_half),
            writer: write_half,
        });

        self.request(json!({ "op": "connect" }), cancel).await?;
        tracing::info!(addr = %addr, "bridge session established");
        Ok(())
    }

    async fn disconnect(&self) -> EngineResult<()> {
        let connected = { self.conn.lock().await.is_some() };
        if connected {
            // Best effort: the daemon tears the session down on socket close anyway.
            let cancel = CancellationToken::new();
            let _ = self.request(json!({ "op": "disconnect" }), &cancel).await;
        }
        *self.conn.lock().await = None;
        tracing::info!("bridge disconnected");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    async fn capture_screenshot(&self, cancel: &CancellationToken) -> EngineResult<Vec<u8>> {
        let reply = self.request(json!({ "op": "screenshot" }), cancel).await?;
        let b64 = reply["png_base64"]
            .as_str()
            .ok_or_else(|| EngineError::Device("screenshot reply missing png_base64".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| EngineError::Device(format!("invalid screenshot payload: {e}")))
    }

    async fn click(&self, x: u32, y: u32, cancel: &CancellationToken) -> EngineResult<()> {
        self.request(json!({ "op": "click", "x": x, "y": y }), cancel)
            .await?;
        Ok(())
    }

    async fn double_click(&self, x: u32, y: u32, cancel: &CancellationToken) -> EngineResult<()> {
        self.request(json!({ "op": "double_click", "x": x, "y": y }), cancel)
            .await?;
        Ok(())
    }

    async fn right_click(&self, x: u32, y: u32, cancel: &CancellationToken) -> EngineResult<()> {
        self.request(json!({ "op": "right_click", "x": x, "y": y }), cancel)
            .await?;
        Ok(())
    }

    async fn send_keys(&self, text: &str, cancel: &CancellationToken) -> EngineResult<()> {
        self.request(
            json!({
                "op": "send_keys",
                "text": text,
                "typing_delay_ms": self.typing_delay_ms,
            }),
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn send_key_combo(&self, combo: &str, cancel: &CancellationToken) -> EngineResult<()> {
        self.request(json!({ "op": "send_key_combo", "combo": combo }), cancel)
            .await?;
        Ok(())
    }
}
