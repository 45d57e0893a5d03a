use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::engine::TaskEngine;
use crate::errors::EngineResult;
use crate::logging::TaskLogger;
use crate::mbl;
use crate::remote::RemoteDesktopController;

/// Newline-delimited JSON request served by [`TaskServer`].
#[derive(Debug, Deserialize)]
struct Request {
    action: String,
    #[serde(default)]
    task: Option<String>,
    #[serde(default)]
    params: Option<HashMap<String, String>>,
}

/// TCP front end for the engine. One task runs at a time: a `run` request
/// arriving while another is in progress is rejected, not queued.
pub struct TaskServer {
    engine: Arc<TaskEngine>,
    controller: Arc<dyn RemoteDesktopController>,
    logger: Arc<dyn TaskLogger>,
    tasks_dir: PathBuf,
    bind: String,
    run_slot: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl TaskServer {
    pub fn new(
        engine: Arc<TaskEngine>,
        controller: Arc<dyn RemoteDesktopController>,
        logger: Arc<dyn TaskLogger>,
        tasks_dir: PathBuf,
        bind: String,
    ) -> Self {
        Self {
            engine,
            controller,
            logger,
            tasks_dir,
            bind,
            run_slot: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn serve(self: Arc<Self>) -> EngineResult<()> {
        let listener = TcpListener::bind(&self.bind).await?;
        self.serve_on(listener).await
    }

    /// Serves on an already-bound listener (lets callers pick port 0).
    pub async fn serve_on(self: Arc<Self>, listener: TcpListener) -> EngineResult<()> {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, tasks_dir = %self.tasks_dir.display(), "task server listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    tracing::debug!(peer = %peer, "client connected");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            tracing::warn!(peer = %peer, error = %e, "connection closed with error");
                        }
                    });
                }
            }
        }

        tracing::info!("task server stopped");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream) -> std::io::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<Request>(&line) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => json!({ "ok": false, "error": format!("malformed request: {e}") }),
            };
            let mut payload = response.to_string();
            payload.push('\n');
            write_half.write_all(payload.as_bytes()).await?;
            write_half.flush().await?;

            if self.shutdown.is_cancelled() {
                break;
            }
        }
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> serde_json::Value {
        tracing::info!(action = %request.action, task = ?request.task, "request received");
        match request.action.as_str() {
            "run" => self.handle_run(request).await,
            "status" => json!({ "ok": true, "status": self.engine.status() }),
            "list_tasks" => self.handle_list_tasks().await,
            "screenshot" => self.handle_screenshot().await,
            "reconnect" => self.handle_reconnect().await,
            "shutdown" => {
                self.shutdown.cancel();
                json!({ "ok": true })
            }
            other => json!({ "ok": false, "error": format!("unknown action '{other}'") }),
        }
    }

    async fn handle_run(&self, request: Request) -> serde_json::Value {
        let Some(name) = request.task else {
            return json!({ "ok": false, "error": "'run' requires a task name" });
        };
        // Task names address files in the tasks directory only.
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return json!({ "ok": false, "error": format!("invalid task name '{name}'") });
        }

        let Ok(guard) = self.run_slot.try_lock() else {
            return json!({ "ok": false, "error": "task already running" });
        };

        let file_name = format!("{name}.mbl");
        let path = self.tasks_dir.join(&file_name);
        let source = match tokio::fs::read_to_string(&path).await {
            Ok(source) => source,
            Err(e) => {
                return json!({ "ok": false, "error": format!("cannot read {}: {e}", path.display()) })
            }
        };

        let task = match mbl::parse_task(&source, &file_name) {
            Ok(task) => task,
            Err(e) => return json!({ "ok": false, "error": e.to_string() }),
        };

        let params = request.params.unwrap_or_default();
        let cancel = self.shutdown.child_token();
        let result = self.engine.execute(&task, params, cancel).await;
        drop(guard);

        json!({ "ok": true, "result": result })
    }

    async fn handle_list_tasks(&self) -> serde_json::Value {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.tasks_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                return json!({
                    "ok": false,
                    "error": format!("cannot read tasks dir {}: {e}", self.tasks_dir.display()),
                })
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "mbl") {
                if let Some(stem) = path.file_stem() {
                    names.push(stem.to_string_lossy().to_string());
                }
            }
        }
        names.sort();
        json!({ "ok": true, "tasks": names })
    }

    async fn handle_screenshot(&self) -> serde_json::Value {
        let token = self.shutdown.child_token();
        match self.controller.capture_screenshot(&token).await {
            Ok(png) => match self.logger.save_screenshot(&png, "manual").await {
                Some(path) => json!({ "ok": true, "path": path }),
                None => json!({ "ok": false, "error": "screenshot could not be saved" }),
            },
            Err(e) => json!({ "ok": false, "error": e.to_string() }),
        }
    }

    async fn handle_reconnect(&self) -> serde_json::Value {
        let token = self.shutdown.child_token();
        if let Err(e) = self.controller.disconnect().await {
            tracing::warn!(error = %e, "disconnect before reconnect failed");
        }
        match self.controller.connect(&token).await {
            Ok(()) => json!({ "ok": true }),
            Err(e) => json!({ "ok": false, "error": e.to_string() }),
        }
    }
}
