use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::mbl::Action;

/// Best-effort task log sink. The engine fires and forgets; implementations
/// must never let logging failures reach the execution path.
#[async_trait]
pub trait TaskLogger: Send + Sync {
    /// Opens a fresh log for one task run, returning its path if one exists.
    async fn start_task_log(&self, task_name: &str) -> Option<PathBuf>;

    async fn log_task_start(&self, task_name: &str, parameters: &HashMap<String, String>);

    async fn log_step_start(&self, index: usize, description: &str);

    async fn log_step_complete(&self, index: usize, description: &str);

    async fn log_action(&self, action: &Action, detail: &str);

    async fn log_task_complete(&self, success: bool, error: Option<&str>);

    /// Persists a screenshot and returns its path if one was written.
    async fn save_screenshot(&self, png: &[u8], prefix: &str) -> Option<PathBuf>;

    async fn flush(&self);
}

#[derive(Debug, Serialize)]
struct LogEntry {
    ts: i64,
    kind: &'static str,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    data: serde_json::Value,
}

struct LogState {
    file_path: Option<PathBuf>,
    pending: Vec<LogEntry>,
}

/// Writes per-task JSONL logs and screenshot PNGs under a base directory.
pub struct FileTaskLogger {
    directory: PathBuf,
    state: Mutex<LogState>,
}

impl FileTaskLogger {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            state: Mutex::new(LogState {
                file_path: None,
                pending: Vec::new(),
            }),
        }
    }

    async fn push(&self, kind: &'static str, data: serde_json::Value) {
        let mut state = self.state.lock().await;
        state.pending.push(LogEntry {
            ts: Utc::now().timestamp_millis(),
            kind,
            data,
        });
    }

    async fn write_pending(state: &mut LogState) {
        let Some(path) = state.file_path.clone() else {
            state.pending.clear();
            return;
        };
        if state.pending.is_empty() {
            return;
        }
        let mut buffer = String::new();
        for entry in state.pending.drain(..) {
            match serde_json::to_string(&entry) {
                Ok(line) => {
                    buffer.push_str(&line);
                    buffer.push('\n');
                }
                Err(e) => tracing::warn!(error = %e, "skipping unserialisable log entry"),
            }
        }
        let result = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;
        match result {
            Ok(mut file) => {
                if let Err(e) = file.write_all(buffer.as_bytes()).await {
                    tracing::warn!(error = %e, path = %path.display(), "task log write failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, path = %path.display(), "task log open failed"),
        }
    }

    fn sanitize(name: &str) -> String {
        name.chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }
}

#[async_trait]
impl TaskLogger for FileTaskLogger {
    async fn start_task_log(&self, task_name: &str) -> Option<PathBuf> {
        if let Err(e) = tokio::fs::create_dir_all(&self.directory).await {
            tracing::warn!(error = %e, dir = %self.directory.display(), "cannot create log directory");
            return None;
        }
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let file_name = format!("{}_{stamp}.jsonl", Self::sanitize(task_name));
        let path = self.directory.join(file_name);

        let mut state = self.state.lock().await;
        state.file_path = Some(path.clone());
        state.pending.clear();
        Some(path)
    }

    async fn log_task_start(&self, task_name: &str, parameters: &HashMap<String, String>) {
        self.push(
            "task_start",
            serde_json::json!({ "task": task_name, "parameters": parameters }),
        )
        .await;
    }

    async fn log_step_start(&self, index: usize, description: &str) {
        self.push(
            "step_start",
            serde_json::json!({ "index": index, "description": description }),
        )
        .await;
    }

    async fn log_step_complete(&self, index: usize, description: &str) {
        self.push(
            "step_complete",
            serde_json::json!({ "index": index, "description": description }),
        )
        .await;
    }

    async fn log_action(&self, action: &Action, detail: &str) {
        self.push(
            "action",
            serde_json::json!({ "verb": action.verb(), "detail": detail }),
        )
        .await;
    }

    async fn log_task_complete(&self, success: bool, error: Option<&str>) {
        self.push(
            "task_complete",
            serde_json::json!({ "success": success, "error": error }),
        )
        .await;
    }

    async fn save_screenshot(&self, png: &[u8], prefix: &str) -> Option<PathBuf> {
        let dir = self.directory.join("screenshots");
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            tracing::warn!(error = %e, dir = %dir.display(), "cannot create screenshot directory");
            return None;
        }
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%3f");
        let path = dir.join(format!("{}_{stamp}.png", Self::sanitize(prefix)));
        match tokio::fs::write(&path, png).await {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "screenshot write failed");
                None
            }
        }
    }

    async fn flush(&self) {
        let mut state = self.state.lock().await;
        Self::write_pending(&mut state).await;
    }
}

impl FileTaskLogger {
    /// Directory screenshots and logs are written beneath.
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("mblrun-log-test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn writes_jsonl_on_flush() {
        let dir = temp_dir();
        let logger = FileTaskLogger::new(&dir);

        let path = logger.start_task_log("Invoice Entry").await.unwrap();
        logger.log_task_start("Invoice Entry", &HashMap::new()).await;
        logger.log_step_start(0, "open form").await;
        logger.log_task_complete(true, None).await;
        logger.flush().await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "task_start");
        assert_eq!(first["data"]["task"], "Invoice Entry");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn screenshot_paths_are_unique_per_call() {
        let dir = temp_dir();
        let logger = FileTaskLogger::new(&dir);
        let _ = logger.start_task_log("t").await;

        let a = logger.save_screenshot(b"png-a", "step").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let b = logger.save_screenshot(b"png-b", "step").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(tokio::fs::read(&a).await.unwrap(), b"png-a");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn task_name_is_sanitised_in_file_name() {
        let dir = temp_dir();
        let logger = FileTaskLogger::new(&dir);
        let path = logger.start_task_log("a/b:c").await.unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("a_b_c_"));
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
