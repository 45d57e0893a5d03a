use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    pub vision: VisionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Timing knobs for the task interpreter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Applied to steps that declare no `timeout` of their own.
    #[serde(default = "default_expect_timeout")]
    pub default_expect_timeout_seconds: u64,
    /// Sleep lengths between `expect` attempts; attempts = 1 + len.
    #[serde(default = "default_retry_intervals")]
    pub expect_retry_intervals_ms: Vec<u64>,
    #[serde(default = "default_post_action_delay")]
    pub post_action_delay_ms: u64,
    #[serde(default = "default_post_click_delay")]
    pub post_click_delay_ms: u64,
    #[serde(default = "default_typing_delay")]
    pub typing_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_expect_timeout_seconds: default_expect_timeout(),
            expect_retry_intervals_ms: default_retry_intervals(),
            post_action_delay_ms: default_post_action_delay(),
            post_click_delay_ms: default_post_click_delay(),
            typing_delay_ms: default_typing_delay(),
        }
    }
}

fn default_expect_timeout() -> u64 {
    30
}

fn default_retry_intervals() -> Vec<u64> {
    vec![1000, 2000, 3000]
}

fn default_post_action_delay() -> u64 {
    500
}

fn default_post_click_delay() -> u64 {
    300
}

fn default_typing_delay() -> u64 {
    50
}

/// Connection settings for the remote desktop bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_bridge_host")]
    pub host: String,
    #[serde(default = "default_bridge_port")]
    pub port: u16,
    /// Desktop resolution, reported to the vision model in the system prompt.
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: default_bridge_host(),
            port: default_bridge_port(),
            width: default_width(),
            height: default_height(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

fn default_bridge_host() -> String {
    "127.0.0.1".into()
}

fn default_bridge_port() -> u16 {
    7601
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_connect_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VisionConfig {
    pub api_base: String,
    pub model: String,
    /// Optional API key stored in config.toml (falls back to env var MBLRUN_VISION_API_KEY).
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_temperature() -> f64 {
    0.0
}

impl VisionConfig {
    /// Key from config.toml, or the MBLRUN_VISION_API_KEY environment variable.
    pub fn resolve_api_key(&self) -> String {
        self.api_key
            .clone()
            .or_else(|| std::env::var("MBLRUN_VISION_API_KEY").ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub directory: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_dir(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_tasks_dir")]
    pub tasks_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            tasks_dir: default_tasks_dir(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7700".into()
}

fn default_tasks_dir() -> PathBuf {
    PathBuf::from("tasks")
}

/// Returns the path to an *existing* config.toml for reading.
fn find_config_path() -> EngineResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }
    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }
    Err(EngineError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

pub fn load_config() -> EngineResult<AppConfig> {
    let path = find_config_path()?;
    load_config_from(&path)
}

pub fn load_config_from(path: &PathBuf) -> EngineResult<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), model = %config.vision.model, "config loaded");
    Ok(config)
}

pub fn save_config(config: &AppConfig, path: &PathBuf) -> EngineResult<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [vision]
            api_base = "https://models.example.com/v1/chat/completions"
            model = "pixel-scout-2"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.engine.default_expect_timeout_seconds, 30);
        assert_eq!(cfg.engine.expect_retry_intervals_ms, vec![1000, 2000, 3000]);
        assert_eq!(cfg.remote.width, 1920);
        assert_eq!(cfg.vision.max_retries, 3);
        assert_eq!(cfg.server.bind, "127.0.0.1:7700");
    }

    #[test]
    fn engine_section_overrides() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [engine]
            default_expect_timeout_seconds = 5
            expect_retry_intervals_ms = [10, 10, 10]

            [vision]
            api_base = "http://localhost:9000"
            model = "m"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.engine.default_expect_timeout_seconds, 5);
        assert_eq!(cfg.engine.expect_retry_intervals_ms, vec![10, 10, 10]);
        assert_eq!(cfg.engine.post_click_delay_ms, 300);
    }
}
