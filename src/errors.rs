use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Task validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Missing input parameter '{0}'")]
    MissingInput(String),

    #[error("Element not found: \"{target}\" ({detail})")]
    ElementNotFound { target: String, detail: String },

    #[error("Expect failed: \"{description}\" did not match after {attempts} attempts (last response: {last_response})")]
    ExpectExhausted {
        description: String,
        attempts: usize,
        last_response: String,
    },

    #[error("Step \"{step}\" timed out after {seconds}s")]
    StepTimedOut { step: String, seconds: u64 },

    #[error("Task aborted: {0}")]
    Abort(String),

    #[error("Task was cancelled.")]
    Cancelled,

    #[error("Device error: {0}")]
    Device(String),

    #[error("Vision model error: {0}")]
    Model(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl serde::Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
