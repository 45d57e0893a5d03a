use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use tokio_util::sync::CancellationToken;

use crate::config::VisionConfig;
use crate::errors::{EngineError, EngineResult};
use crate::vision::{VisionModelClient, VisionReply};

/// HTTPS client for an OpenAI-compatible vision endpoint.
///
/// Each call posts one system message and one user message carrying the
/// screenshot plus the instruction prompt, non-streaming. Rate-limit and
/// server errors are retried with exponential backoff up to
/// `max_retries` times; other HTTP failures propagate as model errors.
pub struct HttpVisionClient {
    api_base: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_retries: u32,
    system_prompt: String,
    client: reqwest::Client,
}

const RETRY_BASE_DELAY_MS: u64 = 500;

impl HttpVisionClient {
    pub fn new(config: &VisionConfig, system_prompt: String) -> Self {
        Self {
            api_base: config.api_base.clone(),
            api_key: config.resolve_api_key(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_retries: config.max_retries,
            system_prompt,
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, png: &[u8], prompt: &str) -> serde_json::Value {
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(png);
        serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {
                    "role": "system",
                    "content": self.system_prompt,
                },
                {
                    "role": "user",
                    "content": [
                        {
                            "type": "image_url",
                            "image_url": { "url": format!("data:image/png;base64,{image_b64}") },
                        },
                        { "type": "text", "text": prompt },
                    ],
                },
            ],
        })
    }

    async fn post_once(&self, body: &serde_json::Value) -> EngineResult<VisionReply> {
        let started = Instant::now();
        let response = self
            .client
            .post(&self.api_base)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let err_body = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(EngineError::Model(format!("retryable {status}: {err_body}")));
            }
            return Err(EngineError::Model(format!("{status}: {err_body}")));
        }

        let json: serde_json::Value = response.json().await?;
        let text = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        let input_tokens = json["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
        let output_tokens = json["usage"]["completion_tokens"].as_u64().unwrap_or(0);
        let model = json["model"].as_str().unwrap_or(&self.model).to_string();

        Ok(VisionReply {
            text,
            input_tokens,
            output_tokens,
            model,
            duration: started.elapsed(),
        })
    }

    fn is_retryable(error: &EngineError) -> bool {
        match error {
            EngineError::Model(message) => message.starts_with("retryable"),
            EngineError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

#[async_trait]
impl VisionModelClient for HttpVisionClient {
    async fn send(
        &self,
        png: &[u8],
        prompt: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<VisionReply> {
        let body = self.build_body(png, prompt);

        let mut attempt = 0u32;
        loop {
            let call = self.post_once(&body);
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                result = call => result,
            };

            match result {
                Ok(reply) => {
                    tracing::debug!(
                        model = %reply.model,
                        input_tokens = reply.input_tokens,
                        output_tokens = reply.output_tokens,
                        duration_ms = reply.duration.as_millis() as u64,
                        "vision model call complete"
                    );
                    return Ok(reply);
                }
                Err(e) if attempt < self.max_retries && Self::is_retryable(&e) => {
                    let delay = Duration::from_millis(RETRY_BASE_DELAY_MS << attempt);
                    attempt += 1;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "vision model call failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
