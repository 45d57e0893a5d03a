pub mod client;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::EngineResult;

pub use client::HttpVisionClient;

/// One completed vision model call.
#[derive(Debug, Clone)]
pub struct VisionReply {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    pub duration: Duration,
}

impl VisionReply {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Screenshot-in, text-out interface to the vision model.
#[async_trait]
pub trait VisionModelClient: Send + Sync {
    /// Sends one PNG screenshot and one instruction prompt, returning the
    /// model's raw text together with token usage.
    async fn send(
        &self,
        png: &[u8],
        prompt: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<VisionReply>;
}
