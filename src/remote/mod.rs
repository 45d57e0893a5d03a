pub mod bridge;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::EngineResult;

pub use bridge::BridgeController;

/// Mouse and keyboard access to the automated desktop.
///
/// Every operation suspends and honours the cancel token; failures surface
/// as [`crate::errors::EngineError::Device`].
#[async_trait]
pub trait RemoteDesktopController: Send + Sync {
    async fn connect(&self, cancel: &CancellationToken) -> EngineResult<()>;

    async fn disconnect(&self) -> EngineResult<()>;

    async fn is_connected(&self) -> bool;

    /// Captures the full desktop as PNG bytes.
    async fn capture_screenshot(&self, cancel: &CancellationToken) -> EngineResult<Vec<u8>>;

    async fn click(&self, x: u32, y: u32, cancel: &CancellationToken) -> EngineResult<()>;

    async fn double_click(&self, x: u32, y: u32, cancel: &CancellationToken) -> EngineResult<()>;

    async fn right_click(&self, x: u32, y: u32, cancel: &CancellationToken) -> EngineResult<()>;

    /// Types literal text into the focused element.
    async fn send_keys(&self, text: &str, cancel: &CancellationToken) -> EngineResult<()>;

    /// Presses a key combo such as `Ctrl+S` or a single named key.
    async fn send_key_combo(&self, combo: &str, cancel: &CancellationToken) -> EngineResult<()>;
}
