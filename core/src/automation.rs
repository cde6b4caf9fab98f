//! Collaborators that drive the desktop messaging client.
//!
//! Every call may block for an unbounded time; callers wrap them in
//! `tokio::time::timeout`.

use async_trait::async_trait;

use crate::error::CoreError;
use crate::models::{KillResult, NumberProbeResult, OpenRequest, OpenResult, ScreenshotVerification};

#[async_trait]
pub trait NumberProbe: Send + Sync {
    /// Checks whether `number` is reachable on the messaging network.
    async fn verify_number_presence(&self, number: &str) -> Result<NumberProbeResult, CoreError>;
}

#[async_trait]
pub trait MessagingAutomation: Send + Sync {
    /// Opens the client on a chat. With `simulate_paste` set, the
    /// implementation types and sends the text on its own schedule; only
    /// the immediate result comes back.
    async fn open_messaging_app(&self, request: &OpenRequest) -> Result<OpenResult, CoreError>;

    /// Compares the newest chat timestamp on screen against the clock.
    async fn verify_screenshot_timestamp(&self) -> Result<ScreenshotVerification, CoreError>;

    async fn kill_messaging_app(&self) -> Result<KillResult, CoreError>;
}
