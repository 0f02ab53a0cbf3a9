//! Adapter interfaces for external notification systems.
//!
//! The approval gateway talks to humans through a `NotificationChannel`:
//! it sends a request and then waits for that request's verdict.

pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::ApprovalRequest;

pub use telegram::{TelegramChannel, TelegramConfig};

/// Trait for human notification channels
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Human-readable channel name
    fn name(&self) -> &str;

    /// Deliver an approval request
    async fn send(&self, request: &ApprovalRequest) -> Result<()>;

    /// Wait until a human answers `request_id`; `true` means approved.
    ///
    /// May wait forever; the caller bounds it with a timeout.
    async fn await_response(&self, request_id: Uuid) -> Result<bool>;
}
