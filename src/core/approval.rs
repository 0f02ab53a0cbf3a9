//! Human approval gateway.
//!
//! Sends an `ApprovalRequest` through a notification channel and waits a
//! bounded time for the verdict. A timeout resolves to "not approved";
//! callers that must treat it as an error use `require_approval`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adapters::NotificationChannel;
use crate::domain::{ApprovalRequest, ApprovalResponse};

use super::error::TaskError;
use super::event_bus::EventBus;

/// Which channel delivers approval requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Telegram,
    /// No channel: requests needing a human are reported, never sent
    #[default]
    None,
}

/// Channel settings; the bot token only comes from the environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(rename = "type", default)]
    pub kind: ChannelKind,

    /// Chat to post requests in (overridden by CARECREW_TELEGRAM_CHAT_ID)
    #[serde(default)]
    pub chat_id: Option<String>,
}

/// Approval settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Seconds to wait for a human (default: 3600)
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub channel: ChannelConfig,
}

fn default_timeout_seconds() -> u64 {
    3600
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            channel: ChannelConfig::default(),
        }
    }
}

/// Sends approval requests and waits for verdicts
pub struct ApprovalGateway {
    channel: Arc<dyn NotificationChannel>,
    default_timeout: Duration,
    bus: Option<EventBus>,
}

impl ApprovalGateway {
    pub fn new(channel: Arc<dyn NotificationChannel>, default_timeout: Duration) -> Self {
        Self {
            channel,
            default_timeout,
            bus: None,
        }
    }

    pub fn from_config(channel: Arc<dyn NotificationChannel>, config: &ApprovalConfig) -> Self {
        Self::new(channel, Duration::from_secs(config.timeout_seconds))
    }

    /// Publish `approval.requested` / `approval.resolved` on `bus`
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Send `request` and wait up to `timeout` (or the default) for a verdict.
    ///
    /// Failing to deliver the request is a transient `notification` error;
    /// running out of time is `Ok(ApprovalResponse::timed_out())`.
    #[instrument(skip_all, fields(request_id = %request.id, channel = self.channel.name()))]
    pub async fn request_approval(
        &self,
        request: ApprovalRequest,
        timeout: Option<Duration>,
    ) -> Result<ApprovalResponse, TaskError> {
        let timeout = timeout.unwrap_or(self.default_timeout);

        self.channel.send(&request).await.map_err(|e| {
            warn!(error = %e, "Failed to deliver approval request");
            TaskError::transient("notification", e.to_string())
        })?;

        self.emit(
            "approval.requested",
            json!({ "request_id": request.id, "title": request.title }),
        );
        info!(timeout_secs = timeout.as_secs(), "Waiting for approval");

        let response = match tokio::time::timeout(timeout, self.channel.await_response(request.id)).await
        {
            Ok(Ok(true)) => ApprovalResponse::approved(),
            Ok(Ok(false)) => ApprovalResponse::rejected(),
            Ok(Err(e)) => {
                warn!(error = %e, "Approval channel failed while waiting");
                return Err(TaskError::transient("notification", e.to_string()));
            }
            Err(_) => {
                warn!("Approval request timed out");
                ApprovalResponse::timed_out()
            }
        };

        info!(
            approved = response.approved,
            timed_out = response.timed_out,
            "Approval resolved"
        );
        self.emit(
            "approval.resolved",
            json!({
                "request_id": request.id,
                "approved": response.approved,
                "timed_out": response.timed_out,
            }),
        );

        Ok(response)
    }

    /// Like `request_approval`, but a timeout is `TaskError::ApprovalTimeout`
    pub async fn require_approval(
        &self,
        request: ApprovalRequest,
        timeout: Option<Duration>,
    ) -> Result<bool, TaskError> {
        let request_id = request.id;
        let waited = timeout.unwrap_or(self.default_timeout);
        let response = self.request_approval(request, timeout).await?;

        if response.timed_out {
            return Err(TaskError::ApprovalTimeout {
                request_id,
                timeout_seconds: waited.as_secs(),
            });
        }
        Ok(response.approved)
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let Some(bus) = &self.bus else {
            return;
        };
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Err(e) = bus.publish(event_type, payload) {
            warn!(error = %e, event_type, "Failed to publish approval event");
        }
    }
}

/// In-process channel: requests are recorded, verdicts injected with `respond`
#[derive(Default)]
pub struct InMemoryChannel {
    sent: Mutex<Vec<ApprovalRequest>>,
    senders: Mutex<HashMap<Uuid, oneshot::Sender<bool>>>,
    receivers: Mutex<HashMap<Uuid, oneshot::Receiver<bool>>>,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer request `id`; false if it is unknown or already answered
    pub fn respond(&self, id: Uuid, approved: bool) -> bool {
        let sender = self
            .senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);

        match sender {
            Some(tx) => tx.send(approved).is_ok(),
            None => false,
        }
    }

    /// Requests delivered so far
    pub fn sent(&self) -> Vec<ApprovalRequest> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Drain the delivered-request log
    pub fn take_sent(&self) -> Vec<ApprovalRequest> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Requests still waiting for a verdict
    pub fn pending(&self) -> usize {
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Removes a request's sender once nobody is waiting on it, including when
/// the wait is cancelled by a timeout
struct PendingGuard<'a> {
    channel: &'a InMemoryChannel,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.channel
            .senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}

#[async_trait]
impl NotificationChannel for InMemoryChannel {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, request: &ApprovalRequest) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(request.id, tx);
        self.receivers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(request.id, rx);
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());
        Ok(())
    }

    async fn await_response(&self, request_id: Uuid) -> Result<bool> {
        let rx = self
            .receivers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&request_id);
        let _pending = PendingGuard {
            channel: self,
            id: request_id,
        };

        match rx {
            Some(rx) => Ok(rx.await?),
            None => anyhow::bail!("Unknown approval request {}", request_id),
        }
    }
}
