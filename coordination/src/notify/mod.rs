//! Notification dispatch for escalation steps
//!
//! The executor hands one [`NotificationPayload`] per step to the
//! [`NotificationDispatcher`], which fans it out to every resolved user
//! through a [`NotificationSender`]. Delivery failures never fail the step;
//! they are parked in the [`NotificationOutbox`] for the retry sweep.

pub mod outbox;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::state::types::{IncidentId, UserId};

pub use crate::state::types::NotificationChannel;
pub use outbox::{
    retry_backoff, retry_failed_deliveries, DeliveryStatus, InMemoryOutbox, NotificationOutbox,
    PendingDelivery, RetryReport,
};

/// Content of an escalation page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub incident_id: IncidentId,
    pub title: String,
    pub message: String,
    /// Zero-indexed step that produced this page
    pub step: usize,
    /// Channels configured on the step; empty means the user's defaults
    pub channels: Vec<NotificationChannel>,
}

/// Outcome reported by a sender for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub success: bool,
    pub error: Option<String>,
}

impl DeliveryReport {
    pub fn delivered() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Errors raised by a notification sender
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected by provider: {0}")]
    Rejected(String),

    #[error("no contact method for user {0}")]
    NoContact(UserId),
}

/// Delivers a page to a single user
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send_user_notification(
        &self,
        user_id: &str,
        payload: &NotificationPayload,
    ) -> Result<DeliveryReport, NotifyError>;
}

/// Per-step delivery tally
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub delivered: Vec<UserId>,
    pub failed: Vec<(UserId, String)>,
}

/// Fans a payload out to users and parks failures for retry
#[derive(Clone)]
pub struct NotificationDispatcher {
    sender: Arc<dyn NotificationSender>,
    outbox: Option<Arc<dyn NotificationOutbox>>,
    clock: SharedClock,
}

impl NotificationDispatcher {
    pub fn new(sender: Arc<dyn NotificationSender>, clock: SharedClock) -> Self {
        Self {
            sender,
            outbox: None,
            clock,
        }
    }

    /// Queue failed deliveries in `outbox`
    pub fn with_outbox(mut self, outbox: Arc<dyn NotificationOutbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Send `payload` to each user in order
    pub async fn dispatch(&self, users: &[UserId], payload: &NotificationPayload) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        for user_id in users {
            let error = match self.sender.send_user_notification(user_id, payload).await {
                Ok(report) if report.success => {
                    summary.delivered.push(user_id.clone());
                    continue;
                }
                Ok(report) => report
                    .error
                    .unwrap_or_else(|| "delivery reported failure".to_string()),
                Err(e) => e.to_string(),
            };

            tracing::warn!(
                incident_id = %payload.incident_id,
                user_id = %user_id,
                error = %error,
                "Notification delivery failed"
            );

            if let Some(outbox) = &self.outbox {
                if let Err(e) = outbox
                    .enqueue(user_id, payload, &error, self.clock.now())
                    .await
                {
                    tracing::error!(user_id = %user_id, "Failed to queue notification retry: {e}");
                }
            }
            summary.failed.push((user_id.clone(), error));
        }

        summary
    }
}
