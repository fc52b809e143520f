//! Outbox for failed notification deliveries
//!
//! A failed page is parked with an attempt counter and a next-attempt time.
//! The retry sweep re-sends due entries with exponential back-off and gives
//! up after `max_attempts`.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{NotificationPayload, NotificationSender};
use crate::state::store::{StoreError, StoreResult};
use crate::state::types::UserId;

/// Lifecycle of a parked delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Abandoned,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Delivered => "DELIVERED",
            Self::Abandoned => "ABANDONED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "DELIVERED" => Some(Self::Delivered),
            "ABANDONED" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

/// A delivery awaiting retry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDelivery {
    pub id: String,
    pub user_id: UserId,
    pub payload: NotificationPayload,
    /// Attempts made so far, including the original send
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub status: DeliveryStatus,
}

/// Back-off before attempt `attempts + 1`: 1m, 2m, 4m ... capped at one hour
pub fn retry_backoff(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(6);
    Duration::minutes(1i64 << exp).min(Duration::hours(1))
}

/// Storage for failed deliveries
#[async_trait]
pub trait NotificationOutbox: Send + Sync {
    /// Park a delivery whose first attempt failed
    async fn enqueue(
        &self,
        user_id: &str,
        payload: &NotificationPayload,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Pending deliveries with `next_attempt_at <= now`, oldest first
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<PendingDelivery>>;

    async fn mark_delivered(&self, id: &str) -> StoreResult<()>;

    /// Record another failed attempt; `None` abandons the delivery
    async fn reschedule(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;
}

/// Counters from one retry pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryReport {
    pub retried: usize,
    pub delivered: usize,
    pub abandoned: usize,
    /// Outcomes the outbox failed to store; those entries come up again
    pub unrecorded: usize,
}

/// Re-send due deliveries once each
pub async fn retry_failed_deliveries(
    outbox: &dyn NotificationOutbox,
    sender: &dyn NotificationSender,
    now: DateTime<Utc>,
    limit: usize,
    max_attempts: u32,
) -> StoreResult<RetryReport> {
    let mut report = RetryReport::default();

    for delivery in outbox.due(now, limit).await? {
        report.retried += 1;

        let error = match sender
            .send_user_notification(&delivery.user_id, &delivery.payload)
            .await
        {
            Ok(r) if r.success => {
                report.delivered += 1;
                if let Err(e) = outbox.mark_delivered(&delivery.id).await {
                    report.unrecorded += 1;
                    tracing::warn!(
                        delivery_id = %delivery.id,
                        user_id = %delivery.user_id,
                        "Failed to mark notification delivered: {e}"
                    );
                }
                continue;
            }
            Ok(r) => r.error.unwrap_or_else(|| "delivery reported failure".to_string()),
            Err(e) => e.to_string(),
        };

        let attempts = delivery.attempts + 1;
        let next = (attempts < max_attempts).then(|| now + retry_backoff(attempts));
        if next.is_none() {
            report.abandoned += 1;
            tracing::warn!(
                delivery_id = %delivery.id,
                user_id = %delivery.user_id,
                attempts,
                "Abandoning notification after repeated failures"
            );
        }
        if let Err(e) = outbox.reschedule(&delivery.id, &error, next).await {
            report.unrecorded += 1;
            tracing::warn!(
                delivery_id = %delivery.id,
                user_id = %delivery.user_id,
                "Failed to reschedule notification: {e}"
            );
        }
    }

    Ok(report)
}

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::LockPoisoned
}

/// In-memory outbox for tests and single-process runs
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    entries: RwLock<Vec<PendingDelivery>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> StoreResult<Vec<PendingDelivery>> {
        Ok(self.entries.read().map_err(poison_err)?.clone())
    }

    fn with_entry(&self, id: &str, f: impl FnOnce(&mut PendingDelivery)) -> StoreResult<()> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(entry);
        Ok(())
    }
}

#[async_trait]
impl NotificationOutbox for InMemoryOutbox {
    async fn enqueue(
        &self,
        user_id: &str,
        payload: &NotificationPayload,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let entry = PendingDelivery {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            payload: payload.clone(),
            attempts: 1,
            next_attempt_at: now + retry_backoff(1),
            last_error: Some(error.to_string()),
            status: DeliveryStatus::Pending,
        };
        self.entries.write().map_err(poison_err)?.push(entry);
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<PendingDelivery>> {
        let entries = self.entries.read().map_err(poison_err)?;
        let mut due: Vec<PendingDelivery> = entries
            .iter()
            .filter(|e| e.status == DeliveryStatus::Pending && e.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|e| e.next_attempt_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_delivered(&self, id: &str) -> StoreResult<()> {
        self.with_entry(id, |e| {
            e.status = DeliveryStatus::Delivered;
            e.attempts += 1;
            e.last_error = None;
        })
    }

    async fn reschedule(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        self.with_entry(id, |e| {
            e.attempts += 1;
            e.last_error = Some(error.to_string());
            match next_attempt_at {
                Some(at) => e.next_attempt_at = at,
                None => e.status = DeliveryStatus::Abandoned,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{DeliveryReport, NotifyError};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` sends, then succeeds
    struct FlakySender {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NotificationSender for FlakySender {
        async fn send_user_notification(
            &self,
            _user_id: &str,
            _payload: &NotificationPayload,
        ) -> Result<DeliveryReport, NotifyError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(NotifyError::Transport("503".into()))
            } else {
                Ok(DeliveryReport::delivered())
            }
        }
    }

    fn payload() -> NotificationPayload {
        NotificationPayload {
            incident_id: "inc-1".into(),
            title: "disk full".into(),
            message: "step 1".into(),
            step: 0,
            channels: vec![],
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(1), Duration::minutes(1));
        assert_eq!(retry_backoff(2), Duration::minutes(2));
        assert_eq!(retry_backoff(3), Duration::minutes(4));
        assert_eq!(retry_backoff(30), Duration::hours(1));
    }

    #[tokio::test]
    async fn test_retry_delivers_after_backoff() {
        let t0 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let outbox = InMemoryOutbox::new();
        outbox.enqueue("u-1", &payload(), "timeout", t0).await.unwrap();

        let sender = FlakySender {
            failures: 0,
            calls: AtomicUsize::new(0),
        };

        // Not due yet
        let report = retry_failed_deliveries(&outbox, &sender, t0, 10, 3)
            .await
            .unwrap();
        assert_eq!(report.retried, 0);

        let report = retry_failed_deliveries(&outbox, &sender, t0 + Duration::minutes(1), 10, 3)
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(outbox.entries().unwrap()[0].status, DeliveryStatus::Delivered);
    }

    /// Serves due entries from memory but cannot write outcomes back
    struct ReadOnlyOutbox {
        inner: InMemoryOutbox,
    }

    #[async_trait]
    impl NotificationOutbox for ReadOnlyOutbox {
        async fn enqueue(
            &self,
            user_id: &str,
            payload: &NotificationPayload,
            error: &str,
            now: DateTime<Utc>,
        ) -> StoreResult<()> {
            self.inner.enqueue(user_id, payload, error, now).await
        }

        async fn due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<PendingDelivery>> {
            self.inner.due(now, limit).await
        }

        async fn mark_delivered(&self, _id: &str) -> StoreResult<()> {
            Err(StoreError::Unavailable("read-only transaction".into()))
        }

        async fn reschedule(
            &self,
            _id: &str,
            _error: &str,
            _next_attempt_at: Option<DateTime<Utc>>,
        ) -> StoreResult<()> {
            Err(StoreError::Unavailable("read-only transaction".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_bookkeeping_does_not_stop_the_pass() {
        let t0 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let outbox = ReadOnlyOutbox {
            inner: InMemoryOutbox::new(),
        };
        for user in ["u-1", "u-2", "u-3"] {
            outbox.enqueue(user, &payload(), "timeout", t0).await.unwrap();
        }
        // First resend fails, the other two go through
        let sender = FlakySender {
            failures: 1,
            calls: AtomicUsize::new(0),
        };

        let report = retry_failed_deliveries(&outbox, &sender, t0 + Duration::minutes(1), 10, 3)
            .await
            .unwrap();
        assert_eq!(sender.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.retried, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.unrecorded, 3);
    }

    #[tokio::test]
    async fn test_retry_abandons_at_max_attempts() {
        let t0 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let outbox = InMemoryOutbox::new();
        outbox.enqueue("u-1", &payload(), "timeout", t0).await.unwrap();
        let sender = FlakySender {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        };

        // attempt 2 fails, rescheduled 2 minutes out
        let at = t0 + Duration::minutes(1);
        let report = retry_failed_deliveries(&outbox, &sender, at, 10, 3).await.unwrap();
        assert_eq!((report.retried, report.abandoned), (1, 0));
        let entry = &outbox.entries().unwrap()[0];
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.next_attempt_at, at + Duration::minutes(2));

        // attempt 3 fails and hits the cap
        let at = at + Duration::minutes(2);
        let report = retry_failed_deliveries(&outbox, &sender, at, 10, 3).await.unwrap();
        assert_eq!(report.abandoned, 1);
        assert_eq!(outbox.entries().unwrap()[0].status, DeliveryStatus::Abandoned);

        let report = retry_failed_deliveries(&outbox, &sender, at + Duration::hours(2), 10, 3)
            .await
            .unwrap();
        assert_eq!(report.retried, 0);
    }
}
