//! Sources of upcoming work that shorten the scheduler's sleep

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::jobs::queue::JobQueue;
use crate::state::store::{IncidentStore, StoreResult};

/// Reports the next instant something becomes due
#[async_trait]
pub trait WakeSource: Send + Sync {
    fn name(&self) -> &str;

    /// Earliest pending deadline, if any. Deadlines already past mean work
    /// is waiting and the scheduler wakes after its minimum delay.
    async fn next_wake(&self) -> StoreResult<Option<DateTime<Utc>>>;
}

/// Next pending escalation step
pub struct EscalationWake {
    incidents: Arc<dyn IncidentStore>,
}

impl EscalationWake {
    pub fn new(incidents: Arc<dyn IncidentStore>) -> Self {
        Self { incidents }
    }
}

#[async_trait]
impl WakeSource for EscalationWake {
    fn name(&self) -> &str {
        "escalations"
    }

    async fn next_wake(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.incidents.next_escalation_due().await
    }
}

/// Next queued job
pub struct QueueWake {
    queue: Arc<dyn JobQueue>,
}

impl QueueWake {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl WakeSource for QueueWake {
    fn name(&self) -> &str {
        "queue"
    }

    async fn next_wake(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.queue.next_job_due().await
    }
}
