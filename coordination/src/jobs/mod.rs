//! Housekeeping jobs run by the cron scheduler
//!
//! Each job is one unit of idempotent work. The scheduler runs every
//! registered job once per tick, in registration order, and isolates their
//! failures from one another. [`JobCadence::Daily`] jobs run on the first
//! tick of each UTC day.

pub mod queue;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::escalation::{BatchProcessor, EscalationRunner};
use crate::notify::{retry_failed_deliveries, NotificationOutbox, NotificationSender};
use crate::state::store::StoreError;

pub use queue::{
    job_retry_delay, process_pending_jobs, DrainReport, InMemoryJobQueue, JobKind, JobQueue,
    JobStatus, QueuedJob, DEFAULT_MAX_ATTEMPTS,
};

/// How often a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCadence {
    EveryTick,
    Daily,
}

/// What a job did in one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    /// Rows or items acted on
    pub affected: usize,
    /// Per-item failures that did not abort the job
    pub errors: Vec<String>,
}

impl JobReport {
    pub fn affected(affected: usize) -> Self {
        Self {
            affected,
            errors: Vec::new(),
        }
    }
}

/// A job that could not run to completion
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Failed(String),
}

/// A unit of periodic work
#[async_trait]
pub trait HousekeepingJob: Send + Sync {
    /// Stable name used in logs and `last_error`
    fn name(&self) -> &str;

    fn cadence(&self) -> JobCadence {
        JobCadence::EveryTick
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<JobReport, JobError>;
}

/// Sweeps due escalations through the batch processor
pub struct EscalationSweep {
    processor: BatchProcessor,
    runner: Arc<dyn EscalationRunner>,
}

impl EscalationSweep {
    pub fn new(processor: BatchProcessor, runner: Arc<dyn EscalationRunner>) -> Self {
        Self { processor, runner }
    }
}

#[async_trait]
impl HousekeepingJob for EscalationSweep {
    fn name(&self) -> &str {
        "escalations"
    }

    async fn run(&self, _now: DateTime<Utc>) -> Result<JobReport, JobError> {
        let report = self.processor.process_pending(self.runner.as_ref()).await?;
        Ok(JobReport {
            affected: report.processed,
            errors: report.errors.unwrap_or_default(),
        })
    }
}

/// Drains due jobs from the queue
pub struct QueueDrain {
    queue: Arc<dyn JobQueue>,
    runner: Arc<dyn EscalationRunner>,
    limit: usize,
}

impl QueueDrain {
    pub fn new(queue: Arc<dyn JobQueue>, runner: Arc<dyn EscalationRunner>, limit: usize) -> Self {
        Self {
            queue,
            runner,
            limit,
        }
    }
}

#[async_trait]
impl HousekeepingJob for QueueDrain {
    fn name(&self) -> &str {
        "queue"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<JobReport, JobError> {
        let report =
            process_pending_jobs(self.queue.as_ref(), self.runner.as_ref(), now, self.limit).await?;
        Ok(JobReport {
            affected: report.completed,
            errors: report.errors,
        })
    }
}

/// Re-sends failed notifications whose back-off elapsed
pub struct NotificationRetrySweep {
    outbox: Arc<dyn NotificationOutbox>,
    sender: Arc<dyn NotificationSender>,
    limit: usize,
    max_attempts: u32,
}

impl NotificationRetrySweep {
    pub fn new(outbox: Arc<dyn NotificationOutbox>, sender: Arc<dyn NotificationSender>) -> Self {
        Self {
            outbox,
            sender,
            limit: 100,
            max_attempts: 3,
        }
    }

    pub fn with_limits(mut self, limit: usize, max_attempts: u32) -> Self {
        self.limit = limit;
        self.max_attempts = max_attempts;
        self
    }
}

#[async_trait]
impl HousekeepingJob for NotificationRetrySweep {
    fn name(&self) -> &str {
        "notification-retry"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<JobReport, JobError> {
        let report = retry_failed_deliveries(
            self.outbox.as_ref(),
            self.sender.as_ref(),
            now,
            self.limit,
            self.max_attempts,
        )
        .await?;
        if report.retried > 0 {
            tracing::info!(
                retried = report.retried,
                delivered = report.delivered,
                abandoned = report.abandoned,
                unrecorded = report.unrecorded,
                "Notification retry sweep finished"
            );
        }
        Ok(JobReport::affected(report.delivered))
    }
}
