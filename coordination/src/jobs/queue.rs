//! Deferred escalation triggers
//!
//! When a step fires, the executor enqueues a job for the next step at its
//! due time. The scheduler drains due jobs every tick; each job runs through
//! the executor's expected-step guard, so a job that lost the race to the
//! batch sweep completes as a no-op.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::escalation::outcome::EscalationRunner;
use crate::state::store::{StoreError, StoreResult};
use crate::state::types::IncidentId;

/// Work carried by a queued job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum JobKind {
    /// Run `step` of the incident's policy
    Escalation { incident_id: IncidentId, step: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A job row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub run_at: DateTime<Utc>,
    /// Claims so far, including the current one
    pub attempts: u32,
    pub max_attempts: u32,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Default attempt budget for a job
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Delay before re-running a failed job: 30s, 60s, 120s ... capped at ten minutes
pub fn job_retry_delay(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(5);
    Duration::seconds(30i64 << exp).min(Duration::minutes(10))
}

/// Durable queue of deferred jobs
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue `step` of an incident at `at`. A pending job for the same
    /// incident and step is reused. Returns the job id.
    async fn schedule_escalation(
        &self,
        incident_id: &str,
        step: usize,
        at: DateTime<Utc>,
    ) -> StoreResult<String>;

    /// Claim up to `limit` pending jobs due at `now`, plus running jobs whose
    /// claim went stale. Claimed jobs are RUNNING with `attempts` incremented.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<QueuedJob>>;

    async fn complete(&self, job_id: &str) -> StoreResult<()>;

    /// Record a failure; `Some(retry_at)` re-queues, `None` fails permanently
    async fn fail(
        &self,
        job_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Earliest `run_at` among pending jobs, including ones already due
    async fn next_job_due(&self) -> StoreResult<Option<DateTime<Utc>>>;
}

/// Counters from one queue drain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub claimed: usize,
    pub escalated: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Run every due job through `runner`
pub async fn process_pending_jobs(
    queue: &dyn JobQueue,
    runner: &dyn EscalationRunner,
    now: DateTime<Utc>,
    limit: usize,
) -> StoreResult<DrainReport> {
    let jobs = queue.claim_due(now, limit).await?;
    let mut report = DrainReport {
        claimed: jobs.len(),
        ..Default::default()
    };

    for job in jobs {
        let JobKind::Escalation { incident_id, step } = &job.kind;

        match runner.run_escalation(incident_id, Some(*step)).await {
            Ok(outcome) => {
                if outcome.escalated() {
                    report.escalated += 1;
                } else {
                    tracing::debug!(
                        job_id = %job.id,
                        incident_id = %incident_id,
                        outcome = outcome.label(),
                        "Queued escalation was a no-op"
                    );
                }
                queue.complete(&job.id).await?;
                report.completed += 1;
            }
            Err(e) => {
                let message = format!("{}: {}", incident_id, e);
                let retry_at = (e.is_retryable() && job.attempts < job.max_attempts)
                    .then(|| now + job_retry_delay(job.attempts));
                match retry_at {
                    Some(_) => report.retried += 1,
                    None => report.failed += 1,
                }
                tracing::warn!(
                    job_id = %job.id,
                    incident_id = %incident_id,
                    attempts = job.attempts,
                    will_retry = retry_at.is_some(),
                    "Queued escalation failed: {e}"
                );
                queue.fail(&job.id, &message, retry_at).await?;
                report.errors.push(message);
            }
        }
    }

    Ok(report)
}

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::LockPoisoned
}

/// In-memory job queue for tests and single-process runs
#[derive(Debug)]
pub struct InMemoryJobQueue {
    jobs: RwLock<HashMap<String, QueuedJob>>,
    claim_timeout: Duration,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            claim_timeout: Duration::minutes(5),
        }
    }

    /// Reclaim RUNNING jobs whose claim is older than `timeout`
    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn job(&self, job_id: &str) -> StoreResult<Option<QueuedJob>> {
        Ok(self.jobs.read().map_err(poison_err)?.get(job_id).cloned())
    }

    pub fn jobs(&self) -> StoreResult<Vec<QueuedJob>> {
        let mut jobs: Vec<QueuedJob> = self.jobs.read().map_err(poison_err)?.values().cloned().collect();
        jobs.sort_by(|a, b| a.run_at.cmp(&b.run_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn update(&self, job_id: &str, f: impl FnOnce(&mut QueuedJob)) -> StoreResult<()> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        f(job);
        Ok(())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn schedule_escalation(
        &self,
        incident_id: &str,
        step: usize,
        at: DateTime<Utc>,
    ) -> StoreResult<String> {
        let kind = JobKind::Escalation {
            incident_id: incident_id.to_string(),
            step,
        };
        let mut jobs = self.jobs.write().map_err(poison_err)?;

        if let Some(existing) = jobs
            .values_mut()
            .find(|j| j.kind == kind && j.status == JobStatus::Pending)
        {
            existing.run_at = at;
            return Ok(existing.id.clone());
        }

        let id = uuid::Uuid::new_v4().to_string();
        jobs.insert(
            id.clone(),
            QueuedJob {
                id: id.clone(),
                kind,
                status: JobStatus::Pending,
                run_at: at,
                attempts: 0,
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                claimed_at: None,
                last_error: None,
            },
        );
        Ok(id)
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<QueuedJob>> {
        let stale_before = now - self.claim_timeout;
        let mut jobs = self.jobs.write().map_err(poison_err)?;

        let mut due: Vec<&mut QueuedJob> = jobs
            .values_mut()
            .filter(|j| match j.status {
                JobStatus::Pending => j.run_at <= now,
                JobStatus::Running => j.claimed_at.is_some_and(|at| at < stale_before),
                JobStatus::Completed | JobStatus::Failed => false,
            })
            .collect();
        due.sort_by(|a, b| a.run_at.cmp(&b.run_at).then_with(|| a.id.cmp(&b.id)));

        Ok(due
            .into_iter()
            .take(limit)
            .map(|job| {
                job.status = JobStatus::Running;
                job.claimed_at = Some(now);
                job.attempts += 1;
                job.clone()
            })
            .collect())
    }

    async fn complete(&self, job_id: &str) -> StoreResult<()> {
        self.update(job_id, |job| {
            job.status = JobStatus::Completed;
            job.claimed_at = None;
        })
    }

    async fn fail(
        &self,
        job_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        self.update(job_id, |job| {
            job.last_error = Some(error.to_string());
            job.claimed_at = None;
            match retry_at {
                Some(at) => {
                    job.status = JobStatus::Pending;
                    job.run_at = at;
                }
                None => job.status = JobStatus::Failed,
            }
        })
    }

    async fn next_job_due(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .jobs
            .read()
            .map_err(poison_err)?
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .map(|j| j.run_at)
            .min())
    }
}
