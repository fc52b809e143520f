//! Store seams for the escalation core
//!
//! The host application owns incidents, policies, teams and schedules; the
//! scheduler reaches them through these traits. Every mutation that guards
//! concurrency is a single conditional write so that correctness rests on the
//! backing store's atomic update, never on an in-process mutex.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::types::*;

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Serialization failure, deadlock or lost optimistic race
    #[error("write conflict: {0}")]
    Conflict(String),

    /// Backend temporarily unreachable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    /// Stored row could not be mapped to a domain type
    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("store error: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StoreError {
    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Unavailable(_))
    }

    pub fn backend(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// State written after a step has been dispatched
#[derive(Debug, Clone)]
pub struct StepAdvance {
    pub incident_id: IncidentId,
    /// New value of `current_escalation_step`
    pub next_step: usize,
    /// When the next step fires; `None` after the last step
    pub next_escalation_at: Option<DateTime<Utc>>,
    /// Mark the incident COMPLETED in the same write
    pub completed: bool,
    /// Timeline entry appended atomically with the update
    pub event: IncidentEvent,
}

/// Candidate returned by the due-escalation scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueEscalation {
    pub incident_id: IncidentId,
    pub current_escalation_step: Option<usize>,
    pub next_escalation_at: DateTime<Utc>,
}

impl DueEscalation {
    /// Keyset cursor for the next page
    pub fn cursor(&self) -> DueCursor {
        DueCursor {
            next_escalation_at: self.next_escalation_at,
            incident_id: self.incident_id.clone(),
        }
    }
}

/// Position after which the due-escalation scan resumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueCursor {
    pub next_escalation_at: DateTime<Utc>,
    pub incident_id: IncidentId,
}

/// Bookkeeping written by the lock holder after a tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub last_run_at: DateTime<Utc>,
    /// Only set when every job in the tick succeeded
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub next_run_at: DateTime<Utc>,
}

/// Incident access needed by the executor and batch processor
#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// Load an incident with its service's escalation policy and steps
    async fn load_escalation_context(
        &self,
        incident_id: &str,
    ) -> StoreResult<Option<EscalationContext>>;

    /// Set COMPLETED and clear step, next time and lock; appends `event`
    async fn mark_escalation_completed(
        &self,
        incident_id: &str,
        event: IncidentEvent,
    ) -> StoreResult<()>;

    /// Conditional update: set `escalation_processing_at = now` only where it
    /// is null or older than `stale_before`. Returns whether this caller got
    /// the lock.
    async fn try_lock_incident(
        &self,
        incident_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Clear `escalation_processing_at` unconditionally
    async fn release_incident_lock(&self, incident_id: &str) -> StoreResult<()>;

    /// Apply a step advance, append its event and clear the lock in one write
    async fn record_step_executed(&self, advance: StepAdvance) -> StoreResult<()>;

    /// Clear the lock and push `next_escalation_at`, leaving step and status
    async fn defer_escalation(
        &self,
        incident_id: &str,
        next_escalation_at: DateTime<Utc>,
        event: IncidentEvent,
    ) -> StoreResult<()>;

    /// ESCALATING incidents with `next_escalation_at <= now`, ordered by
    /// `(next_escalation_at, id)`, strictly after `after`
    async fn find_due_escalations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        after: Option<&DueCursor>,
    ) -> StoreResult<Vec<DueEscalation>>;

    /// Earliest `next_escalation_at` among ESCALATING incidents, overdue ones included
    async fn next_escalation_due(&self) -> StoreResult<Option<DateTime<Utc>>>;
}

/// Read-only team and schedule lookups
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn find_team(&self, team_id: &str) -> StoreResult<Option<Team>>;

    /// Schedule with its layers and the overrides that cover `at`
    async fn find_schedule(
        &self,
        schedule_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<OnCallSchedule>>;
}

/// The [`CronSchedulerState`] singleton row
#[async_trait]
pub trait SchedulerStateStore: Send + Sync {
    /// Upsert the singleton and return its current contents
    async fn ensure_state(&self) -> StoreResult<CronSchedulerState>;

    async fn load_state(&self) -> StoreResult<Option<CronSchedulerState>>;

    /// One conditional update that succeeds when the lock is free, already
    /// held by `worker_id`, or was taken before `stale_before`. On success
    /// sets `locked_by = worker_id, locked_at = now`.
    async fn try_acquire_lock(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Clear the lock only where `locked_by = worker_id`
    async fn release_lock(&self, worker_id: &str) -> StoreResult<bool>;

    /// Persist tick bookkeeping; ignored unless `worker_id` holds the lock
    async fn record_run(&self, worker_id: &str, record: &RunRecord) -> StoreResult<bool>;

    /// Remember the day the daily jobs last ran
    async fn mark_rollup(&self, worker_id: &str, date: NaiveDate) -> StoreResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::Conflict("40001".into()).is_retryable());
        assert!(StoreError::Unavailable("connection reset".into()).is_retryable());
        assert!(!StoreError::NotFound("inc-1".into()).is_retryable());
        assert!(!StoreError::InvalidData("bad step".into()).is_retryable());
        assert!(!StoreError::LockPoisoned.is_retryable());
    }

    #[test]
    fn test_backend_error_keeps_source() {
        let source = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let err = StoreError::backend("write failed", source);
        assert!(err.to_string().contains("write failed"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
