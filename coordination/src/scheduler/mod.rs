//! Lock-coordinated cron scheduler
//!
//! Any number of processes may run a [`CronScheduler`]; the
//! `CronSchedulerState` row decides which one does the work.
//!
//! ```text
//! start ──► tick ──► ensure state ──► acquire lock ──denied──► sleep lock_retry
//!            ▲                            │
//!            │                         acquired
//!            │                            ▼
//!            │                   run jobs in order (isolated)
//!            │                            │
//!            │                   record run, compute next wake
//!            │                            │
//!            └──── sleep clamp(next due, min, max) ◄──┘
//! ```
//!
//! A tick always runs to completion. `stop` cancels the sleep, waits for an
//! in-flight tick, and then releases the lock if this worker holds it.

pub mod cadence;
pub mod config;
pub mod gate;
pub mod wake;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{SharedClock, SystemClock};
use crate::jobs::{HousekeepingJob, JobCadence};
use crate::state::store::{RunRecord, SchedulerStateStore, StoreError};

pub use cadence::next_wake_delay;
pub use config::SchedulerConfig;
pub use gate::SchedulerGate;
pub use wake::{EscalationWake, QueueWake, WakeSource};

/// Point-in-time view of a scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub worker_id: Option<String>,
    /// Human-readable cadence
    pub schedule: String,
    pub holds_lock: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_delay_secs: Option<u64>,
}

/// One job's result within a tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub name: String,
    pub affected: usize,
    /// Item-level failures reported by the job
    pub item_errors: usize,
}

/// Everything one tick did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub started_at: DateTime<Utc>,
    pub acquired_lock: bool,
    /// Scheduler state could not be read or written
    pub degraded: bool,
    pub jobs: Vec<JobRun>,
    /// `"<job>: <error>"` for each job that failed outright
    pub failures: Vec<String>,
    pub next_delay: Duration,
}

impl TickReport {
    fn new(started_at: DateTime<Utc>, next_delay: Duration) -> Self {
        Self {
            started_at,
            acquired_lock: false,
            degraded: false,
            jobs: Vec::new(),
            failures: Vec::new(),
            next_delay,
        }
    }
}

struct Running {
    worker_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn SchedulerStateStore>,
    wake_sources: Vec<Arc<dyn WakeSource>>,
    jobs: Vec<Arc<dyn HousekeepingJob>>,
    clock: SharedClock,
    config: SchedulerConfig,
    running: Mutex<Option<Running>>,
    status: Mutex<SchedulerStatus>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `worker-` followed by 12 hex characters
pub fn new_worker_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..12])
}

/// Handle to a scheduler; clones share the same loop
#[derive(Clone)]
pub struct CronScheduler {
    inner: Arc<Inner>,
}

impl CronScheduler {
    pub fn new(
        store: Arc<dyn SchedulerStateStore>,
        wake_sources: Vec<Arc<dyn WakeSource>>,
        jobs: Vec<Arc<dyn HousekeepingJob>>,
        clock: SharedClock,
        config: SchedulerConfig,
    ) -> Self {
        let status = SchedulerStatus {
            schedule: format!(
                "dynamic, every {}s to {}s",
                config.min_delay().as_secs(),
                config.max_delay().as_secs()
            ),
            ..Default::default()
        };
        Self {
            inner: Arc::new(Inner {
                store,
                wake_sources,
                jobs,
                clock,
                config,
                running: Mutex::new(None),
                status: Mutex::new(status),
            }),
        }
    }

    pub fn builder(store: Arc<dyn SchedulerStateStore>) -> CronSchedulerBuilder {
        CronSchedulerBuilder {
            store,
            wake_sources: Vec::new(),
            jobs: Vec::new(),
            clock: SystemClock::shared(),
            config: SchedulerConfig::default(),
        }
    }

    /// Start the background loop.
    ///
    /// Returns `false` when the gate refuses; the scheduler then stays
    /// stopped. Calling `start` on a running scheduler is a no-op that
    /// returns `true`. Must be called from within a tokio runtime.
    pub fn start(&self, gate: &SchedulerGate) -> bool {
        if let Some(reason) = gate.refusal() {
            tracing::info!(reason, "Cron scheduler not started");
            return false;
        }

        let mut running = lock(&self.inner.running);
        if running.is_some() {
            return true;
        }

        let worker_id = new_worker_id();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.inner.clone(),
            worker_id.clone(),
            cancel.clone(),
        ));

        {
            let mut status = lock(&self.inner.status);
            status.running = true;
            status.worker_id = Some(worker_id.clone());
            status.last_error = None;
        }
        tracing::info!(worker_id = %worker_id, "Cron scheduler started");

        *running = Some(Running {
            worker_id,
            cancel,
            handle,
        });
        true
    }

    /// Stop the loop and release the lock. Safe to call repeatedly.
    pub async fn stop(&self) {
        let Some(running) = lock(&self.inner.running).take() else {
            return;
        };

        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            tracing::error!(worker_id = %running.worker_id, "Scheduler task ended abnormally: {e}");
        }

        match self.inner.store.release_lock(&running.worker_id).await {
            Ok(true) => tracing::info!(worker_id = %running.worker_id, "Released scheduler lock"),
            Ok(false) => {}
            Err(e) => tracing::warn!(
                worker_id = %running.worker_id,
                "Failed to release scheduler lock, it expires after the stale window: {e}"
            ),
        }

        let mut status = lock(&self.inner.status);
        status.running = false;
        status.holds_lock = false;
        status.next_run_at = None;
        tracing::info!(worker_id = %running.worker_id, "Cron scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.running).is_some()
    }

    pub fn status(&self) -> SchedulerStatus {
        lock(&self.inner.status).clone()
    }

    /// Run a single tick outside the loop.
    ///
    /// Uses the running worker's identity if started; otherwise a one-off
    /// identity whose lock is released before returning.
    pub async fn run_once(&self) -> TickReport {
        let current = lock(&self.inner.running)
            .as_ref()
            .map(|r| r.worker_id.clone());

        match current {
            Some(worker_id) => self.inner.tick(&worker_id).await,
            None => {
                let worker_id = new_worker_id();
                let report = self.inner.tick(&worker_id).await;
                if report.acquired_lock {
                    if let Err(e) = self.inner.store.release_lock(&worker_id).await {
                        tracing::warn!(worker_id = %worker_id, "Failed to release scheduler lock: {e}");
                    }
                    lock(&self.inner.status).holds_lock = false;
                }
                report
            }
        }
    }
}

async fn run_loop(inner: Arc<Inner>, worker_id: String, cancel: CancellationToken) {
    loop {
        let report = inner.tick(&worker_id).await;
        let deadline = tokio::time::Instant::now() + report.next_delay;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }
}

impl Inner {
    fn previous_delay(&self) -> Duration {
        lock(&self.status)
            .last_delay_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.lock_retry())
    }

    fn set_delay(&self, now: DateTime<Utc>, delay: Duration) {
        let mut status = lock(&self.status);
        status.last_delay_secs = Some(delay.as_secs());
        status.next_run_at = chrono::Duration::from_std(delay).ok().map(|d| now + d);
    }

    /// State store unreachable: keep the previous cadence and surface the error
    fn degrade(&self, mut report: TickReport, error: StoreError) -> TickReport {
        tracing::error!("Scheduler state unavailable, keeping previous cadence: {error}");
        report.degraded = true;
        report.next_delay = self.previous_delay();
        {
            let mut status = lock(&self.status);
            status.holds_lock = false;
            status.last_error = Some(error.to_string());
        }
        self.set_delay(report.started_at, report.next_delay);
        report
    }

    async fn tick(&self, worker_id: &str) -> TickReport {
        let now = self.clock.now();
        let report = TickReport::new(now, self.config.lock_retry());

        let state = match self.store.ensure_state().await {
            Ok(state) => state,
            Err(e) => return self.degrade(report, e),
        };

        let stale_before = now - self.config.stale_lock();
        match self.store.try_acquire_lock(worker_id, now, stale_before).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(
                    worker_id = %worker_id,
                    holder = state.locked_by.as_deref().unwrap_or("unknown"),
                    "Scheduler lock held by another worker"
                );
                lock(&self.status).holds_lock = false;
                self.set_delay(now, report.next_delay);
                return report;
            }
            Err(e) => return self.degrade(report, e),
        }

        lock(&self.status).holds_lock = true;
        self.run_jobs(worker_id, now, state.last_rollup_date, report)
            .await
    }

    async fn run_jobs(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        last_rollup_date: Option<chrono::NaiveDate>,
        mut report: TickReport,
    ) -> TickReport {
        report.acquired_lock = true;
        let today = now.date_naive();
        let daily_due = last_rollup_date != Some(today);
        let mut daily_ran = false;
        let mut daily_failed = false;

        for job in &self.jobs {
            let daily = job.cadence() == JobCadence::Daily;
            if daily && !daily_due {
                continue;
            }
            daily_ran |= daily;

            match job.run(now).await {
                Ok(job_report) => {
                    if !job_report.errors.is_empty() {
                        tracing::warn!(
                            job = job.name(),
                            errors = job_report.errors.len(),
                            "Job finished with item failures"
                        );
                    }
                    report.jobs.push(JobRun {
                        name: job.name().to_string(),
                        affected: job_report.affected,
                        item_errors: job_report.errors.len(),
                    });
                }
                Err(e) => {
                    tracing::warn!(job = job.name(), "Job failed: {e}");
                    daily_failed |= daily;
                    report.failures.push(format!("{}: {}", job.name(), e));
                }
            }
        }

        if daily_ran && !daily_failed {
            if let Err(e) = self.store.mark_rollup(worker_id, today).await {
                tracing::warn!("Failed to record daily job date: {e}");
            }
        }

        let finished = self.clock.now();
        let mut candidates = Vec::new();
        for source in &self.wake_sources {
            match source.next_wake().await {
                Ok(Some(at)) => candidates.push(at),
                Ok(None) => {}
                Err(e) => tracing::warn!(source = source.name(), "Failed to read next wake time: {e}"),
            }
        }
        report.next_delay = next_wake_delay(finished, candidates, &self.config);
        let next_run_at = finished
            + chrono::Duration::from_std(report.next_delay).unwrap_or(chrono::Duration::zero());

        let last_error = (!report.failures.is_empty()).then(|| report.failures.join("; "));
        let record = RunRecord {
            last_run_at: now,
            last_success_at: report.failures.is_empty().then_some(finished),
            last_error: last_error.clone(),
            next_run_at,
        };

        let mut status_error = last_error;
        match self.store.record_run(worker_id, &record).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(worker_id = %worker_id, "Lost scheduler lock before recording run");
                lock(&self.status).holds_lock = false;
            }
            Err(e) => {
                tracing::error!(worker_id = %worker_id, "Failed to record scheduler run: {e}");
                report.degraded = true;
                let state_error = format!("record run: {e}");
                status_error = Some(match status_error {
                    Some(failures) => format!("{failures}; {state_error}"),
                    None => state_error,
                });
            }
        }

        {
            let mut status = lock(&self.status);
            status.last_run_at = Some(now);
            if record.last_success_at.is_some() {
                status.last_success_at = record.last_success_at;
            }
            status.last_error = status_error;
        }
        self.set_delay(finished, report.next_delay);

        tracing::info!(
            worker_id = %worker_id,
            jobs = report.jobs.len(),
            failures = report.failures.len(),
            next_delay_secs = report.next_delay.as_secs(),
            "Scheduler tick finished"
        );
        report
    }
}

/// Builder for [`CronScheduler`]
pub struct CronSchedulerBuilder {
    store: Arc<dyn SchedulerStateStore>,
    wake_sources: Vec<Arc<dyn WakeSource>>,
    jobs: Vec<Arc<dyn HousekeepingJob>>,
    clock: SharedClock,
    config: SchedulerConfig,
}

impl CronSchedulerBuilder {
    /// Register a job; jobs run in registration order
    pub fn job(mut self, job: Arc<dyn HousekeepingJob>) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn wake_source(mut self, source: Arc<dyn WakeSource>) -> Self {
        self.wake_sources.push(source);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> CronScheduler {
        CronScheduler::new(
            self.store,
            self.wake_sources,
            self.jobs,
            self.clock,
            self.config,
        )
    }
}
