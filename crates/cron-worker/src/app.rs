//! Scheduler wiring
//!
//! Job order within a tick: escalation sweep, queue drain, notification
//! retry, then the SQL sweeps.

use std::sync::Arc;

use oncall_coordination::{
    BatchProcessor, CronScheduler, DirectoryStore, EscalationExecutor, EscalationSweep,
    EscalationWake, IncidentStore, JobQueue, NotificationDispatcher, NotificationOutbox,
    NotificationRetrySweep, NotificationSender, QueueDrain, QueueWake, SchedulerGate,
    SchedulerStateStore, SharedClock, TickReport,
};

use crate::config::WorkerConfig;
use crate::postgres::PgStore;
use crate::sweeps::{standard_sweeps, SweepExecutor};

/// Store handles the scheduler runs against
#[derive(Clone)]
pub struct WorkerStores {
    pub incidents: Arc<dyn IncidentStore>,
    pub directory: Arc<dyn DirectoryStore>,
    pub state: Arc<dyn SchedulerStateStore>,
    pub queue: Arc<dyn JobQueue>,
    pub outbox: Arc<dyn NotificationOutbox>,
    /// Target of the SQL sweeps; `None` skips them
    pub sweeps: Option<Arc<dyn SweepExecutor>>,
}

impl WorkerStores {
    /// Every handle backed by the same Postgres connection
    pub fn postgres(store: Arc<PgStore>) -> Self {
        Self {
            incidents: store.clone(),
            directory: store.clone(),
            state: store.clone(),
            queue: store.clone(),
            outbox: store.clone(),
            sweeps: Some(store),
        }
    }
}

/// Build a stopped scheduler with the standard jobs and wake sources
pub fn build_scheduler(
    stores: WorkerStores,
    sender: Arc<dyn NotificationSender>,
    clock: SharedClock,
    config: &WorkerConfig,
) -> CronScheduler {
    let dispatcher = NotificationDispatcher::new(sender.clone(), clock.clone())
        .with_outbox(stores.outbox.clone());
    let executor = Arc::new(
        EscalationExecutor::new(
            stores.incidents.clone(),
            stores.directory.clone(),
            dispatcher,
            clock.clone(),
        )
        .with_config(config.executor.clone())
        .with_job_queue(stores.queue.clone()),
    );
    let processor = BatchProcessor::new(stores.incidents.clone(), clock.clone()).with_limits(
        config.scheduler.escalation_batch_size,
        config.scheduler.max_escalations_per_pass,
    );

    let mut builder = CronScheduler::builder(stores.state.clone())
        .clock(clock)
        .config(config.scheduler.clone())
        .job(Arc::new(EscalationSweep::new(processor, executor.clone())))
        .job(Arc::new(QueueDrain::new(
            stores.queue.clone(),
            executor,
            config.scheduler.queue_drain_limit,
        )))
        .job(Arc::new(
            NotificationRetrySweep::new(stores.outbox.clone(), sender).with_limits(
                config.notify.retry_batch_size,
                config.notify.max_attempts,
            ),
        ));

    if let Some(executor) = stores.sweeps {
        for sweep in standard_sweeps(executor, &config.sweeps) {
            builder = builder.job(Arc::new(sweep));
        }
    }

    builder
        .wake_source(Arc::new(EscalationWake::new(stores.incidents)))
        .wake_source(Arc::new(QueueWake::new(stores.queue)))
        .build()
}

/// Run one tick unless the environment gate refuses it
pub async fn run_once_gated(scheduler: &CronScheduler, gate: &SchedulerGate) -> Option<TickReport> {
    if let Some(reason) = gate.refusal() {
        tracing::info!(reason, "Single tick skipped");
        return None;
    }
    Some(scheduler.run_once().await)
}
