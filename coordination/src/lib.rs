//! On-call Coordination Library
//!
//! This library provides the background core of the incident pager:
//! - Escalation policies advanced one step at a time under a per-incident lock
//! - Target resolution for users, teams and on-call schedules
//! - A lock-coordinated cron scheduler shared by any number of worker processes
//!
//! # Components
//!
//! ## Escalation
//! - [`TargetResolver`]: maps a step target to the user IDs to page
//! - [`EscalationExecutor`]: advances a single incident by one step
//! - [`BatchProcessor`]: sweeps every incident whose next step is due
//!
//! ## Scheduling
//! - [`CronScheduler`]: lease-locked background loop with a dynamic wake time
//! - [`HousekeepingJob`]: unit of work run once per scheduler tick
//! - [`JobQueue`]: deferred escalation triggers
//!
//! ## Storage
//! - [`IncidentStore`], [`DirectoryStore`], [`SchedulerStateStore`]: store seams
//! - [`InMemoryStore`]: single-process implementation used by tests and demos
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use oncall_coordination::{CronScheduler, EscalationSweep, EscalationWake, InMemoryStore, SchedulerGate};
//!
//! let store = Arc::new(InMemoryStore::new());
//! let scheduler = CronScheduler::builder(store.clone())
//!     .job(Arc::new(EscalationSweep::new(processor, executor)))
//!     .wake_source(Arc::new(EscalationWake::new(store.clone())))
//!     .build();
//!
//! scheduler.start(&SchedulerGate::from_env());
//! // ...
//! scheduler.stop().await;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod clock;
pub mod escalation;
pub mod jobs;
pub mod notify;
pub mod oncall;
pub mod scheduler;
pub mod state;

// Re-export clock types
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};

// Re-export escalation types
pub use escalation::{
    BatchProcessor, BatchReport, EscalationError, EscalationExecutor, EscalationOutcome,
    EscalationRunner, ExecutorConfig, TargetResolver,
};

// Re-export job types
pub use jobs::{
    process_pending_jobs, DrainReport, EscalationSweep, HousekeepingJob, InMemoryJobQueue,
    JobCadence, JobError, JobQueue, JobReport, NotificationRetrySweep, QueueDrain, QueuedJob,
};

// Re-export notification types
pub use notify::{
    DeliveryReport, DispatchSummary, InMemoryOutbox, NotificationDispatcher, NotificationOutbox,
    NotificationPayload, NotificationSender, NotifyError,
};

// Re-export scheduler types
pub use scheduler::{
    next_wake_delay, CronScheduler, CronSchedulerBuilder, EscalationWake, QueueWake,
    SchedulerConfig, SchedulerGate, SchedulerStatus, TickReport, WakeSource,
};

// Re-export state types
pub use state::{
    CronSchedulerState, DirectoryStore, EscalationContext, EscalationPolicy, EscalationStatus,
    EscalationStep, EscalationTarget, InMemoryStore, Incident, IncidentEvent, IncidentEventKind,
    IncidentStore, NotificationChannel, OnCallSchedule, ScheduleLayer, ScheduleOverride,
    SchedulerStateStore, StoreError, StoreResult, TargetType, Team, TeamMember,
};
