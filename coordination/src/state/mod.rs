//! State module for incident escalation
//!
//! This module defines the data the escalation core reads and writes, and
//! the store seams it reaches that data through:
//! - Incidents and the four escalation columns the scheduler owns
//! - Escalation policies, teams and on-call schedules (read-only)
//! - The append-only incident timeline
//! - The `CronSchedulerState` singleton used as a cross-process lease
//!
//! # Usage
//!
//! ```ignore
//! use oncall_coordination::state::{InMemoryStore, Incident, IncidentStore};
//!
//! let store = InMemoryStore::new();
//! store.insert_incident(Incident::new("inc-1", "API 5xx", "svc-api").escalating_at(now))?;
//!
//! if store.try_lock_incident("inc-1", now, now - Duration::minutes(5)).await? {
//!     // this worker owns the next step
//! }
//! ```

pub mod memory;
pub mod store;
pub mod types;

// Re-export core types
pub use memory::InMemoryStore;
pub use store::{
    DirectoryStore, DueCursor, DueEscalation, IncidentStore, RunRecord, SchedulerStateStore,
    StepAdvance, StoreError, StoreResult,
};
pub use types::{
    CronSchedulerState, EscalationContext, EscalationPolicy, EscalationStatus, EscalationStep,
    EscalationTarget, Incident, IncidentEvent, IncidentEventKind, IncidentId, NotificationChannel,
    OnCallSchedule, PolicyId, ScheduleId, ScheduleLayer, ScheduleOverride, ServiceId, TargetType,
    Team, TeamId, TeamMember, UserId,
};
