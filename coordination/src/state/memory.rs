//! In-memory store implementation for testing.
//!
//! [`InMemoryStore`] implements every store seam over `RwLock`-guarded maps.
//! Each conditional update takes the write lock once, so the check and the
//! write are atomic exactly like a single `UPDATE ... WHERE` statement.
//!
//! ## Limitations
//!
//! - **Single-process only**: locks are not shared across process boundaries
//! - **No persistence**: all state is lost when the process exits

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::store::*;
use super::types::*;

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::LockPoisoned
}

/// In-memory implementation of the incident, directory and scheduler stores
#[derive(Debug, Default)]
pub struct InMemoryStore {
    incidents: RwLock<HashMap<IncidentId, Incident>>,
    service_policies: RwLock<HashMap<ServiceId, PolicyId>>,
    policies: RwLock<HashMap<PolicyId, EscalationPolicy>>,
    teams: RwLock<HashMap<TeamId, Team>>,
    schedules: RwLock<HashMap<ScheduleId, OnCallSchedule>>,
    events: RwLock<Vec<IncidentEvent>>,
    scheduler: RwLock<Option<CronSchedulerState>>,
    scheduler_unavailable: AtomicBool,
    incident_writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    pub fn insert_incident(&self, incident: Incident) -> StoreResult<()> {
        let mut incidents = self.incidents.write().map_err(poison_err)?;
        incidents.insert(incident.id.clone(), incident);
        Ok(())
    }

    /// Attach a policy to a service
    pub fn insert_policy(&self, service_id: &str, policy: EscalationPolicy) -> StoreResult<()> {
        self.service_policies
            .write()
            .map_err(poison_err)?
            .insert(service_id.to_string(), policy.id.clone());
        self.policies
            .write()
            .map_err(poison_err)?
            .insert(policy.id.clone(), policy);
        Ok(())
    }

    pub fn insert_team(&self, team: Team) -> StoreResult<()> {
        self.teams
            .write()
            .map_err(poison_err)?
            .insert(team.id.clone(), team);
        Ok(())
    }

    pub fn insert_schedule(&self, schedule: OnCallSchedule) -> StoreResult<()> {
        self.schedules
            .write()
            .map_err(poison_err)?
            .insert(schedule.id.clone(), schedule);
        Ok(())
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn incident(&self, incident_id: &str) -> StoreResult<Option<Incident>> {
        Ok(self
            .incidents
            .read()
            .map_err(poison_err)?
            .get(incident_id)
            .cloned())
    }

    /// Timeline entries for one incident, in append order
    pub fn events_for(&self, incident_id: &str) -> StoreResult<Vec<IncidentEvent>> {
        Ok(self
            .events
            .read()
            .map_err(poison_err)?
            .iter()
            .filter(|e| e.incident_id == incident_id)
            .cloned()
            .collect())
    }

    /// Number of incident mutations applied so far
    pub fn incident_write_count(&self) -> usize {
        self.incident_writes.load(Ordering::SeqCst)
    }

    /// Make every scheduler-state call fail with `Unavailable`
    pub fn set_scheduler_state_unavailable(&self, unavailable: bool) {
        self.scheduler_unavailable
            .store(unavailable, Ordering::SeqCst);
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn check_scheduler_available(&self) -> StoreResult<()> {
        if self.scheduler_unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "scheduler state table unreachable".to_string(),
            ));
        }
        Ok(())
    }

    fn append_event(&self, event: IncidentEvent) -> StoreResult<()> {
        self.events.write().map_err(poison_err)?.push(event);
        Ok(())
    }

    /// Apply `f` to an existing incident under the write lock
    fn update_incident<R>(
        &self,
        incident_id: &str,
        f: impl FnOnce(&mut Incident) -> R,
    ) -> StoreResult<R> {
        let mut incidents = self.incidents.write().map_err(poison_err)?;
        let incident = incidents
            .get_mut(incident_id)
            .ok_or_else(|| StoreError::NotFound(incident_id.to_string()))?;
        let result = f(incident);
        self.incident_writes.fetch_add(1, Ordering::SeqCst);
        Ok(result)
    }
}

#[async_trait]
impl IncidentStore for InMemoryStore {
    async fn load_escalation_context(
        &self,
        incident_id: &str,
    ) -> StoreResult<Option<EscalationContext>> {
        let Some(incident) = self.incident(incident_id)? else {
            return Ok(None);
        };

        let policy_id = self
            .service_policies
            .read()
            .map_err(poison_err)?
            .get(&incident.service_id)
            .cloned();
        let policy = match policy_id {
            Some(id) => self.policies.read().map_err(poison_err)?.get(&id).cloned(),
            None => None,
        };

        Ok(Some(EscalationContext { incident, policy }))
    }

    async fn mark_escalation_completed(
        &self,
        incident_id: &str,
        event: IncidentEvent,
    ) -> StoreResult<()> {
        self.update_incident(incident_id, |incident| {
            incident.escalation_status = EscalationStatus::Completed;
            incident.current_escalation_step = None;
            incident.next_escalation_at = None;
            incident.escalation_processing_at = None;
        })?;
        self.append_event(event)
    }

    async fn try_lock_incident(
        &self,
        incident_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut incidents = self.incidents.write().map_err(poison_err)?;
        match incidents.get_mut(incident_id) {
            Some(incident)
                if incident
                    .escalation_processing_at
                    .map_or(true, |at| at < stale_before) =>
            {
                incident.escalation_processing_at = Some(now);
                self.incident_writes.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_incident_lock(&self, incident_id: &str) -> StoreResult<()> {
        self.update_incident(incident_id, |incident| {
            incident.escalation_processing_at = None;
        })
    }

    async fn record_step_executed(&self, advance: StepAdvance) -> StoreResult<()> {
        self.update_incident(&advance.incident_id, |incident| {
            incident.current_escalation_step = Some(advance.next_step);
            incident.next_escalation_at = advance.next_escalation_at;
            incident.escalation_processing_at = None;
            if advance.completed {
                incident.escalation_status = EscalationStatus::Completed;
            }
        })?;
        self.append_event(advance.event)
    }

    async fn defer_escalation(
        &self,
        incident_id: &str,
        next_escalation_at: DateTime<Utc>,
        event: IncidentEvent,
    ) -> StoreResult<()> {
        self.update_incident(incident_id, |incident| {
            incident.next_escalation_at = Some(next_escalation_at);
            incident.escalation_processing_at = None;
        })?;
        self.append_event(event)
    }

    async fn find_due_escalations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        after: Option<&DueCursor>,
    ) -> StoreResult<Vec<DueEscalation>> {
        let incidents = self.incidents.read().map_err(poison_err)?;

        let mut due: Vec<DueEscalation> = incidents
            .values()
            .filter(|i| i.escalation_status == EscalationStatus::Escalating)
            .filter_map(|i| {
                let at = i.next_escalation_at?;
                (at <= now).then(|| DueEscalation {
                    incident_id: i.id.clone(),
                    current_escalation_step: i.current_escalation_step,
                    next_escalation_at: at,
                })
            })
            .filter(|d| match after {
                Some(cursor) => {
                    (d.next_escalation_at, d.incident_id.as_str())
                        > (cursor.next_escalation_at, cursor.incident_id.as_str())
                }
                None => true,
            })
            .collect();
        drop(incidents);

        due.sort_by(|a, b| {
            a.next_escalation_at
                .cmp(&b.next_escalation_at)
                .then_with(|| a.incident_id.cmp(&b.incident_id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn next_escalation_due(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let incidents = self.incidents.read().map_err(poison_err)?;
        Ok(incidents
            .values()
            .filter(|i| i.escalation_status == EscalationStatus::Escalating)
            .filter_map(|i| i.next_escalation_at)
            .min())
    }
}

#[async_trait]
impl DirectoryStore for InMemoryStore {
    async fn find_team(&self, team_id: &str) -> StoreResult<Option<Team>> {
        Ok(self.teams.read().map_err(poison_err)?.get(team_id).cloned())
    }

    async fn find_schedule(
        &self,
        schedule_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<OnCallSchedule>> {
        let schedules = self.schedules.read().map_err(poison_err)?;
        Ok(schedules.get(schedule_id).map(|schedule| {
            let mut schedule = schedule.clone();
            schedule.overrides.retain(|o| o.covers(at));
            schedule
        }))
    }
}

#[async_trait]
impl SchedulerStateStore for InMemoryStore {
    async fn ensure_state(&self) -> StoreResult<CronSchedulerState> {
        self.check_scheduler_available()?;
        let mut state = self.scheduler.write().map_err(poison_err)?;
        Ok(state.get_or_insert_with(CronSchedulerState::new).clone())
    }

    async fn load_state(&self) -> StoreResult<Option<CronSchedulerState>> {
        self.check_scheduler_available()?;
        Ok(self.scheduler.read().map_err(poison_err)?.clone())
    }

    async fn try_acquire_lock(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check_scheduler_available()?;
        let mut guard = self.scheduler.write().map_err(poison_err)?;
        let Some(state) = guard.as_mut() else {
            return Ok(false);
        };
        if !state.lock_available_to(worker_id, stale_before) {
            return Ok(false);
        }
        state.locked_by = Some(worker_id.to_string());
        state.locked_at = Some(now);
        Ok(true)
    }

    async fn release_lock(&self, worker_id: &str) -> StoreResult<bool> {
        self.check_scheduler_available()?;
        let mut guard = self.scheduler.write().map_err(poison_err)?;
        match guard.as_mut() {
            Some(state) if state.locked_by.as_deref() == Some(worker_id) => {
                state.locked_by = None;
                state.locked_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_run(&self, worker_id: &str, record: &RunRecord) -> StoreResult<bool> {
        self.check_scheduler_available()?;
        let mut guard = self.scheduler.write().map_err(poison_err)?;
        match guard.as_mut() {
            Some(state) if state.locked_by.as_deref() == Some(worker_id) => {
                state.last_run_at = Some(record.last_run_at);
                if record.last_success_at.is_some() {
                    state.last_success_at = record.last_success_at;
                }
                state.last_error = record.last_error.clone();
                state.next_run_at = Some(record.next_run_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_rollup(&self, worker_id: &str, date: NaiveDate) -> StoreResult<bool> {
        self.check_scheduler_available()?;
        let mut guard = self.scheduler.write().map_err(poison_err)?;
        match guard.as_mut() {
            Some(state) if state.locked_by.as_deref() == Some(worker_id) => {
                state.last_rollup_date = Some(date);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
