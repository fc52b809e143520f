//! Escalation executor: runs the current step of one incident
//!
//! ```text
//! load ─► COMPLETED? ─► policy? ─► exhausted? ─► lock ─► target ─► resolve ─► dispatch ─► advance
//!            │             │           │           │        │
//!            ▼             ▼           ▼           ▼        ▼
//!     AlreadyCompleted  NoPolicy   Exhausted  InProgress  InvalidTarget
//! ```
//!
//! Everything after the lock is taken ends by clearing it, either in the
//! same write that advances the incident or through an explicit release
//! when a store call fails.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::outcome::{EscalationError, EscalationOutcome, EscalationRunner};
use super::resolver::TargetResolver;
use crate::clock::SharedClock;
use crate::jobs::queue::JobQueue;
use crate::notify::{NotificationDispatcher, NotificationPayload};
use crate::state::store::{DirectoryStore, IncidentStore, StepAdvance};
use crate::state::types::{
    EscalationStatus, EscalationStep, Incident, IncidentEvent, IncidentEventKind,
};

/// Executor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// How long an incident with a broken step target waits before the
    /// scheduler looks at it again
    pub invalid_target_retry_secs: u64,
    /// Age after which a per-incident lock left by a dead worker is taken over
    pub stale_lock_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            invalid_target_retry_secs: 900,
            stale_lock_secs: 300,
        }
    }
}

impl ExecutorConfig {
    pub fn invalid_target_retry(&self) -> Duration {
        Duration::seconds(self.invalid_target_retry_secs.min(u64::from(u32::MAX)) as i64)
    }

    pub fn stale_lock(&self) -> Duration {
        Duration::seconds(self.stale_lock_secs.min(u64::from(u32::MAX)) as i64)
    }
}

/// Executes escalation steps against the incident store
#[derive(Clone)]
pub struct EscalationExecutor {
    incidents: Arc<dyn IncidentStore>,
    resolver: TargetResolver,
    dispatcher: NotificationDispatcher,
    queue: Option<Arc<dyn JobQueue>>,
    clock: SharedClock,
    config: ExecutorConfig,
}

impl EscalationExecutor {
    pub fn new(
        incidents: Arc<dyn IncidentStore>,
        directory: Arc<dyn DirectoryStore>,
        dispatcher: NotificationDispatcher,
        clock: SharedClock,
    ) -> Self {
        Self {
            incidents,
            resolver: TargetResolver::new(directory),
            dispatcher,
            queue: None,
            clock,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Also enqueue a job for each next step
    pub fn with_job_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Execute the incident's current step
    pub async fn execute(&self, incident_id: &str) -> Result<EscalationOutcome, EscalationError> {
        self.execute_step(incident_id, None).await
    }

    /// Execute only if the incident is still at `expected_step`
    pub async fn execute_expected(
        &self,
        incident_id: &str,
        expected_step: usize,
    ) -> Result<EscalationOutcome, EscalationError> {
        self.execute_step(incident_id, Some(expected_step)).await
    }

    async fn execute_step(
        &self,
        incident_id: &str,
        expected_step: Option<usize>,
    ) -> Result<EscalationOutcome, EscalationError> {
        let now = self.clock.now();

        let Some(context) = self.incidents.load_escalation_context(incident_id).await? else {
            tracing::debug!(incident_id = %incident_id, "Incident not found");
            return Ok(EscalationOutcome::NoPolicy);
        };
        let incident = context.incident;

        // Checked before the policy so a finished incident is a pure read
        if incident.escalation_status == EscalationStatus::Completed {
            return Ok(EscalationOutcome::AlreadyCompleted);
        }

        let Some(mut policy) = context.policy.filter(|p| !p.steps.is_empty()) else {
            tracing::debug!(incident_id = %incident_id, "No escalation policy configured");
            return Ok(EscalationOutcome::NoPolicy);
        };
        policy.steps.sort_by_key(|s| s.step_order);
        let steps = policy.steps;

        let step_index = incident.current_escalation_step.unwrap_or(0);
        if step_index >= steps.len() {
            let event = IncidentEvent::new(
                incident_id,
                IncidentEventKind::EscalationCompleted,
                "All escalation steps exhausted",
                now,
            )
            .with_data(json!({ "policyId": policy.id, "steps": steps.len() }));
            self.incidents
                .mark_escalation_completed(incident_id, event)
                .await?;
            tracing::info!(incident_id = %incident_id, "Escalation exhausted, marked completed");
            return Ok(EscalationOutcome::Exhausted);
        }

        if let Some(expected) = expected_step {
            if expected != step_index {
                return Ok(EscalationOutcome::Superseded {
                    expected,
                    current: step_index,
                });
            }
        }

        let stale_before = now - self.config.stale_lock();
        if !self
            .incidents
            .try_lock_incident(incident_id, now, stale_before)
            .await?
        {
            tracing::debug!(incident_id = %incident_id, "Escalation already in progress");
            return Ok(EscalationOutcome::AlreadyInProgress);
        }

        match self.run_locked(&incident, &steps, step_index, now).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(release_err) = self.incidents.release_incident_lock(incident_id).await {
                    tracing::error!(
                        incident_id = %incident_id,
                        "Failed to release escalation lock after error: {release_err}"
                    );
                }
                Err(e)
            }
        }
    }

    /// Body of an escalation attempt; the caller holds the incident lock
    async fn run_locked(
        &self,
        incident: &Incident,
        steps: &[EscalationStep],
        step_index: usize,
        now: DateTime<Utc>,
    ) -> Result<EscalationOutcome, EscalationError> {
        let step = &steps[step_index];

        let Some(target) = step.target() else {
            let retry_at = now + self.config.invalid_target_retry();
            let event = IncidentEvent::new(
                &incident.id,
                IncidentEventKind::EscalationTargetInvalid,
                format!(
                    "Escalation step {} has an invalid {} target",
                    step_index + 1,
                    step.target_type
                ),
                now,
            )
            .with_data(json!({ "step": step_index, "retryAt": retry_at }));
            self.incidents
                .defer_escalation(&incident.id, retry_at, event)
                .await?;
            tracing::warn!(
                incident_id = %incident.id,
                step = step_index,
                target_type = %step.target_type,
                "Invalid escalation target, deferring"
            );
            return Ok(EscalationOutcome::InvalidTarget);
        };

        let users = self.resolver.resolve_target(&target, now).await?;
        if users.is_empty() {
            tracing::warn!(
                incident_id = %incident.id,
                step = step_index,
                target_type = %target.target_type(),
                target_id = %target.target_id(),
                "Escalation step resolved to nobody"
            );
        }

        let payload = NotificationPayload {
            incident_id: incident.id.clone(),
            title: incident.title.clone(),
            message: format!(
                "Escalation step {} of {}: {}",
                step_index + 1,
                steps.len(),
                incident.title
            ),
            step: step_index,
            channels: step.notification_channels.clone(),
        };
        let summary = self.dispatcher.dispatch(&users, &payload).await;

        let next_step = step_index + 1;
        let next_escalation_at = steps.get(next_step).map(|s| now + s.delay());
        let completed = next_escalation_at.is_none();

        let event = IncidentEvent::new(
            &incident.id,
            IncidentEventKind::EscalationStepExecuted,
            format!(
                "Escalation step {} notified {} of {} users",
                step_index + 1,
                summary.delivered.len(),
                users.len()
            ),
            now,
        )
        .with_data(json!({
            "step": step_index,
            "targetType": target.target_type().as_str(),
            "targetId": target.target_id(),
            "notified": summary.delivered,
            "failed": summary.failed.iter().map(|(u, _)| u).collect::<Vec<_>>(),
            "completed": completed,
        }));

        self.incidents
            .record_step_executed(StepAdvance {
                incident_id: incident.id.clone(),
                next_step,
                next_escalation_at,
                completed,
                event,
            })
            .await?;

        if let (Some(queue), Some(at)) = (&self.queue, next_escalation_at) {
            if let Err(e) = queue.schedule_escalation(&incident.id, next_step, at).await {
                tracing::warn!(
                    incident_id = %incident.id,
                    step = next_step,
                    "Failed to queue next escalation step: {e}"
                );
            }
        }

        tracing::info!(
            incident_id = %incident.id,
            step = step_index,
            notified = summary.delivered.len(),
            failed = summary.failed.len(),
            completed,
            "Escalation step executed"
        );

        Ok(EscalationOutcome::Escalated {
            step: step_index,
            notified: summary.delivered.len(),
            failed: summary.failed.len(),
            next_escalation_at,
        })
    }
}

#[async_trait]
impl EscalationRunner for EscalationExecutor {
    async fn run_escalation(
        &self,
        incident_id: &str,
        expected_step: Option<usize>,
    ) -> Result<EscalationOutcome, EscalationError> {
        self.execute_step(incident_id, expected_step).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::queue::InMemoryJobQueue;
    use crate::notify::{DeliveryReport, InMemoryOutbox, NotificationSender, NotifyError};
    use crate::state::memory::InMemoryStore;
    use crate::state::store::{DueCursor, DueEscalation, StoreError, StoreResult};
    use crate::state::types::{EscalationContext, EscalationPolicy, Team, TeamMember};
    use chrono::TimeZone;
    use std::sync::Mutex;

    /// Records every page and fails for users listed in `reject`
    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<String>>,
        reject: Vec<String>,
    }

    #[async_trait]
    impl NotificationSender for RecordingSender {
        async fn send_user_notification(
            &self,
            user_id: &str,
            _payload: &NotificationPayload,
        ) -> Result<DeliveryReport, NotifyError> {
            self.sent.lock().unwrap().push(user_id.to_string());
            if self.reject.iter().any(|r| r == user_id) {
                return Err(NotifyError::Rejected("invalid number".into()));
            }
            Ok(DeliveryReport::delivered())
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        sender: Arc<RecordingSender>,
        clock: Arc<ManualClock>,
        executor: EscalationExecutor,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    /// Locks taken within five minutes of `t0` are live
    fn stale_before() -> DateTime<Utc> {
        t0() - chrono::Duration::minutes(5)
    }

    fn harness_with(sender: RecordingSender) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let sender = Arc::new(sender);
        let clock = Arc::new(ManualClock::new(t0()));
        let dispatcher = NotificationDispatcher::new(sender.clone(), clock.clone());
        let executor =
            EscalationExecutor::new(store.clone(), store.clone(), dispatcher, clock.clone());
        Harness {
            store,
            sender,
            clock,
            executor,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingSender::default())
    }

    fn two_step_policy() -> EscalationPolicy {
        EscalationPolicy::new("pol-1", "default")
            .with_step(EscalationStep::user(0, 0, "primary"))
            .with_step(EscalationStep::user(1, 15, "secondary"))
    }

    #[tokio::test]
    async fn test_first_step_notifies_and_advances() {
        let h = harness();
        h.store.insert_policy("svc-1", two_step_policy()).unwrap();
        h.store
            .insert_incident(Incident::new("inc-1", "db down", "svc-1").escalating_at(t0()))
            .unwrap();

        let outcome = h.executor.execute("inc-1").await.unwrap();
        assert_eq!(
            outcome,
            EscalationOutcome::Escalated {
                step: 0,
                notified: 1,
                failed: 0,
                next_escalation_at: Some(t0() + Duration::minutes(15)),
            }
        );
        assert_eq!(*h.sender.sent.lock().unwrap(), vec!["primary"]);

        let incident = h.store.incident("inc-1").unwrap().unwrap();
        assert_eq!(incident.current_escalation_step, Some(1));
        assert_eq!(incident.escalation_status, EscalationStatus::Escalating);
        assert!(!incident.is_locked());

        let events = h.store.events_for("inc-1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, IncidentEventKind::EscalationStepExecuted);
    }

    #[tokio::test]
    async fn test_last_step_completes_in_same_write() {
        let h = harness();
        h.store.insert_policy("svc-1", two_step_policy()).unwrap();
        h.store
            .insert_incident(
                Incident::new("inc-1", "db down", "svc-1")
                    .escalating_at(t0())
                    .at_step(1),
            )
            .unwrap();

        let outcome = h.executor.execute("inc-1").await.unwrap();
        assert!(matches!(
            outcome,
            EscalationOutcome::Escalated {
                step: 1,
                next_escalation_at: None,
                ..
            }
        ));

        let incident = h.store.incident("inc-1").unwrap().unwrap();
        assert_eq!(incident.escalation_status, EscalationStatus::Completed);
        assert_eq!(incident.next_escalation_at, None);

        let writes = h.store.incident_write_count();
        assert_eq!(
            h.executor.execute("inc-1").await.unwrap(),
            EscalationOutcome::AlreadyCompleted
        );
        assert_eq!(h.store.incident_write_count(), writes);
    }

    #[tokio::test]
    async fn test_exhausted_marks_completed() {
        let h = harness();
        h.store.insert_policy("svc-1", two_step_policy()).unwrap();
        h.store
            .insert_incident(
                Incident::new("inc-1", "db down", "svc-1")
                    .escalating_at(t0())
                    .at_step(2),
            )
            .unwrap();

        assert_eq!(
            h.executor.execute("inc-1").await.unwrap(),
            EscalationOutcome::Exhausted
        );
        let incident = h.store.incident("inc-1").unwrap().unwrap();
        assert_eq!(incident.escalation_status, EscalationStatus::Completed);
        assert_eq!(incident.current_escalation_step, None);
        assert!(h.sender.sent.lock().unwrap().is_empty());

        // Exactly once: the next call is a no-op
        assert_eq!(
            h.executor.execute("inc-1").await.unwrap(),
            EscalationOutcome::AlreadyCompleted
        );
    }

    #[tokio::test]
    async fn test_missing_incident_or_policy() {
        let h = harness();
        assert_eq!(
            h.executor.execute("ghost").await.unwrap(),
            EscalationOutcome::NoPolicy
        );

        h.store
            .insert_incident(Incident::new("inc-1", "orphan", "svc-none").escalating_at(t0()))
            .unwrap();
        assert_eq!(
            h.executor.execute("inc-1").await.unwrap(),
            EscalationOutcome::NoPolicy
        );

        h.store
            .insert_policy("svc-empty", EscalationPolicy::new("pol-empty", "empty"))
            .unwrap();
        h.store
            .insert_incident(Incident::new("inc-2", "stepless", "svc-empty").escalating_at(t0()))
            .unwrap();
        assert_eq!(
            h.executor.execute("inc-2").await.unwrap(),
            EscalationOutcome::NoPolicy
        );
    }

    #[tokio::test]
    async fn test_locked_incident_is_in_progress() {
        let h = harness();
        h.store.insert_policy("svc-1", two_step_policy()).unwrap();
        h.store
            .insert_incident(Incident::new("inc-1", "db down", "svc-1").escalating_at(t0()))
            .unwrap();
        assert!(h
            .store
            .try_lock_incident("inc-1", t0(), stale_before())
            .await
            .unwrap());

        assert_eq!(
            h.executor.execute("inc-1").await.unwrap(),
            EscalationOutcome::AlreadyInProgress
        );
        assert!(h.sender.sent.lock().unwrap().is_empty());
        // The other worker's lock is untouched
        assert!(h.store.incident("inc-1").unwrap().unwrap().is_locked());
    }

    #[tokio::test]
    async fn test_abandoned_incident_lock_is_taken_over() {
        let h = harness();
        h.store.insert_policy("svc-1", two_step_policy()).unwrap();
        h.store
            .insert_incident(Incident::new("inc-1", "db down", "svc-1").escalating_at(t0()))
            .unwrap();
        assert!(h
            .store
            .try_lock_incident("inc-1", t0(), stale_before())
            .await
            .unwrap());

        h.clock.advance(Duration::minutes(4));
        assert_eq!(
            h.executor.execute("inc-1").await.unwrap(),
            EscalationOutcome::AlreadyInProgress
        );

        h.clock.advance(Duration::minutes(2));
        assert!(h.executor.execute("inc-1").await.unwrap().escalated());
        let incident = h.store.incident("inc-1").unwrap().unwrap();
        assert_eq!(incident.current_escalation_step, Some(1));
        assert!(!incident.is_locked());
    }

    #[tokio::test]
    async fn test_invalid_target_defers_and_releases_lock() {
        let h = harness();
        let mut broken = EscalationStep::user(0, 0, "u-1");
        broken.target_type = crate::state::types::TargetType::Team;
        h.store
            .insert_policy(
                "svc-1",
                EscalationPolicy::new("pol-1", "broken").with_step(broken),
            )
            .unwrap();
        h.store
            .insert_incident(Incident::new("inc-1", "db down", "svc-1").escalating_at(t0()))
            .unwrap();

        assert_eq!(
            h.executor.execute("inc-1").await.unwrap(),
            EscalationOutcome::InvalidTarget
        );

        let incident = h.store.incident("inc-1").unwrap().unwrap();
        assert!(!incident.is_locked());
        assert_eq!(incident.escalation_status, EscalationStatus::Escalating);
        assert_eq!(incident.current_escalation_step, None);
        assert_eq!(
            incident.next_escalation_at,
            Some(t0() + Duration::seconds(900))
        );
        let events = h.store.events_for("inc-1").unwrap();
        assert_eq!(events[0].kind, IncidentEventKind::EscalationTargetInvalid);
    }

    #[tokio::test]
    async fn test_delivery_failures_do_not_fail_step() {
        let h = harness_with(RecordingSender {
            reject: vec!["dev".into()],
            ..Default::default()
        });
        h.store
            .insert_team(Team {
                id: "t-1".into(),
                team_lead_id: Some("lead".into()),
                members: vec![TeamMember::new("lead", true), TeamMember::new("dev", true)],
            })
            .unwrap();
        h.store
            .insert_policy(
                "svc-1",
                EscalationPolicy::new("pol-1", "team").with_step(EscalationStep::team(0, 0, "t-1")),
            )
            .unwrap();
        h.store
            .insert_incident(Incident::new("inc-1", "db down", "svc-1").escalating_at(t0()))
            .unwrap();

        let outcome = h.executor.execute("inc-1").await.unwrap();
        assert!(matches!(
            outcome,
            EscalationOutcome::Escalated {
                notified: 1,
                failed: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_lead_only_team_with_no_opted_in_lead_still_advances() {
        let h = harness();
        h.store
            .insert_team(Team {
                id: "t-1".into(),
                team_lead_id: Some("lead".into()),
                members: vec![TeamMember::new("lead", false), TeamMember::new("dev", true)],
            })
            .unwrap();
        h.store
            .insert_policy(
                "svc-1",
                EscalationPolicy::new("pol-1", "lead")
                    .with_step(EscalationStep::team(0, 0, "t-1").lead_only()),
            )
            .unwrap();
        h.store
            .insert_incident(Incident::new("inc-1", "db down", "svc-1").escalating_at(t0()))
            .unwrap();

        let outcome = h.executor.execute("inc-1").await.unwrap();
        assert!(matches!(
            outcome,
            EscalationOutcome::Escalated { notified: 0, .. }
        ));
        assert!(h.sender.sent.lock().unwrap().is_empty());
        let incident = h.store.incident("inc-1").unwrap().unwrap();
        assert_eq!(incident.escalation_status, EscalationStatus::Completed);
    }

    #[tokio::test]
    async fn test_expected_step_guards_stale_triggers() {
        let h = harness();
        h.store.insert_policy("svc-1", two_step_policy()).unwrap();
        h.store
            .insert_incident(
                Incident::new("inc-1", "db down", "svc-1")
                    .escalating_at(t0())
                    .at_step(1),
            )
            .unwrap();

        assert_eq!(
            h.executor.execute_expected("inc-1", 0).await.unwrap(),
            EscalationOutcome::Superseded {
                expected: 0,
                current: 1
            }
        );
        assert!(h.executor.execute_expected("inc-1", 1).await.unwrap().escalated());
    }

    #[tokio::test]
    async fn test_next_step_is_queued() {
        let h = harness();
        let queue = Arc::new(InMemoryJobQueue::new());
        let executor = h.executor.clone().with_job_queue(queue.clone());
        h.store.insert_policy("svc-1", two_step_policy()).unwrap();
        h.store
            .insert_incident(Incident::new("inc-1", "db down", "svc-1").escalating_at(t0()))
            .unwrap();

        executor.execute("inc-1").await.unwrap();

        let due = t0() + Duration::minutes(15);
        assert_eq!(queue.next_job_due().await.unwrap(), Some(due));
        h.clock.set(due);
        let jobs = queue.claim_due(due, 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
    }

    /// Incident store whose step write always hits a serialization failure
    struct ConflictingStore {
        inner: InMemoryStore,
    }

    #[async_trait]
    impl IncidentStore for ConflictingStore {
        async fn load_escalation_context(
            &self,
            incident_id: &str,
        ) -> StoreResult<Option<EscalationContext>> {
            self.inner.load_escalation_context(incident_id).await
        }
        async fn mark_escalation_completed(
            &self,
            incident_id: &str,
            event: IncidentEvent,
        ) -> StoreResult<()> {
            self.inner.mark_escalation_completed(incident_id, event).await
        }
        async fn try_lock_incident(
            &self,
            incident_id: &str,
            now: DateTime<Utc>,
            stale_before: DateTime<Utc>,
        ) -> StoreResult<bool> {
            self.inner.try_lock_incident(incident_id, now, stale_before).await
        }
        async fn release_incident_lock(&self, incident_id: &str) -> StoreResult<()> {
            self.inner.release_incident_lock(incident_id).await
        }
        async fn record_step_executed(&self, _advance: StepAdvance) -> StoreResult<()> {
            Err(StoreError::Conflict("could not serialize access".into()))
        }
        async fn defer_escalation(
            &self,
            incident_id: &str,
            next_escalation_at: DateTime<Utc>,
            event: IncidentEvent,
        ) -> StoreResult<()> {
            self.inner
                .defer_escalation(incident_id, next_escalation_at, event)
                .await
        }
        async fn find_due_escalations(
            &self,
            now: DateTime<Utc>,
            limit: usize,
            after: Option<&DueCursor>,
        ) -> StoreResult<Vec<DueEscalation>> {
            self.inner.find_due_escalations(now, limit, after).await
        }
        async fn next_escalation_due(&self) -> StoreResult<Option<DateTime<Utc>>> {
            self.inner.next_escalation_due().await
        }
    }

    #[tokio::test]
    async fn test_store_failure_after_lock_releases_it() {
        let inner = InMemoryStore::new();
        inner.insert_policy("svc-1", two_step_policy()).unwrap();
        inner
            .insert_incident(Incident::new("inc-1", "db down", "svc-1").escalating_at(t0()))
            .unwrap();
        let store = Arc::new(ConflictingStore { inner });
        let clock = Arc::new(ManualClock::new(t0()));
        let dispatcher =
            NotificationDispatcher::new(Arc::new(RecordingSender::default()), clock.clone())
                .with_outbox(Arc::new(InMemoryOutbox::new()));
        let executor =
            EscalationExecutor::new(store.clone(), Arc::new(InMemoryStore::new()), dispatcher, clock);

        let err = executor.execute("inc-1").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!store.inner.incident("inc-1").unwrap().unwrap().is_locked());
    }
}
