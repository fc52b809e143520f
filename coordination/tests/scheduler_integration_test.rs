//! Integration tests for the cron scheduler
//!
//! Runs full scheduler loops on paused tokio time against a shared
//! in-memory store standing in for the database.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use oncall_coordination::{
    BatchProcessor, CronScheduler, DeliveryReport, EscalationExecutor, EscalationPolicy,
    EscalationStatus, EscalationStep, EscalationSweep, EscalationWake, InMemoryStore, Incident,
    IncidentStore, ManualClock, NotificationDispatcher, NotificationPayload, NotificationSender,
    NotifyError, SchedulerConfig, SchedulerGate, SchedulerStateStore, SystemClock,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap()
}

#[derive(Default)]
struct Pager {
    pages: Mutex<Vec<String>>,
}

#[async_trait]
impl NotificationSender for Pager {
    async fn send_user_notification(
        &self,
        user_id: &str,
        _payload: &NotificationPayload,
    ) -> Result<DeliveryReport, NotifyError> {
        self.pages.lock().unwrap().push(user_id.to_string());
        Ok(DeliveryReport::delivered())
    }
}

fn escalating_scheduler(
    store: &Arc<InMemoryStore>,
    clock: &Arc<ManualClock>,
    pager: &Arc<Pager>,
) -> CronScheduler {
    let dispatcher = NotificationDispatcher::new(pager.clone(), clock.clone());
    let executor = Arc::new(EscalationExecutor::new(
        store.clone(),
        store.clone(),
        dispatcher,
        clock.clone(),
    ));
    let processor = BatchProcessor::new(store.clone(), clock.clone());

    CronScheduler::builder(store.clone())
        .clock(clock.clone())
        .config(SchedulerConfig::default())
        .job(Arc::new(EscalationSweep::new(processor, executor)))
        .wake_source(Arc::new(EscalationWake::new(store.clone())))
        .build()
}

/// Test: status right after a start during the production build reports not running
#[tokio::test]
async fn test_build_phase_start_reports_not_running() {
    let store = Arc::new(InMemoryStore::new());
    let scheduler = CronScheduler::builder(store)
        .clock(SystemClock::shared())
        .build();

    let gate = SchedulerGate::from_lookup(|key| {
        (key == "NEXT_PHASE").then(|| "phase-production-build".to_string())
    });
    assert!(!scheduler.start(&gate));

    let status = scheduler.status();
    assert!(!status.running);
    assert_eq!(status.worker_id, None);
}

/// Test: disabled flag keeps the scheduler off
#[tokio::test]
async fn test_disabled_flag_refuses_start() {
    let store = Arc::new(InMemoryStore::new());
    let scheduler = CronScheduler::builder(store).build();

    let gate = SchedulerGate::from_lookup(|key| {
        (key == "CRON_SCHEDULER_ENABLED").then(|| "false".to_string())
    });
    assert!(!scheduler.start(&gate));
    assert!(!scheduler.is_running());
}

/// Test: a due incident is paged by the running loop and the loop sleeps until the next step
#[tokio::test(start_paused = true)]
async fn test_loop_pages_due_incident() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let pager = Arc::new(Pager::default());
    store
        .insert_policy(
            "svc-api",
            EscalationPolicy::new("pol-api", "api")
                .with_step(EscalationStep::user(0, 0, "first"))
                .with_step(EscalationStep::user(1, 1, "second")),
        )
        .unwrap();
    store
        .insert_incident(Incident::new("inc-1", "latency", "svc-api").escalating_at(t0()))
        .unwrap();

    let scheduler = escalating_scheduler(&store, &clock, &pager);
    assert!(scheduler.start(&SchedulerGate::open()));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*pager.pages.lock().unwrap(), vec!["first"]);

    // Next step is due in 60s, inside the clamp window
    let status = scheduler.status();
    assert!(status.running);
    assert!(status.holds_lock);
    assert_eq!(status.last_delay_secs, Some(60));
    assert!(status.last_success_at.is_some());

    clock.advance(chrono::Duration::seconds(60));
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(*pager.pages.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(
        store.incident("inc-1").unwrap().unwrap().escalation_status,
        EscalationStatus::Completed
    );

    scheduler.stop().await;
    assert!(store.load_state().await.unwrap().unwrap().locked_by.is_none());
}

/// Test: two running schedulers never both page the same incident
#[tokio::test(start_paused = true)]
async fn test_two_processes_share_the_work() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let pager = Arc::new(Pager::default());
    store
        .insert_policy(
            "svc-api",
            EscalationPolicy::new("pol-api", "api").with_step(EscalationStep::user(0, 0, "oncall")),
        )
        .unwrap();
    for i in 0..5 {
        store
            .insert_incident(
                Incident::new(format!("inc-{i}"), "latency", "svc-api").escalating_at(t0()),
            )
            .unwrap();
    }

    let a = escalating_scheduler(&store, &clock, &pager);
    let b = escalating_scheduler(&store, &clock, &pager);
    assert!(a.start(&SchedulerGate::open()));
    assert!(b.start(&SchedulerGate::open()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(pager.pages.lock().unwrap().len(), 5);
    assert!(a.status().holds_lock ^ b.status().holds_lock);

    // The holder stops; the other takes over on its next lock retry
    let (holder, standby) = if a.status().holds_lock { (a, b) } else { (b, a) };
    holder.stop().await;
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(standby.status().holds_lock);

    standby.stop().await;
}

/// Test: a stale lock left by a crashed worker is taken over after five minutes
#[tokio::test]
async fn test_crashed_worker_lock_is_reclaimed() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    store.ensure_state().await.unwrap();
    assert!(store
        .try_acquire_lock("worker-deadbeef0000", t0(), t0() - chrono::Duration::minutes(5))
        .await
        .unwrap());

    let scheduler = CronScheduler::builder(store.clone())
        .clock(clock.clone())
        .build();

    clock.advance(chrono::Duration::minutes(4));
    assert!(!scheduler.run_once().await.acquired_lock);

    clock.advance(chrono::Duration::minutes(2));
    assert!(scheduler.run_once().await.acquired_lock);
}

/// Test: a backlog left by the per-pass cap is picked up after the minimum delay
#[tokio::test]
async fn test_capped_pass_backlog_wakes_after_min_delay() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let pager = Arc::new(Pager::default());
    store
        .insert_policy(
            "svc-api",
            EscalationPolicy::new("pol-api", "api").with_step(EscalationStep::user(0, 0, "oncall")),
        )
        .unwrap();
    for i in 0..3 {
        store
            .insert_incident(
                Incident::new(format!("inc-{i}"), "latency", "svc-api")
                    .escalating_at(t0() - chrono::Duration::minutes(1)),
            )
            .unwrap();
    }

    let executor = Arc::new(EscalationExecutor::new(
        store.clone(),
        store.clone(),
        NotificationDispatcher::new(pager.clone(), clock.clone()),
        clock.clone(),
    ));
    let processor = BatchProcessor::new(store.clone(), clock.clone()).with_limits(1, 1);
    let scheduler = CronScheduler::builder(store.clone())
        .clock(clock.clone())
        .job(Arc::new(EscalationSweep::new(processor, executor)))
        .wake_source(Arc::new(EscalationWake::new(store.clone())))
        .build();

    let report = scheduler.run_once().await;
    assert_eq!(pager.pages.lock().unwrap().len(), 1);
    assert_eq!(store.find_due_escalations(t0(), 10, None).await.unwrap().len(), 2);
    assert_eq!(report.next_delay, Duration::from_secs(15));

    scheduler.run_once().await;
    scheduler.run_once().await;
    assert_eq!(pager.pages.lock().unwrap().len(), 3);

    // Drained: nothing pending, back to the idle ceiling
    let report = scheduler.run_once().await;
    assert_eq!(report.next_delay, Duration::from_secs(120));
}
