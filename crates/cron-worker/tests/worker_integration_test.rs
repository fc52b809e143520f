//! Worker wiring tests
//!
//! The in-memory tests run everywhere. The Postgres test needs a database
//! with the host schema at `TEST_DATABASE_URL`; run it with `--ignored`.

use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use cron_worker::{build_scheduler, PgStore, WorkerConfig, WorkerStores};
use oncall_coordination::{
    DeliveryReport, EscalationPolicy, EscalationStatus, EscalationStep, InMemoryJobQueue,
    InMemoryOutbox, InMemoryStore, Incident, ManualClock, NotificationPayload, NotificationSender,
    NotifyError, SchedulerStateStore,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 2, 10, 22, 0, 0).unwrap()
}

/// Fails the first page to each user, then delivers
#[derive(Default)]
struct FlakyPager {
    seen: Mutex<Vec<String>>,
    delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl NotificationSender for FlakyPager {
    async fn send_user_notification(
        &self,
        user_id: &str,
        _payload: &NotificationPayload,
    ) -> Result<DeliveryReport, NotifyError> {
        let mut seen = self.seen.lock().unwrap();
        if !seen.iter().any(|u| u == user_id) {
            seen.push(user_id.to_string());
            return Err(NotifyError::Transport("gateway timeout".into()));
        }
        self.delivered.lock().unwrap().push(user_id.to_string());
        Ok(DeliveryReport::delivered())
    }
}

fn memory_stores(store: &Arc<InMemoryStore>, outbox: &Arc<InMemoryOutbox>) -> WorkerStores {
    WorkerStores {
        incidents: store.clone(),
        directory: store.clone(),
        state: store.clone(),
        queue: Arc::new(InMemoryJobQueue::new()),
        outbox: outbox.clone(),
        sweeps: None,
    }
}

/// Test: a failed page is parked and delivered by a later tick's retry sweep
#[tokio::test]
async fn test_failed_page_is_retried_on_later_tick() {
    let store = Arc::new(InMemoryStore::new());
    let outbox = Arc::new(InMemoryOutbox::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let pager = Arc::new(FlakyPager::default());

    store
        .insert_policy(
            "svc-auth",
            EscalationPolicy::new("pol-auth", "auth").with_step(EscalationStep::user(0, 0, "oncall")),
        )
        .unwrap();
    store
        .insert_incident(Incident::new("inc-7", "login errors", "svc-auth").escalating_at(t0()))
        .unwrap();

    let scheduler = build_scheduler(
        memory_stores(&store, &outbox),
        pager.clone(),
        clock.clone(),
        &WorkerConfig::default(),
    );

    let first = scheduler.run_once().await;
    assert!(first.failures.is_empty());
    // The step still advanced even though delivery failed
    assert_eq!(
        store.incident("inc-7").unwrap().unwrap().escalation_status,
        EscalationStatus::Completed
    );
    assert_eq!(outbox.len(), 1);
    assert!(pager.delivered.lock().unwrap().is_empty());

    clock.advance(chrono::Duration::minutes(1));
    let second = scheduler.run_once().await;
    let retry = second
        .jobs
        .iter()
        .find(|j| j.name == "notification-retry")
        .unwrap();
    assert_eq!(retry.affected, 1);
    assert_eq!(*pager.delivered.lock().unwrap(), vec!["oncall"]);
}

/// Test: scheduler tuning from a TOML file reaches the running loop
#[tokio::test]
async fn test_config_file_tunes_idle_sleep() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[scheduler]\nmax_delay_secs = 60").unwrap();
    let config = WorkerConfig::from_file(file.path()).unwrap();
    config.validate().unwrap();

    let store = Arc::new(InMemoryStore::new());
    let scheduler = build_scheduler(
        memory_stores(&store, &Arc::new(InMemoryOutbox::new())),
        Arc::new(FlakyPager::default()),
        Arc::new(ManualClock::new(t0())),
        &config,
    );

    let report = scheduler.run_once().await;
    assert_eq!(report.next_delay, std::time::Duration::from_secs(60));

    let state = store.load_state().await.unwrap().unwrap();
    assert_eq!(state.next_run_at, Some(t0() + chrono::Duration::seconds(60)));
    assert_eq!(state.last_success_at, Some(t0()));
    assert_eq!(state.locked_by, None);
}

/// Test: lock acquisition and release against a real database
#[tokio::test]
#[ignore]
async fn test_postgres_scheduler_lock() {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        return;
    };
    let store = PgStore::connect(&url).await.unwrap();
    store.apply_schema().await.unwrap();

    let now = Utc::now();
    store.ensure_state().await.unwrap();
    store.release_lock("worker-itest00000a").await.unwrap();
    store.release_lock("worker-itest00000b").await.unwrap();

    let stale_before = now - chrono::Duration::minutes(5);
    assert!(store
        .try_acquire_lock("worker-itest00000a", now, stale_before)
        .await
        .unwrap());
    assert!(!store
        .try_acquire_lock("worker-itest00000b", now, stale_before)
        .await
        .unwrap());
    assert!(store.release_lock("worker-itest00000a").await.unwrap());
}
