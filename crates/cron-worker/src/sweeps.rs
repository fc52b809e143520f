//! SQL housekeeping sweeps
//!
//! Each sweep is one idempotent statement against the host schema, bound to
//! the tick time as `$1`. They run after the escalation jobs in the order
//! returned by [`standard_sweeps`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use oncall_coordination::jobs::{HousekeepingJob, JobCadence, JobError, JobReport};
use oncall_coordination::StoreResult;

use crate::config::SweepConfig;

/// Runs a sweep statement and returns the affected row count
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SweepExecutor: Send + Sync {
    async fn execute_sweep(&self, sql: &str, now: DateTime<Utc>) -> StoreResult<u64>;
}

/// Snoozed incidents whose snooze expired go back to open
pub const AUTO_UNSNOOZE_SQL: &str = r#"
UPDATE "Incident"
SET "status" = 'OPEN', "snoozedUntil" = NULL
WHERE "status" = 'SNOOZED' AND "snoozedUntil" <= $1"#;

/// Expired one-time tokens (email verification, password reset)
pub const STALE_TOKEN_CLEANUP_SQL: &str = r#"
DELETE FROM "VerificationToken" WHERE "expires" < $1"#;

/// Unacknowledged incidents past their SLA deadline get flagged once
pub const SLA_BREACH_SQL: &str = r#"
UPDATE "Incident"
SET "slaBreached" = TRUE, "slaBreachedAt" = $1
WHERE "slaBreached" = FALSE
  AND "acknowledgedAt" IS NULL
  AND "status" <> 'RESOLVED'
  AND "slaDeadline" <= $1"#;

/// Per-service counts for the previous UTC day
pub const DAILY_ROLLUP_SQL: &str = r#"
INSERT INTO "IncidentDailyRollup" ("day", "serviceId", "opened", "resolved")
SELECT (date_trunc('day', $1::timestamp) - INTERVAL '1 day')::date,
       i."serviceId",
       COUNT(*) FILTER (WHERE i."createdAt" >= date_trunc('day', $1::timestamp) - INTERVAL '1 day'),
       COUNT(*) FILTER (WHERE i."resolvedAt" >= date_trunc('day', $1::timestamp) - INTERVAL '1 day')
FROM "Incident" i
WHERE i."createdAt" < date_trunc('day', $1::timestamp)
  AND (i."createdAt" >= date_trunc('day', $1::timestamp) - INTERVAL '1 day'
       OR (i."resolvedAt" >= date_trunc('day', $1::timestamp) - INTERVAL '1 day'
           AND i."resolvedAt" < date_trunc('day', $1::timestamp)))
GROUP BY i."serviceId"
ON CONFLICT ("day", "serviceId")
DO UPDATE SET "opened" = EXCLUDED."opened", "resolved" = EXCLUDED."resolved""#;

/// A housekeeping job backed by one SQL statement
pub struct SqlSweep {
    name: &'static str,
    cadence: JobCadence,
    sql: &'static str,
    executor: Arc<dyn SweepExecutor>,
}

impl SqlSweep {
    pub fn new(
        name: &'static str,
        cadence: JobCadence,
        sql: &'static str,
        executor: Arc<dyn SweepExecutor>,
    ) -> Self {
        Self {
            name,
            cadence,
            sql,
            executor,
        }
    }
}

#[async_trait]
impl HousekeepingJob for SqlSweep {
    fn name(&self) -> &str {
        self.name
    }

    fn cadence(&self) -> JobCadence {
        self.cadence
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<JobReport, JobError> {
        let affected = self.executor.execute_sweep(self.sql, now).await?;
        if affected > 0 {
            tracing::info!(job = self.name, affected, "Sweep updated rows");
        }
        Ok(JobReport::affected(affected as usize))
    }
}

/// The enabled sweeps in run order: unsnooze, token cleanup, SLA check, rollup
pub fn standard_sweeps(executor: Arc<dyn SweepExecutor>, config: &SweepConfig) -> Vec<SqlSweep> {
    let table = [
        (
            config.auto_unsnooze,
            "auto-unsnooze",
            JobCadence::EveryTick,
            AUTO_UNSNOOZE_SQL,
        ),
        (
            config.stale_token_cleanup,
            "stale-token-cleanup",
            JobCadence::EveryTick,
            STALE_TOKEN_CLEANUP_SQL,
        ),
        (
            config.sla_breach_check,
            "sla-breach-check",
            JobCadence::EveryTick,
            SLA_BREACH_SQL,
        ),
        (
            config.daily_rollup,
            "daily-rollup",
            JobCadence::Daily,
            DAILY_ROLLUP_SQL,
        ),
    ];

    table
        .into_iter()
        .filter(|(enabled, ..)| *enabled)
        .map(|(_, name, cadence, sql)| SqlSweep::new(name, cadence, sql, executor.clone()))
        .collect()
}
