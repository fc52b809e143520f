//! Postgres-backed stores
//!
//! Every write that guards concurrency is one SQL statement. Updates that
//! also append to the incident timeline use a data-modifying CTE so the
//! column change and the event row commit together.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::FromSql;
use tokio_postgres::{Client, NoTls, Row};

use oncall_coordination::jobs::{JobKind, JobQueue, JobStatus, QueuedJob, DEFAULT_MAX_ATTEMPTS};
use oncall_coordination::notify::{
    retry_backoff, DeliveryStatus, NotificationOutbox, NotificationPayload, PendingDelivery,
};
use oncall_coordination::state::{
    CronSchedulerState, DirectoryStore, DueCursor, DueEscalation, EscalationContext,
    EscalationPolicy, EscalationStatus, EscalationStep, Incident, IncidentEvent, IncidentStore,
    NotificationChannel, OnCallSchedule, RunRecord, ScheduleLayer, ScheduleOverride,
    SchedulerStateStore, StepAdvance, StoreError, StoreResult, TargetType, Team, TeamMember,
};

use crate::schema;
use crate::sweeps::SweepExecutor;

const JOB_TYPE_ESCALATION: &str = "ESCALATION";

/// How a database error should be treated by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transience {
    Conflict,
    Unavailable,
    Permanent,
}

fn transience(code: Option<&SqlState>, closed: bool) -> Transience {
    match code {
        Some(code)
            if *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::LOCK_NOT_AVAILABLE =>
        {
            Transience::Conflict
        }
        Some(code)
            if *code == SqlState::ADMIN_SHUTDOWN
                || *code == SqlState::CANNOT_CONNECT_NOW
                || *code == SqlState::TOO_MANY_CONNECTIONS =>
        {
            Transience::Unavailable
        }
        _ if closed => Transience::Unavailable,
        _ => Transience::Permanent,
    }
}

fn pg_err(context: &str, e: tokio_postgres::Error) -> StoreError {
    match transience(e.code(), e.is_closed()) {
        Transience::Conflict => StoreError::Conflict(format!("{context}: {e}")),
        Transience::Unavailable => StoreError::Unavailable(format!("{context}: {e}")),
        Transience::Permanent => StoreError::backend(context, e),
    }
}

fn ts(at: DateTime<Utc>) -> NaiveDateTime {
    at.naive_utc()
}

fn utc(at: NaiveDateTime) -> DateTime<Utc> {
    at.and_utc()
}

fn db_int(value: usize, what: &str) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::InvalidData(format!("{what} out of range: {value}")))
}

fn db_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn col<'a, T: FromSql<'a>>(row: &'a Row, name: &str) -> StoreResult<T> {
    row.try_get(name)
        .map_err(|e| StoreError::InvalidData(format!("column {name}: {e}")))
}

fn unsigned(value: i32, what: &str) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::InvalidData(format!("negative {what}: {value}")))
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Store over a single Postgres connection
pub struct PgStore {
    client: Client,
    claim_timeout: Duration,
}

impl PgStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            claim_timeout: Duration::minutes(5),
        }
    }

    /// Connect and drive the connection on a background task
    pub async fn connect(database_url: &str) -> StoreResult<Arc<Self>> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| pg_err("connect", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("Postgres connection closed: {e}");
            }
        });

        Ok(Arc::new(Self::new(client)))
    }

    /// Reclaim RUNNING jobs whose claim is older than `timeout`
    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    /// Create the worker-owned tables
    pub async fn apply_schema(&self) -> StoreResult<()> {
        for (name, sql) in schema::statements() {
            self.client
                .batch_execute(sql)
                .await
                .map_err(|e| pg_err(name, e))?;
            tracing::debug!(object = name, "Schema statement applied");
        }
        Ok(())
    }

    async fn load_policy(&self, policy_id: &str) -> StoreResult<Option<EscalationPolicy>> {
        let Some(row) = self
            .client
            .query_opt(
                r#"SELECT "id", "name" FROM "EscalationPolicy" WHERE "id" = $1"#,
                &[&policy_id],
            )
            .await
            .map_err(|e| pg_err("load policy", e))?
        else {
            return Ok(None);
        };

        let rows = self
            .client
            .query(
                r#"SELECT "stepOrder", "delayMinutes", "targetType"::text AS "targetType",
                          "targetUserId", "targetTeamId", "targetScheduleId",
                          "notifyOnlyTeamLead",
                          COALESCE("notificationChannels"::text[], ARRAY[]::text[]) AS "channels"
                   FROM "EscalationStep"
                   WHERE "policyId" = $1
                   ORDER BY "stepOrder""#,
                &[&policy_id],
            )
            .await
            .map_err(|e| pg_err("load policy steps", e))?;

        let steps = rows.iter().map(step_from_row).collect::<StoreResult<Vec<_>>>()?;

        Ok(Some(EscalationPolicy {
            id: col(&row, "id")?,
            name: col(&row, "name")?,
            steps,
        }))
    }

    /// Update the incident with `update_sql` and append the event in one statement
    async fn update_with_event(
        &self,
        context: &str,
        update_sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
        event: &IncidentEvent,
    ) -> StoreResult<()> {
        let n = params.len();
        let sql = format!(
            r#"WITH updated AS ({update_sql} RETURNING "id")
               INSERT INTO "IncidentEvent" ("id", "incidentId", "type", "message", "data", "createdAt")
               SELECT ${}::text, "id", ${}::text, ${}::text, ${}::jsonb, ${}::timestamp FROM updated"#,
            n + 1,
            n + 2,
            n + 3,
            n + 4,
            n + 5,
        );

        let event_id = new_id();
        let kind = event.kind.as_str();
        let created_at = ts(event.created_at);
        let mut all: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = params.to_vec();
        all.extend_from_slice(&[&event_id, &kind, &event.message, &event.data, &created_at]);

        let inserted = self
            .client
            .execute(sql.as_str(), &all)
            .await
            .map_err(|e| pg_err(context, e))?;
        if inserted == 0 {
            return Err(StoreError::NotFound(event.incident_id.clone()));
        }
        Ok(())
    }
}

fn step_from_row(row: &Row) -> StoreResult<EscalationStep> {
    let target_type: String = col(row, "targetType")?;
    let channels: Vec<String> = col(row, "channels")?;

    Ok(EscalationStep {
        step_order: unsigned(col(row, "stepOrder")?, "stepOrder")?,
        delay_minutes: unsigned(col(row, "delayMinutes")?, "delayMinutes")?,
        target_type: TargetType::parse(&target_type),
        target_user_id: col(row, "targetUserId")?,
        target_team_id: col(row, "targetTeamId")?,
        target_schedule_id: col(row, "targetScheduleId")?,
        notify_only_team_lead: col(row, "notifyOnlyTeamLead")?,
        notification_channels: channels
            .iter()
            .filter_map(|c| NotificationChannel::parse(c))
            .collect(),
    })
}

fn incident_from_row(row: &Row) -> StoreResult<Incident> {
    let status: String = col(row, "escalationStatus")?;
    let step: Option<i32> = col(row, "currentEscalationStep")?;
    let next: Option<NaiveDateTime> = col(row, "nextEscalationAt")?;
    let processing: Option<NaiveDateTime> = col(row, "escalationProcessingAt")?;

    Ok(Incident {
        id: col(row, "id")?,
        title: col(row, "title")?,
        service_id: col(row, "serviceId")?,
        escalation_status: EscalationStatus::parse(&status)
            .ok_or_else(|| StoreError::InvalidData(format!("escalation status {status:?}")))?,
        current_escalation_step: step
            .map(|s| unsigned(s, "currentEscalationStep").map(|s| s as usize))
            .transpose()?,
        next_escalation_at: next.map(utc),
        escalation_processing_at: processing.map(utc),
    })
}

const STATE_COLUMNS: &str = r#""id", "lockedBy", "lockedAt", "nextRunAt", "lastRunAt",
    "lastSuccessAt", "lastError", "lastRollupDate""#;

fn state_from_row(row: &Row) -> StoreResult<CronSchedulerState> {
    let at = |name: &str| -> StoreResult<Option<DateTime<Utc>>> {
        Ok(col::<Option<NaiveDateTime>>(row, name)?.map(utc))
    };
    Ok(CronSchedulerState {
        id: col(row, "id")?,
        locked_by: col(row, "lockedBy")?,
        locked_at: at("lockedAt")?,
        next_run_at: at("nextRunAt")?,
        last_run_at: at("lastRunAt")?,
        last_success_at: at("lastSuccessAt")?,
        last_error: col(row, "lastError")?,
        last_rollup_date: col::<Option<NaiveDate>>(row, "lastRollupDate")?,
    })
}

const JOB_COLUMNS: &str = r#""id", "type", "incidentId", "step", "status", "runAt",
    "attempts", "maxAttempts", "claimedAt", "lastError""#;

fn job_from_row(row: &Row) -> StoreResult<QueuedJob> {
    let job_type: String = col(row, "type")?;
    if job_type != JOB_TYPE_ESCALATION {
        return Err(StoreError::InvalidData(format!("job type {job_type:?}")));
    }
    let status: String = col(row, "status")?;

    Ok(QueuedJob {
        id: col(row, "id")?,
        kind: JobKind::Escalation {
            incident_id: col(row, "incidentId")?,
            step: unsigned(col(row, "step")?, "step")? as usize,
        },
        status: JobStatus::parse(&status)
            .ok_or_else(|| StoreError::InvalidData(format!("job status {status:?}")))?,
        run_at: utc(col(row, "runAt")?),
        attempts: unsigned(col(row, "attempts")?, "attempts")?,
        max_attempts: unsigned(col(row, "maxAttempts")?, "maxAttempts")?,
        claimed_at: col::<Option<NaiveDateTime>>(row, "claimedAt")?.map(utc),
        last_error: col(row, "lastError")?,
    })
}

fn delivery_from_row(row: &Row) -> StoreResult<PendingDelivery> {
    let payload: serde_json::Value = col(row, "payload")?;
    let status: String = col(row, "status")?;

    Ok(PendingDelivery {
        id: col(row, "id")?,
        user_id: col(row, "userId")?,
        payload: serde_json::from_value(payload)
            .map_err(|e| StoreError::InvalidData(format!("outbox payload: {e}")))?,
        attempts: unsigned(col(row, "attempts")?, "attempts")?,
        next_attempt_at: utc(col(row, "nextAttemptAt")?),
        last_error: col(row, "lastError")?,
        status: DeliveryStatus::parse(&status)
            .ok_or_else(|| StoreError::InvalidData(format!("delivery status {status:?}")))?,
    })
}

#[async_trait]
impl IncidentStore for PgStore {
    async fn load_escalation_context(
        &self,
        incident_id: &str,
    ) -> StoreResult<Option<EscalationContext>> {
        let Some(row) = self
            .client
            .query_opt(
                r#"SELECT i."id", i."title", i."serviceId",
                          i."escalationStatus"::text AS "escalationStatus",
                          i."currentEscalationStep", i."nextEscalationAt",
                          i."escalationProcessingAt", s."escalationPolicyId"
                   FROM "Incident" i
                   LEFT JOIN "Service" s ON s."id" = i."serviceId"
                   WHERE i."id" = $1"#,
                &[&incident_id],
            )
            .await
            .map_err(|e| pg_err("load incident", e))?
        else {
            return Ok(None);
        };

        let incident = incident_from_row(&row)?;
        let policy = match col::<Option<String>>(&row, "escalationPolicyId")? {
            Some(policy_id) => self.load_policy(&policy_id).await?,
            None => None,
        };

        Ok(Some(EscalationContext { incident, policy }))
    }

    async fn mark_escalation_completed(
        &self,
        incident_id: &str,
        event: IncidentEvent,
    ) -> StoreResult<()> {
        self.update_with_event(
            "mark escalation completed",
            r#"UPDATE "Incident"
               SET "escalationStatus" = 'COMPLETED',
                   "currentEscalationStep" = NULL,
                   "nextEscalationAt" = NULL,
                   "escalationProcessingAt" = NULL
               WHERE "id" = $1"#,
            &[&incident_id],
            &event,
        )
        .await
    }

    async fn try_lock_incident(
        &self,
        incident_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let updated = self
            .client
            .execute(
                r#"UPDATE "Incident" SET "escalationProcessingAt" = $2
                   WHERE "id" = $1
                     AND ("escalationProcessingAt" IS NULL OR "escalationProcessingAt" < $3)"#,
                &[&incident_id, &ts(now), &ts(stale_before)],
            )
            .await
            .map_err(|e| pg_err("lock incident", e))?;
        Ok(updated == 1)
    }

    async fn release_incident_lock(&self, incident_id: &str) -> StoreResult<()> {
        let updated = self
            .client
            .execute(
                r#"UPDATE "Incident" SET "escalationProcessingAt" = NULL WHERE "id" = $1"#,
                &[&incident_id],
            )
            .await
            .map_err(|e| pg_err("release incident lock", e))?;
        if updated == 0 {
            return Err(StoreError::NotFound(incident_id.to_string()));
        }
        Ok(())
    }

    async fn record_step_executed(&self, advance: StepAdvance) -> StoreResult<()> {
        let next_step = db_int(advance.next_step, "next step")?;
        let next_at = advance.next_escalation_at.map(ts);

        self.update_with_event(
            "record step executed",
            r#"UPDATE "Incident"
               SET "currentEscalationStep" = $2,
                   "nextEscalationAt" = $3,
                   "escalationStatus" = CASE WHEN $4::boolean
                       THEN 'COMPLETED'::"EscalationStatus"
                       ELSE "escalationStatus" END,
                   "escalationProcessingAt" = NULL
               WHERE "id" = $1"#,
            &[&advance.incident_id, &next_step, &next_at, &advance.completed],
            &advance.event,
        )
        .await
    }

    async fn defer_escalation(
        &self,
        incident_id: &str,
        next_escalation_at: DateTime<Utc>,
        event: IncidentEvent,
    ) -> StoreResult<()> {
        self.update_with_event(
            "defer escalation",
            r#"UPDATE "Incident"
               SET "nextEscalationAt" = $2, "escalationProcessingAt" = NULL
               WHERE "id" = $1"#,
            &[&incident_id, &ts(next_escalation_at)],
            &event,
        )
        .await
    }

    async fn find_due_escalations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        after: Option<&DueCursor>,
    ) -> StoreResult<Vec<DueEscalation>> {
        let after_at = after.map(|c| ts(c.next_escalation_at));
        let after_id = after.map(|c| c.incident_id.as_str());

        let rows = self
            .client
            .query(
                r#"SELECT "id", "currentEscalationStep", "nextEscalationAt"
                   FROM "Incident"
                   WHERE "escalationStatus" = 'ESCALATING'
                     AND "nextEscalationAt" <= $1
                     AND ($2::timestamp IS NULL
                          OR ("nextEscalationAt", "id") > ($2::timestamp, $3::text))
                   ORDER BY "nextEscalationAt", "id"
                   LIMIT $4"#,
                &[&ts(now), &after_at, &after_id, &db_limit(limit)],
            )
            .await
            .map_err(|e| pg_err("find due escalations", e))?;

        rows.iter()
            .map(|row| {
                let step: Option<i32> = col(row, "currentEscalationStep")?;
                Ok(DueEscalation {
                    incident_id: col(row, "id")?,
                    current_escalation_step: step
                        .map(|s| unsigned(s, "currentEscalationStep").map(|s| s as usize))
                        .transpose()?,
                    next_escalation_at: utc(col(row, "nextEscalationAt")?),
                })
            })
            .collect()
    }

    async fn next_escalation_due(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let row = self
            .client
            .query_one(
                r#"SELECT MIN("nextEscalationAt") AS "next" FROM "Incident"
                   WHERE "escalationStatus" = 'ESCALATING'"#,
                &[],
            )
            .await
            .map_err(|e| pg_err("next escalation", e))?;
        Ok(col::<Option<NaiveDateTime>>(&row, "next")?.map(utc))
    }
}

#[async_trait]
impl DirectoryStore for PgStore {
    async fn find_team(&self, team_id: &str) -> StoreResult<Option<Team>> {
        let Some(row) = self
            .client
            .query_opt(
                r#"SELECT "id", "teamLeadId" FROM "Team" WHERE "id" = $1"#,
                &[&team_id],
            )
            .await
            .map_err(|e| pg_err("find team", e))?
        else {
            return Ok(None);
        };

        let members = self
            .client
            .query(
                r#"SELECT "userId", "receiveTeamNotifications" FROM "TeamMember"
                   WHERE "teamId" = $1
                   ORDER BY "createdAt", "userId""#,
                &[&team_id],
            )
            .await
            .map_err(|e| pg_err("find team members", e))?
            .iter()
            .map(|m| {
                Ok(TeamMember::new(
                    col::<String>(m, "userId")?,
                    col(m, "receiveTeamNotifications")?,
                ))
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Some(Team {
            id: col(&row, "id")?,
            team_lead_id: col(&row, "teamLeadId")?,
            members,
        }))
    }

    async fn find_schedule(
        &self,
        schedule_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<OnCallSchedule>> {
        let Some(row) = self
            .client
            .query_opt(
                r#"SELECT "id", "name", "timeZone" FROM "OnCallSchedule" WHERE "id" = $1"#,
                &[&schedule_id],
            )
            .await
            .map_err(|e| pg_err("find schedule", e))?
        else {
            return Ok(None);
        };

        let layers = self
            .client
            .query(
                r#"SELECT l."id", l."name", l."start", l."end", l."rotationLengthHours",
                          COALESCE(
                              array_agg(u."userId" ORDER BY u."position")
                                  FILTER (WHERE u."userId" IS NOT NULL),
                              ARRAY[]::text[]
                          ) AS "users"
                   FROM "ScheduleLayer" l
                   LEFT JOIN "ScheduleLayerUser" u ON u."layerId" = l."id"
                   WHERE l."scheduleId" = $1
                   GROUP BY l."id"
                   ORDER BY l."start", l."id""#,
                &[&schedule_id],
            )
            .await
            .map_err(|e| pg_err("find schedule layers", e))?
            .iter()
            .map(|l| {
                Ok(ScheduleLayer {
                    id: col(l, "id")?,
                    name: col(l, "name")?,
                    start: utc(col(l, "start")?),
                    end: col::<Option<NaiveDateTime>>(l, "end")?.map(utc),
                    rotation_length_hours: unsigned(
                        col(l, "rotationLengthHours")?,
                        "rotationLengthHours",
                    )?,
                    users: col(l, "users")?,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let overrides = self
            .client
            .query(
                r#"SELECT "userId", "start", "end" FROM "ScheduleOverride"
                   WHERE "scheduleId" = $1 AND "start" <= $2 AND "end" > $2
                   ORDER BY "start", "id""#,
                &[&schedule_id, &ts(at)],
            )
            .await
            .map_err(|e| pg_err("find schedule overrides", e))?
            .iter()
            .map(|o| {
                Ok(ScheduleOverride {
                    user_id: col(o, "userId")?,
                    start: utc(col(o, "start")?),
                    end: utc(col(o, "end")?),
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Some(OnCallSchedule {
            id: col(&row, "id")?,
            name: col(&row, "name")?,
            time_zone: col(&row, "timeZone")?,
            layers,
            overrides,
        }))
    }
}

#[async_trait]
impl SchedulerStateStore for PgStore {
    async fn ensure_state(&self) -> StoreResult<CronSchedulerState> {
        let sql = format!(
            r#"INSERT INTO "CronSchedulerState" ("id") VALUES ($1)
               ON CONFLICT ("id") DO UPDATE SET "id" = EXCLUDED."id"
               RETURNING {STATE_COLUMNS}"#
        );
        let row = self
            .client
            .query_one(sql.as_str(), &[&CronSchedulerState::SINGLETON_ID])
            .await
            .map_err(|e| pg_err("ensure scheduler state", e))?;
        state_from_row(&row)
    }

    async fn load_state(&self) -> StoreResult<Option<CronSchedulerState>> {
        let sql = format!(r#"SELECT {STATE_COLUMNS} FROM "CronSchedulerState" WHERE "id" = $1"#);
        self.client
            .query_opt(sql.as_str(), &[&CronSchedulerState::SINGLETON_ID])
            .await
            .map_err(|e| pg_err("load scheduler state", e))?
            .as_ref()
            .map(state_from_row)
            .transpose()
    }

    async fn try_acquire_lock(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let updated = self
            .client
            .execute(
                r#"UPDATE "CronSchedulerState"
                   SET "lockedBy" = $2, "lockedAt" = $3
                   WHERE "id" = $1
                     AND ("lockedBy" IS NULL
                          OR "lockedBy" = $2
                          OR "lockedAt" IS NULL
                          OR "lockedAt" < $4)"#,
                &[
                    &CronSchedulerState::SINGLETON_ID,
                    &worker_id,
                    &ts(now),
                    &ts(stale_before),
                ],
            )
            .await
            .map_err(|e| pg_err("acquire scheduler lock", e))?;
        Ok(updated == 1)
    }

    async fn release_lock(&self, worker_id: &str) -> StoreResult<bool> {
        let updated = self
            .client
            .execute(
                r#"UPDATE "CronSchedulerState" SET "lockedBy" = NULL, "lockedAt" = NULL
                   WHERE "id" = $1 AND "lockedBy" = $2"#,
                &[&CronSchedulerState::SINGLETON_ID, &worker_id],
            )
            .await
            .map_err(|e| pg_err("release scheduler lock", e))?;
        Ok(updated == 1)
    }

    async fn record_run(&self, worker_id: &str, record: &RunRecord) -> StoreResult<bool> {
        let updated = self
            .client
            .execute(
                r#"UPDATE "CronSchedulerState"
                   SET "lastRunAt" = $3,
                       "lastSuccessAt" = COALESCE($4::timestamp, "lastSuccessAt"),
                       "lastError" = $5,
                       "nextRunAt" = $6
                   WHERE "id" = $1 AND "lockedBy" = $2"#,
                &[
                    &CronSchedulerState::SINGLETON_ID,
                    &worker_id,
                    &ts(record.last_run_at),
                    &record.last_success_at.map(ts),
                    &record.last_error,
                    &ts(record.next_run_at),
                ],
            )
            .await
            .map_err(|e| pg_err("record scheduler run", e))?;
        Ok(updated == 1)
    }

    async fn mark_rollup(&self, worker_id: &str, date: NaiveDate) -> StoreResult<bool> {
        let updated = self
            .client
            .execute(
                r#"UPDATE "CronSchedulerState" SET "lastRollupDate" = $3
                   WHERE "id" = $1 AND "lockedBy" = $2"#,
                &[&CronSchedulerState::SINGLETON_ID, &worker_id, &date],
            )
            .await
            .map_err(|e| pg_err("mark rollup", e))?;
        Ok(updated == 1)
    }
}

#[async_trait]
impl JobQueue for PgStore {
    async fn schedule_escalation(
        &self,
        incident_id: &str,
        step: usize,
        at: DateTime<Utc>,
    ) -> StoreResult<String> {
        let step = db_int(step, "step")?;
        let max_attempts = DEFAULT_MAX_ATTEMPTS as i32;

        let row = self
            .client
            .query_one(
                r#"WITH existing AS (
                       UPDATE "BackgroundJob" SET "runAt" = $4::timestamp
                       WHERE "id" = (
                           SELECT "id" FROM "BackgroundJob"
                           WHERE "type" = $5::text AND "incidentId" = $2::text
                             AND "step" = $3::int4 AND "status" = 'PENDING'
                           ORDER BY "runAt", "id"
                           LIMIT 1
                       )
                       RETURNING "id"
                   ), inserted AS (
                       INSERT INTO "BackgroundJob"
                           ("id", "type", "incidentId", "step", "status", "runAt", "attempts", "maxAttempts")
                       SELECT $1::text, $5::text, $2::text, $3::int4, 'PENDING', $4::timestamp, 0, $6::int4
                       WHERE NOT EXISTS (SELECT 1 FROM existing)
                       RETURNING "id"
                   )
                   SELECT "id" FROM existing UNION ALL SELECT "id" FROM inserted"#,
                &[
                    &new_id(),
                    &incident_id,
                    &step,
                    &ts(at),
                    &JOB_TYPE_ESCALATION,
                    &max_attempts,
                ],
            )
            .await
            .map_err(|e| pg_err("schedule escalation job", e))?;
        col(&row, "id")
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<QueuedJob>> {
        let sql = format!(
            r#"UPDATE "BackgroundJob"
               SET "status" = 'RUNNING', "claimedAt" = $1, "attempts" = "attempts" + 1
               WHERE "id" IN (
                   SELECT "id" FROM "BackgroundJob"
                   WHERE ("status" = 'PENDING' AND "runAt" <= $1)
                      OR ("status" = 'RUNNING' AND "claimedAt" < $2)
                   ORDER BY "runAt", "id"
                   LIMIT $3
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING {JOB_COLUMNS}"#
        );
        let rows = self
            .client
            .query(
                sql.as_str(),
                &[&ts(now), &ts(now - self.claim_timeout), &db_limit(limit)],
            )
            .await
            .map_err(|e| pg_err("claim due jobs", e))?;

        let mut jobs = rows.iter().map(job_from_row).collect::<StoreResult<Vec<_>>>()?;
        jobs.sort_by(|a, b| a.run_at.cmp(&b.run_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn complete(&self, job_id: &str) -> StoreResult<()> {
        let updated = self
            .client
            .execute(
                r#"UPDATE "BackgroundJob" SET "status" = 'COMPLETED', "claimedAt" = NULL
                   WHERE "id" = $1"#,
                &[&job_id],
            )
            .await
            .map_err(|e| pg_err("complete job", e))?;
        if updated == 0 {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let updated = self
            .client
            .execute(
                r#"UPDATE "BackgroundJob"
                   SET "lastError" = $2,
                       "claimedAt" = NULL,
                       "status" = CASE WHEN $3::timestamp IS NULL THEN 'FAILED' ELSE 'PENDING' END,
                       "runAt" = COALESCE($3::timestamp, "runAt")
                   WHERE "id" = $1"#,
                &[&job_id, &error, &retry_at.map(ts)],
            )
            .await
            .map_err(|e| pg_err("fail job", e))?;
        if updated == 0 {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn next_job_due(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let row = self
            .client
            .query_one(
                r#"SELECT MIN("runAt") AS "next" FROM "BackgroundJob"
                   WHERE "status" = 'PENDING'"#,
                &[],
            )
            .await
            .map_err(|e| pg_err("next due job", e))?;
        Ok(col::<Option<NaiveDateTime>>(&row, "next")?.map(utc))
    }
}

#[async_trait]
impl NotificationOutbox for PgStore {
    async fn enqueue(
        &self,
        user_id: &str,
        payload: &NotificationPayload,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let body = serde_json::to_value(payload)
            .map_err(|e| StoreError::InvalidData(format!("outbox payload: {e}")))?;
        self.client
            .execute(
                r#"INSERT INTO "NotificationOutbox"
                       ("id", "userId", "payload", "attempts", "nextAttemptAt", "lastError", "status")
                   VALUES ($1, $2, $3, 1, $4, $5, 'PENDING')"#,
                &[&new_id(), &user_id, &body, &ts(now + retry_backoff(1)), &error],
            )
            .await
            .map_err(|e| pg_err("enqueue notification", e))?;
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<PendingDelivery>> {
        self.client
            .query(
                r#"SELECT "id", "userId", "payload", "attempts", "nextAttemptAt", "lastError", "status"
                   FROM "NotificationOutbox"
                   WHERE "status" = 'PENDING' AND "nextAttemptAt" <= $1
                   ORDER BY "nextAttemptAt", "id"
                   LIMIT $2"#,
                &[&ts(now), &db_limit(limit)],
            )
            .await
            .map_err(|e| pg_err("load due notifications", e))?
            .iter()
            .map(delivery_from_row)
            .collect()
    }

    async fn mark_delivered(&self, id: &str) -> StoreResult<()> {
        let updated = self
            .client
            .execute(
                r#"UPDATE "NotificationOutbox"
                   SET "status" = 'DELIVERED', "attempts" = "attempts" + 1, "lastError" = NULL
                   WHERE "id" = $1"#,
                &[&id],
            )
            .await
            .map_err(|e| pg_err("mark notification delivered", e))?;
        if updated == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let updated = self
            .client
            .execute(
                r#"UPDATE "NotificationOutbox"
                   SET "attempts" = "attempts" + 1,
                       "lastError" = $2,
                       "status" = CASE WHEN $3::timestamp IS NULL THEN 'ABANDONED' ELSE "status" END,
                       "nextAttemptAt" = COALESCE($3::timestamp, "nextAttemptAt")
                   WHERE "id" = $1"#,
                &[&id, &error, &next_attempt_at.map(ts)],
            )
            .await
            .map_err(|e| pg_err("reschedule notification", e))?;
        if updated == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SweepExecutor for PgStore {
    async fn execute_sweep(&self, sql: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        self.client
            .execute(sql, &[&ts(now)])
            .await
            .map_err(|e| pg_err("housekeeping sweep", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_serialization_failures_are_conflicts() {
        assert_eq!(
            transience(Some(&SqlState::T_R_SERIALIZATION_FAILURE), false),
            Transience::Conflict
        );
        assert_eq!(
            transience(Some(&SqlState::T_R_DEADLOCK_DETECTED), false),
            Transience::Conflict
        );
    }

    #[test]
    fn test_dropped_connections_are_unavailable() {
        assert_eq!(transience(None, true), Transience::Unavailable);
        assert_eq!(
            transience(Some(&SqlState::ADMIN_SHUTDOWN), false),
            Transience::Unavailable
        );
    }

    #[test]
    fn test_constraint_violations_are_permanent() {
        assert_eq!(
            transience(Some(&SqlState::UNIQUE_VIOLATION), false),
            Transience::Permanent
        );
        assert_eq!(transience(None, false), Transience::Permanent);
    }

    #[test]
    fn test_timestamps_round_trip_as_naive_utc() {
        let at = Utc.with_ymd_and_hms(2024, 3, 31, 1, 30, 0).unwrap();
        assert_eq!(utc(ts(at)), at);
        assert_eq!(ts(at).to_string(), "2024-03-31 01:30:00");
    }

    #[test]
    fn test_negative_counts_are_invalid_data() {
        assert!(matches!(
            unsigned(-1, "attempts"),
            Err(StoreError::InvalidData(_))
        ));
        assert_eq!(unsigned(3, "attempts").unwrap(), 3);
        assert!(db_int(usize::MAX, "step").is_err());
    }
}
