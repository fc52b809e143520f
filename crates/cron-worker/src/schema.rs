//! Database layout
//!
//! The host application owns `Incident`, `Service`, `EscalationPolicy`,
//! `EscalationStep`, `Team`, `TeamMember`, the schedule tables and
//! `IncidentEvent`. Their columns follow the host's ORM naming: quoted
//! camelCase, `TIMESTAMP(3)` holding UTC, and Postgres enums for status
//! fields. The worker only creates the three tables it owns.

/// Tables owned by the worker, created with `IF NOT EXISTS`
pub const WORKER_TABLES: &[(&str, &str)] = &[
    (
        "CronSchedulerState",
        r#"
CREATE TABLE IF NOT EXISTS "CronSchedulerState" (
    "id"             TEXT PRIMARY KEY,
    "lockedBy"       TEXT,
    "lockedAt"       TIMESTAMP(3),
    "nextRunAt"      TIMESTAMP(3),
    "lastRunAt"      TIMESTAMP(3),
    "lastSuccessAt"  TIMESTAMP(3),
    "lastError"      TEXT,
    "lastRollupDate" DATE
)"#,
    ),
    (
        "BackgroundJob",
        r#"
CREATE TABLE IF NOT EXISTS "BackgroundJob" (
    "id"          TEXT PRIMARY KEY,
    "type"        TEXT NOT NULL,
    "incidentId"  TEXT NOT NULL,
    "step"        INTEGER NOT NULL,
    "status"      TEXT NOT NULL DEFAULT 'PENDING',
    "runAt"       TIMESTAMP(3) NOT NULL,
    "attempts"    INTEGER NOT NULL DEFAULT 0,
    "maxAttempts" INTEGER NOT NULL DEFAULT 3,
    "claimedAt"   TIMESTAMP(3),
    "lastError"   TEXT,
    "createdAt"   TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP
)"#,
    ),
    (
        "BackgroundJob_status_runAt_idx",
        r#"
CREATE INDEX IF NOT EXISTS "BackgroundJob_status_runAt_idx"
    ON "BackgroundJob" ("status", "runAt")"#,
    ),
    (
        "NotificationOutbox",
        r#"
CREATE TABLE IF NOT EXISTS "NotificationOutbox" (
    "id"            TEXT PRIMARY KEY,
    "userId"        TEXT NOT NULL,
    "payload"       JSONB NOT NULL,
    "attempts"      INTEGER NOT NULL,
    "nextAttemptAt" TIMESTAMP(3) NOT NULL,
    "lastError"     TEXT,
    "status"        TEXT NOT NULL DEFAULT 'PENDING',
    "createdAt"     TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP
)"#,
    ),
    (
        "NotificationOutbox_status_nextAttemptAt_idx",
        r#"
CREATE INDEX IF NOT EXISTS "NotificationOutbox_status_nextAttemptAt_idx"
    ON "NotificationOutbox" ("status", "nextAttemptAt")"#,
    ),
];

/// Partial index backing the due-escalation scan on the host table
pub const DUE_ESCALATION_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS "Incident_escalation_due_idx"
    ON "Incident" ("nextEscalationAt", "id")
    WHERE "escalationStatus" = 'ESCALATING'"#;

/// Every statement `PgStore::apply_schema` runs, in order
pub fn statements() -> impl Iterator<Item = (&'static str, &'static str)> {
    WORKER_TABLES
        .iter()
        .copied()
        .chain(std::iter::once(("Incident_escalation_due_idx", DUE_ESCALATION_INDEX)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_are_idempotent() {
        for (name, sql) in statements() {
            assert!(sql.contains("IF NOT EXISTS"), "{name} is not idempotent");
            assert!(sql.contains(&format!("\"{name}\"")), "{name} creates something else");
        }
    }

    #[test]
    fn test_tables_come_before_their_indexes() {
        let names: Vec<_> = statements().map(|(name, _)| name).collect();
        let table = names.iter().position(|n| *n == "BackgroundJob").unwrap();
        let index = names
            .iter()
            .position(|n| *n == "BackgroundJob_status_runAt_idx")
            .unwrap();
        assert!(table < index);
    }
}
