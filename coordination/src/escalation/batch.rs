//! Batch processor: sweeps every incident whose next step is due
//!
//! Candidates are read in keyset pages ordered by `(next_escalation_at, id)`
//! and handed to the runner one at a time. One incident failing never stops
//! the sweep.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::outcome::EscalationRunner;
use crate::clock::SharedClock;
use crate::state::store::{DueCursor, IncidentStore, StoreResult};

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Incidents that escalated
    pub processed: usize,
    /// Candidates examined
    pub total: usize,
    /// Candidates with a benign non-escalation outcome
    pub skipped: usize,
    /// `"<incident_id>: <error>"` per failed candidate; `None` when nothing failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl BatchReport {
    pub fn error_count(&self) -> usize {
        self.errors.as_ref().map_or(0, Vec::len)
    }
}

/// Sequential sweep over due escalations
#[derive(Clone)]
pub struct BatchProcessor {
    incidents: Arc<dyn IncidentStore>,
    clock: SharedClock,
    batch_size: usize,
    max_per_pass: usize,
}

impl BatchProcessor {
    pub fn new(incidents: Arc<dyn IncidentStore>, clock: SharedClock) -> Self {
        Self {
            incidents,
            clock,
            batch_size: 100,
            max_per_pass: 1000,
        }
    }

    /// Page size and per-sweep cap
    pub fn with_limits(mut self, batch_size: usize, max_per_pass: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self.max_per_pass = max_per_pass;
        self
    }

    /// Run every due escalation through `runner`
    pub async fn process_pending(&self, runner: &dyn EscalationRunner) -> StoreResult<BatchReport> {
        let now = self.clock.now();
        let mut report = BatchReport::default();
        let mut errors = Vec::new();
        let mut cursor: Option<DueCursor> = None;

        while report.total < self.max_per_pass {
            let page_size = self.batch_size.min(self.max_per_pass - report.total);
            let page = self
                .incidents
                .find_due_escalations(now, page_size, cursor.as_ref())
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.cursor());
            let page_len = page.len();

            for due in page {
                report.total += 1;
                let expected = due.current_escalation_step.unwrap_or(0);

                match runner.run_escalation(&due.incident_id, Some(expected)).await {
                    Ok(outcome) if outcome.escalated() => report.processed += 1,
                    Ok(outcome) => {
                        report.skipped += 1;
                        tracing::debug!(
                            incident_id = %due.incident_id,
                            outcome = outcome.label(),
                            "Escalation not executed: {outcome}"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(incident_id = %due.incident_id, "Escalation failed: {e}");
                        if e.is_retryable() {
                            if let Err(release_err) =
                                self.incidents.release_incident_lock(&due.incident_id).await
                            {
                                tracing::error!(
                                    incident_id = %due.incident_id,
                                    "Failed to release escalation lock: {release_err}"
                                );
                            }
                        }
                        errors.push(format!("{}: {}", due.incident_id, e));
                    }
                }
            }

            if page_len < page_size {
                break;
            }
        }

        if !errors.is_empty() {
            report.errors = Some(errors);
        }

        tracing::info!(
            processed = report.processed,
            total = report.total,
            skipped = report.skipped,
            errors = report.error_count(),
            "Escalation sweep finished"
        );
        Ok(report)
    }
}
