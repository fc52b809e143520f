//! Results of one escalation attempt
//!
//! Every non-escalation result the executor can produce is a variant of the
//! closed [`EscalationOutcome`] enum. Callers branch on the variant; only
//! store failures travel as [`EscalationError`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::store::StoreError;

/// Result of executing (or declining to execute) one escalation step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum EscalationOutcome {
    /// A step was dispatched and the incident advanced
    Escalated {
        /// Zero-indexed step that fired
        step: usize,
        /// Users the step resolved to and paged successfully
        notified: usize,
        /// Users whose delivery failed and was queued for retry
        failed: usize,
        /// When the following step fires; `None` once the policy completed
        next_escalation_at: Option<DateTime<Utc>>,
    },
    /// Incident missing, or its service has no policy with steps
    NoPolicy,
    /// Incident is already COMPLETED; nothing was written
    AlreadyCompleted,
    /// Step index ran past the policy; incident was just marked COMPLETED
    Exhausted,
    /// Another worker holds the per-incident lock
    AlreadyInProgress,
    /// Step target descriptor is inconsistent; next attempt was deferred
    InvalidTarget,
    /// The incident moved past the step the caller was asked to run
    Superseded {
        expected: usize,
        current: usize,
    },
}

impl EscalationOutcome {
    pub fn escalated(&self) -> bool {
        matches!(self, Self::Escalated { .. })
    }

    /// Human-readable reason for a non-escalation outcome
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Escalated { .. } => None,
            Self::NoPolicy => Some("No escalation policy configured"),
            Self::AlreadyCompleted => Some("Escalation already completed"),
            Self::Exhausted => Some("All escalation steps exhausted"),
            Self::AlreadyInProgress => Some("Escalation already in progress"),
            Self::InvalidTarget => Some("Invalid target configuration"),
            Self::Superseded { .. } => Some("Escalation step already executed"),
        }
    }

    /// Short label for logs and metrics fields
    pub fn label(&self) -> &'static str {
        match self {
            Self::Escalated { .. } => "escalated",
            Self::NoPolicy => "no_policy",
            Self::AlreadyCompleted => "already_completed",
            Self::Exhausted => "exhausted",
            Self::AlreadyInProgress => "already_in_progress",
            Self::InvalidTarget => "invalid_target",
            Self::Superseded { .. } => "superseded",
        }
    }
}

impl std::fmt::Display for EscalationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Escalated {
                step,
                notified,
                failed,
                ..
            } => write!(f, "escalated step {step} ({notified} notified, {failed} failed)"),
            other => f.write_str(other.reason().unwrap_or_else(|| other.label())),
        }
    }
}

/// Failures that abort an escalation attempt
#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EscalationError {
    /// Whether the same incident can be retried on a later pass
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
        }
    }
}

/// Anything that can run one escalation attempt for an incident.
///
/// Implemented by [`super::EscalationExecutor`]; tests substitute doubles.
#[async_trait]
pub trait EscalationRunner: Send + Sync {
    /// Run the incident's current step. With `expected_step`, decline with
    /// [`EscalationOutcome::Superseded`] if the incident has moved past it.
    async fn run_escalation(
        &self,
        incident_id: &str,
        expected_step: Option<usize>,
    ) -> Result<EscalationOutcome, EscalationError>;
}
