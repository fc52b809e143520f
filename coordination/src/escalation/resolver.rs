//! Escalation target resolution
//!
//! Maps a step's target descriptor to the concrete users to page:
//! - USER: the user itself, no lookup
//! - TEAM: members who opted in to team pages, or only the lead
//! - SCHEDULE: whoever is on call at the given instant
//!
//! An empty list is a valid answer meaning "nobody to notify".

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::oncall::on_call_users;
use crate::state::store::{DirectoryStore, StoreResult};
use crate::state::types::{EscalationTarget, TargetType, UserId};

/// Resolves step targets against the team and schedule directory
#[derive(Clone)]
pub struct TargetResolver {
    directory: Arc<dyn DirectoryStore>,
}

impl TargetResolver {
    pub fn new(directory: Arc<dyn DirectoryStore>) -> Self {
        Self { directory }
    }

    /// Resolve a raw descriptor. Unknown target types resolve to nobody.
    pub async fn resolve(
        &self,
        target_type: TargetType,
        target_id: &str,
        at: DateTime<Utc>,
        notify_only_team_lead: bool,
    ) -> StoreResult<Vec<UserId>> {
        match target_type {
            TargetType::User => Ok(vec![target_id.to_string()]),
            TargetType::Team => self.team_users(target_id, notify_only_team_lead).await,
            TargetType::Schedule => self.schedule_users(target_id, at).await,
            TargetType::Unknown => {
                tracing::warn!(target_id = %target_id, "Unknown escalation target type");
                Ok(Vec::new())
            }
        }
    }

    /// Resolve a validated target
    pub async fn resolve_target(
        &self,
        target: &EscalationTarget,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<UserId>> {
        let lead_only = matches!(target, EscalationTarget::Team { lead_only: true, .. });
        self.resolve(target.target_type(), target.target_id(), at, lead_only)
            .await
    }

    async fn team_users(&self, team_id: &str, lead_only: bool) -> StoreResult<Vec<UserId>> {
        let Some(team) = self.directory.find_team(team_id).await? else {
            tracing::warn!(team_id = %team_id, "Escalation target team not found");
            return Ok(Vec::new());
        };

        let members: Vec<UserId> = team.notifiable_members().cloned().collect();
        if !lead_only {
            return Ok(members);
        }

        // The lead is paged only if they also opted in to team pages
        Ok(team
            .team_lead_id
            .filter(|lead| members.contains(lead))
            .into_iter()
            .collect())
    }

    async fn schedule_users(&self, schedule_id: &str, at: DateTime<Utc>) -> StoreResult<Vec<UserId>> {
        match self.directory.find_schedule(schedule_id, at).await? {
            Some(schedule) => Ok(on_call_users(&schedule, at)),
            None => {
                tracing::warn!(schedule_id = %schedule_id, "Escalation target schedule not found");
                Ok(Vec::new())
            }
        }
    }
}
