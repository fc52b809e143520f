//! Core types for incident escalation state
//!
//! These mirror the rows the host application owns. The scheduler only
//! mutates the four escalation columns on [`Incident`], appends
//! [`IncidentEvent`] rows, and maintains the [`CronSchedulerState`] singleton.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for incidents
pub type IncidentId = String;

/// Unique identifier for users
pub type UserId = String;

/// Unique identifier for teams
pub type TeamId = String;

/// Unique identifier for on-call schedules
pub type ScheduleId = String;

/// Unique identifier for escalation policies
pub type PolicyId = String;

/// Unique identifier for services
pub type ServiceId = String;

/// Escalation progress of an incident
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationStatus {
    /// Escalation has not started (or was stopped by acknowledgement)
    #[default]
    None,
    /// Steps remain to be executed
    Escalating,
    /// Every step ran or the policy was exhausted
    Completed,
}

impl EscalationStatus {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Escalating => "ESCALATING",
            Self::Completed => "COMPLETED",
        }
    }

    /// Parse the database representation
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NONE" => Some(Self::None),
            "ESCALATING" => Some(Self::Escalating),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of recipient an escalation step targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetType {
    User,
    Team,
    Schedule,
    /// Anything the resolver does not understand
    #[serde(other)]
    Unknown,
}

impl TargetType {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Team => "TEAM",
            Self::Schedule => "SCHEDULE",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Parse the database representation; unrecognized values map to `Unknown`
    pub fn parse(value: &str) -> Self {
        match value {
            "USER" => Self::User,
            "TEAM" => Self::Team,
            "SCHEDULE" => Self::Schedule,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery channel for a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationChannel {
    Email,
    Sms,
    Push,
    Slack,
    Webhook,
    Whatsapp,
}

impl NotificationChannel {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
            Self::Push => "PUSH",
            Self::Slack => "SLACK",
            Self::Webhook => "WEBHOOK",
            Self::Whatsapp => "WHATSAPP",
        }
    }

    /// Parse the database representation
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "EMAIL" => Some(Self::Email),
            "SMS" => Some(Self::Sms),
            "PUSH" => Some(Self::Push),
            "SLACK" => Some(Self::Slack),
            "WEBHOOK" => Some(Self::Webhook),
            "WHATSAPP" => Some(Self::Whatsapp),
            _ => None,
        }
    }
}

/// A validated step target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum EscalationTarget {
    User(UserId),
    Team {
        team_id: TeamId,
        /// Page only the team lead instead of every opted-in member
        lead_only: bool,
    },
    Schedule(ScheduleId),
}

impl EscalationTarget {
    pub fn target_type(&self) -> TargetType {
        match self {
            Self::User(_) => TargetType::User,
            Self::Team { .. } => TargetType::Team,
            Self::Schedule(_) => TargetType::Schedule,
        }
    }

    pub fn target_id(&self) -> &str {
        match self {
            Self::User(id) | Self::Schedule(id) => id,
            Self::Team { team_id, .. } => team_id,
        }
    }
}

/// One rung of an escalation policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationStep {
    /// Position within the policy (0-indexed)
    pub step_order: u32,
    /// Minutes to wait after the previous step before this one fires
    pub delay_minutes: u32,
    pub target_type: TargetType,
    pub target_user_id: Option<UserId>,
    pub target_team_id: Option<TeamId>,
    pub target_schedule_id: Option<ScheduleId>,
    #[serde(default)]
    pub notify_only_team_lead: bool,
    #[serde(default)]
    pub notification_channels: Vec<NotificationChannel>,
}

impl EscalationStep {
    fn blank(step_order: u32, delay_minutes: u32, target_type: TargetType) -> Self {
        Self {
            step_order,
            delay_minutes,
            target_type,
            target_user_id: None,
            target_team_id: None,
            target_schedule_id: None,
            notify_only_team_lead: false,
            notification_channels: Vec::new(),
        }
    }

    /// Step paging a single user
    pub fn user(step_order: u32, delay_minutes: u32, user_id: impl Into<UserId>) -> Self {
        Self {
            target_user_id: Some(user_id.into()),
            ..Self::blank(step_order, delay_minutes, TargetType::User)
        }
    }

    /// Step paging a team
    pub fn team(step_order: u32, delay_minutes: u32, team_id: impl Into<TeamId>) -> Self {
        Self {
            target_team_id: Some(team_id.into()),
            ..Self::blank(step_order, delay_minutes, TargetType::Team)
        }
    }

    /// Step paging whoever is on call for a schedule
    pub fn schedule(
        step_order: u32,
        delay_minutes: u32,
        schedule_id: impl Into<ScheduleId>,
    ) -> Self {
        Self {
            target_schedule_id: Some(schedule_id.into()),
            ..Self::blank(step_order, delay_minutes, TargetType::Schedule)
        }
    }

    /// Restrict a team step to the team lead
    pub fn lead_only(mut self) -> Self {
        self.notify_only_team_lead = true;
        self
    }

    /// Set the channels used for this step
    pub fn with_channels(mut self, channels: Vec<NotificationChannel>) -> Self {
        self.notification_channels = channels;
        self
    }

    /// Delay before this step fires
    pub fn delay(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.delay_minutes))
    }

    /// The target this step pages, if the descriptor is consistent.
    ///
    /// Returns `None` when the ID matching `target_type` is missing or empty,
    /// or when the type is unrecognized.
    pub fn target(&self) -> Option<EscalationTarget> {
        fn present(id: &Option<String>) -> Option<String> {
            id.as_ref().filter(|id| !id.trim().is_empty()).cloned()
        }

        match self.target_type {
            TargetType::User => present(&self.target_user_id).map(EscalationTarget::User),
            TargetType::Team => present(&self.target_team_id).map(|team_id| EscalationTarget::Team {
                team_id,
                lead_only: self.notify_only_team_lead,
            }),
            TargetType::Schedule => {
                present(&self.target_schedule_id).map(EscalationTarget::Schedule)
            }
            TargetType::Unknown => None,
        }
    }
}

/// Ordered escalation rule set attached to a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub id: PolicyId,
    pub name: String,
    /// Steps sorted by `step_order`
    pub steps: Vec<EscalationStep>,
}

impl EscalationPolicy {
    pub fn new(id: impl Into<PolicyId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: EscalationStep) -> Self {
        self.steps.push(step);
        self
    }
}

/// The escalation-relevant view of an incident
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub title: String,
    pub service_id: ServiceId,
    pub escalation_status: EscalationStatus,
    /// Index of the next step to execute; `None` means the first step
    pub current_escalation_step: Option<usize>,
    pub next_escalation_at: Option<DateTime<Utc>>,
    /// Per-incident lock; non-null while a worker executes a step
    pub escalation_processing_at: Option<DateTime<Utc>>,
}

impl Incident {
    /// Create an incident that has not started escalating
    pub fn new(
        id: impl Into<IncidentId>,
        title: impl Into<String>,
        service_id: impl Into<ServiceId>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            service_id: service_id.into(),
            escalation_status: EscalationStatus::None,
            current_escalation_step: None,
            next_escalation_at: None,
            escalation_processing_at: None,
        }
    }

    /// Mark the incident as escalating with its next step due at `due`
    pub fn escalating_at(mut self, due: DateTime<Utc>) -> Self {
        self.escalation_status = EscalationStatus::Escalating;
        self.next_escalation_at = Some(due);
        self
    }

    pub fn at_step(mut self, step: usize) -> Self {
        self.current_escalation_step = Some(step);
        self
    }

    pub fn is_locked(&self) -> bool {
        self.escalation_processing_at.is_some()
    }
}

/// Incident plus the policy of its service
#[derive(Debug, Clone)]
pub struct EscalationContext {
    pub incident: Incident,
    pub policy: Option<EscalationPolicy>,
}

/// Member of a team
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMember {
    pub user_id: UserId,
    /// Opt-in flag for team-wide pages
    pub receive_team_notifications: bool,
}

impl TeamMember {
    pub fn new(user_id: impl Into<UserId>, receive_team_notifications: bool) -> Self {
        Self {
            user_id: user_id.into(),
            receive_team_notifications,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub team_lead_id: Option<UserId>,
    pub members: Vec<TeamMember>,
}

impl Team {
    /// Members who opted in to team pages, in membership order
    pub fn notifiable_members(&self) -> impl Iterator<Item = &UserId> {
        self.members
            .iter()
            .filter(|m| m.receive_team_notifications)
            .map(|m| &m.user_id)
    }
}

/// A rotation definition within an on-call schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleLayer {
    pub id: String,
    pub name: String,
    /// First hand-off instant
    pub start: DateTime<Utc>,
    /// Layer stops producing on-call users at this instant
    pub end: Option<DateTime<Utc>>,
    /// Length of one shift in hours (24 = daily, 168 = weekly)
    pub rotation_length_hours: u32,
    /// Users in rotation order
    pub users: Vec<UserId>,
}

/// A time-bounded exception that puts a specific user on call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOverride {
    pub user_id: UserId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ScheduleOverride {
    /// Whether the override covers `at` (start inclusive, end exclusive)
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnCallSchedule {
    pub id: ScheduleId,
    pub name: String,
    /// IANA time zone name, e.g. `America/New_York`
    pub time_zone: String,
    pub layers: Vec<ScheduleLayer>,
    pub overrides: Vec<ScheduleOverride>,
}

/// Kind of audit row appended to the incident timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentEventKind {
    EscalationStepExecuted,
    EscalationCompleted,
    EscalationTargetInvalid,
}

impl IncidentEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EscalationStepExecuted => "ESCALATION_STEP_EXECUTED",
            Self::EscalationCompleted => "ESCALATION_COMPLETED",
            Self::EscalationTargetInvalid => "ESCALATION_TARGET_INVALID",
        }
    }
}

/// Append-only incident timeline entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentEvent {
    pub incident_id: IncidentId,
    pub kind: IncidentEventKind,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl IncidentEvent {
    pub fn new(
        incident_id: impl Into<IncidentId>,
        kind: IncidentEventKind,
        message: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            incident_id: incident_id.into(),
            kind,
            message: message.into(),
            data: serde_json::Value::Null,
            created_at,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Process-wide scheduler row: distributed lock plus scheduling clock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSchedulerState {
    pub id: String,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_rollup_date: Option<NaiveDate>,
}

impl CronSchedulerState {
    /// Primary key of the only row
    pub const SINGLETON_ID: &'static str = "singleton";

    pub fn new() -> Self {
        Self {
            id: Self::SINGLETON_ID.to_string(),
            locked_by: None,
            locked_at: None,
            next_run_at: None,
            last_run_at: None,
            last_success_at: None,
            last_error: None,
            last_rollup_date: None,
        }
    }

    /// Whether `worker_id` may take the lock: free, already ours, or stale.
    pub fn lock_available_to(&self, worker_id: &str, stale_before: DateTime<Utc>) -> bool {
        match (&self.locked_by, self.locked_at) {
            (None, _) => true,
            (Some(holder), _) if holder == worker_id => true,
            (Some(_), Some(locked_at)) => locked_at < stale_before,
            // Held without a timestamp: treat as stale so it can never wedge
            (Some(_), None) => true,
        }
    }
}

impl Default for CronSchedulerState {
    fn default() -> Self {
        Self::new()
    }
}
