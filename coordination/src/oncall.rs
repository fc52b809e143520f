//! On-call computation: who is paged for a schedule at a given instant
//!
//! ```text
//! at ──► overrides covering `at`? ──yes──► override users
//!              │
//!              no
//!              ▼
//!        every layer active at `at`
//!              │  shift = floor(local elapsed / rotation length)
//!              ▼
//!        users[shift mod len]   (deduplicated across layers)
//! ```
//!
//! Elapsed time is measured between wall-clock readings in the schedule's own
//! time zone, so a daily 09:00 hand-off stays at 09:00 across DST changes.

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;

use crate::state::types::{OnCallSchedule, ScheduleLayer, UserId};

/// Parse a schedule time zone, falling back to UTC for unknown names
pub fn schedule_time_zone(name: &str) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::warn!(time_zone = %name, "Unknown schedule time zone, using UTC");
            Tz::UTC
        }
    }
}

fn local_naive(at: DateTime<Utc>, tz: Tz) -> NaiveDateTime {
    at.with_timezone(&tz).naive_local()
}

/// The user a single layer puts on call at `at`, if the layer is active
pub fn layer_user_at(layer: &ScheduleLayer, tz: Tz, at: DateTime<Utc>) -> Option<&UserId> {
    if layer.users.is_empty() || layer.rotation_length_hours == 0 {
        return None;
    }
    if at < layer.start || layer.end.is_some_and(|end| at >= end) {
        return None;
    }

    let elapsed = local_naive(at, tz) - local_naive(layer.start, tz);
    let shift_secs = i64::from(layer.rotation_length_hours) * 3600;
    // A DST fall-back can make local elapsed time briefly negative right after start
    let shift = elapsed.num_seconds().max(0) / shift_secs;
    let index = usize::try_from(shift).ok()? % layer.users.len();

    layer.users.get(index)
}

/// Users on call for `schedule` at `at`.
///
/// Overrides covering `at` take precedence over every rotation layer. With no
/// override, each active layer contributes its current user. An empty result
/// means nobody is on call.
pub fn on_call_users(schedule: &OnCallSchedule, at: DateTime<Utc>) -> Vec<UserId> {
    let mut users: Vec<UserId> = Vec::new();
    let mut push = |user: &UserId| {
        if !users.contains(user) {
            users.push(user.clone());
        }
    };

    let overrides: Vec<_> = schedule.overrides.iter().filter(|o| o.covers(at)).collect();
    if !overrides.is_empty() {
        for o in overrides {
            push(&o.user_id);
        }
        return users;
    }

    let tz = schedule_time_zone(&schedule.time_zone);
    for layer in &schedule.layers {
        if let Some(user) = layer_user_at(layer, tz, at) {
            push(user);
        }
    }
    users
}
