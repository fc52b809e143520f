//! Dynamic wake-time computation

use chrono::{DateTime, Utc};

use super::config::SchedulerConfig;

/// Delay until the next tick.
///
/// Takes the earliest candidate deadline and clamps the wait to
/// `[min_delay, max_delay]`; past deadlines wake after `min_delay`. With no
/// candidates the scheduler sleeps for `max_delay`.
pub fn next_wake_delay(
    now: DateTime<Utc>,
    candidates: impl IntoIterator<Item = DateTime<Utc>>,
    config: &SchedulerConfig,
) -> std::time::Duration {
    let min = config.min_delay();
    let max = config.max_delay();

    match candidates.into_iter().min() {
        Some(at) => (at - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
            .clamp(min, max),
        None => max,
    }
}
