//! Scheduler tuning

use serde::{Deserialize, Serialize};

/// Timing and batching knobs for [`super::CronScheduler`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Shortest sleep between ticks
    pub min_delay_secs: u64,
    /// Longest sleep between ticks; also the delay when nothing is pending
    pub max_delay_secs: u64,
    /// Sleep after losing the lock race to another worker
    pub lock_retry_secs: u64,
    /// Age after which another worker's lock may be taken over
    pub stale_lock_secs: u64,
    /// Page size of the due-escalation scan
    pub escalation_batch_size: usize,
    /// Cap on escalations examined per sweep
    pub max_escalations_per_pass: usize,
    /// Jobs claimed per queue drain
    pub queue_drain_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_delay_secs: 15,
            max_delay_secs: 120,
            lock_retry_secs: 30,
            stale_lock_secs: 300,
            escalation_batch_size: 100,
            max_escalations_per_pass: 1000,
            queue_drain_limit: 50,
        }
    }
}

impl SchedulerConfig {
    pub fn min_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.min_delay_secs)
    }

    pub fn max_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.max_delay_secs.max(self.min_delay_secs))
    }

    pub fn lock_retry(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lock_retry_secs)
    }

    pub fn stale_lock(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_lock_secs.min(u64::from(u32::MAX)) as i64)
    }

    /// Reject settings the loop cannot honor
    pub fn validate(&self) -> Result<(), String> {
        if self.min_delay_secs == 0 {
            return Err("min_delay_secs must be at least 1".to_string());
        }
        if self.min_delay_secs > self.max_delay_secs {
            return Err(format!(
                "min_delay_secs ({}) exceeds max_delay_secs ({})",
                self.min_delay_secs, self.max_delay_secs
            ));
        }
        // A live holder refreshes its lock once per tick
        if self.stale_lock_secs <= self.max_delay_secs {
            return Err(format!(
                "stale_lock_secs ({}) must exceed max_delay_secs ({})",
                self.stale_lock_secs, self.max_delay_secs
            ));
        }
        if self.escalation_batch_size == 0 {
            return Err("escalation_batch_size must be at least 1".to_string());
        }
        Ok(())
    }
}
