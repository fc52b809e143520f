//! Environment gating for the scheduler
//!
//! The scheduler must never run inside a production build step, and an
//! operator can switch it off without a deploy.

/// Variable set by the host framework while building
pub const BUILD_PHASE_VAR: &str = "NEXT_PHASE";

/// Value of [`BUILD_PHASE_VAR`] during a production build
pub const BUILD_PHASE_VALUE: &str = "phase-production-build";

/// Operator switch; `0`, `false`, `no` or `off` disables the scheduler
pub const ENABLED_VAR: &str = "CRON_SCHEDULER_ENABLED";

/// Snapshot of the environment flags, read once at start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerGate {
    pub build_phase: bool,
    pub disabled: bool,
}

impl SchedulerGate {
    /// Gate that allows starting
    pub fn open() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the gate from any key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let build_phase = lookup(BUILD_PHASE_VAR).is_some_and(|v| v == BUILD_PHASE_VALUE);
        let disabled = lookup(ENABLED_VAR).is_some_and(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "no" | "off"
            )
        });
        Self {
            build_phase,
            disabled,
        }
    }

    /// Why starting is refused, if it is
    pub fn refusal(&self) -> Option<&'static str> {
        if self.build_phase {
            Some("production build phase")
        } else if self.disabled {
            Some("disabled by CRON_SCHEDULER_ENABLED")
        } else {
            None
        }
    }

    pub fn allows_start(&self) -> bool {
        self.refusal().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn gate(vars: &[(&str, &str)]) -> SchedulerGate {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SchedulerGate::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_empty_environment_allows_start() {
        assert!(gate(&[]).allows_start());
        assert!(gate(&[(ENABLED_VAR, "true")]).allows_start());
        assert!(gate(&[(BUILD_PHASE_VAR, "phase-development-server")]).allows_start());
    }

    #[test]
    fn test_build_phase_refuses() {
        let g = gate(&[(BUILD_PHASE_VAR, BUILD_PHASE_VALUE)]);
        assert!(g.build_phase);
        assert_eq!(g.refusal(), Some("production build phase"));
    }

    #[test]
    fn test_disable_flag_values() {
        for value in ["0", "false", "FALSE", "no", " off "] {
            assert!(!gate(&[(ENABLED_VAR, value)]).allows_start(), "{value}");
        }
    }
}
