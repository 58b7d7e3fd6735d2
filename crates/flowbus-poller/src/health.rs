//! Per-address connection health.
//!
//! Counts consecutive failures of polls and commands. An address whose
//! streak reaches the disable threshold is skipped for the cool-down
//! period, then comes back HEALTHY with its streak retained: one success
//! records the recovery, one failure disables it again.

use flowbus_common::{Address, HealthConfig, HealthState};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Health record of one address.
#[derive(Debug, Clone, Default)]
pub struct ConnectionHealth {
    /// Current state.
    pub state: HealthState,
    /// Failures since the last success.
    pub consecutive_errors: u32,
    /// Successes that ended an error streak.
    pub recovery_count: u64,
    /// Failures over the lifetime of the record.
    pub total_errors: u64,
    /// Time of the last failure.
    pub last_error_time: Option<Instant>,
    /// Time of the last recovery.
    pub last_recovery_time: Option<Instant>,
    /// End of the current cool-down.
    pub disabled_until: Option<Instant>,
}

/// Result of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Streak below the threshold.
    Degraded {
        /// Current streak length.
        consecutive: u32,
    },
    /// The streak just reached the threshold.
    Disabled {
        /// Current streak length.
        consecutive: u32,
        /// End of the cool-down.
        until: Instant,
    },
    /// The address was already disabled.
    AlreadyDisabled,
}

/// Result of recording a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessOutcome {
    /// No streak was running.
    Steady,
    /// The success ended an error streak.
    Recovered {
        /// Length of the streak that ended.
        after_errors: u32,
        /// Recoveries including this one.
        recovery_count: u64,
    },
}

/// Serializable view of one address's health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    /// Current state.
    pub state: HealthState,
    /// Failures since the last success.
    pub consecutive_errors: u32,
    /// Successes that ended an error streak.
    pub recovery_count: u64,
    /// Failures over the lifetime of the record.
    pub total_errors: u64,
    /// Time left in the cool-down, if disabled.
    pub disabled_for: Option<Duration>,
}

/// Health of every address on one port. Owned by the port worker.
#[derive(Debug)]
pub struct HealthTracker {
    threshold: u32,
    cooldown: Duration,
    entries: HashMap<Address, ConnectionHealth>,
}

impl HealthTracker {
    /// Create a tracker.
    #[must_use]
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            threshold: config.disable_threshold.max(1),
            cooldown: config.cooldown,
            entries: HashMap::new(),
        }
    }

    /// Record a successful poll or command.
    pub fn record_success(&mut self, address: Address, now: Instant) -> SuccessOutcome {
        let entry = self.entries.entry(address).or_default();
        if entry.consecutive_errors == 0 {
            return SuccessOutcome::Steady;
        }

        let after_errors = entry.consecutive_errors;
        entry.consecutive_errors = 0;
        entry.recovery_count += 1;
        entry.last_recovery_time = Some(now);
        entry.disabled_until = None;
        if entry.state != HealthState::Healthy {
            set_state(address, entry, HealthState::Healthy);
        }

        SuccessOutcome::Recovered {
            after_errors,
            recovery_count: entry.recovery_count,
        }
    }

    /// Record a failed poll or command.
    pub fn record_failure(&mut self, address: Address, now: Instant) -> FailureOutcome {
        let entry = self.entries.entry(address).or_default();
        entry.consecutive_errors = entry.consecutive_errors.saturating_add(1);
        entry.total_errors += 1;
        entry.last_error_time = Some(now);

        if entry.state == HealthState::Disabled {
            return FailureOutcome::AlreadyDisabled;
        }

        if entry.consecutive_errors >= self.threshold {
            let until = now + self.cooldown;
            entry.disabled_until = Some(until);
            set_state(address, entry, HealthState::Disabled);
            return FailureOutcome::Disabled {
                consecutive: entry.consecutive_errors,
                until,
            };
        }

        if entry.state == HealthState::Healthy {
            set_state(address, entry, HealthState::Degraded);
        }
        FailureOutcome::Degraded {
            consecutive: entry.consecutive_errors,
        }
    }

    /// True if `address` is in its cool-down at `now`.
    ///
    /// An address whose cool-down has elapsed is re-enabled here.
    pub fn is_disabled(&mut self, address: Address, now: Instant) -> bool {
        let Some(entry) = self.entries.get_mut(&address) else {
            return false;
        };
        if entry.state != HealthState::Disabled {
            return false;
        }
        if entry.disabled_until.is_some_and(|until| now < until) {
            return true;
        }

        entry.disabled_until = None;
        set_state(address, entry, HealthState::Healthy);
        info!(
            %address,
            consecutive = entry.consecutive_errors,
            "Cool-down elapsed, address re-enabled"
        );
        false
    }

    /// Health record of `address`.
    #[must_use]
    pub fn get(&self, address: Address) -> Option<&ConnectionHealth> {
        self.entries.get(&address)
    }

    /// Current state of `address` (HEALTHY if never seen).
    #[must_use]
    pub fn state(&self, address: Address) -> HealthState {
        self.entries.get(&address).map_or(HealthState::Healthy, |e| e.state)
    }

    /// Forget `address`.
    pub fn remove(&mut self, address: Address) {
        self.entries.remove(&address);
    }

    /// Addresses with a health record.
    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.entries.keys().copied()
    }

    /// Serializable view of `address`.
    #[must_use]
    pub fn snapshot(&self, address: Address, now: Instant) -> HealthSnapshot {
        let entry = self.entries.get(&address).cloned().unwrap_or_default();
        HealthSnapshot {
            state: entry.state,
            consecutive_errors: entry.consecutive_errors,
            recovery_count: entry.recovery_count,
            total_errors: entry.total_errors,
            disabled_for: entry
                .disabled_until
                .map(|until| until.saturating_duration_since(now)),
        }
    }
}

fn set_state(address: Address, entry: &mut ConnectionHealth, target: HealthState) {
    let from = entry.state;
    match entry.state.transition_to(target) {
        Ok(()) => debug!(%address, %from, to = %target, "Health state changed"),
        Err(e) => warn!(%address, error = %e, "Rejected health transition"),
    }
}
