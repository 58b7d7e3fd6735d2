//! Per-address connection health state machine.
//!
//! State transitions:
//! HEALTHY → DEGRADED → DISABLED → (cool-down elapsed) HEALTHY
//!
//! An address that comes back from a cool-down keeps its error streak,
//! so the first success records a recovery and the first failure
//! disables it again.

use crate::error::{FlowError, FlowResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Health states of one instrument address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    /// Last operation succeeded.
    #[default]
    Healthy,
    /// One or more consecutive failures, still polled.
    Degraded,
    /// Error streak crossed the threshold; skipped until the cool-down ends.
    Disabled,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Disabled => write!(f, "DISABLED"),
        }
    }
}

impl HealthState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: HealthState) -> bool {
        use HealthState::{Degraded, Disabled, Healthy};

        matches!(
            (self, target),
            (Healthy, Degraded)
                | (Degraded, Healthy)
                | (Degraded, Disabled)
                // A threshold of one disables on the first failure
                | (Healthy, Disabled)
                // Cool-down elapsed
                | (Disabled, Healthy)
        )
    }

    /// Attempt to transition to `target`, returning error if invalid.
    pub fn transition_to(&mut self, target: HealthState) -> FlowResult<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(FlowError::InvalidStateTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Returns true if the scheduler should poll this address.
    #[must_use]
    pub fn is_pollable(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}
