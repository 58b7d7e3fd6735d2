//! Connection statistics snapshots.
//!
//! The port worker rebuilds a [`ConnectionStats`] after every change and
//! stores it in a shared cell; readers clone it without touching the
//! worker's own state.

use crate::health::HealthSnapshot;
use flowbus_common::{Address, IntervalSnapshot, PortName};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Statistics of one address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddressStats {
    /// Poll period, if the address is registered.
    pub period: Option<Duration>,
    /// Health counters.
    pub health: HealthSnapshot,
    /// Polls attempted.
    pub polls: u64,
    /// Polls that returned a measurement.
    pub successful_polls: u64,
    /// Polls skipped while disabled.
    pub skipped_polls: u64,
    /// Time between consecutive polls.
    pub intervals: IntervalSnapshot,
    /// Last measured flow.
    pub last_value: Option<f64>,
    /// Last reported fluid name.
    pub fluid_name: Option<String>,
}

/// Statistics of one port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStats {
    /// Port name.
    pub port: PortName,
    /// Time since the worker started.
    pub uptime: Duration,
    /// Per-address statistics.
    pub addresses: BTreeMap<Address, AddressStats>,
    /// Commands executed.
    pub commands_processed: u64,
    /// Commands that failed.
    pub commands_failed: u64,
    /// Events lost to full subscribers.
    pub events_dropped: u64,
    /// Master connection generation.
    pub connection_generation: u64,
}

impl ConnectionStats {
    /// Empty statistics for `port`.
    #[must_use]
    pub fn new(port: PortName) -> Self {
        Self {
            port,
            uptime: Duration::ZERO,
            addresses: BTreeMap::new(),
            commands_processed: 0,
            commands_failed: 0,
            events_dropped: 0,
            connection_generation: 0,
        }
    }

    /// Recovery count per address.
    #[must_use]
    pub fn recoveries_by_address(&self) -> BTreeMap<Address, u64> {
        self.addresses
            .iter()
            .map(|(a, s)| (*a, s.health.recovery_count))
            .collect()
    }

    /// Current error streak per address.
    #[must_use]
    pub fn consecutive_errors_by_address(&self) -> BTreeMap<Address, u32> {
        self.addresses
            .iter()
            .map(|(a, s)| (*a, s.health.consecutive_errors))
            .collect()
    }

    /// Statistics of one address.
    #[must_use]
    pub fn address(&self, address: Address) -> Option<&AddressStats> {
        self.addresses.get(&address)
    }
}
