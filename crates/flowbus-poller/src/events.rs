//! Events published by a port worker.
//!
//! The worker is the only producer. Each subscriber gets its own bounded
//! channel; a subscriber that falls behind loses events (counted) instead
//! of stalling the bus.

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use flowbus_common::{Address, ErrorKind, PortName};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Result of one successful poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementEvent {
    /// Port the instrument is on.
    pub port: PortName,
    /// Instrument address.
    pub address: Address,
    /// Measured flow in engineering units.
    pub value: f64,
    /// Name of the active fluid.
    pub fluid_name: String,
    /// Wall-clock time of the reading.
    pub timestamp: SystemTime,
}

/// A failed poll or command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEvent {
    /// Port the instrument is on.
    pub port: PortName,
    /// Instrument address.
    pub address: Address,
    /// Error class.
    pub kind: ErrorKind,
    /// Human readable description.
    pub message: String,
}

/// Command type carried by telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    /// Flow setpoint in engineering units.
    FlowSetpoint,
    /// Setpoint in percent of capacity.
    PercentSetpoint,
    /// Fluid table switch.
    FluidIndex,
    /// User tag.
    UserTag,
}

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    /// Port the instrument is on.
    pub port: PortName,
    /// Instrument address.
    pub address: Address,
    /// Command type.
    pub kind: TelemetryKind,
    /// Parameter name.
    pub name: String,
    /// Confirmed value on success, requested value on failure.
    pub value: String,
    /// Whether the write was confirmed.
    pub success: bool,
    /// Wall-clock time the command finished.
    pub timestamp: SystemTime,
}

/// Everything a port worker reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Successful poll.
    Measurement(MeasurementEvent),
    /// Failed poll or command.
    Error(ErrorEvent),
    /// Finished command.
    Telemetry(TelemetryEvent),
    /// The address reached the error threshold and is skipped.
    AddressDisabled {
        /// Port the instrument is on.
        port: PortName,
        /// Instrument address.
        address: Address,
        /// Streak length that triggered the disable.
        consecutive_errors: u32,
        /// Length of the cool-down.
        cooldown: Duration,
    },
    /// A success ended an error streak.
    AddressRecovered {
        /// Port the instrument is on.
        port: PortName,
        /// Instrument address.
        address: Address,
        /// Recoveries so far, including this one.
        recovery_count: u64,
    },
}

impl Event {
    /// Port the event belongs to.
    #[must_use]
    pub fn port(&self) -> &PortName {
        match self {
            Self::Measurement(e) => &e.port,
            Self::Error(e) => &e.port,
            Self::Telemetry(e) => &e.port,
            Self::AddressDisabled { port, .. } | Self::AddressRecovered { port, .. } => port,
        }
    }

    /// Address the event belongs to.
    #[must_use]
    pub fn address(&self) -> Address {
        match self {
            Self::Measurement(e) => e.address,
            Self::Error(e) => e.address,
            Self::Telemetry(e) => e.address,
            Self::AddressDisabled { address, .. } | Self::AddressRecovered { address, .. } => {
                *address
            }
        }
    }
}

/// Fan-out of one port's events to any number of subscribers.
#[derive(Debug)]
pub struct EventHub {
    subscribers: Mutex<Vec<Sender<Event>>>,
    capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventHub {
    /// Create a hub whose subscriber channels hold `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Open a new subscription.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = channel::bounded(self.capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Forward events into an existing channel, e.g. one shared by all ports.
    pub fn attach(&self, sender: Sender<Event>) {
        self.subscribers.lock().push(sender);
    }

    /// Deliver `event` to every subscriber without blocking.
    ///
    /// Full subscribers miss the event; disconnected ones are removed.
    pub fn publish(&self, event: Event) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Removing disconnected event subscriber");
                false
            }
        });
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Events published so far.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Deliveries lost to full subscribers.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
