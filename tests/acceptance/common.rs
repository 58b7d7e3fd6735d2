//! Shared helpers for the acceptance scenarios.

#![allow(dead_code)]

use crossbeam::channel::Receiver;
use flowbus_common::{Address, ServiceConfig};
use flowbus_poller::{Event, MeasurementEvent, PortBuilder, PortHandle};
use flowbus_transport::SimulatedBus;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn addr(v: u8) -> Address {
    Address::new(v).unwrap()
}

pub fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

/// Defaults with a fast retry backoff.
pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.retry.backoff_base = ms(1);
    config.retry.backoff_step = ms(1);
    config
}

pub fn spawn_port(bus: &SimulatedBus, config: ServiceConfig) -> PortHandle {
    PortBuilder::new("sim0", Arc::new(bus.clone()))
        .config(config)
        .spawn()
        .unwrap()
}

/// Event with the time it was received.
#[derive(Debug, Clone)]
pub struct Logged {
    pub at: Instant,
    pub event: Event,
}

/// Everything received from one subscription.
pub struct EventLog {
    rx: Receiver<Event>,
    pub events: Vec<Logged>,
}

impl EventLog {
    pub fn new(rx: Receiver<Event>) -> Self {
        Self {
            rx,
            events: Vec::new(),
        }
    }

    /// Record events for `window`.
    pub fn collect_for(&mut self, window: Duration) {
        let deadline = Instant::now() + window;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.rx.recv_timeout(left) {
                Ok(event) => self.events.push(Logged {
                    at: Instant::now(),
                    event,
                }),
                Err(_) => break,
            }
        }
    }

    /// Record events until one matches `pred` or `timeout` passes.
    pub fn wait_for(&mut self, timeout: Duration, pred: impl Fn(&Event) -> bool) -> Option<Event> {
        let deadline = Instant::now() + timeout;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            let Ok(event) = self.rx.recv_timeout(left) else {
                break;
            };
            self.events.push(Logged {
                at: Instant::now(),
                event: event.clone(),
            });
            if pred(&event) {
                return Some(event);
            }
        }
        None
    }

    pub fn measurements(&self, address: Address) -> Vec<(Instant, &MeasurementEvent)> {
        self.events
            .iter()
            .filter_map(|l| match &l.event {
                Event::Measurement(m) if m.address == address => Some((l.at, m)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.iter().filter(|l| pred(&l.event)).count()
    }

    /// Longest time between two consecutive measurements of `address`.
    pub fn max_measurement_gap(&self, address: Address) -> Duration {
        self.measurements(address)
            .windows(2)
            .map(|w| w[1].0 - w[0].0)
            .max()
            .unwrap_or_default()
    }
}
